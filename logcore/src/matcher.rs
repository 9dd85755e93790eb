//! Polymorphic matcher: fixed string, glob, POSIX ERE, and PCRE, unified
//! behind one flag vocabulary and one capture-propagation contract.
//!
//! There is no PCRE crate in this workspace's dependency stack (nor in any
//! sibling repo this one was grown alongside), so the `Pcre` variant is
//! backed by the same `regex` crate as `PosixRe` — named captures and `i`/
//! multiline flags are fully supported, but PCRE-only constructs such as
//! backreferences are not. This is recorded as a deliberate simplification
//! in `DESIGN.md` rather than a silent behavior gap.

use std::sync::Arc;

use crate::logmsg::LogMessage;
use crate::nvtable::{NVHandle, NVType};
use crate::template::LogTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatcherFlags(pub u32);

impl MatcherFlags {
    pub const GLOBAL: MatcherFlags = MatcherFlags(0x01);
    pub const ICASE: MatcherFlags = MatcherFlags(0x02);
    pub const NEWLINE: MatcherFlags = MatcherFlags(0x04);
    pub const UTF8: MatcherFlags = MatcherFlags(0x08);
    pub const STORE_MATCHES: MatcherFlags = MatcherFlags(0x10);
    pub const MATCH_ONLY: MatcherFlags = MatcherFlags(0x20);
    pub const SUBSTRING: MatcherFlags = MatcherFlags(0x40);
    pub const PREFIX: MatcherFlags = MatcherFlags(0x80);

    pub fn contains(self, other: MatcherFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn union(self, other: MatcherFlags) -> MatcherFlags {
        MatcherFlags(self.0 | other.0)
    }
}

/// Regex-backed matchers keep one compiled pattern per top-level
/// alternation branch, in source order. A pattern with no top-level `|`
/// just has one branch. Keeping the branches separate (instead of handing
/// the whole pattern to one `Regex`) is what lets `replace` reproduce the
/// "retry for a non-empty match before giving up" global-substitution
/// behavior: the underlying `regex` crate, like PCRE and Perl, commits to
/// the first alternative that matches at a position and never backtracks
/// into a later one just because it's longer, so skipping empty-only
/// branches has to be done by us, one branch at a time.
enum Kind {
    String(Vec<u8>),
    Regex(Vec<regex::bytes::Regex>),
}

/// A compiled matcher. Construct with [`LogMatcher::compile_string`],
/// [`LogMatcher::compile_glob`], [`LogMatcher::compile_posix_re`], or
/// [`LogMatcher::compile_pcre`].
pub struct LogMatcher {
    kind: Kind,
    flags: MatcherFlags,
    source: Arc<str>,
}

fn compile_err(pattern: &str, position: usize, reason: impl Into<String>) -> crate::Error {
    crate::Error::MatcherCompile {
        pattern: pattern.to_string(),
        position,
        reason: reason.into(),
    }
}

fn regex_builder(pattern: &str, flags: MatcherFlags) -> regex::bytes::RegexBuilder {
    let mut b = regex::bytes::RegexBuilder::new(pattern);
    b.case_insensitive(flags.contains(MatcherFlags::ICASE));
    b.multi_line(flags.contains(MatcherFlags::NEWLINE));
    b.unicode(flags.contains(MatcherFlags::UTF8));
    b
}

fn compile_branches(pattern: &str, flags: MatcherFlags) -> Result<Vec<regex::bytes::Regex>, regex::Error> {
    split_top_level_alternation(pattern)
        .into_iter()
        .map(|part| regex_builder(&part, flags).build())
        .collect()
}

impl LogMatcher {
    pub fn compile_string(pattern: &[u8], flags: MatcherFlags) -> crate::Result<LogMatcher> {
        Ok(LogMatcher {
            kind: Kind::String(pattern.to_vec()),
            flags,
            source: Arc::from(String::from_utf8_lossy(pattern).as_ref()),
        })
    }

    pub fn compile_glob(pattern: &str, flags: MatcherFlags) -> crate::Result<LogMatcher> {
        let translated = glob_to_regex(pattern);
        let branches = compile_branches(&translated, flags).map_err(|e| compile_err(pattern, 0, e.to_string()))?;
        Ok(LogMatcher {
            kind: Kind::Regex(branches),
            flags,
            source: Arc::from(pattern),
        })
    }

    pub fn compile_posix_re(pattern: &str, flags: MatcherFlags) -> crate::Result<LogMatcher> {
        let branches = compile_branches(pattern, flags).map_err(|e| compile_err(pattern, 0, e.to_string()))?;
        Ok(LogMatcher {
            kind: Kind::Regex(branches),
            flags,
            source: Arc::from(pattern),
        })
    }

    pub fn compile_pcre(pattern: &str, flags: MatcherFlags) -> crate::Result<LogMatcher> {
        let branches = compile_branches(pattern, flags).map_err(|e| compile_err(pattern, 0, e.to_string()))?;
        Ok(LogMatcher {
            kind: Kind::Regex(branches),
            flags,
            source: Arc::from(pattern),
        })
    }

    /// Matches the bytes currently stored at `value_handle` in `msg`.
    /// Returns `false` (no side effects) if the value is unset or does not
    /// match; when `STORE_MATCHES` is set and the match succeeds, positional
    /// captures land in the message's numbered match slots and named
    /// captures under their own name.
    pub fn match_value(&self, msg: &LogMessage, value_handle: NVHandle) -> bool {
        let bytes = msg.get_value(value_handle);
        match &self.kind {
            Kind::String(pat) => {
                if self.flags.contains(MatcherFlags::SUBSTRING) {
                    contains_bytes(&bytes, pat, self.flags.contains(MatcherFlags::ICASE))
                } else if self.flags.contains(MatcherFlags::PREFIX) {
                    starts_with_bytes(&bytes, pat, self.flags.contains(MatcherFlags::ICASE))
                } else {
                    eq_bytes(&bytes, pat, self.flags.contains(MatcherFlags::ICASE))
                }
            }
            Kind::Regex(branches) => {
                let Some((start, _end, bi)) = find_leftmost(branches, &bytes, 0) else {
                    return false;
                };
                if self.flags.contains(MatcherFlags::STORE_MATCHES) && !self.flags.contains(MatcherFlags::MATCH_ONLY) {
                    if let Some(caps) = branches[bi].captures(&bytes[start..]) {
                        store_captures(msg, &branches[bi], &caps, value_handle, &bytes, start);
                    }
                }
                true
            }
        }
    }

    /// Replaces every match (or, without `GLOBAL`, the first) in the value
    /// at `value_handle` with `replacement` expanded against `msg`. Returns
    /// `None` for the string matcher, which has no notion of a
    /// substitution template.
    ///
    /// Mirrors the standard PCRE/Perl global-match loop: after an empty
    /// match, the next attempt is pinned to that exact position and
    /// required to be non-empty (trying branches in order, skipping any
    /// that can only match empty there) before the scan is allowed to slide
    /// forward a byte. Without this, an alternation like `b*|aa` would
    /// never take the `aa` branch, since plain leftmost-first matching
    /// always prefers `b*`'s empty match.
    pub fn replace(
        &self,
        msg: &LogMessage,
        value_handle: NVHandle,
        replacement: &LogTemplate,
    ) -> Option<Vec<u8>> {
        let branches = match &self.kind {
            Kind::Regex(branches) => branches,
            Kind::String(_) => return None,
        };
        // buffer the input first: the replacement template may read `$0..$N`
        // from match slots that alias this very value (e.g. `$1` replacing
        // itself), so we must not write through a borrow of the bytes we're
        // still scanning.
        let input = msg.get_value(value_handle).to_vec();
        let mut out = Vec::with_capacity(input.len());
        let mut pos = 0usize;
        let mut force_nonempty = false;
        loop {
            if pos > input.len() {
                break;
            }
            let found = if force_nonempty {
                find_nonempty_anchored(branches, &input, pos).map(|(end, bi)| (pos, end, bi))
            } else {
                find_leftmost(branches, &input, pos)
            };
            let Some((start, end, bi)) = found else {
                if force_nonempty {
                    force_nonempty = false;
                    if pos < input.len() {
                        out.push(input[pos]);
                    }
                    pos += 1;
                    continue;
                }
                out.extend_from_slice(&input[pos..]);
                break;
            };
            out.extend_from_slice(&input[pos..start]);
            if self.flags.contains(MatcherFlags::STORE_MATCHES) {
                if let Some(caps) = branches[bi].captures(&input[start..]) {
                    store_captures(msg, &branches[bi], &caps, value_handle, &input, start);
                }
            }
            out.extend_from_slice(&replacement.format(msg));
            if end == start {
                force_nonempty = true;
                pos = start;
            } else {
                force_nonempty = false;
                pos = end;
            }
            if !self.flags.contains(MatcherFlags::GLOBAL) {
                out.extend_from_slice(&input[pos.min(input.len())..]);
                break;
            }
        }
        Some(out)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Leftmost-first search across branches: the earliest position where any
/// branch matches wins; among branches that both match at that position,
/// the one listed first (lowest index) wins, matching standard alternation
/// priority instead of POSIX longest-match.
///
/// Uses `find_at` rather than re-slicing the haystack per candidate start:
/// `\A`/`\z` in a compiled pattern anchor to the true ends of `haystack`,
/// and handing the engine a shifted sub-slice instead would make `\A`
/// spuriously re-match at every position we tried.
fn find_leftmost(branches: &[regex::bytes::Regex], haystack: &[u8], from: usize) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;
    for (bi, re) in branches.iter().enumerate() {
        if let Some(m) = re.find_at(haystack, from) {
            let better = match best {
                None => true,
                Some((bs, _, bbi)) => m.start() < bs || (m.start() == bs && bi < bbi),
            };
            if better {
                best = Some((m.start(), m.end(), bi));
            }
        }
    }
    best
}

/// Like [`find_leftmost`] but pinned to exactly `pos` and required to
/// return a non-empty match, trying branches in order and skipping any
/// that only match empty (or don't reach all the way to `pos`) there.
fn find_nonempty_anchored(branches: &[regex::bytes::Regex], haystack: &[u8], pos: usize) -> Option<(usize, usize)> {
    for (bi, re) in branches.iter().enumerate() {
        if let Some(m) = re.find_at(haystack, pos) {
            if m.start() == pos && m.end() > pos {
                return Some((m.end(), bi));
            }
        }
    }
    None
}

/// Splits a pattern on top-level `|` (depth 0, outside character classes,
/// respecting backslash escapes). A pattern with no top-level alternation
/// yields a single-element vector.
fn split_top_level_alternation(pattern: &str) -> Vec<String> {
    let bytes = pattern.as_bytes();
    let mut branches = Vec::new();
    let mut depth = 0i32;
    let mut in_class = false;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1;
            }
            b'[' if !in_class => in_class = true,
            b']' if in_class => in_class = false,
            b'(' if !in_class => depth += 1,
            b')' if !in_class => depth -= 1,
            b'|' if !in_class && depth == 0 => {
                branches.push(pattern[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    branches.push(pattern[start..].to_string());
    branches
}

fn store_captures(
    msg: &LogMessage,
    re: &regex::bytes::Regex,
    caps: &regex::bytes::Captures,
    value_handle: NVHandle,
    input: &[u8],
    base: usize,
) {
    let base_is_input = {
        // only safe to store zero-copy indirect refs back into value_handle
        // when the bytes we matched against are exactly what's stored there
        // right now (true for match_value; replace() matches a local copy).
        msg.get_value(value_handle) == input
    };
    for i in 0..caps.len() {
        let Some(m) = caps.get(i) else { continue };
        let start = base + m.start();
        let len = m.end() - m.start();
        if base_is_input {
            let _ = msg.set_match_indirect(i as u32, value_handle, NVType::Other, start as u16, len as u16);
        } else {
            let _ = msg.set_match(i as u32, m.as_bytes());
        }
    }
    // named captures overwrite positional slots sharing a name; later
    // (higher-index) groups win on collision with a reserved name, matching
    // the observed donor behavior for PCRE named-capture collisions.
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let registry = crate::nvtable::logmsg_registry();
            if let Ok(handle) = registry.get_or_assign_handle(name.as_bytes()) {
                let _ = msg.set_value(handle, name.as_bytes(), m.as_bytes());
            }
        }
    }
}

fn eq_bytes(a: &[u8], b: &[u8], icase: bool) -> bool {
    if icase {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

fn starts_with_bytes(haystack: &[u8], needle: &[u8], icase: bool) -> bool {
    haystack.len() >= needle.len() && eq_bytes(&haystack[..needle.len()], needle, icase)
}

fn contains_bytes(haystack: &[u8], needle: &[u8], icase: bool) -> bool {
    if needle.is_empty() {
        return true;
    }
    if icase {
        let hay_lower: Vec<u8> = haystack.iter().map(|b| b.to_ascii_lowercase()).collect();
        let needle_lower: Vec<u8> = needle.iter().map(|b| b.to_ascii_lowercase()).collect();
        hay_lower.windows(needle_lower.len()).any(|w| w == needle_lower.as_slice())
    } else {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}

/// Translates a POSIX-like glob (`*`, `?`, `[...]` classes) anchored to both
/// ends into an equivalent regex, reusing the `regex` crate already in the
/// dependency stack instead of pulling in a dedicated glob matcher.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?s)\\A");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for c2 in chars.by_ref() {
                    out.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            _ => {
                for esc in regex::escape(&c.to_string()).chars() {
                    out.push(esc);
                }
            }
        }
    }
    out.push_str("\\z");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_exact_match() {
        let m = LogMatcher::compile_string(b"hello", MatcherFlags::default()).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"hello").unwrap();
        assert!(m.match_value(&msg, crate::logmsg::builtin::MESSAGE));
    }

    #[test]
    fn string_substring_flag() {
        let m = LogMatcher::compile_string(b"wor", MatcherFlags::SUBSTRING).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"hello world").unwrap();
        assert!(m.match_value(&msg, crate::logmsg::builtin::MESSAGE));
    }

    #[test]
    fn glob_is_anchored_both_ends() {
        let m = LogMatcher::compile_glob("foo*bar", MatcherFlags::default()).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"foo123bar").unwrap();
        assert!(m.match_value(&msg, crate::logmsg::builtin::MESSAGE));
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"xfoo123bar").unwrap();
        assert!(!m.match_value(&msg, crate::logmsg::builtin::MESSAGE));
    }

    #[test]
    fn posix_re_store_matches_writes_positional_slot() {
        let m = LogMatcher::compile_posix_re(r"(\d+)-(\d+)", MatcherFlags::STORE_MATCHES).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"id 12-34 done").unwrap();
        assert!(m.match_value(&msg, crate::logmsg::builtin::MESSAGE));
        assert_eq!(msg.get_value(crate::nvtable::NVHandle(
            crate::nvtable::logmsg_registry().lookup_handle(b"1").unwrap().0
        )), b"12");
    }

    #[test]
    fn global_replace_with_empty_match_advances_one_byte() {
        let re = LogMatcher::compile_posix_re("c*", MatcherFlags::GLOBAL).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"aa bb").unwrap();
        let tmpl = LogTemplate::compile("#").unwrap();
        let out = re.replace(&msg, crate::logmsg::builtin::MESSAGE, &tmpl).unwrap();
        assert_eq!(out, b"#a#a# #b#b#");
    }

    #[test]
    fn global_replace_alternation_with_empty_branch() {
        let re = LogMatcher::compile_posix_re("b*|aa", MatcherFlags::GLOBAL).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", b"aa").unwrap();
        let tmpl = LogTemplate::compile("@").unwrap();
        let out = re.replace(&msg, crate::logmsg::builtin::MESSAGE, &tmpl).unwrap();
        assert_eq!(out, b"@@@");
    }

    #[test]
    fn split_top_level_alternation_respects_groups_and_classes() {
        let parts = split_top_level_alternation(r"(a|b)|[c|d]|e\|f");
        assert_eq!(parts, vec![r"(a|b)".to_string(), r"[c|d]".to_string(), r"e\|f".to_string()]);
    }
}
