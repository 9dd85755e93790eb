//! Literal+parser-node radix tree used by the pattern database to classify
//! free-form message text against a library of patterns.
//!
//! A node is either a literal byte-string key with children keyed by their
//! first diverging byte, or a parser placeholder (`STRING`, `ESTRING`, ...)
//! with zero or more children. Insertion is the classic radix algorithm:
//! literal keys are split at the point two patterns diverge. Lookup walks
//! literal children first, then tries every parser child in insertion order;
//! a parser alternative whose subtree does not itself reach a terminal value
//! only contributes that subtree's own terminal as a fallback, so the
//! alternative that consumes the most input before bottoming out wins —
//! see [`Node::lookup`] for the worked rationale.

use std::sync::Arc;

use smallvec::SmallVec;

/// Typed parser placeholder kinds from the pattern-DB dialect (`@TYPE@`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserType {
    String,
    Estring,
    Qstring,
    Anystring,
    Number,
    Ipv4,
    Ipv6,
    Float,
}

/// A compiled placeholder: type plus optional capture name and parameter
/// (delimiter for ESTRING, quote pair for QSTRING, extra char class for
/// STRING, radix hint for NUMBER).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub ptype: ParserType,
    pub name: Option<Arc<str>>,
    pub param: Option<Arc<str>>,
}

/// One token of a compiled pattern: a run of literal bytes, or a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternToken {
    Literal(Vec<u8>),
    Placeholder(Placeholder),
}

/// Parses the pattern-DB literal+placeholder dialect: `@TYPE[:NAME[:PARAM]]@`
/// placeholders embedded in otherwise-literal UTF-8 text, `@@` a literal `@`.
pub fn compile_pattern(src: &str) -> crate::Result<Vec<PatternToken>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut literal = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'@' {
            literal.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'@') {
            literal.push(b'@');
            i += 2;
            continue;
        }
        let Some(close) = bytes[i + 1..].iter().position(|&b| b == b'@') else {
            return Err(crate::Error::PatternDbLoad {
                file: String::new(),
                line: 0,
                reason: format!("unterminated placeholder in pattern `{src}`"),
            });
        };
        let body = &src[i + 1..i + 1 + close];
        if !literal.is_empty() {
            tokens.push(PatternToken::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(PatternToken::Placeholder(parse_placeholder(body, src)?));
        i = i + 1 + close + 1;
    }
    if !literal.is_empty() {
        tokens.push(PatternToken::Literal(literal));
    }
    Ok(tokens)
}

fn parse_placeholder(body: &str, src: &str) -> crate::Result<Placeholder> {
    let mut parts = body.splitn(3, ':');
    let type_str = parts.next().unwrap_or_default();
    let ptype = match type_str {
        "STRING" => ParserType::String,
        "ESTRING" => ParserType::Estring,
        "QSTRING" => ParserType::Qstring,
        "ANYSTRING" => ParserType::Anystring,
        "NUMBER" => ParserType::Number,
        "IPv4" => ParserType::Ipv4,
        "IPv6" => ParserType::Ipv6,
        "FLOAT" => ParserType::Float,
        other => {
            return Err(crate::Error::PatternDbLoad {
                file: String::new(),
                line: 0,
                reason: format!("unknown parser type `{other}` in pattern `{src}`"),
            })
        }
    };
    let name = parts.next().filter(|s| !s.is_empty()).map(Arc::from);
    let param = parts.next().map(Arc::from);
    Ok(Placeholder { ptype, name, param })
}

/// One captured placeholder along the winning lookup path. `ref_offset`/
/// `ref_len` are absolute byte offsets into the original input, suitable for
/// writing back as a zero-copy indirect NV reference; `owned` carries bytes
/// synthesized by the parser (e.g. `QSTRING` stripped of quotes) instead.
#[derive(Debug, Clone)]
pub struct Match {
    pub ptype: ParserType,
    pub name: Option<Arc<str>>,
    pub ref_offset: usize,
    pub ref_len: usize,
    pub owned: Option<Vec<u8>>,
}

struct ParserChild<V> {
    placeholder: Placeholder,
    node: Node<V>,
}

struct LiteralChild<V> {
    key: Vec<u8>,
    node: Node<V>,
}

/// A node of the radix tree. The root is always a literal node with an
/// empty key.
pub struct Node<V> {
    literal_children: Vec<LiteralChild<V>>,
    parser_children: Vec<ParserChild<V>>,
    value: Option<V>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node {
            literal_children: Vec::new(),
            parser_children: Vec::new(),
            value: None,
        }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl<V> Node<V> {
    pub fn new() -> Self {
        Node::default()
    }

    /// Inserts `tokens` with terminal `value`. Returns
    /// `Err(PatternDbLoad)` if the exact same token sequence was already
    /// inserted (duplicate pattern).
    pub fn insert(&mut self, tokens: &[PatternToken], value: V) -> crate::Result<()> {
        self.insert_tokens(tokens, value)
    }

    fn insert_tokens(&mut self, tokens: &[PatternToken], value: V) -> crate::Result<()> {
        match tokens.first() {
            None => {
                if self.value.is_some() {
                    return Err(crate::Error::PatternDbLoad {
                        file: String::new(),
                        line: 0,
                        reason: "duplicate pattern for the same rule".to_string(),
                    });
                }
                self.value = Some(value);
                Ok(())
            }
            Some(PatternToken::Literal(lit)) => self.insert_literal(lit, &tokens[1..], value),
            Some(PatternToken::Placeholder(p)) => {
                if let Some(existing) = self
                    .parser_children
                    .iter_mut()
                    .find(|c| c.placeholder.ptype == p.ptype && c.placeholder.name == p.name)
                {
                    existing.node.insert_tokens(&tokens[1..], value)
                } else {
                    let mut node = Node::new();
                    node.insert_tokens(&tokens[1..], value)?;
                    self.parser_children.push(ParserChild {
                        placeholder: p.clone(),
                        node,
                    });
                    Ok(())
                }
            }
        }
    }

    fn insert_literal(&mut self, lit: &[u8], rest: &[PatternToken], value: V) -> crate::Result<()> {
        if lit.is_empty() {
            return self.insert_tokens(rest, value);
        }
        for idx in 0..self.literal_children.len() {
            let common = common_prefix_len(&self.literal_children[idx].key, lit);
            if common == 0 {
                continue;
            }
            let child_key_len = self.literal_children[idx].key.len();
            if common == child_key_len && common == lit.len() {
                return self.literal_children[idx].node.insert_tokens(rest, value);
            }
            if common == child_key_len {
                let mut new_rest = Vec::with_capacity(rest.len() + 1);
                new_rest.push(PatternToken::Literal(lit[common..].to_vec()));
                new_rest.extend_from_slice(rest);
                return self.literal_children[idx].node.insert_tokens(&new_rest, value);
            }
            if common == lit.len() {
                // `lit` is a strict prefix of the existing key: split the
                // child so `lit`'s node sits between this node and it.
                let old = &mut self.literal_children[idx];
                let suffix = old.key[common..].to_vec();
                let old_node = std::mem::take(&mut old.node);
                let old_key = std::mem::replace(&mut old.key, lit.to_vec());
                let _ = old_key;
                let mut split = Node::new();
                split.literal_children.push(LiteralChild { key: suffix, node: old_node });
                old.node = split;
                return self.literal_children[idx].node.insert_tokens(rest, value);
            }
            // partial common prefix: split into a shared node with two
            // diverging children.
            let old = &mut self.literal_children[idx];
            let old_suffix = old.key[common..].to_vec();
            let new_suffix = lit[common..].to_vec();
            let shared_key = old.key[..common].to_vec();
            let old_node = std::mem::take(&mut old.node);
            old.key = shared_key;
            let mut shared = Node::new();
            shared.literal_children.push(LiteralChild { key: old_suffix, node: old_node });
            let mut new_leaf = Node::new();
            new_leaf.insert_tokens(rest, value)?;
            shared.literal_children.push(LiteralChild { key: new_suffix, node: new_leaf });
            old.node = shared;
            return Ok(());
        }
        let mut child = Node::new();
        child.insert_tokens(rest, value)?;
        self.literal_children.push(LiteralChild { key: lit.to_vec(), node: child });
        Ok(())
    }

    /// Looks up `input` (the whole message text, or a rule radix's key
    /// space) against this tree, returning the winning terminal value plus
    /// the captures along the path that reached it.
    ///
    /// Matching need not consume all of `input`: a parser node with no
    /// further children is a valid terminal even with trailing bytes left
    /// over (it has nothing left to try). Among sibling alternatives that
    /// could *both* reach a terminal, the one that consumes more of the
    /// input before bottoming out wins — `find_best` explores every
    /// alternative (rather than stopping at the first node with a value)
    /// and keeps the candidate with the smallest leftover, breaking ties by
    /// which alternative was explored first (literal children before
    /// parser children, parser children in insertion order).
    pub fn lookup<'a>(&'a self, input: &[u8]) -> Option<(&'a V, SmallVec<[Match; 4]>)> {
        let mut best: Option<(usize, &'a V, SmallVec<[Match; 4]>)> = None;
        self.find_best(input, 0, &mut SmallVec::new(), &mut best);
        best.map(|(_, v, m)| (v, m))
    }

    /// Renders the tree's structure (literal keys and parser placeholder
    /// types, not payload values) for `pdbtool dump`. Each line is indented
    /// two spaces per tree depth; a trailing `*` marks a node carrying a
    /// terminal value.
    pub fn structure_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.write_structure_lines(0, &mut out);
        out
    }

    fn write_structure_lines(&self, depth: usize, out: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        for lc in &self.literal_children {
            let marker = if lc.node.value.is_some() { " *" } else { "" };
            out.push(format!("{indent}\"{}\"{marker}", String::from_utf8_lossy(&lc.key)));
            lc.node.write_structure_lines(depth + 1, out);
        }
        for pc in &self.parser_children {
            let marker = if pc.node.value.is_some() { " *" } else { "" };
            let name = pc.placeholder.name.as_deref().unwrap_or("");
            out.push(format!("{indent}@{:?}:{name}@{marker}", pc.placeholder.ptype));
            pc.node.write_structure_lines(depth + 1, out);
        }
    }

    /// `pos` is the absolute offset of `remaining`'s first byte within the
    /// original input passed to [`Node::lookup`]; it threads through the
    /// recursion so captured placeholders can record input-relative offsets.
    fn find_best<'a>(
        &'a self,
        remaining: &[u8],
        pos: usize,
        trail: &mut SmallVec<[Match; 4]>,
        best: &mut Option<(usize, &'a V, SmallVec<[Match; 4]>)>,
    ) {
        for lc in &self.literal_children {
            if remaining.len() >= lc.key.len() && &remaining[..lc.key.len()] == lc.key.as_slice() {
                lc.node.find_best(&remaining[lc.key.len()..], pos + lc.key.len(), trail, best);
            }
        }
        for pc in &self.parser_children {
            if let Some((consumed, m)) = try_parse(&pc.placeholder, remaining, pos) {
                let pushed = m.is_some();
                if let Some(m) = m {
                    trail.push(m);
                }
                pc.node
                    .find_best(&remaining[consumed..], pos + consumed, trail, best);
                if pushed {
                    trail.pop();
                }
            }
        }
        if let Some(v) = &self.value {
            let leftover = remaining.len();
            let better = match best {
                None => true,
                Some((b, _, _)) => leftover < *b,
            };
            if better {
                *best = Some((leftover, v, trail.clone()));
            }
        }
    }
}

fn try_parse(ph: &Placeholder, input: &[u8], pos: usize) -> Option<(usize, Option<Match>)> {
    match ph.ptype {
        ParserType::String => parse_string(input, ph.param.as_deref()),
        ParserType::Estring => parse_estring(input, ph.param.as_deref().unwrap_or("")),
        ParserType::Qstring => parse_qstring(input, ph.param.as_deref()),
        ParserType::Anystring => parse_anystring(input),
        ParserType::Number => parse_number(input, ph.param.as_deref()),
        ParserType::Ipv4 => parse_ipv4(input),
        ParserType::Ipv6 => parse_ipv6(input),
        ParserType::Float => parse_float(input),
    }
    .map(|(consumed, local_ref_ofs, ref_len, owned)| {
        let m = Match {
            ptype: ph.ptype,
            name: ph.name.clone(),
            ref_offset: pos + local_ref_ofs,
            ref_len,
            owned,
        };
        (consumed, Some(m))
    })
}

type ParseResult = Option<(usize, usize, usize, Option<Vec<u8>>)>;

fn parse_string(input: &[u8], extra: Option<&str>) -> ParseResult {
    let extra_bytes = extra.map(|s| s.as_bytes()).unwrap_or(b"");
    let len = input
        .iter()
        .take_while(|&&b| b.is_ascii_alphanumeric() || extra_bytes.contains(&b))
        .count();
    if len == 0 {
        return None;
    }
    Some((len, 0, len, None))
}

fn parse_estring(input: &[u8], delim: &str) -> ParseResult {
    if delim.is_empty() {
        return None;
    }
    let delim = delim.as_bytes();
    let pos = input
        .windows(delim.len().max(1))
        .position(|w| w == delim)?;
    Some((pos + delim.len(), 0, pos, None))
}

fn parse_qstring(input: &[u8], quotes: Option<&str>) -> ParseResult {
    let mut chars = quotes.unwrap_or("\"\"").chars();
    let open = chars.next()? as u8;
    let close = chars.next().unwrap_or(open as char) as u8;
    if input.first() != Some(&open) {
        return None;
    }
    let close_pos = input[1..].iter().position(|&b| b == close)?;
    let content = &input[1..1 + close_pos];
    Some((1 + close_pos + 1, 1, content.len(), None))
}

fn parse_anystring(input: &[u8]) -> ParseResult {
    Some((input.len(), 0, input.len(), None))
}

fn parse_number(input: &[u8], param: Option<&str>) -> ParseResult {
    let hex = param == Some("HEX");
    let len = input
        .iter()
        .take_while(|&&b| b.is_ascii_digit() || (hex && b.is_ascii_hexdigit()))
        .count();
    if len == 0 {
        return None;
    }
    Some((len, 0, len, None))
}

fn parse_ipv4(input: &[u8]) -> ParseResult {
    let mut end = 0;
    for part in 0..4 {
        if part > 0 {
            if input.get(end) != Some(&b'.') {
                return None;
            }
            end += 1;
        }
        let digit_start = end;
        let mut val: u32 = 0;
        let mut n = 0;
        while let Some(&b) = input.get(end) {
            if !b.is_ascii_digit() || n >= 3 {
                break;
            }
            val = val * 10 + (b - b'0') as u32;
            end += 1;
            n += 1;
        }
        if n == 0 || val > 255 {
            return None;
        }
        let _ = digit_start;
    }
    Some((end, 0, end, None))
}

fn parse_ipv6(input: &[u8]) -> ParseResult {
    let max = input
        .iter()
        .take_while(|&&b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
        .count();
    for len in (2..=max).rev() {
        if let Ok(text) = std::str::from_utf8(&input[..len]) {
            if text.parse::<std::net::Ipv6Addr>().is_ok() {
                return Some((len, 0, len, None));
            }
        }
    }
    None
}

fn parse_float(input: &[u8]) -> ParseResult {
    let mut i = 0;
    if matches!(input.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }
    let int_start = i;
    while input.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    if i == int_start {
        return None;
    }
    if input.get(i) == Some(&b'.') {
        i += 1;
        while input.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
    }
    if matches!(input.get(i), Some(b'e') | Some(b'E')) {
        let mut j = i + 1;
        if matches!(input.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        let exp_start = j;
        while input.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    Some((i, 0, i, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(root: &mut Node<&'static str>, pattern: &str, value: &'static str) {
        let tokens = compile_pattern(pattern).unwrap();
        root.insert(&tokens, value).unwrap();
    }

    #[test]
    fn zero_copy_estring_placeholder_match() {
        let mut root = Node::new();
        insert(&mut root, "pattern foobar @ESTRING:rest: @tail", "rule1");
        let (v, matches) = root.lookup(b"pattern foobar something tail").unwrap();
        assert_eq!(*v, "rule1");
        let m = matches.iter().find(|m| m.name.as_deref() == Some("rest")).unwrap();
        assert_eq!(&b"pattern foobar something tail"[m.ref_offset..m.ref_offset + m.ref_len], b"something");
        assert!(m.owned.is_none());
    }

    #[test]
    fn conflicting_rules_pick_longest_alternative() {
        let mut root = Node::new();
        insert(&mut root, "pattern @ESTRING:foo1: @", "11");
        insert(&mut root, "pattern @ESTRING:foo2: @tail", "12");

        assert_eq!(*root.lookup(b"pattern foobar ").unwrap().0, "11");
        assert_eq!(*root.lookup(b"pattern foobar tail").unwrap().0, "12");
        assert_eq!(*root.lookup(b"pattern foobar something else").unwrap().0, "11");
    }

    #[test]
    fn ipv4_placeholder_matches_dotted_quad() {
        let mut root = Node::new();
        insert(&mut root, "from @IPv4:addr@ ok", "ip");
        let (v, matches) = root.lookup(b"from 10.0.0.1 ok").unwrap();
        assert_eq!(*v, "ip");
        assert_eq!(matches[0].ref_len, 8);
    }

    #[test]
    fn no_match_returns_none() {
        let mut root = Node::new();
        insert(&mut root, "literal only", "x");
        assert!(root.lookup(b"nope").is_none());
    }
}
