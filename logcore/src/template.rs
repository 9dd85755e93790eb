//! Compiled templates: a sequence of literal chunks, macro references, and
//! name-value references, with shared formatting options (timestamp style,
//! fractional digits, escaping) resolved against a [`LogMessage`] at format
//! time.
//!
//! Syntax: `$NAME` or `${NAME}` expands a macro or NV value; `${NAME:-def}`
//! supplies a default used when the value is unset or empty; `$$` is a
//! literal `$`. `NAME` is resolved against the macro table first
//! ([`crate::macros::lookup`]); anything else, including bare digits like
//! `${1}`, is a name-value reference (positional captures are just NV
//! entries named `"1"`, `"2"`, ... per [`crate::logmsg::LogMessage::set_match`]).

use crate::logmsg::LogMessage;
use crate::logstamp::TsFormat;
use crate::macros::MacroId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateOptions {
    pub ts_format: TsFormat,
    pub frac_digits: u8,
    pub escape: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        TemplateOptions {
            ts_format: TsFormat::Bsd,
            frac_digits: 0,
            escape: false,
        }
    }
}

enum Element {
    Literal(Vec<u8>),
    Macro { id: MacroId, default: Option<Vec<u8>> },
    NvRef { name: Vec<u8>, default: Option<Vec<u8>> },
}

/// A compiled template. Construct with [`LogTemplate::compile`] or
/// [`LogTemplate::compile_with_options`]; callers that must never propagate
/// a bad operator-supplied template string (e.g. the pattern database
/// loader) use [`LogTemplate::broken`] instead of bubbling the `Err` up.
pub struct LogTemplate {
    elements: Vec<Element>,
    options: TemplateOptions,
    broken: Option<String>,
}

fn compile_err(template: &str, position: usize, reason: impl Into<String>) -> crate::Error {
    crate::Error::TemplateCompile {
        template: template.to_string(),
        position,
        reason: reason.into(),
    }
}

impl LogTemplate {
    pub fn compile(src: &str) -> crate::Result<LogTemplate> {
        LogTemplate::compile_with_options(src, TemplateOptions::default())
    }

    pub fn compile_with_options(src: &str, options: TemplateOptions) -> crate::Result<LogTemplate> {
        let elements = parse_elements(src)?;
        Ok(LogTemplate {
            elements,
            options,
            broken: None,
        })
    }

    /// A template that never fails to format: every call to [`Self::format`]
    /// emits `error in template: <source>` verbatim, per the contract that a
    /// bad template must produce visible output rather than silently
    /// dropping the field it was supposed to fill.
    pub fn broken(src: &str) -> LogTemplate {
        LogTemplate {
            elements: Vec::new(),
            options: TemplateOptions::default(),
            broken: Some(src.to_string()),
        }
    }

    /// Compiles `src`, falling back to [`Self::broken`] on a parse error
    /// instead of propagating it.
    pub fn compile_or_broken(src: &str) -> LogTemplate {
        LogTemplate::compile(src).unwrap_or_else(|_| LogTemplate::broken(src))
    }

    pub fn format(&self, msg: &LogMessage) -> Vec<u8> {
        if let Some(src) = &self.broken {
            return format!("error in template: {src}").into_bytes();
        }
        let mut out = Vec::new();
        for element in &self.elements {
            match element {
                Element::Literal(bytes) => out.extend_from_slice(bytes),
                Element::Macro { id, default } => {
                    let value = msg.get_macro_value(*id, self.options.ts_format, self.options.frac_digits);
                    append_with_default(&mut out, value, default, self.options.escape);
                }
                Element::NvRef { name, default } => {
                    let value = resolve_nv(msg, name);
                    append_with_default(&mut out, value.unwrap_or_default(), default, self.options.escape);
                }
            }
        }
        out
    }
}

fn append_with_default(out: &mut Vec<u8>, value: Vec<u8>, default: &Option<Vec<u8>>, escape: bool) {
    let value = if value.is_empty() {
        default.clone().unwrap_or_default()
    } else {
        value
    };
    append_escaped(out, &value, escape);
}

fn append_escaped(out: &mut Vec<u8>, bytes: &[u8], escape: bool) {
    if !escape {
        out.extend_from_slice(bytes);
        return;
    }
    for &b in bytes {
        match b {
            b'\'' | b'"' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b if b < 0x20 => out.extend_from_slice(format!("\\{b:03o}").as_bytes()),
            _ => out.push(b),
        }
    }
}

fn resolve_nv(msg: &LogMessage, name: &[u8]) -> Option<Vec<u8>> {
    let handle = crate::nvtable::logmsg_registry().lookup_handle(name)?;
    Some(msg.get_value(handle))
}

fn parse_elements(src: &str) -> crate::Result<Vec<Element>> {
    let bytes = src.as_bytes();
    let mut elements = Vec::new();
    let mut literal = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
                literal.push(b'$');
                i += 2;
                continue;
            }
            if !literal.is_empty() {
                elements.push(Element::Literal(std::mem::take(&mut literal)));
            }
            let (element, consumed) = parse_reference(src, i)?;
            elements.push(element);
            i += consumed;
        } else {
            literal.push(bytes[i]);
            i += 1;
        }
    }
    if !literal.is_empty() {
        elements.push(Element::Literal(literal));
    }
    Ok(elements)
}

/// Parses one `$NAME`, `${NAME}`, or `${NAME:-default}` reference starting
/// at `src[start]` (which must be `$`). Returns the element and the number
/// of bytes consumed, including the leading `$`.
fn parse_reference(src: &str, start: usize) -> crate::Result<(Element, usize)> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    if i < bytes.len() && bytes[i] == b'{' {
        i += 1;
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'}' && bytes[i] != b':' {
            i += 1;
        }
        let name = &src[name_start..i];
        if name.is_empty() {
            return Err(compile_err(src, start, "empty template reference"));
        }
        let default = if i < bytes.len() && bytes[i] == b':' {
            if i + 1 >= bytes.len() || bytes[i + 1] != b'-' {
                return Err(compile_err(src, i, "expected ':-' before a default value"));
            }
            i += 2;
            let default_start = i;
            while i < bytes.len() && bytes[i] != b'}' {
                i += 1;
            }
            Some(src[default_start..i].as_bytes().to_vec())
        } else {
            None
        };
        if i >= bytes.len() || bytes[i] != b'}' {
            return Err(compile_err(src, start, "unterminated ${...} reference"));
        }
        i += 1;
        Ok((make_element(name, default), i - start))
    } else {
        let name_start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        if i == name_start {
            return Err(compile_err(src, start, "expected a name after '$'"));
        }
        let name = &src[name_start..i];
        Ok((make_element(name, None), i - start))
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn make_element(name: &str, default: Option<Vec<u8>>) -> Element {
    match crate::macros::lookup(name) {
        Some(id) => Element::Macro { id, default },
        None => Element::NvRef {
            name: name.as_bytes().to_vec(),
            default,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmsg::builtin;

    #[test]
    fn literal_only_template_passes_through() {
        let t = LogTemplate::compile("hello world").unwrap();
        let msg = LogMessage::new_empty(4096);
        assert_eq!(t.format(&msg), b"hello world");
    }

    #[test]
    fn escaped_dollar_is_literal() {
        let t = LogTemplate::compile("cost: $$5").unwrap();
        let msg = LogMessage::new_empty(4096);
        assert_eq!(t.format(&msg), b"cost: $5");
    }

    #[test]
    fn bare_macro_reference_expands() {
        let t = LogTemplate::compile("host=$HOST").unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(builtin::HOST, b"HOST", b"myhost").unwrap();
        assert_eq!(t.format(&msg), b"host=myhost");
    }

    #[test]
    fn nv_reference_falls_back_to_default_when_unset() {
        let t = LogTemplate::compile("severity=${custom.sev:-unknown}").unwrap();
        let msg = LogMessage::new_empty(4096);
        assert_eq!(t.format(&msg), b"severity=unknown");
    }

    #[test]
    fn positional_capture_reference_reads_match_slot() {
        let t = LogTemplate::compile("first=${1}").unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_match(1, b"abc").unwrap();
        assert_eq!(t.format(&msg), b"first=abc");
    }

    #[test]
    fn unterminated_reference_is_a_compile_error() {
        assert!(LogTemplate::compile("${HOST").is_err());
    }

    #[test]
    fn broken_template_formats_as_diagnostic() {
        let t = LogTemplate::compile_or_broken("${HOST");
        let msg = LogMessage::new_empty(4096);
        assert_eq!(t.format(&msg), b"error in template: ${HOST");
    }

    #[test]
    fn escape_mode_backslash_escapes_reserved_bytes() {
        let mut opts = TemplateOptions::default();
        opts.escape = true;
        let t = LogTemplate::compile_with_options("msg=$MESSAGE", opts).unwrap();
        let msg = LogMessage::new_empty(4096);
        msg.set_value(builtin::MESSAGE, b"MESSAGE", b"a\"b\\c\nd").unwrap();
        assert_eq!(t.format(&msg), b"msg=a\\\"b\\\\c\\012d");
    }
}
