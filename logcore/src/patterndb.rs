//! Two-level radix pattern database: `$PROGRAM` selects a per-program rule
//! tree, `$MESSAGE` against that tree yields a classification verdict.
//!
//! Loaded from the XML dialect described in the external-interfaces docs:
//! `<patterndb><ruleset><patterns><pattern>...</pattern></patterns>
//! <rules><rule>...</rule></rules></ruleset></patterndb>`. Nothing in this
//! crate's lineage demonstrates `quick_xml`'s event-reader API directly
//! (see DESIGN.md); the loader below follows that crate's own documented
//! `Reader`/`Event` conventions rather than a sibling usage example.

use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::logmsg::LogMessage;
use crate::nvtable::{logmsg_registry, NVHandle, NVType};
use crate::radix::{self, Match, Node, ParserType};
use crate::template::LogTemplate;

const DEFAULT_MAX_MSG_SIZE: usize = 65536;

/// One `<values><value name="...">TEMPLATE</value></values>` entry, already
/// compiled. A malformed template never aborts the load (see
/// [`LogTemplate::compile_or_broken`]) — it degrades to a visible diagnostic
/// at format time instead.
pub struct ValueTemplate {
    pub name: String,
    pub template: LogTemplate,
}

/// One `<examples><example>...</example></examples>` self-test vector.
#[derive(Debug, Clone, Default)]
pub struct Example {
    pub program: String,
    pub message: String,
    pub expected_values: Vec<(String, String)>,
}

/// A compiled `<rule>`.
pub struct Rule {
    pub rule_id: String,
    pub class: String,
    pub provider: Option<String>,
    pub tag_ids: Vec<u32>,
    pub values: Vec<ValueTemplate>,
}

struct ProgramEntry {
    rules: Node<Arc<Rule>>,
}

struct ExampleCase {
    rule: Arc<Rule>,
    example: Example,
}

/// A loaded pattern database, ready for [`PatternDb::classify`].
pub struct PatternDb {
    pub version: u32,
    pub pub_date: String,
    programs: Node<Arc<ProgramEntry>>,
    examples: Vec<ExampleCase>,
}

/// The outcome of classifying one message against a loaded database.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub class: String,
    pub rule_id: Option<String>,
}

/// The outcome of replaying one embedded `<example>` vector.
#[derive(Debug, Clone)]
pub struct ExampleOutcome {
    pub program: String,
    pub message: String,
    pub expected_rule: String,
    pub actual_rule: Option<String>,
    pub passed: bool,
    pub value_mismatches: Vec<(String, String, Vec<u8>)>,
}

impl PatternDb {
    pub fn load_str(xml: &str) -> crate::Result<PatternDb> {
        loader::load(xml)
    }

    pub fn load_file(path: &std::path::Path) -> crate::Result<PatternDb> {
        let xml = std::fs::read_to_string(path).map_err(|e| crate::Error::PatternDbLoad {
            file: path.display().to_string(),
            line: 0,
            reason: e.to_string(),
        })?;
        PatternDb::load_str(&xml).map_err(|e| match e {
            crate::Error::PatternDbLoad { line, reason, .. } => crate::Error::PatternDbLoad {
                file: path.display().to_string(),
                line,
                reason,
            },
            other => other,
        })
    }

    /// Classifies `msg` via `$PROGRAM`/`$MESSAGE`, writing
    /// `.classifier.class`/`.classifier.rule_id`, rule tags, and value
    /// templates onto the message as a side effect, per the pattern-DB
    /// lookup contract. Always returns a verdict — `class = "unknown"` with
    /// no `rule_id` when nothing matches.
    pub fn classify(&self, msg: &LogMessage, program_handle: NVHandle, message_handle: NVHandle) -> Verdict {
        let _span = tracing::debug_span!("patterndb_classify").entered();
        let program = msg.get_value(program_handle);
        let Some((entry, _)) = self.programs.lookup(&program) else {
            set_classifier(msg, "unknown", None);
            return Verdict { class: "unknown".to_string(), rule_id: None };
        };
        let message = msg.get_value(message_handle);
        let Some((rule, matches)) = entry.rules.lookup(&message) else {
            set_classifier(msg, "unknown", None);
            return Verdict { class: "unknown".to_string(), rule_id: None };
        };
        apply_rule(msg, rule, &matches, message_handle);
        Verdict { class: rule.class.clone(), rule_id: Some(rule.rule_id.clone()) }
    }

    /// Renders the outer `$PROGRAM` radix's structure, for `pdbtool dump
    /// --program-tree`.
    pub fn dump_program_tree(&self) -> Vec<String> {
        self.programs.structure_lines()
    }

    /// Renders one program's inner `$MESSAGE` radix, for `pdbtool dump -P
    /// <program>`. `None` if no ruleset matched `program`.
    pub fn dump_rule_tree(&self, program: &str) -> Option<Vec<String>> {
        let (entry, _) = self.programs.lookup(program.as_bytes())?;
        Some(entry.rules.structure_lines())
    }

    /// Runs every embedded `<example>` vector, the same set `pdbtool test`
    /// exercises, and reports pass/fail plus value mismatches for each.
    pub fn run_examples(&self) -> Vec<ExampleOutcome> {
        self.examples
            .iter()
            .map(|case| {
                let msg = LogMessage::new_empty(DEFAULT_MAX_MSG_SIZE);
                msg.set_value(crate::logmsg::builtin::PROGRAM, b"PROGRAM", case.example.program.as_bytes())
                    .expect("fresh message always has room for an example vector");
                msg.set_value(crate::logmsg::builtin::MESSAGE, b"MESSAGE", case.example.message.as_bytes())
                    .expect("fresh message always has room for an example vector");
                let verdict = self.classify(&msg, crate::logmsg::builtin::PROGRAM, crate::logmsg::builtin::MESSAGE);
                let registry = logmsg_registry();
                let mut value_mismatches = Vec::new();
                for (name, expected) in &case.example.expected_values {
                    let actual = registry
                        .lookup_handle(name.as_bytes())
                        .map(|h| msg.get_value(h))
                        .unwrap_or_default();
                    if actual != expected.as_bytes() {
                        value_mismatches.push((name.clone(), expected.clone(), actual));
                    }
                }
                let passed = verdict.rule_id.as_deref() == Some(case.rule.rule_id.as_str()) && value_mismatches.is_empty();
                ExampleOutcome {
                    program: case.example.program.clone(),
                    message: case.example.message.clone(),
                    expected_rule: case.rule.rule_id.clone(),
                    actual_rule: verdict.rule_id,
                    passed,
                    value_mismatches,
                }
            })
            .collect()
    }
}

fn set_classifier(msg: &LogMessage, class: &str, rule_id: Option<&str>) {
    let registry = logmsg_registry();
    if let Ok(h) = registry.get_or_assign_handle(b".classifier.class") {
        let _ = msg.set_value(h, b".classifier.class", class.as_bytes());
    }
    if let Some(rid) = rule_id {
        if let Ok(h) = registry.get_or_assign_handle(b".classifier.rule_id") {
            let _ = msg.set_value(h, b".classifier.rule_id", rid.as_bytes());
        }
    }
}

fn nvtype_of(ptype: ParserType) -> NVType {
    match ptype {
        ParserType::String => NVType::String,
        ParserType::Estring => NVType::Estring,
        ParserType::Qstring => NVType::Qstring,
        ParserType::Anystring => NVType::Anystring,
        ParserType::Number => NVType::Number,
        ParserType::Ipv4 => NVType::Ipv4,
        ParserType::Ipv6 => NVType::Ipv6,
        ParserType::Float => NVType::Float,
    }
}

fn apply_rule(msg: &LogMessage, rule: &Rule, matches: &[Match], message_handle: NVHandle) {
    let registry = logmsg_registry();
    for m in matches {
        let Some(name) = &m.name else { continue };
        let Ok(handle) = registry.get_or_assign_handle(name.as_bytes()) else {
            continue;
        };
        let result = if let Some(owned) = &m.owned {
            msg.set_value(handle, name.as_bytes(), owned)
        } else {
            msg.set_value_indirect(
                handle,
                name.as_bytes(),
                message_handle,
                nvtype_of(m.ptype),
                m.ref_offset as u16,
                m.ref_len as u16,
            )
        };
        if let Err(e) = result {
            tracing::warn!(capture = %name, error = %e, "failed to store pattern-db capture");
        }
    }
    for &tag_id in &rule.tag_ids {
        msg.set_tag_by_id(tag_id);
    }
    set_classifier(msg, &rule.class, Some(&rule.rule_id));
    for vt in &rule.values {
        let bytes = vt.template.format(msg);
        match registry.get_or_assign_handle(vt.name.as_bytes()) {
            Ok(handle) => {
                if let Err(e) = msg.set_value(handle, vt.name.as_bytes(), &bytes) {
                    tracing::warn!(name = %vt.name, error = %e, "failed to store pattern-db value");
                }
            }
            Err(e) => tracing::warn!(name = %vt.name, error = %e, "failed to register pattern-db value name"),
        }
    }
}

mod loader {
    use super::*;

    enum Elem {
        Patterndb { version: u32, pub_date: String },
        Ruleset { patterns: Vec<String>, rules: Node<Arc<Rule>> },
        Patterns(Vec<String>),
        Rules,
        Rule {
            class: String,
            id: String,
            provider: Option<String>,
            patterns: Vec<String>,
            tags: Vec<String>,
            values: Vec<(String, String)>,
            examples: Vec<Example>,
        },
        Tags(Vec<String>),
        Values(Vec<(String, String)>),
        Value { name: String },
        Examples(Vec<Example>),
        Example { program: Option<String>, message: Option<String>, test_values: Vec<(String, String)> },
        TestMessage { program: Option<String> },
        TestValues(Vec<(String, String)>),
        TestValue { name: String },
        Pattern,
        Tag,
    }

    fn err(xml: &str, pos: usize, reason: impl Into<String>) -> crate::Error {
        let line = xml[..pos.min(xml.len())].matches('\n').count() + 1;
        crate::Error::PatternDbLoad { file: String::new(), line, reason: reason.into() }
    }

    fn attr(start: &BytesStart, key: &str) -> Option<String> {
        start
            .attributes()
            .flatten()
            .find(|a| a.key.as_ref() == key.as_bytes())
            .and_then(|a| a.unescape_value().ok().map(|c| c.into_owned()))
    }

    fn open(xml: &str, pos: usize, s: &BytesStart) -> crate::Result<Elem> {
        Ok(match s.name().as_ref() {
            b"patterndb" => Elem::Patterndb {
                version: attr(s, "version").and_then(|v| v.parse().ok()).unwrap_or(0),
                pub_date: attr(s, "pub_date").unwrap_or_default(),
            },
            b"ruleset" => Elem::Ruleset { patterns: Vec::new(), rules: Node::new() },
            b"patterns" => Elem::Patterns(Vec::new()),
            b"pattern" => Elem::Pattern,
            b"rules" => Elem::Rules,
            b"rule" => Elem::Rule {
                class: attr(s, "class").unwrap_or_default(),
                id: attr(s, "id").ok_or_else(|| err(xml, pos, "<rule> missing id attribute"))?,
                provider: attr(s, "provider"),
                patterns: Vec::new(),
                tags: Vec::new(),
                values: Vec::new(),
                examples: Vec::new(),
            },
            b"tags" => Elem::Tags(Vec::new()),
            b"tag" => Elem::Tag,
            b"values" => Elem::Values(Vec::new()),
            b"value" => Elem::Value {
                name: attr(s, "name").ok_or_else(|| err(xml, pos, "<value> missing name attribute"))?,
            },
            b"examples" => Elem::Examples(Vec::new()),
            b"example" => Elem::Example { program: None, message: None, test_values: Vec::new() },
            b"test_message" => Elem::TestMessage { program: attr(s, "program") },
            b"test_values" => Elem::TestValues(Vec::new()),
            b"test_value" => Elem::TestValue {
                name: attr(s, "name").ok_or_else(|| err(xml, pos, "<test_value> missing name attribute"))?,
            },
            other => {
                return Err(err(xml, pos, format!("unexpected element <{}>", String::from_utf8_lossy(other))));
            }
        })
    }

    /// Closes the top-of-stack frame, merging its accumulated content (and
    /// `text`, for leaf elements) into whatever frame is now on top. `None`
    /// top-of-stack after a pop means the element just closed was
    /// `<patterndb>` itself; the caller stashes its final output then.
    fn close(
        xml: &str,
        pos: usize,
        stack: &mut Vec<Elem>,
        text: &str,
        out_version: &mut u32,
        out_pub_date: &mut String,
        out_programs: &mut Node<Arc<ProgramEntry>>,
        out_examples: &mut Vec<ExampleCase>,
    ) -> crate::Result<()> {
        let closed = stack.pop().ok_or_else(|| err(xml, pos, "unbalanced closing tag"))?;
        match closed {
            Elem::Patterndb { version, pub_date } => {
                *out_version = version;
                *out_pub_date = pub_date;
            }
            Elem::Pattern => {
                let Some(Elem::Patterns(items)) = stack.last_mut() else {
                    return Err(err(xml, pos, "<pattern> outside <patterns>"));
                };
                items.push(text.to_string());
            }
            Elem::Tag => {
                let Some(Elem::Tags(items)) = stack.last_mut() else {
                    return Err(err(xml, pos, "<tag> outside <tags>"));
                };
                items.push(text.to_string());
            }
            Elem::Patterns(items) => match stack.last_mut() {
                Some(Elem::Ruleset { patterns, .. }) => patterns.extend(items),
                Some(Elem::Rule { patterns, .. }) => patterns.extend(items),
                _ => return Err(err(xml, pos, "<patterns> outside <ruleset> or <rule>")),
            },
            Elem::Tags(items) => match stack.last_mut() {
                Some(Elem::Rule { tags, .. }) => tags.extend(items),
                _ => return Err(err(xml, pos, "<tags> outside <rule>")),
            },
            Elem::Value { name } => {
                let Some(Elem::Values(items)) = stack.last_mut() else {
                    return Err(err(xml, pos, "<value> outside <values>"));
                };
                items.push((name, text.to_string()));
            }
            Elem::Values(items) => match stack.last_mut() {
                Some(Elem::Rule { values, .. }) => values.extend(items),
                _ => return Err(err(xml, pos, "<values> outside <rule>")),
            },
            Elem::TestValue { name } => {
                let Some(Elem::TestValues(items)) = stack.last_mut() else {
                    return Err(err(xml, pos, "<test_value> outside <test_values>"));
                };
                items.push((name, text.to_string()));
            }
            Elem::TestValues(items) => match stack.last_mut() {
                Some(Elem::Example { test_values, .. }) => test_values.extend(items),
                _ => return Err(err(xml, pos, "<test_values> outside <example>")),
            },
            Elem::TestMessage { program } => {
                let Some(Elem::Example { program: ex_program, message, .. }) = stack.last_mut() else {
                    return Err(err(xml, pos, "<test_message> outside <example>"));
                };
                *ex_program = program;
                *message = Some(text.to_string());
            }
            Elem::Example { program, message, test_values } => {
                let Some(Elem::Rule { examples, .. }) = stack.last_mut() else {
                    return Err(err(xml, pos, "<example> outside <rule>"));
                };
                examples.push(Example {
                    program: program.unwrap_or_default(),
                    message: message.unwrap_or_default(),
                    expected_values: test_values,
                });
            }
            Elem::Examples(items) => match stack.last_mut() {
                Some(Elem::Rule { examples, .. }) => examples.extend(items),
                _ => return Err(err(xml, pos, "<examples> outside <rule>")),
            },
            Elem::Rule { class, id, provider, patterns, tags, values, examples } => {
                let Some(Elem::Ruleset { rules, .. }) = stack.last_mut() else {
                    return Err(err(xml, pos, "<rule> outside <ruleset>"));
                };
                let tag_ids = tags.iter().map(|t| crate::tags::global().get_by_name(t)).collect();
                let rule = Arc::new(Rule {
                    rule_id: id,
                    class,
                    provider,
                    tag_ids,
                    values: values
                        .into_iter()
                        .map(|(name, src)| ValueTemplate { template: LogTemplate::compile_or_broken(&src), name })
                        .collect(),
                });
                for pattern in &patterns {
                    let tokens = radix::compile_pattern(pattern)?;
                    rules.insert(&tokens, Arc::clone(&rule))?;
                }
                for example in examples {
                    out_examples.push(ExampleCase { rule: Arc::clone(&rule), example });
                }
            }
            Elem::Rules => {} // merged incrementally via each <rule>'s own close
            Elem::Ruleset { patterns, rules } => {
                let entry = Arc::new(ProgramEntry { rules });
                for pattern in &patterns {
                    let tokens = radix::compile_pattern(pattern)?;
                    out_programs.insert(&tokens, Arc::clone(&entry))?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn load(xml: &str) -> crate::Result<PatternDb> {
        let _span = tracing::info_span!("patterndb_load").entered();
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut version = 0u32;
        let mut pub_date = String::new();
        let mut programs: Node<Arc<ProgramEntry>> = Node::new();
        let mut examples: Vec<ExampleCase> = Vec::new();

        let mut stack: Vec<Elem> = Vec::new();
        let mut text = String::new();

        loop {
            let pos = reader.buffer_position() as usize;
            match reader.read_event()? {
                Event::Eof => break,
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(t) => text.push_str(&String::from_utf8_lossy(&t.into_inner())),
                Event::Start(s) => {
                    text.clear();
                    let frame = open(xml, pos, &s)?;
                    stack.push(frame);
                }
                Event::Empty(s) => {
                    text.clear();
                    let frame = open(xml, pos, &s)?;
                    stack.push(frame);
                    close(xml, pos, &mut stack, &text, &mut version, &mut pub_date, &mut programs, &mut examples)?;
                }
                Event::End(_) => {
                    close(xml, pos, &mut stack, &text, &mut version, &mut pub_date, &mut programs, &mut examples)?;
                    text.clear();
                }
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err(err(xml, xml.len(), "unterminated element at end of document"));
        }

        Ok(PatternDb { version, pub_date, programs, examples })
    }
}
