use super::ValueNode;
use std::collections::{BTreeSet, HashMap};

pub type OperatorCheck = fn(&ValueNode) -> bool;

/// SQL template for one `(value shape, operator)` pair.
///
/// Placeholders: `%c` column, `%v` bound value, `%v[a:b]` bound slice of a list
/// value (Python slice semantics), `%j` JSON path joined by commas, `%%` a literal `%`.
#[derive(Debug, Clone)]
pub struct Operator {
    pub template: String,
    pub check: Option<OperatorCheck>,
}

impl Operator {
    pub fn accepts(&self, value: &ValueNode) -> bool {
        self.check.map_or(true, |check| check(value))
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Operator>,
    names: BTreeSet<String>,
}

/// `[JSON/][LIST/]<TYPE>/<OP>`
pub fn operator_id(json: bool, value: &ValueNode, operator: &str) -> String {
    let mut id = String::new();
    if json {
        id.push_str("JSON/");
    }
    if value.is_list() {
        id.push_str("LIST/");
    }
    id.push_str(value.value_type().as_str());
    id.push('/');
    id.push_str(&operator.to_ascii_uppercase());
    id
}

fn is_envelope(value: &ValueNode) -> bool {
    matches!(value, ValueNode::List(items) if items.len() == 4 || items.len() == 5)
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `shape` is the id prefix without the operator, e.g. `JSON/LIST/STRING`.
    pub fn add(&mut self, shape: &str, operator: &str, template: &str) {
        self.insert(shape, operator, template, None);
    }

    pub fn add_checked(&mut self, shape: &str, operator: &str, template: &str, check: OperatorCheck) {
        self.insert(shape, operator, template, Some(check));
    }

    fn insert(&mut self, shape: &str, operator: &str, template: &str, check: Option<OperatorCheck>) {
        let operator = operator.to_ascii_lowercase();
        self.operators.insert(
            format!("{shape}/{}", operator.to_ascii_uppercase()),
            Operator {
                template: template.to_string(),
                check,
            },
        );
        self.names.insert(operator);
    }

    pub fn get(&self, id: &str) -> Option<&Operator> {
        self.operators.get(id)
    }

    pub fn is_operator_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// The operator table served by the API.
    pub fn standard() -> Self {
        let mut reg = Self::new();

        reg.add("NULL", "eq", "%c is %v");
        reg.add("NULL", "neq", "%c is not %v");

        reg.add("BOOLEAN", "eq", "%c = %v");
        reg.add("BOOLEAN", "neq", "%c <> %v");

        reg.add("NUMBER", "eq", "%c = %v");
        reg.add("NUMBER", "neq", "%c <> %v");
        reg.add("NUMBER", "lt", "%c < %v");
        reg.add("NUMBER", "gt", "%c > %v");
        reg.add("NUMBER", "lteq", "%c <= %v");
        reg.add("NUMBER", "gteq", "%c >= %v");

        reg.add("STRING", "eq", "%c = %v");
        reg.add("STRING", "neq", "%c <> %v");
        reg.add("STRING", "re", "%c ~ %v");
        reg.add("STRING", "ire", "%c ~* %v");
        reg.add("STRING", "nre", "%c !~ %v");
        reg.add("STRING", "nire", "%c !~* %v");

        reg.add("JSON/NULL", "eq", "%c#>'{%j}' is %v");
        reg.add("JSON/NULL", "neq", "%c#>'{%j}' is not %v");

        reg.add("JSON/BOOLEAN", "eq", "(%c#>'{%j}')::boolean = %v");
        reg.add("JSON/BOOLEAN", "neq", "(%c#>'{%j}')::boolean <> %v");

        for (op, sql) in [
            ("eq", "="),
            ("neq", "<>"),
            ("lt", "<"),
            ("gt", ">"),
            ("lteq", "<="),
            ("gteq", ">="),
        ] {
            reg.add(
                "JSON/NUMBER",
                op,
                &format!("(%c#>'{{%j}}')::double precision {sql} %v"),
            );
        }

        for (op, sql) in [
            ("eq", "="),
            ("neq", "<>"),
            ("re", "~"),
            ("ire", "~*"),
            ("nre", "!~"),
            ("nire", "!~*"),
        ] {
            reg.add("JSON/STRING", op, &format!("%c#>>'{{%j}}' {sql} %v"));
        }

        for shape in ["LIST/NUMBER", "LIST/STRING", "LIST/NULL"] {
            reg.add(shape, "in", "%c in (%v)");
            reg.add(shape, "nin", "%c not in (%v)");
        }

        reg.add_checked("LIST/NUMBER", "bbi", "%c && ST_MakeEnvelope(%v)", is_envelope);
        reg.add_checked("LIST/NUMBER", "bbc", "%c @ ST_MakeEnvelope(%v)", is_envelope);

        reg.add("JSON/LIST/STRING", "in", "%c#>>'{%j}' in (%v)");
        reg.add("JSON/LIST/NUMBER", "in", "(%c#>'{%j}')::double precision in (%v)");
        reg.add("JSON/LIST/NULL", "in", "%c#>'{%j}' in (%v)");
        reg.add("JSON/LIST/MIXED", "in", "%c#>'{%j}' in (%v)");

        reg.add("JSON/LIST/STRING", "nin", "%c#>>'{%j}' not in (%v)");
        reg.add("JSON/LIST/NUMBER", "nin", "(%c#>'{%j}')::double precision not in (%v)");
        reg.add("JSON/LIST/NULL", "nin", "%c#>'{%j}' not in (%v)");
        reg.add("JSON/LIST/MIXED", "nin", "%c#>'{%j}' not in (%v)");

        reg
    }
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Column,
    JsonPath,
    Value(Option<Slice>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl Slice {
    /// Half-open range into a sequence of `len` items, negative bounds count from the end.
    pub fn range(&self, len: usize) -> std::ops::Range<usize> {
        let len = len as i64;
        let clamp = |bound: i64| -> usize {
            let resolved = if bound < 0 { len + bound } else { bound };
            resolved.clamp(0, len) as usize
        };
        let start = self.start.map_or(0, clamp);
        let end = self.end.map_or(len as usize, clamp);
        start..end.max(start)
    }
}

/// Splits a template into its placeholders. Unknown `%x` sequences are kept as text.
pub fn parse_template(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    let flush = |text: &mut String, parts: &mut Vec<TemplatePart>| {
        if !text.is_empty() {
            parts.push(TemplatePart::Text(std::mem::take(text)));
        }
    };

    while let Some(ch) = chars.next() {
        if ch != '%' {
            text.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                text.push('%');
            }
            Some('c') => {
                chars.next();
                flush(&mut text, &mut parts);
                parts.push(TemplatePart::Column);
            }
            Some('j') => {
                chars.next();
                flush(&mut text, &mut parts);
                parts.push(TemplatePart::JsonPath);
            }
            Some('v') => {
                chars.next();
                flush(&mut text, &mut parts);
                let slice = if chars.peek() == Some(&'[') {
                    let mut spec = String::new();
                    chars.next();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        spec.push(next);
                    }
                    parse_slice(&spec)
                } else {
                    None
                };
                parts.push(TemplatePart::Value(slice));
            }
            _ => text.push('%'),
        }
    }
    flush(&mut text, &mut parts);
    parts
}

fn parse_slice(spec: &str) -> Option<Slice> {
    let bound = |raw: &str| -> Option<i64> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else {
            raw.parse().ok()
        }
    };
    match spec.split_once(':') {
        Some((start, end)) => Some(Slice {
            start: bound(start),
            end: bound(end),
        }),
        None => {
            let index = bound(spec)?;
            Some(Slice {
                start: Some(index),
                end: Some(if index == -1 { i64::MAX } else { index + 1 }),
            })
        }
    }
}
