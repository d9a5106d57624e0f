//! The `where` mini-language: AST, parser and the operator table it compiles against.
//!
//! ```text
//! and(sactive.eq.true,or(smetadata.city.eq."BZ",scode.in.(a,b)))
//! ```

mod operators;
mod parser;

pub use operators::{
    operator_id, parse_template, Operator, OperatorCheck, OperatorRegistry, Slice, TemplatePart,
};
pub use parser::parse;

use serde_json::{Number, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Clause(Clause),
}

impl FilterNode {
    /// Node name as reported in diagnostics: `AND`, `OR` or `CLAUSE`.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterNode::And(_) => "AND",
            FilterNode::Or(_) => "OR",
            FilterNode::Clause(_) => "CLAUSE",
        }
    }

    /// Clauses in source order.
    pub fn clauses(&self) -> Vec<&Clause> {
        let mut out = Vec::new();
        self.collect_clauses(&mut out);
        out
    }

    fn collect_clauses<'a>(&'a self, out: &mut Vec<&'a Clause>) {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.collect_clauses(out);
                }
            }
            FilterNode::Clause(clause) => out.push(clause),
        }
    }
}

/// `alias[.json.path].operator.value`
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub alias: String,
    pub json_path: Option<String>,
    pub operator: String,
    pub value: ValueNode,
    /// Character offset of the alias in the filter string.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueNode {
    Scalar(Literal),
    List(Vec<Literal>),
}

impl ValueNode {
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueNode::Scalar(literal) => literal.value_type(),
            ValueNode::List(items) => children_type(items),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ValueNode::List(_))
    }

    pub fn len(&self) -> usize {
        match self {
            ValueNode::Scalar(_) => 1,
            ValueNode::List(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ValueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueNode::Scalar(literal) => write!(f, "{literal}"),
            ValueNode::List(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Number(Number),
    String(String),
}

impl Literal {
    pub fn value_type(&self) -> ValueType {
        match self {
            Literal::Null => ValueType::Null,
            Literal::Boolean(_) => ValueType::Boolean,
            Literal::Number(_) => ValueType::Number,
            Literal::String(_) => ValueType::String,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Boolean(value) => Value::Bool(*value),
            Literal::Number(value) => Value::Number(value.clone()),
            Literal::String(value) => Value::String(value.clone()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Boolean(value) => write!(f, "{value}"),
            Literal::Number(value) => write!(f, "{value}"),
            Literal::String(value) => write!(f, "'{value}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    Mixed,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Null => "NULL",
            ValueType::Boolean => "BOOLEAN",
            ValueType::Number => "NUMBER",
            ValueType::String => "STRING",
            ValueType::Mixed => "MIXED",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared type of list members; nulls do not break homogeneity, an all-null list is `NULL`.
pub fn children_type(items: &[Literal]) -> ValueType {
    let mut found: Option<ValueType> = None;
    for item in items {
        let kind = item.value_type();
        if kind == ValueType::Null {
            continue;
        }
        match found {
            None => found = Some(kind),
            Some(existing) if existing == kind => {}
            Some(_) => return ValueType::Mixed,
        }
    }
    found.unwrap_or(ValueType::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_children_type() {
        let num = Literal::Number(Number::from(1));
        let text = Literal::String("a".into());
        assert_eq!(children_type(&[num.clone(), num.clone()]), ValueType::Number);
        assert_eq!(children_type(&[num.clone(), Literal::Null]), ValueType::Number);
        assert_eq!(children_type(&[Literal::Null]), ValueType::Null);
        assert_eq!(children_type(&[num, text]), ValueType::Mixed);
    }

    #[test]
    fn list_display_matches_filter_syntax() {
        let value = ValueNode::List(vec![Literal::Number(Number::from(3)), Literal::Null]);
        assert_eq!(value.to_string(), "(3,null)");
    }
}
