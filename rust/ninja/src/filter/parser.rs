use super::{Clause, FilterNode, Literal, OperatorRegistry, ValueNode};
use crate::error::{Result, ServiceError};
use serde_json::Number;
use std::str::FromStr;

/// Parses a `where` string. Blank input yields `None`; a top-level comma
/// separated sequence is an implicit `and`.
///
/// A clause segment is taken as the operator when it names a registered
/// operator and is followed by `.`; the segments between alias and operator
/// form the JSON path.
pub fn parse(input: &str, registry: &OperatorRegistry) -> Result<Option<FilterNode>> {
    if input.trim().is_empty() {
        return Ok(None);
    }

    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
        registry,
    };

    let mut nodes = parser.sequence()?;
    parser.skip_whitespace();
    if let Some(ch) = parser.peek() {
        return Err(parser.error(format!("unexpected '{ch}'")));
    }

    Ok(Some(if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        FilterNode::And(nodes)
    }))
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    registry: &'a OperatorRegistry,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, reason: impl Into<String>) -> ServiceError {
        self.error_at(self.pos, reason)
    }

    fn error_at(&self, position: usize, reason: impl Into<String>) -> ServiceError {
        ServiceError::FilterSyntax {
            position,
            reason: reason.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.peek() {
            Some(ch) if ch == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{expected}' but found '{ch}'"))),
            None => Err(self.error(format!("expected '{expected}' but reached end of input"))),
        }
    }

    /// Terms separated by commas, up to `)` or end of input.
    fn sequence(&mut self) -> Result<Vec<FilterNode>> {
        let mut nodes = vec![self.term()?];
        loop {
            self.skip_whitespace();
            if self.peek() != Some(',') {
                return Ok(nodes);
            }
            self.pos += 1;
            nodes.push(self.term()?);
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn term(&mut self) -> Result<FilterNode> {
        self.skip_whitespace();
        let start = self.pos;
        let ident = self.identifier();
        if ident.is_empty() {
            return Err(match self.peek() {
                Some(ch) => self.error(format!("expected an attribute, 'and(' or 'or(' but found '{ch}'")),
                None => self.error("expected an attribute, 'and(' or 'or(' but reached end of input"),
            });
        }

        if (ident == "and" || ident == "or") && self.peek() == Some('(') {
            self.pos += 1;
            let children = self.sequence()?;
            self.skip_whitespace();
            self.expect(')')?;
            return Ok(if ident == "and" {
                FilterNode::And(children)
            } else {
                FilterNode::Or(children)
            });
        }

        self.clause(ident, start)
    }

    fn clause(&mut self, alias: String, start: usize) -> Result<FilterNode> {
        let mut path: Vec<String> = Vec::new();
        let operator = loop {
            self.expect('.')?;
            let segment_start = self.pos;
            let segment = self.identifier();
            if segment.is_empty() {
                return Err(self.error_at(segment_start, "expected a JSON path segment or operator"));
            }
            if self.registry.is_operator_name(&segment) && self.peek() == Some('.') {
                self.pos += 1;
                break segment;
            }
            if self.peek() != Some('.') {
                return Err(self.error_at(
                    segment_start,
                    format!("expected an operator followed by '.', found '{segment}'"),
                ));
            }
            path.push(segment);
        };

        let value = if self.peek() == Some('(') {
            self.pos += 1;
            let mut items = vec![self.literal()?];
            loop {
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                        items.push(self.literal()?);
                    }
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    Some(ch) => return Err(self.error(format!("unexpected '{ch}' in list"))),
                    None => return Err(self.error("unterminated list, missing ')'")),
                }
            }
            ValueNode::List(items)
        } else {
            ValueNode::Scalar(self.literal()?)
        };

        Ok(FilterNode::Clause(Clause {
            alias,
            json_path: (!path.is_empty()).then(|| path.join(".")),
            operator,
            value,
            position: start,
        }))
    }

    /// A quoted or bare value, stopping before `,` or `)`.
    fn literal(&mut self) -> Result<Literal> {
        self.skip_whitespace();
        match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                let literal = self.quoted(quote)?;
                self.skip_whitespace();
                match self.peek() {
                    None | Some(',') | Some(')') => Ok(literal),
                    Some(ch) => Err(self.error(format!("unexpected '{ch}' after quoted value"))),
                }
            }
            _ => self.bare(),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<Literal> {
        let start = self.pos;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(ch) => {
                            text.push(ch);
                            self.pos += 1;
                        }
                        None => return Err(self.error("dangling escape at end of input")),
                    }
                }
                Some(ch) if ch == quote => {
                    self.pos += 1;
                    return Ok(Literal::String(text));
                }
                Some(ch) => {
                    text.push(ch);
                    self.pos += 1;
                }
                None => return Err(self.error_at(start, "unterminated quoted value")),
            }
        }
    }

    fn bare(&mut self) -> Result<Literal> {
        let start = self.pos;
        let mut text = String::new();
        let mut escaped = false;
        while let Some(ch) = self.peek() {
            match ch {
                ',' | ')' => break,
                '(' | '\'' => {
                    return Err(self.error(format!("unescaped '{ch}' inside value")));
                }
                '\\' => {
                    self.pos += 1;
                    let Some(next) = self.peek() else {
                        return Err(self.error("dangling escape at end of input"));
                    };
                    text.push(next);
                    escaped = true;
                    self.pos += 1;
                }
                _ => {
                    text.push(ch);
                    self.pos += 1;
                }
            }
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(self.error_at(start, "missing value"));
        }
        if escaped {
            return Ok(Literal::String(trimmed.to_string()));
        }
        Ok(match trimmed {
            "null" => Literal::Null,
            "true" => Literal::Boolean(true),
            "false" => Literal::Boolean(false),
            other => match Number::from_str(other) {
                Ok(number) => Literal::Number(number),
                Err(_) => Literal::String(other.to_string()),
            },
        })
    }
}
