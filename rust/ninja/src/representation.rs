use crate::error::{Result, ServiceError};
use std::{collections::BTreeSet, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    Node,
    Edge,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Flat,
    Tree,
}

/// Dataset and output shape, written in the first path segment as an
/// unordered comma separated pair such as `tree,edge` or just `flat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Representation {
    pub dataset: Dataset,
    pub shape: Shape,
}

impl Representation {
    pub const fn new(dataset: Dataset, shape: Shape) -> Self {
        Self { dataset, shape }
    }

    pub fn is_tree(self) -> bool {
        self.shape == Shape::Tree
    }

    pub fn is_event(self) -> bool {
        self.dataset == Dataset::Event
    }
}

impl FromStr for Representation {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self> {
        let wrong = || ServiceError::WrongRepresentation(raw.to_string());
        let tokens: BTreeSet<String> = raw
            .split(',')
            .map(|token| token.trim().to_lowercase())
            .filter(|token| !token.is_empty())
            .collect();

        let mut dataset = None;
        let mut shape = None;
        for token in &tokens {
            match token.as_str() {
                "flat" | "tree" => {
                    if shape.is_some() {
                        return Err(wrong());
                    }
                    shape = Some(if token == "flat" { Shape::Flat } else { Shape::Tree });
                }
                "node" | "edge" | "event" => {
                    if dataset.is_some() {
                        return Err(wrong());
                    }
                    dataset = Some(match token.as_str() {
                        "node" => Dataset::Node,
                        "edge" => Dataset::Edge,
                        _ => Dataset::Event,
                    });
                }
                _ => return Err(wrong()),
            }
        }

        let shape = shape.ok_or_else(wrong)?;
        Ok(Self::new(dataset.unwrap_or(Dataset::Node), shape))
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self.shape {
            Shape::Flat => "flat",
            Shape::Tree => "tree",
        };
        let dataset = match self.dataset {
            Dataset::Node => "node",
            Dataset::Edge => "edge",
            Dataset::Event => "event",
        };
        write!(f, "{shape},{dataset}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unordered_and_dataset_defaults_to_node() {
        let parsed: Representation = "node, FLAT".parse().unwrap();
        assert_eq!(parsed, Representation::new(Dataset::Node, Shape::Flat));
        let parsed: Representation = "tree".parse().unwrap();
        assert_eq!(parsed, Representation::new(Dataset::Node, Shape::Tree));
        let parsed: Representation = "event,tree".parse().unwrap();
        assert_eq!(parsed.to_string(), "tree,event");
    }

    #[test]
    fn rejects_missing_or_conflicting_tokens() {
        for raw in ["node", "flat,tree", "edge,node,flat", "flat,table", ""] {
            let err = raw.parse::<Representation>().unwrap_err();
            assert!(
                matches!(&err, ServiceError::WrongRepresentation(given) if given == raw),
                "{raw}: {err:?}"
            );
        }
    }
}
