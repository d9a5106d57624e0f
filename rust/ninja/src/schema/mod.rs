//! Immutable catalogue of target-lists and the hierarchy paths between them.

mod definition;
mod target;

pub use definition::api_schema;
pub use target::{apply_format, LookUp, LookUpType, Target, TargetDef, TargetDefList};

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Where descent into child lists stops while computing a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPoint {
    pub list: String,
    pub inclusive: bool,
}

impl ExitPoint {
    /// The list is part of the hierarchy but its children are not.
    pub fn inclusive(list: &str) -> Self {
        Self {
            list: list.to_string(),
            inclusive: true,
        }
    }

    /// The list and everything below it are cut off.
    pub fn exclusive(list: &str) -> Self {
        Self {
            list: list.to_string(),
            inclusive: false,
        }
    }
}

/// Levels of target-list names, entry point first.
pub type Hierarchy = Vec<Vec<String>>;

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    lists: Vec<TargetDefList>,
}

impl SchemaBuilder {
    pub fn add(mut self, list: TargetDefList) -> Self {
        self.lists.push(list);
        self
    }

    /// Freezes the catalogue after checking names and references.
    pub fn build(self) -> Result<Schema> {
        let mut lists = BTreeMap::new();
        for list in self.lists {
            let name = list.name().to_string();
            if lists.insert(name.clone(), list).is_some() {
                bail!("duplicate target-list '{name}'");
            }
        }

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        for list in lists.values() {
            if let Some(parent) = &list.lookup().parent_list {
                if !lists.contains_key(parent) {
                    bail!("list '{}' names unknown parent '{parent}'", list.name());
                }
            }
            for target in list.targets() {
                for child in target.children() {
                    if !lists.contains_key(child) {
                        bail!(
                            "target '{}' in '{}' points to unknown list '{child}'",
                            target.name(),
                            list.name()
                        );
                    }
                }
                attributes
                    .entry(target.final_name().to_string())
                    .or_default()
                    .push(list.name().to_string());
            }
        }

        Ok(Schema { lists, attributes })
    }
}

#[derive(Debug)]
pub struct Schema {
    lists: BTreeMap<String, TargetDefList>,
    attributes: HashMap<String, Vec<String>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TargetDefList> {
        self.lists.get(name)
    }

    pub fn list_names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    /// Every list defining `attribute`, optionally restricted to `allowed`, in name order.
    pub fn find_all<'a>(
        &'a self,
        attribute: &str,
        allowed: Option<&'a BTreeSet<String>>,
    ) -> Vec<&'a TargetDefList> {
        let mut found: Vec<&TargetDefList> = self
            .attributes
            .get(attribute)
            .into_iter()
            .flatten()
            .filter(|name| allowed.map_or(true, |allowed| allowed.contains(*name)))
            .filter_map(|name| self.lists.get(name))
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found.dedup_by(|a, b| a.name() == b.name());
        found
    }

    pub fn find<'a>(&'a self, attribute: &str, allowed: Option<&'a BTreeSet<String>>) -> Option<&'a TargetDefList> {
        self.find_all(attribute, allowed).into_iter().next()
    }

    pub fn knows_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    /// Breadth-first walk from `entry` through pointer targets. Lists are visited
    /// once, so cyclic references terminate.
    pub fn hierarchy(&self, entry: &str, exits: &[ExitPoint]) -> Result<Hierarchy> {
        if !self.lists.contains_key(entry) {
            bail!("unknown entry point '{entry}'");
        }

        let mut visited: HashSet<String> = HashSet::from([entry.to_string()]);
        let mut levels: Hierarchy = Vec::new();
        let mut current = vec![entry.to_string()];

        while !current.is_empty() {
            let mut next = Vec::new();
            for name in &current {
                if exits.iter().any(|exit| exit.inclusive && &exit.list == name) {
                    continue;
                }
                let Some(list) = self.lists.get(name) else {
                    continue;
                };
                for child in list.targets().iter().flat_map(TargetDef::children) {
                    if exits.iter().any(|exit| !exit.inclusive && &exit.list == child) {
                        continue;
                    }
                    if visited.insert(child.clone()) {
                        next.push(child.clone());
                    }
                }
            }
            levels.push(current);
            current = next;
        }

        Ok(levels)
    }

    /// Map keys along the hierarchy, one per level, stopping at the first level
    /// that holds no MAP list.
    pub fn hierarchy_trigger_keys(&self, entry: &str, exits: &[ExitPoint]) -> Result<Vec<String>> {
        Ok(self.trigger_keys_of(&self.hierarchy(entry, exits)?))
    }

    pub fn trigger_keys_of(&self, hierarchy: &Hierarchy) -> Vec<String> {
        let mut keys = Vec::new();
        for level in hierarchy {
            let key = level
                .iter()
                .filter_map(|name| self.lists.get(name))
                .map(TargetDefList::lookup)
                .find(|lookup| lookup.kind == LookUpType::Map)
                .and_then(|lookup| lookup.map_type_key.clone());
            match key {
                Some(key) => keys.push(key),
                None => break,
            }
        }
        keys
    }
}
