//! Reshapes an ordered flat result into the nested tree representation.
//!
//! Rows must arrive sorted by the hierarchy trigger keys. Whenever the value of
//! trigger key `i` changes, every object from level `i` downwards is rebuilt
//! and attached to its parent according to the list's [`LookUp`].

use crate::{
    error::{Result, ServiceError},
    query::executor::Row,
    schema::{ExitPoint, LookUpType, Schema, Target},
};
use serde_json::{Map, Value};
use std::collections::{btree_map::Entry, BTreeMap, HashMap};

type NodeId = usize;

#[derive(Debug, Default)]
struct Object {
    fields: BTreeMap<String, Value>,
    children: BTreeMap<String, Child>,
}

impl Object {
    fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.children.is_empty()
    }
}

#[derive(Debug)]
enum Child {
    Object(NodeId),
    Map(BTreeMap<String, NodeId>),
    List(Vec<NodeId>),
}

pub struct TreeBuilder<'a> {
    schema: &'a Schema,
    entry: &'a str,
    exits: &'a [ExitPoint],
    show_null: bool,
    max_size_mb: i64,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(schema: &'a Schema, entry: &'a str, exits: &'a [ExitPoint]) -> Self {
        Self {
            schema,
            entry,
            exits,
            show_null: false,
            max_size_mb: 0,
        }
    }

    pub fn show_null(mut self, show_null: bool) -> Self {
        self.show_null = show_null;
        self
    }

    /// Size cap in MB, `<= 0` disables it.
    pub fn max_size_mb(mut self, max_size_mb: i64) -> Self {
        self.max_size_mb = max_size_mb;
        self
    }

    pub fn build(&self, rows: &[Row]) -> Result<Value> {
        let Some(first) = rows.first() else {
            return Ok(Value::Object(Map::new()));
        };

        let hierarchy = self.schema.hierarchy(self.entry, self.exits)?;
        let trigger_keys = self.schema.trigger_keys_of(&hierarchy);
        let max_bytes = (self.max_size_mb > 0).then(|| self.max_size_mb as u64 * 1_000_000);

        // Every row carries the same columns, so the per-list catalogue comes from the first.
        let catalog: HashMap<&str, Vec<(String, Target)>> = hierarchy
            .iter()
            .flatten()
            .filter_map(|name| self.schema.get(name))
            .map(|list| {
                let columns = first
                    .keys()
                    .filter_map(|key| Target::parse(key).map(|target| (key.clone(), target)))
                    .filter(|(_, target)| list.find(target.name()).is_some())
                    .collect();
                (list.name(), columns)
            })
            .collect();

        let mut arena = vec![Object::default()];
        const ROOT: NodeId = 0;
        let mut cache: HashMap<&str, NodeId> = HashMap::new();
        let mut previous: Option<Vec<&str>> = None;
        let mut size: u64 = 0;

        for row in rows {
            let current = trigger_values(row, &trigger_keys)?;
            let renew = match &previous {
                None => 0,
                Some(previous) => previous
                    .iter()
                    .zip(&current)
                    .position(|(before, now)| before != now)
                    .unwrap_or(trigger_keys.len()),
            };

            for level in hierarchy.iter().skip(renew) {
                for name in level {
                    let columns = catalog.get(name.as_str()).map(Vec::as_slice).unwrap_or_default();
                    let (object, bytes) = self.make_object(columns, row);
                    size += bytes;
                    arena.push(object);
                    cache.insert(name.as_str(), arena.len() - 1);
                }
            }

            for level in hierarchy.iter().skip(renew).rev() {
                // merged and inlined values first, so emptiness checks below see them
                let ordered = level
                    .iter()
                    .filter_map(|name| self.schema.get(name))
                    .filter(|list| matches!(list.lookup().kind, LookUpType::Merge | LookUpType::Inline))
                    .chain(
                        level
                            .iter()
                            .filter_map(|name| self.schema.get(name))
                            .filter(|list| matches!(list.lookup().kind, LookUpType::Map | LookUpType::List)),
                    );

                for list in ordered {
                    let lookup = list.lookup();
                    let Some(&node) = cache.get(list.name()) else {
                        continue;
                    };
                    let parent = lookup
                        .parent_list
                        .as_deref()
                        .and_then(|parent| cache.get(parent).copied())
                        .unwrap_or(ROOT);
                    let target = lookup.parent_target.clone();

                    match lookup.kind {
                        LookUpType::Inline => {
                            let Some(target) = target else { continue };
                            if arena[node].is_empty() && !self.show_null {
                                arena[parent].children.remove(&target);
                            } else {
                                arena[parent].children.insert(target, Child::Object(node));
                            }
                        }
                        LookUpType::Merge => {
                            let Some(target) = target else { continue };
                            let value = arena[node].fields.get(&target).cloned();
                            match value {
                                Some(value) if !value.is_null() || self.show_null => {
                                    arena[parent].fields.insert(target, value);
                                }
                                None if self.show_null => {
                                    arena[parent].fields.insert(target, Value::Null);
                                }
                                _ => {}
                            }
                        }
                        LookUpType::Map => {
                            let Some(key) = lookup.map_type_key.as_deref() else { continue };
                            let key = map_key(row, key)?;
                            let existing = match target {
                                None => match arena[parent].children.get(key) {
                                    Some(Child::Object(existing)) => Some(*existing),
                                    _ => {
                                        arena[parent]
                                            .children
                                            .insert(key.to_string(), Child::Object(node));
                                        None
                                    }
                                },
                                Some(target) => {
                                    let entry = arena[parent]
                                        .children
                                        .entry(target)
                                        .or_insert_with(|| Child::Map(BTreeMap::new()));
                                    match entry {
                                        Child::Map(map) => match map.get(key) {
                                            Some(existing) => Some(*existing),
                                            None => {
                                                map.insert(key.to_string(), node);
                                                None
                                            }
                                        },
                                        _ => None,
                                    }
                                }
                            };
                            // an entry with this key already exists: keep filling that one
                            if let Some(existing) = existing {
                                absorb(&mut arena, node, existing);
                                cache.insert(list.name(), existing);
                            }
                        }
                        LookUpType::List => {
                            let Some(target) = target else { continue };
                            if arena[node].is_empty() && !self.show_null {
                                continue;
                            }
                            let entry = arena[parent]
                                .children
                                .entry(target)
                                .or_insert_with(|| Child::List(Vec::new()));
                            if let Child::List(items) = entry {
                                items.push(node);
                            }
                        }
                    }
                }
            }

            previous = Some(current);

            if let Some(max_bytes) = max_bytes {
                if size > max_bytes {
                    return Err(ServiceError::ResponseTooLarge(self.max_size_mb));
                }
            }
        }

        Ok(render(&arena, ROOT))
    }

    /// Projects the row through a list's columns; returns the object and its
    /// estimated serialised size.
    fn make_object(&self, columns: &[(String, Target)], row: &Row) -> (Object, u64) {
        let mut object = Object::default();
        let mut size = 0u64;

        for (key, target) in columns {
            let cell = row.get(key).cloned().unwrap_or(Value::Null);
            if cell.is_null() && !self.show_null {
                continue;
            }
            size += value_len(&cell);

            match target.json_path() {
                None => {
                    size += key.len() as u64;
                    object.fields.insert(key.clone(), cell);
                }
                Some(path) => {
                    let root = object
                        .fields
                        .entry(target.name().to_string())
                        .or_insert_with(|| {
                            size += target.name().len() as u64;
                            Value::Object(Map::new())
                        });
                    size += path.len() as u64;
                    nest(root, path, cell);
                }
            }
        }

        (object, size)
    }
}

/// Moves everything attached to `from` into `into`, keeping what `into` already has.
fn absorb(arena: &mut [Object], from: NodeId, into: NodeId) {
    if from == into {
        return;
    }
    let fresh = std::mem::take(&mut arena[from]);
    let mut pending = Vec::new();

    let target = &mut arena[into];
    for (key, value) in fresh.fields {
        target.fields.entry(key).or_insert(value);
    }
    for (key, child) in fresh.children {
        match target.children.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(child);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), child) {
                (Child::Map(existing), Child::Map(entries)) => {
                    for (name, node) in entries {
                        match existing.get(&name) {
                            Some(&other) => pending.push((node, other)),
                            None => {
                                existing.insert(name, node);
                            }
                        }
                    }
                }
                (Child::List(existing), Child::List(items)) => existing.extend(items),
                (Child::Object(existing), Child::Object(node)) => pending.push((node, *existing)),
                _ => {}
            },
        }
    }

    for (from, into) in pending {
        absorb(arena, from, into);
    }
}

fn trigger_values<'r>(row: &'r Row, keys: &[String]) -> Result<Vec<&'r str>> {
    keys.iter().map(|key| map_key(row, key)).collect()
}

/// Map keys must be present strings; null and other types are rejected.
fn map_key<'r>(row: &'r Row, key: &str) -> Result<&'r str> {
    match row.get(key) {
        Some(Value::String(value)) => Ok(value.as_str()),
        _ => Err(ServiceError::TriggerKeyNotString(key.to_string())),
    }
}

/// Puts `value` at the dotted `path` below `root`, creating objects on the way.
/// A non-object already in the way is left untouched.
fn nest(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn value_len(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::String(text) => text.len() as u64,
        other => other.to_string().len() as u64,
    }
}

fn render(arena: &[Object], id: NodeId) -> Value {
    let object = &arena[id];
    let mut out: BTreeMap<String, Value> = object.fields.clone();
    for (key, child) in &object.children {
        let value = match child {
            Child::Object(node) => render(arena, *node),
            Child::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(name, node)| (name.clone(), render(arena, *node)))
                    .collect(),
            ),
            Child::List(items) => Value::Array(items.iter().map(|node| render(arena, *node)).collect()),
        };
        out.insert(key.clone(), value);
    }
    Value::Object(out.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::api_schema;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap().clone())
            .collect()
    }

    fn station_exits() -> Vec<ExitPoint> {
        vec![
            ExitPoint::exclusive("datatype"),
            ExitPoint::exclusive("metadatahistory"),
        ]
    }

    #[test]
    fn stations_nest_by_type_and_code() {
        let schema = api_schema().unwrap();
        let exits = station_exits();
        let input = rows(json!([
            {"_stationtype": "Parking", "_stationcode": "A", "sname": "Alpha", "pname": "Hub", "smetadata.address.city": "BZ"},
            {"_stationtype": "Parking", "_stationcode": "B", "sname": "Beta", "pname": null, "smetadata.address.city": null},
            {"_stationtype": "Weather", "_stationcode": "W", "sname": "Wind", "pname": null, "smetadata.address.city": null},
        ]));

        let tree = TreeBuilder::new(&schema, "stationtype", &exits).build(&input).unwrap();
        assert_eq!(
            tree,
            json!({
                "Parking": {"stations": {
                    "A": {"sname": "Alpha", "sparent": {"pname": "Hub"}, "smetadata": {"address": {"city": "BZ"}}},
                    "B": {"sname": "Beta"},
                }},
                "Weather": {"stations": {"W": {"sname": "Wind"}}},
            })
        );
    }

    #[test]
    fn show_null_keeps_empty_objects_and_nulls() {
        let schema = api_schema().unwrap();
        let exits = station_exits();
        let input = rows(json!([
            {"_stationtype": "Parking", "_stationcode": "B", "sname": "Beta", "pname": null},
        ]));
        let tree = TreeBuilder::new(&schema, "stationtype", &exits)
            .show_null(true)
            .build(&input)
            .unwrap();
        assert_eq!(
            tree,
            json!({"Parking": {"stations": {"B": {"sname": "Beta", "sparent": {"pname": null}}}}})
        );
    }

    #[test]
    fn measurements_merge_values_into_lists() {
        let schema = api_schema().unwrap();
        let exits = [ExitPoint::exclusive("metadatahistory")];
        let input = rows(json!([
            {"_stationtype": "Parking", "_stationcode": "A", "_datatypename": "free", "tname": "free", "mvalue": 3, "mvalidtime": "t1", "prname": "collector"},
            {"_stationtype": "Parking", "_stationcode": "A", "_datatypename": "free", "tname": "free", "mvalue": 4, "mvalidtime": "t2", "prname": null},
            {"_stationtype": "Parking", "_stationcode": "A", "_datatypename": "status", "tname": "status", "mvalue": "ok", "mvalidtime": "t1", "prname": null},
        ]));

        let tree = TreeBuilder::new(&schema, "stationtype", &exits).build(&input).unwrap();
        assert_eq!(
            tree,
            json!({"Parking": {"stations": {"A": {"sdatatypes": {
                "free": {"tname": "free", "tmeasurements": [
                    {"mvalue": 3, "mvalidtime": "t1", "mprovenance": {"prname": "collector"}},
                    {"mvalue": 4, "mvalidtime": "t2"},
                ]},
                "status": {"tname": "status", "tmeasurements": [{"mvalue": "ok", "mvalidtime": "t1"}]},
            }}}}})
        );
    }

    #[test]
    fn unsorted_keys_reuse_existing_entries() {
        let schema = api_schema().unwrap();
        let exits = station_exits();
        let input = rows(json!([
            {"_stationtype": "Parking", "_stationcode": "A", "sname": "Alpha"},
            {"_stationtype": "Bike", "_stationcode": "B", "sname": "Beta"},
            {"_stationtype": "Parking", "_stationcode": "C", "sname": "Gamma"},
        ]));
        let tree = TreeBuilder::new(&schema, "stationtype", &exits).build(&input).unwrap();
        assert_eq!(
            tree["Parking"]["stations"],
            json!({"A": {"sname": "Alpha"}, "C": {"sname": "Gamma"}})
        );
    }

    #[test]
    fn trigger_keys_must_be_strings() {
        let schema = api_schema().unwrap();
        let exits = station_exits();
        let input = rows(json!([{"_stationtype": "Parking", "_stationcode": 7, "sname": "x"}]));
        let err = TreeBuilder::new(&schema, "stationtype", &exits).build(&input).unwrap_err();
        assert!(
            matches!(&err, ServiceError::TriggerKeyNotString(key) if key == "_stationcode"),
            "got: {err:?}"
        );

        let missing = rows(json!([{"_stationtype": "Parking", "sname": "x"}]));
        let err = TreeBuilder::new(&schema, "stationtype", &exits).build(&missing).unwrap_err();
        assert!(matches!(err, ServiceError::TriggerKeyNotString(_)), "got: {err:?}");

        let null = rows(json!([{"_stationtype": "Parking", "_stationcode": null, "sname": "x"}]));
        let err = TreeBuilder::new(&schema, "stationtype", &exits).build(&null).unwrap_err();
        assert!(
            matches!(&err, ServiceError::TriggerKeyNotString(key) if key == "_stationcode"),
            "got: {err:?}"
        );

        let later = rows(json!([
            {"_stationtype": "Parking", "_stationcode": "A", "sname": "x"},
            {"_stationtype": null, "_stationcode": "B", "sname": "y"},
        ]));
        let err = TreeBuilder::new(&schema, "stationtype", &exits).build(&later).unwrap_err();
        assert!(
            matches!(&err, ServiceError::TriggerKeyNotString(key) if key == "_stationtype"),
            "got: {err:?}"
        );
    }

    #[test]
    fn response_size_is_capped() {
        let schema = api_schema().unwrap();
        let exits = station_exits();
        let big = "x".repeat(600_000);
        let input = rows(json!([
            {"_stationtype": "T", "_stationcode": "A", "sname": big},
            {"_stationtype": "T", "_stationcode": "B", "sname": big},
        ]));

        let err = TreeBuilder::new(&schema, "stationtype", &exits)
            .max_size_mb(1)
            .build(&input)
            .unwrap_err();
        assert!(matches!(err, ServiceError::ResponseTooLarge(1)), "got: {err:?}");

        let ok = TreeBuilder::new(&schema, "stationtype", &exits)
            .max_size_mb(1)
            .build(&input[..1])
            .unwrap();
        assert_eq!(ok["T"]["stations"]["A"]["sname"].as_str().map(str::len), Some(600_000));
    }

    #[test]
    fn empty_result_is_an_empty_object() {
        let schema = api_schema().unwrap();
        let tree = TreeBuilder::new(&schema, "edgetype", &[]).build(&[]).unwrap();
        assert_eq!(tree, json!({}));
    }
}
