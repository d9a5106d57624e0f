//! Building blocks of the schema: attribute definitions, the lists that group
//! them, and runtime references parsed from a projection.

use anyhow::{bail, ensure, Result};
use std::fmt;

/// How objects of a target-list attach to their parent while building a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookUpType {
    Inline,
    Merge,
    Map,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookUp {
    pub kind: LookUpType,
    pub parent_list: Option<String>,
    pub parent_target: Option<String>,
    pub map_type_key: Option<String>,
}

impl LookUp {
    pub fn new(
        kind: LookUpType,
        parent_list: Option<&str>,
        parent_target: Option<&str>,
        map_type_key: Option<&str>,
    ) -> Self {
        Self {
            kind,
            parent_list: parent_list.map(str::to_string),
            parent_target: parent_target.map(str::to_string),
            map_type_key: map_type_key.map(str::to_string),
        }
    }

    pub fn inline(parent_list: &str, parent_target: &str) -> Self {
        Self::new(LookUpType::Inline, Some(parent_list), Some(parent_target), None)
    }

    pub fn merge(parent_list: &str, parent_target: &str) -> Self {
        Self::new(LookUpType::Merge, Some(parent_list), Some(parent_target), None)
    }

    pub fn list(parent_list: &str, parent_target: &str) -> Self {
        Self::new(LookUpType::List, Some(parent_list), Some(parent_target), None)
    }

    pub fn map(parent_list: Option<&str>, parent_target: Option<&str>, key: &str) -> Self {
        Self::new(LookUpType::Map, parent_list, parent_target, Some(key))
    }
}

/// A single API attribute: either a column expression or a pointer to child
/// target-lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDef {
    name: String,
    alias: Option<String>,
    projected_name: Option<String>,
    column: Option<String>,
    select_format: String,
    column_format: String,
    children: Vec<String>,
    scalar_only: bool,
}

impl TargetDef {
    pub fn column(name: &str, column: &str) -> Result<Self> {
        validate_name(name)?;
        ensure!(!column.trim().is_empty(), "target '{name}' has an empty column");
        Ok(Self {
            name: name.to_string(),
            alias: None,
            projected_name: None,
            column: Some(column.to_string()),
            select_format: "%s".to_string(),
            column_format: "%s".to_string(),
            children: Vec::new(),
            scalar_only: false,
        })
    }

    pub fn pointer<I, S>(name: &str, children: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_name(name)?;
        let children: Vec<String> = children.into_iter().map(Into::into).collect();
        ensure!(!children.is_empty(), "pointer target '{name}' has no children");
        Ok(Self {
            name: name.to_string(),
            alias: None,
            projected_name: None,
            column: None,
            select_format: "%s".to_string(),
            column_format: "%s".to_string(),
            children,
            scalar_only: false,
        })
    }

    pub fn with_alias(mut self, alias: &str) -> Result<Self> {
        validate_name(alias)?;
        self.alias = Some(alias.to_string());
        Ok(self)
    }

    /// Column label used in the projection instead of the final name. Rows are
    /// expected to fold it back into the final name before they are shaped.
    pub fn with_projected_name(mut self, name: &str) -> Result<Self> {
        validate_name(name)?;
        self.projected_name = Some(name.to_string());
        Ok(self)
    }

    pub fn with_select_format(mut self, format: &str) -> Result<Self> {
        ensure!(format.contains("%s"), "select format '{format}' lacks %s");
        self.select_format = format.to_string();
        Ok(self)
    }

    pub fn with_column_format(mut self, format: &str) -> Result<Self> {
        ensure!(format.contains("%s"), "column format '{format}' lacks %s");
        self.column_format = format.to_string();
        Ok(self)
    }

    /// JSON sub-paths of this attribute project to `null` instead of a path lookup.
    pub fn scalar_only(mut self) -> Self {
        self.scalar_only = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn final_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn raw_column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn formatted_column(&self) -> Option<String> {
        self.column
            .as_deref()
            .map(|column| apply_format(&self.column_format, column))
    }

    /// Projection fragment `<selectFormat(column as label)>`, where the label is
    /// the projected name if set, else the final name.
    pub fn select_fragment(&self) -> Option<String> {
        let label = self.projected_name.as_deref().unwrap_or(self.final_name());
        self.formatted_column()
            .map(|column| apply_format(&self.select_format, &format!("{column} as {label}")))
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_pointer(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_scalar_only(&self) -> bool {
        self.scalar_only
    }
}

/// A named group of attributes plus the rule that attaches it to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDefList {
    name: String,
    lookup: LookUp,
    targets: Vec<TargetDef>,
}

impl TargetDefList {
    pub fn new(name: &str, lookup: LookUp) -> Result<Self> {
        validate_name(name)?;
        if lookup.kind == LookUpType::Map {
            ensure!(
                lookup.map_type_key.is_some(),
                "MAP list '{name}' needs a map type key"
            );
        } else {
            ensure!(
                lookup.parent_list.is_some() && lookup.parent_target.is_some(),
                "list '{name}' needs a parent list and parent target"
            );
        }
        Ok(Self {
            name: name.to_string(),
            lookup,
            targets: Vec::new(),
        })
    }

    pub fn add(mut self, target: TargetDef) -> Result<Self> {
        if self
            .targets
            .iter()
            .any(|existing| existing.final_name() == target.final_name())
        {
            bail!(
                "duplicate attribute '{}' in list '{}'",
                target.final_name(),
                self.name
            );
        }
        self.targets.push(target);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self) -> &LookUp {
        &self.lookup
    }

    pub fn targets(&self) -> &[TargetDef] {
        &self.targets
    }

    pub fn find(&self, final_name: &str) -> Option<&TargetDef> {
        self.targets
            .iter()
            .find(|target| target.final_name() == final_name)
    }

    pub fn final_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(TargetDef::final_name)
    }
}

/// Reference to an attribute as written in a projection, e.g. `smetadata.address.city`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    name: String,
    json_path: Option<String>,
}

impl Target {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('.') {
            Some((name, path)) if !path.is_empty() => Some(Self {
                name: name.to_string(),
                json_path: Some(path.to_string()),
            }),
            Some((name, _)) => Some(Self::plain(name)),
            None => Some(Self::plain(raw)),
        }
    }

    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            json_path: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_path(&self) -> Option<&str> {
        self.json_path.as_deref()
    }

    /// `a.b` becomes `a,b`, the Postgres text-array path syntax.
    pub fn json_path_sql(&self) -> Option<String> {
        self.json_path.as_deref().map(|path| path.replace('.', ","))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.json_path {
            Some(path) => write!(f, "{}.{}", self.name, path),
            None => f.write_str(&self.name),
        }
    }
}

pub fn apply_format(format: &str, value: &str) -> String {
    format.replacen("%s", value, 1)
}

fn validate_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')),
        "invalid attribute name '{name}'"
    );
    Ok(())
}
