//! Role based row filtering.
//!
//! Each class directory holds a `rules.txt` manifest naming one `<ROLE>.sql`
//! file per line. A file is a single boolean predicate; `--` and `//` comments
//! and blank lines are dropped.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

pub const ROLE_ADMIN: &str = "ADMIN";
pub const ROLE_GUEST: &str = "GUEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AclClass {
    Stations,
    Events,
}

impl AclClass {
    pub fn dir_name(self) -> &'static str {
        match self {
            AclClass::Stations => "stations",
            AclClass::Events => "events",
        }
    }
}

const BUNDLED: &[(AclClass, &str, &str)] = &[
    (
        AclClass::Stations,
        "rules.txt",
        include_str!("../../resources/acl-rules/stations/rules.txt"),
    ),
    (
        AclClass::Stations,
        "ADMIN.sql",
        include_str!("../../resources/acl-rules/stations/ADMIN.sql"),
    ),
    (
        AclClass::Stations,
        "GUEST.sql",
        include_str!("../../resources/acl-rules/stations/GUEST.sql"),
    ),
    (
        AclClass::Events,
        "rules.txt",
        include_str!("../../resources/acl-rules/events/rules.txt"),
    ),
    (
        AclClass::Events,
        "ADMIN.sql",
        include_str!("../../resources/acl-rules/events/ADMIN.sql"),
    ),
    (
        AclClass::Events,
        "GUEST.sql",
        include_str!("../../resources/acl-rules/events/GUEST.sql"),
    ),
];

type RuleSet = BTreeMap<String, String>;

/// Role predicates per class, loaded on first use and immutable afterwards.
#[derive(Debug, Default)]
pub struct AclRules {
    dir: Option<PathBuf>,
    stations: Mutex<Option<Arc<RuleSet>>>,
    events: Mutex<Option<Arc<RuleSet>>>,
}

impl AclRules {
    /// Rules compiled into the binary.
    pub fn bundled() -> Self {
        Self::default()
    }

    /// Rules read from `<dir>/<class>/` instead of the bundled copies.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// `None` for administrators, otherwise the disjunction of the caller's
    /// role predicates in parentheses. Roles without a rule are skipped; if
    /// none is left nothing is visible.
    pub fn where_clause(&self, class: AclClass, roles: &[String]) -> anyhow::Result<Option<String>> {
        debug!(class = class.dir_name(), ?roles, "constructing acl rules");
        if roles.iter().any(|role| role == ROLE_ADMIN) {
            return Ok(None);
        }

        let rules = self.rules(class)?;
        let predicates: Vec<&str> = roles
            .iter()
            .filter_map(|role| rules.get(role).map(String::as_str))
            .collect();
        if predicates.is_empty() {
            return Ok(Some("(false)".to_string()));
        }
        Ok(Some(format!("({})", predicates.join(" or "))))
    }

    fn rules(&self, class: AclClass) -> anyhow::Result<Arc<RuleSet>> {
        let slot = match class {
            AclClass::Stations => &self.stations,
            AclClass::Events => &self.events,
        };
        let mut guard = slot.lock();
        if let Some(rules) = guard.as_ref() {
            return Ok(Arc::clone(rules));
        }

        let rules = Arc::new(self.load(class)?);
        info!(
            class = class.dir_name(),
            roles = ?rules.keys().collect::<Vec<_>>(),
            "loaded acl rules"
        );
        *guard = Some(Arc::clone(&rules));
        Ok(rules)
    }

    fn load(&self, class: AclClass) -> anyhow::Result<RuleSet> {
        let read = |file: &str| -> anyhow::Result<String> {
            match &self.dir {
                Some(dir) => read_file(&dir.join(class.dir_name()).join(file)),
                None => BUNDLED
                    .iter()
                    .find(|(owner, name, _)| *owner == class && *name == file)
                    .map(|(_, _, content)| content.to_string())
                    .with_context(|| {
                        format!("acl rule '{}/{file}' is not bundled", class.dir_name())
                    }),
            }
        };

        let manifest = read("rules.txt")?;
        let mut rules = RuleSet::new();
        for file in manifest.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some(role) = file.strip_suffix(".sql") else {
                bail!("acl manifest entry '{file}' is not a .sql file");
            };
            let role = role.to_uppercase();
            if role == ROLE_ADMIN {
                continue;
            }
            let predicate = strip_comments(&read(file)?);
            if predicate.is_empty() {
                bail!("acl rule '{file}' for {} is empty", class.dir_name());
            }
            rules.insert(role, predicate);
        }
        Ok(rules)
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read acl rule {}", path.display()))
}

/// Removes `--` and `//` line comments and blank lines. Markers inside quoted
/// literals or identifiers are kept.
pub fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| line[..comment_start(line)].trim_end())
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn comment_start(line: &str) -> usize {
    let bytes = line.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &byte) in bytes.iter().enumerate() {
        match quote {
            // a doubled quote closes and reopens, which leaves the span open
            Some(open) if byte == open => quote = None,
            Some(_) => {}
            None if byte == b'\'' || byte == b'"' => quote = Some(byte),
            None if matches!(byte, b'-' | b'/') && bytes.get(i + 1) == Some(&byte) => return i,
            None => {}
        }
    }
    line.len()
}
