//! Migration scripts: discovery and deterministic ordering.
//!
//! Files ending in `init.sql` (any case) apply before every other script;
//! within each group scripts apply in ascending lexical filename order.

pub mod runner;

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::MigrationError;

pub use runner::{MigrationConnection, MigrationRunner, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScriptKind {
    Init,
    Standard,
}

impl ScriptKind {
    pub fn of(file_name: &str) -> Self {
        if file_name.to_ascii_lowercase().ends_with("init.sql") {
            ScriptKind::Init
        } else {
            ScriptKind::Standard
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub name: String,
    pub kind: ScriptKind,
    pub body: String,
}

impl MigrationScript {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ScriptKind::of(&name),
            name,
            body: body.into(),
        }
    }

    fn apply_order(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Sort scripts into application order.
pub fn order(mut scripts: Vec<MigrationScript>) -> Vec<MigrationScript> {
    scripts.sort_by(MigrationScript::apply_order);
    scripts
}

/// Read every `*.sql` regular file in `dir`, unordered.
pub fn discover(dir: &Path) -> Result<Vec<MigrationScript>, MigrationError> {
    let discovery_error = |message: String| MigrationError::Discovery {
        path: dir.display().to_string(),
        message,
    };

    let entries = fs::read_dir(dir).map_err(|e| discovery_error(e.to_string()))?;
    let mut scripts = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| discovery_error(e.to_string()))?;
        let path = entry.path();
        let is_file = entry
            .file_type()
            .map_err(|e| discovery_error(e.to_string()))?
            .is_file();
        if !is_file || path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let body = fs::read_to_string(&path)
            .map_err(|e| discovery_error(format!("{}: {}", name, e)))?;
        debug!("Discovered migration {}", name);
        scripts.push(MigrationScript::new(name, body));
    }

    Ok(scripts)
}

/// Discover and order the scripts in `dir`.
pub fn load_scripts(dir: &Path) -> Result<Vec<MigrationScript>, MigrationError> {
    discover(dir).map(order)
}
