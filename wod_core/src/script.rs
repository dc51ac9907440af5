//! Parsed workout script: statements and their typed fragments.
//!
//! The lexer/parser lives elsewhere. This module only defines the shape of
//! its output, loads it from JSON and checks the tree is well formed.
//! Statements are immutable once a [`Script`] is built.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

// ============================================================================
// Identifiers and source metadata
// ============================================================================

/// Unique id of a statement, assigned by the parser
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementId(pub u32);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a statement came from in the source text
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMeta {
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// ============================================================================
// Fragments
// ============================================================================

/// Direction a timer runs in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerDirection {
    #[default]
    Up,
    Down,
}

/// Smallest typed token within a statement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// Time bound, e.g. `20:00`. Negative durations are rejected at runtime.
    Timer {
        duration_ms: i64,
        #[serde(default)]
        direction: TimerDirection,
    },
    /// Round count, e.g. `(5)`
    Rounds { count: u32 },
    /// Named piece of work, e.g. `Pullups`
    Effort { name: String },
    /// Children of this statement run as one atomic unit
    Lap,
    /// Measured quantity, e.g. `10 reps` or `24 kg`
    Metric {
        key: String,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
}

// ============================================================================
// Statements
// ============================================================================

/// One parsed unit of script
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    pub id: StatementId,
    #[serde(default)]
    pub parent: Option<StatementId>,
    #[serde(default)]
    pub children: Vec<StatementId>,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    #[serde(default)]
    pub meta: SourceMeta,
}

impl Statement {
    /// Create a top-level statement with the given fragments
    pub fn new(id: u32, fragments: Vec<Fragment>) -> Self {
        Self {
            id: StatementId(id),
            parent: None,
            children: Vec::new(),
            fragments,
            meta: SourceMeta::default(),
        }
    }

    /// First timer fragment as `(duration_ms, direction)`
    pub fn timer(&self) -> Option<(i64, TimerDirection)> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Timer {
                duration_ms,
                direction,
            } => Some((*duration_ms, *direction)),
            _ => None,
        })
    }

    /// Round count from the first rounds fragment
    pub fn rounds(&self) -> Option<u32> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Rounds { count } => Some(*count),
            _ => None,
        })
    }

    pub fn has_timer(&self) -> bool {
        self.timer().is_some()
    }

    pub fn has_rounds(&self) -> bool {
        self.rounds().is_some()
    }

    /// Whether the statement carries a lap marker
    pub fn is_lap(&self) -> bool {
        self.fragments.iter().any(|f| matches!(f, Fragment::Lap))
    }

    pub fn efforts(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Effort { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Source text if the parser kept it, otherwise a summary of the fragments
    pub fn label(&self) -> String {
        if let Some(text) = &self.meta.text {
            return text.clone();
        }

        let parts: Vec<String> = self
            .fragments
            .iter()
            .map(|f| match f {
                Fragment::Timer { duration_ms, .. } => format_duration(*duration_ms),
                Fragment::Rounds { count } => format!("({})", count),
                Fragment::Effort { name } => name.clone(),
                Fragment::Lap => "+".to_string(),
                Fragment::Metric { key, value, unit } => match unit {
                    Some(unit) => format!("{} {}{}", key, value, unit),
                    None => format!("{} {}", value, key),
                },
            })
            .collect();

        if parts.is_empty() {
            format!("statement {}", self.id)
        } else {
            parts.join(" ")
        }
    }
}

/// Render milliseconds as `mm:ss`
pub fn format_duration(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let total = ms.unsigned_abs() / 1000;
    format!("{}{:02}:{:02}", sign, total / 60, total % 60)
}

// ============================================================================
// Script
// ============================================================================

/// On-disk shape of the parser output
#[derive(Debug, Deserialize, Serialize)]
struct ScriptFile {
    statements: Vec<Statement>,
}

/// The full statement tree of one workout
#[derive(Clone, Debug, Default)]
pub struct Script {
    statements: Vec<Statement>,
    index: HashMap<StatementId, usize>,
}

impl Script {
    /// Build a script from parser output, indexing statements by id
    ///
    /// Later duplicates shadow earlier ones in the index; [`Script::validate`]
    /// reports them.
    pub fn new(statements: Vec<Statement>) -> Self {
        let index = statements
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.id, pos))
            .collect();
        Self { statements, index }
    }

    /// Parse a script from the parser's JSON output
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ScriptFile = serde_json::from_str(json)?;
        Ok(Self::new(file.statements))
    }

    /// Load a script from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let script = Self::from_json(&contents)?;
        tracing::info!(
            "Loaded script with {} statements from {:?}",
            script.len(),
            path
        );
        Ok(script)
    }

    /// Load and validate, failing on the first batch of problems
    pub fn load_validated(path: &Path) -> Result<Self> {
        let script = Self::load(path)?;
        let errors = script.validate();
        if !errors.is_empty() {
            return Err(Error::Script(errors.join("; ")));
        }
        Ok(script)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = ScriptFile {
            statements: self.statements.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn get(&self, id: StatementId) -> Option<&Statement> {
        self.index.get(&id).map(|&pos| &self.statements[pos])
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Top-level statements in source order
    pub fn roots(&self) -> Vec<StatementId> {
        self.statements
            .iter()
            .filter(|s| s.parent.is_none())
            .map(|s| s.id)
            .collect()
    }

    /// Check the tree is well formed
    ///
    /// Returns a list of human-readable problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for stmt in &self.statements {
            if !seen.insert(stmt.id) {
                errors.push(format!("Duplicate statement id {}", stmt.id));
            }

            if let Some(parent) = stmt.parent {
                match self.get(parent) {
                    None => errors.push(format!(
                        "Statement {} references unknown parent {}",
                        stmt.id, parent
                    )),
                    Some(p) if !p.children.contains(&stmt.id) => errors.push(format!(
                        "Statement {} names parent {} which does not list it as a child",
                        stmt.id, parent
                    )),
                    Some(_) => {}
                }
            }

            for child in &stmt.children {
                match self.get(*child) {
                    None => errors.push(format!(
                        "Statement {} references unknown child {}",
                        stmt.id, child
                    )),
                    Some(c) if c.parent != Some(stmt.id) => errors.push(format!(
                        "Statement {} lists child {} whose parent is {:?}",
                        stmt.id, child, c.parent
                    )),
                    Some(_) => {}
                }
            }
        }

        // Walking parents longer than the script means a cycle
        for stmt in &self.statements {
            let mut steps = 0;
            let mut cursor = stmt.parent;
            while let Some(id) = cursor {
                steps += 1;
                if steps > self.statements.len() {
                    errors.push(format!("Statement {} is part of a parent cycle", stmt.id));
                    break;
                }
                cursor = self.get(id).and_then(|p| p.parent);
            }
        }

        errors
    }
}
