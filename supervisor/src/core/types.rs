//! Shared deterministic types for supervisor core logic.
//!
//! These types define stable contracts between the launcher, registry, monitor
//! and the external collaborators. They carry no I/O and serialize the same way
//! across runs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Numeric identifier of a tenant (the owner of a work directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric identifier of a hosted script in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(pub u64);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Composite registry key: at most one live record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptKey {
    pub tenant: TenantId,
    pub name: String,
}

impl ScriptKey {
    pub fn new(tenant: TenantId, name: impl Into<String>) -> Self {
        Self {
            tenant,
            name: name.into(),
        }
    }

    /// Filesystem-safe stem used for the per-script log file.
    pub fn file_stem(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.tenant, name)
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tenant, self.name)
    }
}

/// Execution runtime of a hosted script, distinguished by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// `.py` scripts.
    Python,
    /// `.js` scripts.
    Node,
}

impl RuntimeKind {
    pub fn extension(self) -> &'static str {
        match self {
            RuntimeKind::Python => "py",
            RuntimeKind::Node => "js",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RuntimeKind::Python => "Python",
            RuntimeKind::Node => "Node.js",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "py" => Some(RuntimeKind::Python),
            "js" => Some(RuntimeKind::Node),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

/// Ranked certainty of a detected entry point.
///
/// Ordering follows certainty: `Low < Medium < High < Exact`. "No result" is
/// modelled as `Option::None` around a [`DetectionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Exact,
}

/// Proposed runnable entry point for a work directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Entry path relative to the work directory (the file name for a single file).
    pub entry: String,
    pub runtime: RuntimeKind,
    pub confidence: Confidence,
}

/// Lifecycle status of a hosted script as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScriptStatus::Stopped => "stopped",
            ScriptStatus::Starting => "starting",
            ScriptStatus::Running => "running",
            ScriptStatus::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// Resource usage of a hosted script. Zero when the script is not running.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_from_extension_is_case_insensitive() {
        assert_eq!(RuntimeKind::from_extension("PY"), Some(RuntimeKind::Python));
        assert_eq!(RuntimeKind::from_extension("js"), Some(RuntimeKind::Node));
        assert_eq!(RuntimeKind::from_extension("ts"), None);
    }

    #[test]
    fn confidence_orders_by_certainty() {
        assert!(Confidence::Exact > Confidence::High);
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn key_file_stem_replaces_path_separators() {
        let key = ScriptKey::new(TenantId(42), "../my bot");
        assert_eq!(key.file_stem(), "42_.._my_bot");
        assert_eq!(key.to_string(), "42_../my bot");
    }
}
