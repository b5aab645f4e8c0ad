//! Deterministic classification of crash-log tails.
//!
//! The pattern table is data ([`ClassifierRule`]) loaded from configuration;
//! [`FailureClassifier`] only evaluates it. Rules are checked in order and the
//! first match wins.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::RuntimeKind;

/// Outcome of classifying a crashed script's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// An import could not be resolved; `name` is the top-level module.
    MissingDependency { runtime: RuntimeKind, name: String },
    /// The interpreter could not open the entry file itself.
    EntryMissing,
    Unknown,
}

/// What a matching rule means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Capture group 1 holds the missing module name.
    MissingDependency,
    EntryMissing,
}

/// One configurable pattern rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRule {
    pub runtime: RuntimeKind,
    pub kind: RuleKind,
    pub pattern: String,
}

impl ClassifierRule {
    fn new(runtime: RuntimeKind, kind: RuleKind, pattern: &str) -> Self {
        Self {
            runtime,
            kind,
            pattern: pattern.to_string(),
        }
    }
}

/// Built-in rule table.
pub fn default_rules() -> Vec<ClassifierRule> {
    vec![
        ClassifierRule::new(
            RuntimeKind::Python,
            RuleKind::MissingDependency,
            r"ModuleNotFoundError: No module named '([^']+)'",
        ),
        ClassifierRule::new(
            RuntimeKind::Python,
            RuleKind::MissingDependency,
            r"ImportError: No module named '?([A-Za-z0-9_.]+)'?",
        ),
        ClassifierRule::new(
            RuntimeKind::Python,
            RuleKind::EntryMissing,
            r"can't open file '[^']+': \[Errno 2\]",
        ),
        ClassifierRule::new(
            RuntimeKind::Node,
            RuleKind::MissingDependency,
            r"Cannot find module '([^']+)'",
        ),
    ]
}

#[derive(Debug)]
struct CompiledRule {
    runtime: RuntimeKind,
    kind: RuleKind,
    regex: Regex,
}

/// Compiled, ordered rule table.
#[derive(Debug)]
pub struct FailureClassifier {
    rules: Vec<CompiledRule>,
}

impl FailureClassifier {
    pub fn new(rules: &[ClassifierRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = Regex::new(&rule.pattern)
                    .with_context(|| format!("compile classifier pattern {:?}", rule.pattern))?;
                Ok(CompiledRule {
                    runtime: rule.runtime,
                    kind: rule.kind,
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Classify a bounded output tail.
    ///
    /// Node module names that are relative or absolute paths never count as a
    /// missing dependency; such matches fall through to the remaining rules.
    pub fn classify(&self, output: &str) -> FailureClass {
        for rule in &self.rules {
            match rule.kind {
                RuleKind::EntryMissing => {
                    if rule.regex.is_match(output) {
                        return FailureClass::EntryMissing;
                    }
                }
                RuleKind::MissingDependency => {
                    let Some(name) = rule
                        .regex
                        .captures(output)
                        .and_then(|caps| caps.get(1))
                        .map(|m| m.as_str())
                    else {
                        continue;
                    };
                    if let Some(name) = dependency_name(rule.runtime, name) {
                        return FailureClass::MissingDependency {
                            runtime: rule.runtime,
                            name,
                        };
                    }
                }
            }
        }
        FailureClass::Unknown
    }
}

fn dependency_name(runtime: RuntimeKind, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match runtime {
        RuntimeKind::Python => raw.split('.').next().map(str::to_string),
        RuntimeKind::Node => {
            if raw.starts_with('.') || raw.starts_with('/') || raw.contains('\\') {
                return None;
            }
            Some(node_package_root(raw))
        }
    }
}

/// `lodash/fp` -> `lodash`, `@scope/pkg/sub` -> `@scope/pkg`.
fn node_package_root(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(pkg) => format!("{scope}/{pkg}"),
            None => scope.to_string(),
        },
        Some(first) => first.to_string(),
        None => specifier.to_string(),
    }
}
