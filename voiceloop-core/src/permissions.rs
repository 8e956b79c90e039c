use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps tool name -> "requires confirmation".
///
/// Tools without an entry require confirmation. Only an explicit `false`
/// lets a tool run without asking the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolPermissions(BTreeMap<String, bool>);

impl ToolPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: impl Into<String>, requires_confirmation: bool) -> Self {
        self.set(tool, requires_confirmation);
        self
    }

    pub fn set(&mut self, tool: impl Into<String>, requires_confirmation: bool) {
        self.0.insert(tool.into(), requires_confirmation);
    }

    pub fn requires_confirmation(&self, tool: &str) -> bool {
        self.0.get(tool).copied().unwrap_or(true)
    }

    /// Merges `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: &ToolPermissions) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), *v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
