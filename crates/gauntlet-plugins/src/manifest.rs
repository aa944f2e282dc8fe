//! Plugin call types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Input passed to plugin execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginCallInput {
    /// Interpolated `with:` parameters from the step definition.
    pub params: BTreeMap<String, String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory of the job.
    pub workspace: PathBuf,
    /// Step name.
    pub step_name: String,
    /// Triggering event fields (`ref`, `sha`, `kind`).
    #[serde(default)]
    pub event: BTreeMap<String, String>,
    /// Source repository the job checks out, when configured.
    pub repository: Option<String>,
}

impl PluginCallInput {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Interpret a boolean parameter the way workflow files spell them.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.param(name), Some("true" | "yes" | "1"))
    }
}

/// Output from a successful plugin execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginCallOutput {
    /// Output values set by the plugin.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Lines to surface in the step log.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl PluginCallOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }
}

/// Plugin reference with version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRef {
    pub name: String,
    pub version: Option<String>,
}

impl PluginRef {
    /// Parse a plugin reference (e.g., "actions/checkout@v2").
    pub fn parse(s: &str) -> Self {
        match s.trim().split_once('@') {
            Some((name, version)) => Self {
                name: name.to_string(),
                version: Some(version.to_string()),
            },
            None => Self {
                name: s.trim().to_string(),
                version: None,
            },
        }
    }

    pub fn full_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }
}
