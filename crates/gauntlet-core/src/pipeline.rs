//! Pipeline definition types.
//!
//! These types represent the user-authored workflow YAML. A definition is
//! immutable once loaded and is validated before anything runs.

use crate::interpolation::matrix_references;
use crate::{Error, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub on: Triggers,
    #[serde(with = "ordered_map")]
    pub jobs: Vec<(String, JobSpec)>,
}

impl PipelineDefinition {
    /// Parse and validate a definition from YAML.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(source)
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Read, parse and validate a definition file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml(&source)
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs
            .iter()
            .find(|(job_name, _)| job_name == name)
            .map(|(_, spec)| spec)
    }

    /// Check the structural rules that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(Error::InvalidPipeline("no jobs defined".into()));
        }

        let mut seen = HashSet::new();
        for (name, job) in &self.jobs {
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidPipeline(format!("duplicate job '{}'", name)));
            }
            job.validate(name)?;
        }

        for schedule in &self.on.schedule {
            schedule.schedule()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(
        default,
        deserialize_with = "present_or_default",
        skip_serializing_if = "Option::is_none"
    )]
    pub push: Option<PushTrigger>,
    #[serde(
        default,
        deserialize_with = "present_or_default",
        skip_serializing_if = "Option::is_none"
    )]
    pub pull_request: Option<PullRequestTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedule: Vec<ScheduleTrigger>,
}

/// A key that is present with a null value (`pull_request:`) still enables
/// the trigger.
fn present_or_default<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?.unwrap_or_default()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub cron: String,
}

impl ScheduleTrigger {
    /// Parse the expression. Five-field crontab syntax is accepted and
    /// pinned to second zero.
    pub fn schedule(&self) -> Result<cron::Schedule> {
        let expr = self.cron.trim();
        let normalized = match expr.split_whitespace().count() {
            5 => format!("0 {}", expr),
            6 | 7 => expr.to_string(),
            n => {
                return Err(Error::InvalidPipeline(format!(
                    "cron expression '{}' has {} fields, expected 5",
                    expr, n
                )));
            }
        };
        cron::Schedule::from_str(&normalized).map_err(|e| {
            Error::InvalidPipeline(format!("invalid cron expression '{}': {}", expr, e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "runs-on", default = "default_runs_on")]
    pub runs_on: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub steps: Vec<StepSpec>,
}

fn default_runs_on() -> String {
    "ubuntu-latest".to_string()
}

impl JobSpec {
    pub fn matrix(&self) -> Option<&MatrixConfig> {
        self.strategy.as_ref().map(|s| &s.matrix)
    }

    pub fn max_parallel(&self) -> Option<u32> {
        self.strategy.as_ref().and_then(|s| s.max_parallel)
    }

    fn validate(&self, job_name: &str) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "job '{}' has no steps",
                job_name
            )));
        }
        if self.max_parallel() == Some(0) {
            return Err(Error::InvalidPipeline(format!(
                "job '{}' sets max-parallel to 0",
                job_name
            )));
        }

        let axes: HashSet<&str> = match self.matrix() {
            Some(matrix) => {
                let mut names = HashSet::new();
                for axis in &matrix.axes {
                    if !names.insert(axis.name.as_str()) {
                        return Err(Error::InvalidPipeline(format!(
                            "job '{}' declares matrix axis '{}' twice",
                            job_name, axis.name
                        )));
                    }
                }
                names
            }
            None => HashSet::new(),
        };

        let mut templates = vec![self.runs_on.as_str()];
        for step in &self.steps {
            match &step.kind {
                StepKind::Command { run } => templates.push(run),
                StepKind::Action { with, .. } => templates.extend(with.values().map(String::as_str)),
            }
        }

        for template in templates {
            for axis in matrix_references(template) {
                if !axes.contains(axis.as_str()) {
                    return Err(Error::InvalidPipeline(format!(
                        "job '{}' references undeclared matrix axis '{}'",
                        job_name, axis
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(rename = "max-parallel", default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

/// Matrix axes in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixConfig {
    pub axes: Vec<MatrixAxis>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl Serialize for MatrixConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.axes.len()))?;
        for axis in &self.axes {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries: Vec<(String, Vec<Scalar>)> = ordered_map::deserialize(deserializer)?;
        Ok(MatrixConfig {
            axes: entries
                .into_iter()
                .map(|(name, values)| MatrixAxis {
                    name,
                    values: values.into_iter().map(|v| v.0).collect(),
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct StepSpec {
    pub name: Option<String>,
    pub kind: StepKind,
    pub timeout_minutes: Option<u32>,
}

/// What a step does: invoke a named external action, or run a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Action {
        uses: String,
        with: BTreeMap<String, String>,
    },
    Command {
        run: String,
    },
}

impl StepSpec {
    pub fn command(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            kind: StepKind::Command { run: run.into() },
            timeout_minutes: None,
        }
    }

    pub fn action(
        name: impl Into<String>,
        uses: impl Into<String>,
        with: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            kind: StepKind::Action {
                uses: uses.into(),
                with,
            },
            timeout_minutes: None,
        }
    }

    /// Name shown in logs and reports.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            StepKind::Action { uses, .. } => uses.clone(),
            StepKind::Command { run } => run.lines().next().unwrap_or_default().trim().to_string(),
        }
    }

    pub fn uses(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Action { uses, .. } => Some(uses),
            StepKind::Command { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uses: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    with: BTreeMap<String, Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(
        rename = "timeout-minutes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    timeout_minutes: Option<u32>,
}

impl TryFrom<RawStep> for StepSpec {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let kind = match (raw.uses, raw.run) {
            (Some(uses), None) => StepKind::Action {
                uses,
                with: raw.with.into_iter().map(|(k, v)| (k, v.0)).collect(),
            },
            (None, Some(run)) => {
                if !raw.with.is_empty() {
                    return Err("'with' is only valid on 'uses' steps".to_string());
                }
                StepKind::Command { run }
            }
            (Some(_), Some(_)) => {
                return Err("a step cannot declare both 'uses' and 'run'".to_string());
            }
            (None, None) => return Err("a step must declare 'uses' or 'run'".to_string()),
        };
        Ok(StepSpec {
            name: raw.name,
            kind,
            timeout_minutes: raw.timeout_minutes,
        })
    }
}

impl From<StepSpec> for RawStep {
    fn from(step: StepSpec) -> Self {
        let (uses, with, run) = match step.kind {
            StepKind::Action { uses, with } => (
                Some(uses),
                with.into_iter().map(|(k, v)| (k, Scalar(v))).collect(),
                None,
            ),
            StepKind::Command { run } => (None, BTreeMap::new(), Some(run)),
        };
        RawStep {
            name: step.name,
            uses,
            with,
            run,
            timeout_minutes: step.timeout_minutes,
        }
    }
}

/// A YAML scalar kept in its textual form (`true`, `1.70`, `stable`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scalar(String);

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match serde_yaml::Value::deserialize(deserializer)? {
            serde_yaml::Value::String(s) => Ok(Scalar(s)),
            serde_yaml::Value::Bool(b) => Ok(Scalar(b.to_string())),
            serde_yaml::Value::Number(n) => Ok(Scalar(n.to_string())),
            other => Err(de::Error::custom(format!(
                "expected a scalar value, found {:?}",
                other
            ))),
        }
    }
}

/// (De)serialize `Vec<(String, V)>` as a mapping while keeping key order.
mod ordered_map {
    use super::*;

    pub fn serialize<S, V>(entries: &[(String, V)], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> std::result::Result<Vec<(String, V)>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = Vec<(String, V)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WORKFLOW: &str = r#"
name: CI
on:
  push:
    branches: [main]
  pull_request:
  schedule:
    - cron: "0 0 1,15 * *"
jobs:
  test:
    runs-on: ${{ matrix.os }}
    strategy:
      matrix:
        toolchain: [stable, "1.70"]
        os: [ubuntu-latest]
    steps:
      - uses: actions-rs/toolchain@v1
        with:
          toolchain: ${{ matrix.toolchain }}
          override: true
      - name: Check formatting
        run: cargo fmt -- --check
        timeout-minutes: 5
"#;

    #[test]
    fn test_parse_workflow() {
        let def = PipelineDefinition::from_yaml(WORKFLOW).unwrap();
        assert_eq!(def.name, "CI");
        assert_eq!(def.on.push.as_ref().unwrap().branches, vec!["main"]);
        assert!(def.on.pull_request.is_some());
        assert_eq!(def.on.schedule.len(), 1);

        let job = def.job("test").unwrap();
        let matrix = job.matrix().unwrap();
        let names: Vec<&str> = matrix.axes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["toolchain", "os"]);
        assert_eq!(matrix.axes[0].values, vec!["stable", "1.70"]);

        assert_eq!(
            job.steps[0].kind,
            StepKind::Action {
                uses: "actions-rs/toolchain@v1".into(),
                with: BTreeMap::from([
                    ("override".to_string(), "true".to_string()),
                    ("toolchain".to_string(), "${{ matrix.toolchain }}".to_string()),
                ]),
            }
        );
        assert_eq!(job.steps[0].display_name(), "actions-rs/toolchain@v1");
        assert_eq!(job.steps[1].timeout_minutes, Some(5));
    }

    #[test]
    fn test_absent_pull_request_stays_disabled() {
        let def = PipelineDefinition::from_yaml(
            "name: x\non:\n  push: {}\njobs:\n  a:\n    steps:\n      - run: ls\n",
        )
        .unwrap();
        assert!(def.on.pull_request.is_none());
        assert!(def.on.push.unwrap().branches.is_empty());
    }

    #[test]
    fn test_step_with_both_uses_and_run_rejected() {
        let yaml = "name: x\njobs:\n  a:\n    steps:\n      - uses: actions/checkout@v2\n        run: ls\n";
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
    }

    #[test]
    fn test_undeclared_matrix_axis_rejected() {
        let yaml = "name: x\njobs:\n  a:\n    runs-on: ${{ matrix.os }}\n    steps:\n      - run: ls\n";
        let err = PipelineDefinition::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared matrix axis 'os'"));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let yaml = "name: x\non:\n  schedule:\n    - cron: \"0 0 1\"\njobs:\n  a:\n    steps:\n      - run: ls\n";
        assert!(PipelineDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_job_without_steps_rejected() {
        let yaml = "name: x\njobs:\n  a:\n    steps: []\n";
        assert!(PipelineDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_definition_survives_yaml_rewrite() {
        let def = PipelineDefinition::from_yaml(WORKFLOW).unwrap();
        let yaml = serde_yaml::to_string(&def).unwrap();
        let reparsed = PipelineDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(
            reparsed.job("test").unwrap().matrix(),
            def.job("test").unwrap().matrix()
        );
    }
}
