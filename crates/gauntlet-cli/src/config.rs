//! CLI configuration management.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Where cache archives are stored.
    pub cache_dir: Option<PathBuf>,
    /// Where job workspaces are created.
    pub workspace_root: Option<PathBuf>,
    /// Cache namespace; entries in other namespaces are invisible.
    #[serde(default = "default_namespace")]
    pub cache_namespace: String,
    /// Default bound on concurrently running jobs.
    pub max_parallel: Option<usize>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn project_dirs() -> Result<directories::ProjectDirs, Box<dyn std::error::Error>> {
    Ok(directories::ProjectDirs::from("dev", "gauntlet", "gauntlet")
        .ok_or("Could not determine config directory")?)
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self {
                cache_namespace: default_namespace(),
                ..Self::default()
            })
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        Ok(project_dirs()?.config_dir().join("config.yaml"))
    }

    pub fn cache_dir(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.cache_dir().join("archives")),
        }
    }

    pub fn workspace_root(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match &self.workspace_root {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_local_dir().join("work")),
        }
    }

    pub fn namespace(&self) -> &str {
        if self.cache_namespace.is_empty() {
            "default"
        } else {
            &self.cache_namespace
        }
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "cache_dir" => self.cache_dir = Some(PathBuf::from(value)),
            "workspace_root" => self.workspace_root = Some(PathBuf::from(value)),
            "cache_namespace" => {
                if value.is_empty() || value.contains(['/', '\\']) {
                    return Err(format!("Invalid cache namespace: {}", value));
                }
                self.cache_namespace = value.to_string();
            }
            "max_parallel" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid max_parallel: {}", value))?;
                if n == 0 {
                    return Err("max_parallel must be at least 1".to_string());
                }
                self.max_parallel = Some(n);
            }
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => return Err(format!("Invalid log format: {}", value)),
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}
