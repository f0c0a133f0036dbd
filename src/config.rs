//! Typed pipeline configuration
//!
//! Every recognized option has a default applied at construction, so a
//! partial TOML file (or none at all) yields a usable configuration.

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the audit trail treats failures of the daily archive file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    /// Archive failures are logged and otherwise ignored
    #[default]
    BestEffort,
    /// Archive failures are also reported to the fallback channel
    Required,
}

/// Configuration for a `SecureOperationPipeline` and its audit/metrics components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identity embedded in every audit event
    #[serde(default = "default_system_id")]
    pub system_id: String,

    /// Append a copy of every audit event to a daily archive file
    #[serde(default)]
    pub enable_archive: bool,

    /// Directory holding `YYYY-MM-DD_audit.log` files
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    #[serde(default)]
    pub archive_policy: ArchivePolicy,

    /// Event type tags that always go to the escalation channel
    #[serde(default)]
    pub critical_event_types: BTreeSet<String>,

    /// How long metric samples are retained (default: 86400)
    #[serde(default = "default_metrics_retention_seconds")]
    pub metrics_retention_seconds: u64,

    /// Width of a metrics time bucket (default: 60)
    #[serde(default = "default_metrics_bucket_seconds")]
    pub metrics_bucket_seconds: u64,

    /// Upper bound on a single operation's business logic, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,
}

fn default_system_id() -> String {
    "a3s-guard".to_string()
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("audit")
}

fn default_metrics_retention_seconds() -> u64 {
    86_400
}

fn default_metrics_bucket_seconds() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_id: default_system_id(),
            enable_archive: false,
            archive_dir: default_archive_dir(),
            archive_policy: ArchivePolicy::default(),
            critical_event_types: BTreeSet::new(),
            metrics_retention_seconds: default_metrics_retention_seconds(),
            metrics_bucket_seconds: default_metrics_bucket_seconds(),
            execution_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| GuardError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.system_id.trim().is_empty() {
            return Err(GuardError::Config("system_id cannot be empty".to_string()));
        }
        if self.metrics_retention_seconds == 0 {
            return Err(GuardError::Config(
                "metrics_retention_seconds must be >= 1".to_string(),
            ));
        }
        if self.metrics_bucket_seconds == 0 {
            return Err(GuardError::Config(
                "metrics_bucket_seconds must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = system_id.into();
        self
    }

    /// Enable the daily archive in the given directory
    pub fn with_archive(mut self, dir: impl Into<PathBuf>, policy: ArchivePolicy) -> Self {
        self.enable_archive = true;
        self.archive_dir = dir.into();
        self.archive_policy = policy;
        self
    }

    pub fn with_critical_event_type(mut self, tag: impl Into<String>) -> Self {
        self.critical_event_types.insert(tag.into());
        self
    }

    pub fn with_metrics_retention_seconds(mut self, seconds: u64) -> Self {
        self.metrics_retention_seconds = seconds;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_critical(&self, tag: &str) -> bool {
        self.critical_event_types.contains(tag)
    }
}
