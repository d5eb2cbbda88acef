//! Optional `intake.json` settings under the runs root.
use crate::run::{DataHandling, RunsRoot};
use crate::tool::DEFAULT_REQUIRED_FIELDS;
use crate::util::read_json;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

const DEFAULT_SHARE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct IntakeConfig {
    pub schema_version: u32,
    pub data_classification: String,
    pub pii_handling: String,
    /// When false the gate records a `system` approval without waiting.
    pub require_approval: bool,
    pub max_resume_attempts: u32,
    pub share_ttl_secs: u64,
    pub share_max_access: u32,
    /// Suspended runs older than this are abandoned by the watch loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension_ttl_secs: Option<u64>,
    pub required_fields: Vec<String>,
    pub poll_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            data_classification: "Internal".to_string(),
            pii_handling: "redacted".to_string(),
            require_approval: true,
            max_resume_attempts: 3,
            share_ttl_secs: DEFAULT_SHARE_TTL_SECS,
            share_max_access: 10,
            suspension_ttl_secs: None,
            required_fields: DEFAULT_REQUIRED_FIELDS
                .iter()
                .map(|field| field.to_string())
                .collect(),
            poll_interval_secs: 5,
        }
    }
}

impl IntakeConfig {
    pub fn handling(&self) -> DataHandling {
        DataHandling {
            data_classification: self.data_classification.clone(),
            pii_handling: self.pii_handling.clone(),
        }
    }
}

/// Load `intake.json`, falling back to defaults when it is absent.
pub fn load_config(root: &RunsRoot) -> Result<IntakeConfig> {
    let path = root.config_path();
    if !path.is_file() {
        return Ok(IntakeConfig::default());
    }
    let config: IntakeConfig =
        read_json(&path).with_context(|| format!("load config {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &IntakeConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported intake config schema_version {}",
            config.schema_version
        ));
    }
    if config.data_classification.trim().is_empty() {
        return Err(anyhow!("data_classification must be non-empty"));
    }
    if config.max_resume_attempts == 0 {
        return Err(anyhow!("max_resume_attempts must be at least 1"));
    }
    if config.share_ttl_secs == 0 {
        return Err(anyhow!("share_ttl_secs must be positive"));
    }
    if config.poll_interval_secs == 0 {
        return Err(anyhow!("poll_interval_secs must be positive"));
    }
    Ok(())
}
