//! Job configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use xregion_provider::ClientConfig;

/// Provider used when a job's client configuration names none.
pub const DEFAULT_PROVIDER: &str = "memory";

/// Default number of synced destination snapshots kept by retention.
pub const DEFAULT_MAX_SNAPSHOTS_TO_RETAIN: usize = 2;

/// Discriminator selecting the sync policy for a job.
///
/// `JobConfig::sync_type` stays a raw string so an unsupported value can be
/// quoted back in the job's configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncType {
    /// Machine image sync (`ec2_ami`).
    Image,
    /// Automated database snapshot sync (`rds_automated_snapshot`).
    Snapshot,
}

impl SyncType {
    /// Parse the configured `sync_type` value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ec2_ami" => Some(Self::Image),
            "rds_automated_snapshot" => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// Options for a single sync job.
///
/// Options whose validation must report the literal the user wrote
/// (`filters`, `max_snapshots_to_retain`) are kept as raw values until
/// `validate_config` runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// `ec2_ami` or `rds_automated_snapshot`.
    #[serde(default)]
    pub sync_type: Option<String>,
    #[serde(default)]
    pub source_region: Option<String>,
    #[serde(default)]
    pub destination_region: Option<String>,
    /// Provider client options, merged over the document's global options.
    #[serde(default, alias = "aws_client_config")]
    pub client_config: ClientConfig,
    /// Value of the `Sync-Identifier` tag images must carry.
    #[serde(default)]
    pub sync_identifier: Option<String>,
    /// Image owner scope, `self` when absent.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Extra `field=value` image filters.
    #[serde(default)]
    pub filters: Option<Value>,
    /// Database instance whose automated snapshots are synced.
    #[serde(default)]
    pub db_instance: Option<String>,
    /// Number of synced destination snapshots to keep.
    #[serde(default)]
    pub max_snapshots_to_retain: Option<Value>,
}

impl JobConfig {
    /// Name of the provider to resolve clients from.
    pub fn provider_name(&self) -> &str {
        self.client_config
            .get("provider")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PROVIDER)
    }

    /// Manually configured account identifier, if any.
    pub fn account_id_override(&self) -> Option<String> {
        ["account_id", "aws_account_id"]
            .iter()
            .filter_map(|key| self.client_config.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// Client configuration for `region`: the job's options plus the region.
    pub fn client_config_for(&self, region: &str) -> ClientConfig {
        let mut config = self.client_config.clone();
        config.insert("region".to_string(), Value::String(region.to_string()));
        config
    }

    /// Merge global client options under this job's own (job keys win).
    pub fn merge_global_client_config(&mut self, global: &ClientConfig) {
        for (key, value) in global {
            self.client_config
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Render a raw option value the way the user wrote it.
pub(crate) fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
