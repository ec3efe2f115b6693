//! Job configuration resolver.
//!
//! Turns a YAML document into validated policies plus per-job configuration
//! errors. Every top-level key starting with `SYNC_` (any case) is a job; a
//! top-level `client_config` (or `aws_client_config`) mapping supplies
//! provider options shared by every job.
//!
//! ```yaml
//! client_config:
//!   provider: memory
//! SYNC_web_ami:
//!   sync_type: ec2_ami
//!   source_region: us-east-1
//!   destination_region: us-west-2
//!   sync_identifier: web
//! SYNC_orders_db:
//!   sync_type: rds_automated_snapshot
//!   source_region: us-east-1
//!   destination_region: us-west-2
//!   db_instance: orders
//!   max_snapshots_to_retain: 3
//! ```

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use xregion_common::{Error, Result};
use xregion_provider::{ClientConfig, ProviderRegistry};

use crate::config::{JobConfig, SyncType};
use crate::image::ImageSyncPolicy;
use crate::policy::SyncPolicy;
use crate::snapshot::SnapshotSyncPolicy;

/// Prefix marking a top-level key as a sync job.
pub const JOB_KEY_PREFIX: &str = "SYNC_";

/// Top-level keys holding client options shared by every job.
pub const GLOBAL_CLIENT_CONFIG_KEYS: [&str; 2] = ["client_config", "aws_client_config"];

/// Validated policies plus the errors of jobs that could not be configured.
pub struct JobSet {
    /// Policies in document order.
    pub jobs: Vec<Box<dyn SyncPolicy>>,
    /// Configuration errors keyed by job name.
    pub errors: BTreeMap<String, Vec<Error>>,
}

/// Builds policies from configuration documents.
pub struct Configure {
    registry: Arc<ProviderRegistry>,
}

impl Configure {
    /// Create a resolver whose policies resolve clients from `registry`.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Read and resolve a YAML configuration file.
    pub async fn configure_from_file(&self, path: impl AsRef<Path>) -> Result<JobSet> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        self.configure_from_str(&raw)
    }

    /// Resolve a YAML configuration document.
    pub fn configure_from_str(&self, raw: &str) -> Result<JobSet> {
        let document: Value = serde_yaml::from_str(raw).map_err(yaml_error)?;
        self.generate_sync_jobs(&document)
    }

    /// Resolve every job in an already parsed document.
    ///
    /// # Errors
    /// - The document is not a mapping
    /// - The global client configuration is not a mapping
    pub fn generate_sync_jobs(&self, document: &Value) -> Result<JobSet> {
        let mapping = document.as_mapping().ok_or_else(|| {
            Error::InvalidInput("The configuration document must be a mapping".to_string())
        })?;

        let global = global_client_config(document)?;
        let mut jobs = Vec::new();
        let mut errors = BTreeMap::new();

        for (key, value) in mapping {
            let Some(job_key) = key.as_str() else {
                continue;
            };
            if !job_key.to_uppercase().starts_with(JOB_KEY_PREFIX) {
                continue;
            }

            match self.create_sync_job(global.as_ref(), job_key, value) {
                Ok(job) => {
                    debug!("Configured sync job {}", job_key);
                    jobs.push(job);
                }
                Err(e) => {
                    warn!("Sync job {} is misconfigured: {}", job_key, e);
                    errors.insert(job_key.to_string(), vec![e]);
                }
            }
        }

        Ok(JobSet { jobs, errors })
    }

    /// Build and validate a single job.
    pub fn create_sync_job(
        &self,
        global: Option<&ClientConfig>,
        job_key: &str,
        value: &Value,
    ) -> Result<Box<dyn SyncPolicy>> {
        let mut config: JobConfig = serde_yaml::from_value(value.clone())
            .map_err(|e| Error::configuration(job_key, e.to_string()))?;
        if let Some(global) = global {
            config.merge_global_client_config(global);
        }

        let raw_type = config.sync_type.clone().unwrap_or_default();
        let sync_type = SyncType::parse(&raw_type).ok_or_else(|| {
            Error::configuration(
                job_key,
                format!(
                    "the 'sync_type' value '{}' is not a supported sync type",
                    raw_type
                ),
            )
        })?;

        let job = build_policy(sync_type, job_key, Arc::new(config), self.registry.clone());
        job.validate_config()?;
        Ok(job)
    }
}

/// The one place a policy variant is chosen.
pub fn build_policy(
    sync_type: SyncType,
    name: &str,
    config: Arc<JobConfig>,
    registry: Arc<ProviderRegistry>,
) -> Box<dyn SyncPolicy> {
    match sync_type {
        SyncType::Image => Box::new(ImageSyncPolicy::new(name, config, registry)),
        SyncType::Snapshot => Box::new(SnapshotSyncPolicy::new(name, config, registry)),
    }
}

fn global_client_config(document: &Value) -> Result<Option<ClientConfig>> {
    for key in GLOBAL_CLIENT_CONFIG_KEYS {
        if let Some(value) = document.get(key) {
            let config: ClientConfig = serde_yaml::from_value(value.clone()).map_err(|e| {
                Error::InvalidInput(format!("The global '{}' value is invalid: {}", key, e))
            })?;
            return Ok(Some(config));
        }
    }
    Ok(None)
}

fn yaml_error(err: serde_yaml::Error) -> Error {
    Error::Serialization(err.to_string())
}
