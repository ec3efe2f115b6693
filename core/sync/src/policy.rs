//! Sync policy contract and the job context shared by every policy.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use xregion_common::{Error, Filter, Result};
use xregion_provider::{CloudClient, ProviderRegistry};

use crate::config::{literal, JobConfig};
use crate::identity::AccountResolver;

/// A per-job policy deciding whether a copy is needed and performing it.
#[async_trait]
pub trait SyncPolicy: Send + Sync {
    /// The job name this policy was configured under.
    fn name(&self) -> &str;

    /// Validate the job configuration.
    ///
    /// # Errors
    /// - `Configuration` naming the job and the offending option
    fn validate_config(&self) -> Result<()>;

    /// Copy the resource if the destination does not reflect the source.
    ///
    /// # Returns
    /// The destination resource id produced, or `None` if no copy was needed.
    async fn sync(&self) -> Result<Option<String>>;

    /// Whether `sync` would copy, without making any mutating call.
    async fn sync_required(&self) -> Result<bool>;
}

/// State and helpers shared by every policy of one job.
pub struct JobContext {
    name: String,
    config: Arc<JobConfig>,
    registry: Arc<ProviderRegistry>,
    account: AccountResolver,
}

impl JobContext {
    /// Create a context for the named job.
    pub fn new(
        name: impl Into<String>,
        config: Arc<JobConfig>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let name = name.into();
        let account = AccountResolver::new(name.clone(), config.account_id_override());
        Self {
            name,
            config,
            registry,
            account,
        }
    }

    /// The job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The job configuration.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// The account resolver, memoized for this job.
    pub fn account(&self) -> &AccountResolver {
        &self.account
    }

    /// Shorthand for a configuration error naming this job.
    pub fn config_error(&self, reason: impl Into<String>) -> Error {
        Error::configuration(&self.name, reason)
    }

    /// The configured source region. Only valid after validation.
    pub fn source_region(&self) -> &str {
        self.config.source_region.as_deref().unwrap_or_default()
    }

    /// The configured destination region. Only valid after validation.
    pub fn destination_region(&self) -> &str {
        self.config.destination_region.as_deref().unwrap_or_default()
    }

    /// Resolve a client bound to `region`.
    pub fn connect(&self, region: &str) -> Result<Arc<dyn CloudClient>> {
        debug!(
            "{}: connecting to {} in {}",
            self.name,
            self.config.provider_name(),
            region
        );
        self.registry
            .resolve(self.config.provider_name(), &self.config.client_config_for(region))
    }

    /// Validation shared by every policy.
    ///
    /// # Errors
    /// - Missing or empty `source_region` / `destination_region`
    /// - `filters` present but not a list, or with malformed entries
    pub fn validate_common(&self) -> Result<()> {
        if self.config.source_region.as_deref().unwrap_or_default().is_empty() {
            return Err(self.config_error("it must have a valid 'source_region' value"));
        }
        if self
            .config
            .destination_region
            .as_deref()
            .unwrap_or_default()
            .is_empty()
        {
            return Err(self.config_error("it must have a valid 'destination_region' value"));
        }
        if let Some(filters) = &self.config.filters {
            self.parse_config_filters(filters)?;
        }
        Ok(())
    }

    /// Parse a `filters` option into `field=value` pairs.
    ///
    /// # Errors
    /// - `Configuration` if the option is not a list, or naming the first
    ///   entry that is not exactly `field=value`
    pub fn parse_config_filters(&self, filters: &Value) -> Result<Vec<Filter>> {
        let entries = match filters {
            Value::Null => return Ok(Vec::new()),
            Value::Array(entries) => entries,
            _ => return Err(self.config_error("the 'filters' value must be a list")),
        };

        entries
            .iter()
            .map(|entry| {
                let literal = literal(entry);
                Filter::parse(&literal).map_err(|_| {
                    self.config_error(format!(
                        "the 'filters' value '{}' must be of the form filter-field=filter-value",
                        literal
                    ))
                })
            })
            .collect()
    }
}
