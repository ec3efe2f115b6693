//! XRegion Sync Engine
//!
//! This module keeps copies of machine images and automated database
//! snapshots in a destination region, using sync-marker tags written on the
//! resources themselves as the only record of what has been copied:
//! - Marker codec for `Sync-{region}[-{subtype}]` tags
//! - Account identity resolution with per-job memoization
//! - Image and database snapshot sync policies with retention
//! - YAML job configuration resolver
//! - Batch runner with per-job fault isolation

pub mod config;
pub mod configure;
pub mod identity;
pub mod image;
pub mod marker;
pub mod outcome;
pub mod policy;
pub mod runner;
pub mod snapshot;

use std::path::Path;
use std::sync::Arc;
use tracing::info;

use xregion_common::Result;
use xregion_provider::ProviderRegistry;

// Re-export main types
pub use config::{JobConfig, SyncType, DEFAULT_MAX_SNAPSHOTS_TO_RETAIN, DEFAULT_PROVIDER};
pub use configure::{build_policy, Configure, JobSet};
pub use identity::{account_from_principal, AccountResolver};
pub use image::ImageSyncPolicy;
pub use marker::SyncMarker;
pub use outcome::SyncOutcome;
pub use policy::{JobContext, SyncPolicy};
pub use runner::{BatchRunner, Operation, RunnerConfig};
pub use snapshot::{SnapshotSyncPolicy, SyncedSnapshot};

/// Resolve the jobs in a YAML configuration file and run `operation` on them.
///
/// Misconfigured jobs come back as failed outcomes after the runnable ones.
///
/// # Errors
/// Only document-level failures: an unreadable file, invalid YAML, or a
/// document that is not a mapping.
pub async fn run(
    config_path: impl AsRef<Path>,
    registry: Arc<ProviderRegistry>,
    operation: Operation,
    runner_config: RunnerConfig,
) -> Result<Vec<SyncOutcome>> {
    let path = config_path.as_ref();
    info!("Loading sync jobs from {}", path.display());

    let set = Configure::new(registry).configure_from_file(path).await?;
    Ok(run_jobs(set, operation, runner_config).await)
}

/// Run an already resolved job set.
pub async fn run_jobs(
    set: JobSet,
    operation: Operation,
    runner_config: RunnerConfig,
) -> Vec<SyncOutcome> {
    BatchRunner::new(runner_config)
        .run(&set.jobs, set.errors, operation)
        .await
}
