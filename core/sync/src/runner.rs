//! Batch runner with per-job fault isolation.

use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{error, info};

use xregion_common::{Error, Result};

use crate::outcome::SyncOutcome;
use crate::policy::SyncPolicy;

/// Which policy operation a run invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Copy whatever is out of date.
    Sync,
    /// Only report whether a copy is required.
    Check,
}

/// Configuration for the batch runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of jobs run at the same time. 1 runs jobs one after another.
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Runs a batch of policies, turning every failure into an outcome.
///
/// Outcomes come back in the order policies were supplied, followed by one
/// failed outcome per configuration error entry. The run itself never fails.
pub struct BatchRunner {
    config: RunnerConfig,
}

impl BatchRunner {
    /// Create a runner.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run `operation` on every policy.
    pub async fn run(
        &self,
        policies: &[Box<dyn SyncPolicy>],
        config_errors: BTreeMap<String, Vec<Error>>,
        operation: Operation,
    ) -> Vec<SyncOutcome> {
        let start = Instant::now();
        info!(
            "Running {:?} on {} jobs ({} with configuration errors)",
            operation,
            policies.len(),
            config_errors.len()
        );

        let mut outcomes: Vec<SyncOutcome> = stream::iter(policies.iter())
            .map(|policy| run_one(&**policy, operation))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        outcomes.extend(
            config_errors
                .into_iter()
                .map(|(name, errors)| SyncOutcome::failed(name, errors)),
        );

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        info!(
            "Run finished in {:?}: {} jobs, {} failed",
            start.elapsed(),
            outcomes.len(),
            failed
        );
        outcomes
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

async fn run_one(policy: &dyn SyncPolicy, operation: Operation) -> SyncOutcome {
    let name = policy.name().to_string();

    // Panics are trapped too; one misbehaving job must not stop the others.
    let result = AssertUnwindSafe(invoke(policy, operation))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(Error::Unexpected(panic_message(panic))));

    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("{}: {}", name, err);
            SyncOutcome::failed(name, vec![err])
        }
    }
}

async fn invoke(policy: &dyn SyncPolicy, operation: Operation) -> Result<SyncOutcome> {
    match operation {
        Operation::Sync => {
            let created = policy.sync().await?;
            Ok(SyncOutcome::synced(policy.name(), created))
        }
        Operation::Check => {
            let required = policy.sync_required().await?;
            Ok(SyncOutcome::checked(policy.name(), required))
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
