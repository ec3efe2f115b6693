//! Per-job sync outcomes.

use serde::{Serialize, Serializer};

use xregion_common::Error;

/// Result of running one job.
///
/// `completed` is false whenever `errors` is non-empty. A completed outcome
/// without `created_resource_id` means no copy was needed.
#[derive(Debug, Serialize)]
pub struct SyncOutcome {
    /// Job name.
    pub name: String,
    /// Whether the operation ran to completion.
    pub completed: bool,
    /// Resource created by a sync, if any.
    pub created_resource_id: Option<String>,
    /// Answer of a check-only run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_required: Option<bool>,
    /// Errors, in the order they were recorded.
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<Error>,
}

impl SyncOutcome {
    /// Outcome of a sync that ran to completion.
    pub fn synced(name: impl Into<String>, created_resource_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            completed: true,
            created_resource_id,
            sync_required: None,
            errors: Vec::new(),
        }
    }

    /// Outcome of a check-only run that ran to completion.
    pub fn checked(name: impl Into<String>, sync_required: bool) -> Self {
        Self {
            name: name.into(),
            completed: true,
            created_resource_id: None,
            sync_required: Some(sync_required),
            errors: Vec::new(),
        }
    }

    /// Outcome of a job that failed with the given errors.
    pub fn failed(name: impl Into<String>, errors: Vec<Error>) -> Self {
        Self {
            name: name.into(),
            completed: false,
            created_resource_id: None,
            sync_required: None,
            errors,
        }
    }

    /// Whether the job failed.
    pub fn is_failed(&self) -> bool {
        !self.completed
    }

    /// Whether a sync created a new resource.
    pub fn created_resource(&self) -> bool {
        self.completed && self.created_resource_id.is_some()
    }
}

fn serialize_errors<S: Serializer>(errors: &[Error], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}
