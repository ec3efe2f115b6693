//! Cloud client trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use xregion_common::{Filter, Result, Tag};

/// Provider client options, passed through to the provider factory.
///
/// The factory receives the job's merged options plus a `region` entry.
pub type ClientConfig = serde_json::Map<String, serde_json::Value>;

/// A machine image as seen in one region's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Provider image identifier (e.g. `ami-0abc...`).
    pub id: String,
    /// Image name, reused for the destination copy.
    pub name: String,
    /// Owning account.
    pub owner_id: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Tags attached to the image.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Other catalog attributes (`architecture`, `virtualization-type`, ...),
    /// addressable by filters under the same name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Database snapshot origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Created by the provider's backup schedule.
    Automated,
    /// Created by a user or by a cross-region copy.
    Manual,
}

/// A database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbInstance {
    pub id: String,
}

/// A database snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbSnapshot {
    /// Snapshot identifier (automated ones look like `rds:db-2024-01-01-00-00`).
    pub id: String,
    /// The instance this snapshot belongs to.
    pub db_instance_id: String,
    /// Automated or manual.
    pub kind: SnapshotKind,
    /// Snapshot creation time.
    pub created_at: DateTime<Utc>,
    /// Tags, when the backend returns them inline.
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Image catalog and mutation capability of a region-scoped client.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Check that the client's region exists and is reachable.
    ///
    /// # Returns
    /// - `Ok(false)` if the provider answered that the region does not exist
    ///
    /// # Errors
    /// - Network/name-resolution failures when the region host is bogus
    async fn region_available(&self) -> Result<bool>;

    /// List images owned by `owner` matching every filter.
    ///
    /// `owner` may be the literal `self` for the credentials' own account.
    async fn describe_images(&self, owner: &str, filters: &[Filter]) -> Result<Vec<Image>>;

    /// Check whether an image exists in this region.
    async fn image_exists(&self, image_id: &str) -> Result<bool>;

    /// Copy an image from `source_region` into this client's region.
    ///
    /// # Returns
    /// The new image id, or `None` if the provider did not report one.
    async fn copy_image(
        &self,
        source_region: &str,
        source_image_id: &str,
        name: &str,
    ) -> Result<Option<String>>;

    /// Write tags onto a resource in this region, replacing same-key tags.
    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()>;
}

/// Database snapshot catalog and mutation capability of a region-scoped client.
#[async_trait]
pub trait SnapshotCatalog: Send + Sync {
    /// Look up a database instance.
    ///
    /// A successful call proves the region is reachable even when the
    /// instance itself does not exist there.
    async fn describe_db_instance(&self, db_instance_id: &str) -> Result<Option<DbInstance>>;

    /// List snapshots of one instance filtered by kind.
    async fn describe_db_snapshots(
        &self,
        db_instance_id: &str,
        kind: SnapshotKind,
    ) -> Result<Vec<DbSnapshot>>;

    /// Fetch tags for a fully-qualified resource reference.
    async fn list_tags_for_resource(&self, resource_name: &str) -> Result<Vec<Tag>>;

    /// Copy a snapshot, given by fully-qualified reference, into this region.
    ///
    /// # Returns
    /// The destination snapshot id, or `None` if the provider did not report one.
    async fn copy_db_snapshot(
        &self,
        source_snapshot: &str,
        target_snapshot_id: &str,
    ) -> Result<Option<String>>;

    /// Write tags onto a fully-qualified resource reference.
    async fn add_tags_to_resource(&self, resource_name: &str, tags: &[Tag]) -> Result<()>;

    /// Delete a snapshot in this region.
    async fn delete_db_snapshot(&self, snapshot_id: &str) -> Result<()>;
}

/// Identity lookup capability.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Enumerate up to `limit` principal references (e.g. user ARNs).
    async fn principal_references(&self, limit: usize) -> Result<Vec<String>>;
}

/// A region-scoped cloud client with every capability the sync engine needs.
pub trait CloudClient: ImageCatalog + SnapshotCatalog + IdentityDirectory {
    /// Get the provider name (e.g., "memory").
    fn provider_name(&self) -> &str;

    /// The region this client is bound to.
    fn region(&self) -> &str;
}
