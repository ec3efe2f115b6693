//! In-memory cloud provider for testing and dry runs.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use xregion_common::{Error, Filter, Result, Tag};

use crate::client::{
    CloudClient, DbInstance, DbSnapshot, IdentityDirectory, Image, ImageCatalog, SnapshotCatalog,
    SnapshotKind,
};

/// Resources held by one region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionState {
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub db_instances: Vec<DbInstance>,
    #[serde(default)]
    pub db_snapshots: Vec<DbSnapshot>,
}

/// Whole-cloud state, serializable to a JSON state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudState {
    /// Account the credentials belong to; `self` owner queries match it.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Principal references returned by identity lookups.
    #[serde(default)]
    pub principals: Vec<String>,
    /// Known regions. A region missing here does not exist.
    #[serde(default)]
    pub regions: BTreeMap<String, RegionState>,
}

/// Every call a client can make, used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    RegionAvailable,
    DescribeImages,
    ImageExists,
    CopyImage,
    CreateTags,
    DescribeDbInstance,
    DescribeDbSnapshots,
    ListTagsForResource,
    CopyDbSnapshot,
    AddTagsToResource,
    DeleteDbSnapshot,
    PrincipalReferences,
}

/// A mutating call recorded by the memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CopyImage {
        region: String,
        source_region: String,
        source_image_id: String,
        image_id: String,
    },
    CreateTags {
        region: String,
        resource_id: String,
        tags: Vec<Tag>,
    },
    CopyDbSnapshot {
        region: String,
        source_snapshot: String,
        snapshot_id: String,
    },
    AddTagsToResource {
        region: String,
        resource_name: String,
        tags: Vec<Tag>,
    },
    DeleteDbSnapshot {
        region: String,
        snapshot_id: String,
    },
}

#[derive(Debug, Default)]
struct Journal {
    mutations: Vec<Mutation>,
    calls: HashMap<CloudOperation, usize>,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable_regions: HashSet<String>,
    failing_operations: HashSet<CloudOperation>,
    copies_without_id: bool,
}

/// In-memory cloud shared by every region-scoped [`MemoryClient`].
///
/// Records every mutating call and supports fault injection, so it doubles
/// as the test fixture for the sync engine. State can be loaded from and
/// saved to a JSON file.
pub struct MemoryCloud {
    state: RwLock<CloudState>,
    journal: Mutex<Journal>,
    faults: RwLock<Faults>,
}

impl MemoryCloud {
    /// Name the provider is registered under.
    pub const PROVIDER_NAME: &'static str = "memory";

    /// Create an empty cloud with no regions.
    pub fn new() -> Self {
        Self::from_state(CloudState::default())
    }

    /// Create a cloud from existing state.
    pub fn from_state(state: CloudState) -> Self {
        Self {
            state: RwLock::new(state),
            journal: Mutex::new(Journal::default()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Load state from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let state: CloudState = serde_json::from_slice(&raw)?;
        Ok(Self::from_state(state))
    }

    /// Write the current state to a JSON file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&*self.state.read().await)?;
        tokio::fs::write(path.as_ref(), raw).await?;
        Ok(())
    }

    /// Get a region-scoped client.
    pub fn client(self: &Arc<Self>, region: impl Into<String>) -> MemoryClient {
        MemoryClient {
            cloud: Arc::clone(self),
            region: region.into(),
        }
    }

    /// Clone of the current state.
    pub async fn state(&self) -> CloudState {
        self.state.read().await.clone()
    }

    /// Mutate state directly, e.g. to seed fixtures or delete out-of-band.
    pub async fn update<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut CloudState) -> T,
    {
        f(&mut *self.state.write().await)
    }

    /// Make every call against `region` fail as if its host did not resolve.
    pub async fn set_unreachable(&self, region: impl Into<String>) {
        self.faults
            .write()
            .await
            .unreachable_regions
            .insert(region.into());
    }

    /// Make every call of `operation` fail with a provider error.
    pub async fn fail_operation(&self, operation: CloudOperation) {
        self.faults
            .write()
            .await
            .failing_operations
            .insert(operation);
    }

    /// Make copy calls succeed without reporting a new resource id.
    pub async fn set_copies_without_id(&self, enabled: bool) {
        self.faults.write().await.copies_without_id = enabled;
    }

    /// All mutating calls made so far, in order.
    pub async fn mutations(&self) -> Vec<Mutation> {
        self.journal.lock().await.mutations.clone()
    }

    /// Number of times `operation` has been called.
    pub async fn call_count(&self, operation: CloudOperation) -> usize {
        self.journal
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    async fn enter(&self, region: &str, operation: CloudOperation) -> Result<()> {
        *self
            .journal
            .lock()
            .await
            .calls
            .entry(operation)
            .or_insert(0) += 1;

        let faults = self.faults.read().await;
        if faults.unreachable_regions.contains(region) {
            return Err(Error::Provider(format!(
                "Failed to resolve host for region '{}'",
                region
            )));
        }
        if faults.failing_operations.contains(&operation) {
            return Err(Error::Provider(format!(
                "{:?} failed in region '{}'",
                operation, region
            )));
        }
        Ok(())
    }

    async fn record(&self, mutation: Mutation) {
        debug!("memory provider mutation: {:?}", mutation);
        self.journal.lock().await.mutations.push(mutation);
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

/// Split an `arn:aws:rds:{region}:{account}:snapshot:{id}` reference.
fn parse_snapshot_reference(reference: &str) -> Option<(&str, &str)> {
    let rest = reference.strip_prefix("arn:aws:rds:")?;
    let mut parts = rest.splitn(4, ':');
    let region = parts.next()?;
    let _account = parts.next()?;
    if parts.next()? != "snapshot" {
        return None;
    }
    let id = parts.next()?;
    Some((region, id))
}

fn region_mut<'a>(state: &'a mut CloudState, region: &str) -> Result<&'a mut RegionState> {
    state
        .regions
        .get_mut(region)
        .ok_or_else(|| Error::Provider(format!("Region '{}' does not exist", region)))
}

fn region_ref<'a>(state: &'a CloudState, region: &str) -> Result<&'a RegionState> {
    state
        .regions
        .get(region)
        .ok_or_else(|| Error::Provider(format!("Region '{}' does not exist", region)))
}

fn merge_tags(existing: &mut Vec<Tag>, tags: &[Tag]) {
    for tag in tags {
        match existing.iter_mut().find(|t| t.key == tag.key) {
            Some(current) => current.value = tag.value.clone(),
            None => existing.push(tag.clone()),
        }
    }
}

/// An image without the filtered attribute never matches.
fn image_matches(image: &Image, filter: &Filter) -> bool {
    if let Some(key) = filter.field.strip_prefix("tag:") {
        return Tag::find(&image.tags, key) == Some(filter.value.as_str());
    }
    match filter.field.as_str() {
        "name" => image.name == filter.value,
        "image-id" => image.id == filter.value,
        "owner-id" => image.owner_id == filter.value,
        other => image.attributes.get(other) == Some(&filter.value),
    }
}

fn mint_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..17])
}

/// Client bound to one region of a [`MemoryCloud`].
pub struct MemoryClient {
    cloud: Arc<MemoryCloud>,
    region: String,
}

impl CloudClient for MemoryClient {
    fn provider_name(&self) -> &str {
        MemoryCloud::PROVIDER_NAME
    }

    fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl ImageCatalog for MemoryClient {
    async fn region_available(&self) -> Result<bool> {
        self.cloud
            .enter(&self.region, CloudOperation::RegionAvailable)
            .await?;
        Ok(self.cloud.state.read().await.regions.contains_key(&self.region))
    }

    async fn describe_images(&self, owner: &str, filters: &[Filter]) -> Result<Vec<Image>> {
        self.cloud
            .enter(&self.region, CloudOperation::DescribeImages)
            .await?;
        let state = self.cloud.state.read().await;
        let region = region_ref(&state, &self.region)?;

        let mut results = Vec::new();
        for image in &region.images {
            let owned = image.owner_id == owner
                || (owner == "self"
                    && (image.owner_id == "self"
                        || state.account_id.as_deref() == Some(image.owner_id.as_str())));
            if !owned {
                continue;
            }

            let mut matched = true;
            for filter in filters {
                if !image_matches(image, filter) {
                    matched = false;
                    break;
                }
            }
            if matched {
                results.push(image.clone());
            }
        }

        Ok(results)
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        self.cloud
            .enter(&self.region, CloudOperation::ImageExists)
            .await?;
        let state = self.cloud.state.read().await;
        let region = region_ref(&state, &self.region)?;
        Ok(region.images.iter().any(|image| image.id == image_id))
    }

    async fn copy_image(
        &self,
        source_region: &str,
        source_image_id: &str,
        name: &str,
    ) -> Result<Option<String>> {
        self.cloud
            .enter(&self.region, CloudOperation::CopyImage)
            .await?;
        let copies_without_id = self.cloud.faults.read().await.copies_without_id;

        let image_id = {
            let mut state = self.cloud.state.write().await;
            let source = region_ref(&state, source_region)?
                .images
                .iter()
                .find(|image| image.id == source_image_id)
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "Image '{}' not found in region '{}'",
                        source_image_id, source_region
                    ))
                })?;

            let image_id = mint_id("ami");
            let owner_id = state
                .account_id
                .clone()
                .unwrap_or_else(|| source.owner_id.clone());
            region_mut(&mut state, &self.region)?.images.push(Image {
                id: image_id.clone(),
                name: name.to_string(),
                owner_id,
                created_at: Utc::now(),
                tags: Vec::new(),
                attributes: source.attributes.clone(),
            });
            image_id
        };

        self.cloud
            .record(Mutation::CopyImage {
                region: self.region.clone(),
                source_region: source_region.to_string(),
                source_image_id: source_image_id.to_string(),
                image_id: image_id.clone(),
            })
            .await;

        Ok((!copies_without_id).then_some(image_id))
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<()> {
        self.cloud
            .enter(&self.region, CloudOperation::CreateTags)
            .await?;
        {
            let mut state = self.cloud.state.write().await;
            let image = region_mut(&mut state, &self.region)?
                .images
                .iter_mut()
                .find(|image| image.id == resource_id)
                .ok_or_else(|| Error::NotFound(format!("Image '{}' not found", resource_id)))?;
            merge_tags(&mut image.tags, tags);
        }

        self.cloud
            .record(Mutation::CreateTags {
                region: self.region.clone(),
                resource_id: resource_id.to_string(),
                tags: tags.to_vec(),
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl SnapshotCatalog for MemoryClient {
    async fn describe_db_instance(&self, db_instance_id: &str) -> Result<Option<DbInstance>> {
        self.cloud
            .enter(&self.region, CloudOperation::DescribeDbInstance)
            .await?;
        let state = self.cloud.state.read().await;
        let region = region_ref(&state, &self.region)?;
        Ok(region
            .db_instances
            .iter()
            .find(|instance| instance.id == db_instance_id)
            .cloned())
    }

    async fn describe_db_snapshots(
        &self,
        db_instance_id: &str,
        kind: SnapshotKind,
    ) -> Result<Vec<DbSnapshot>> {
        self.cloud
            .enter(&self.region, CloudOperation::DescribeDbSnapshots)
            .await?;
        let state = self.cloud.state.read().await;
        let region = region_ref(&state, &self.region)?;
        Ok(region
            .db_snapshots
            .iter()
            .filter(|s| s.db_instance_id == db_instance_id && s.kind == kind)
            .cloned()
            .collect())
    }

    async fn list_tags_for_resource(&self, resource_name: &str) -> Result<Vec<Tag>> {
        self.cloud
            .enter(&self.region, CloudOperation::ListTagsForResource)
            .await?;
        let (_, snapshot_id) = parse_snapshot_reference(resource_name).ok_or_else(|| {
            Error::Provider(format!("Invalid resource name '{}'", resource_name))
        })?;

        let state = self.cloud.state.read().await;
        region_ref(&state, &self.region)?
            .db_snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .map(|s| s.tags.clone())
            .ok_or_else(|| Error::NotFound(format!("Snapshot '{}' not found", snapshot_id)))
    }

    async fn copy_db_snapshot(
        &self,
        source_snapshot: &str,
        target_snapshot_id: &str,
    ) -> Result<Option<String>> {
        self.cloud
            .enter(&self.region, CloudOperation::CopyDbSnapshot)
            .await?;
        let copies_without_id = self.cloud.faults.read().await.copies_without_id;
        let (source_region, source_id) = parse_snapshot_reference(source_snapshot)
            .ok_or_else(|| {
                Error::Provider(format!("Invalid source snapshot '{}'", source_snapshot))
            })?;

        {
            let mut state = self.cloud.state.write().await;
            let source = region_ref(&state, source_region)?
                .db_snapshots
                .iter()
                .find(|s| s.id == source_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Snapshot '{}' not found", source_id)))?;

            let destination = region_mut(&mut state, &self.region)?;
            if destination
                .db_snapshots
                .iter()
                .any(|s| s.id == target_snapshot_id)
            {
                return Err(Error::Provider(format!(
                    "Snapshot '{}' already exists in region '{}'",
                    target_snapshot_id, self.region
                )));
            }
            destination.db_snapshots.push(DbSnapshot {
                id: target_snapshot_id.to_string(),
                db_instance_id: source.db_instance_id,
                kind: SnapshotKind::Manual,
                created_at: Utc::now(),
                tags: Vec::new(),
            });
        }

        self.cloud
            .record(Mutation::CopyDbSnapshot {
                region: self.region.clone(),
                source_snapshot: source_snapshot.to_string(),
                snapshot_id: target_snapshot_id.to_string(),
            })
            .await;

        Ok((!copies_without_id).then(|| target_snapshot_id.to_string()))
    }

    async fn add_tags_to_resource(&self, resource_name: &str, tags: &[Tag]) -> Result<()> {
        self.cloud
            .enter(&self.region, CloudOperation::AddTagsToResource)
            .await?;
        let (_, snapshot_id) = parse_snapshot_reference(resource_name).ok_or_else(|| {
            Error::Provider(format!("Invalid resource name '{}'", resource_name))
        })?;

        {
            let mut state = self.cloud.state.write().await;
            let snapshot = region_mut(&mut state, &self.region)?
                .db_snapshots
                .iter_mut()
                .find(|s| s.id == snapshot_id)
                .ok_or_else(|| Error::NotFound(format!("Snapshot '{}' not found", snapshot_id)))?;
            merge_tags(&mut snapshot.tags, tags);
        }

        self.cloud
            .record(Mutation::AddTagsToResource {
                region: self.region.clone(),
                resource_name: resource_name.to_string(),
                tags: tags.to_vec(),
            })
            .await;
        Ok(())
    }

    async fn delete_db_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.cloud
            .enter(&self.region, CloudOperation::DeleteDbSnapshot)
            .await?;
        {
            let mut state = self.cloud.state.write().await;
            let region = region_mut(&mut state, &self.region)?;
            let before = region.db_snapshots.len();
            region.db_snapshots.retain(|s| s.id != snapshot_id);
            if region.db_snapshots.len() == before {
                return Err(Error::NotFound(format!(
                    "Snapshot '{}' not found",
                    snapshot_id
                )));
            }
        }

        self.cloud
            .record(Mutation::DeleteDbSnapshot {
                region: self.region.clone(),
                snapshot_id: snapshot_id.to_string(),
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for MemoryClient {
    async fn principal_references(&self, limit: usize) -> Result<Vec<String>> {
        self.cloud
            .enter(&self.region, CloudOperation::PrincipalReferences)
            .await?;
        let state = self.cloud.state.read().await;
        Ok(state.principals.iter().take(limit).cloned().collect())
    }
}
