//! Machine image sync policy.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use xregion_common::{Filter, Result};
use xregion_provider::{CloudClient, Image, ImageCatalog, ProviderRegistry};

use crate::config::JobConfig;
use crate::marker;
use crate::policy::{JobContext, SyncPolicy};

/// Owner scope used when a job does not configure `owner_id`.
pub const DEFAULT_OWNER: &str = "self";

/// Tag every image of a job carries when `sync_identifier` is configured.
pub const IDENTIFIER_TAG: &str = "Sync-Identifier";

/// Syncs the single image matching a job's filters to the destination region.
///
/// The destination image id is recorded in a marker on the source image.
/// A later run skips the copy only while that destination image still exists.
pub struct ImageSyncPolicy {
    ctx: JobContext,
}

/// Everything the copy step needs once the idempotency check has run.
struct ImagePlan {
    source: Arc<dyn CloudClient>,
    destination: Arc<dyn CloudClient>,
    image: Image,
    required: bool,
}

impl ImageSyncPolicy {
    /// Create a policy for the named job.
    pub fn new(
        name: impl Into<String>,
        config: Arc<JobConfig>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            ctx: JobContext::new(name, config, registry),
        }
    }

    /// Filters selecting the job's image: the identifier tag plus user filters.
    fn filters(&self) -> Result<Vec<Filter>> {
        let config = self.ctx.config();
        let mut filters = Vec::new();

        if let Some(identifier) = config.sync_identifier.as_deref().filter(|s| !s.is_empty()) {
            filters.push(Filter::new(format!("tag:{}", IDENTIFIER_TAG), identifier));
        }
        if let Some(configured) = &config.filters {
            filters.extend(self.ctx.parse_config_filters(configured)?);
        }

        Ok(filters)
    }

    /// Resolve a client for `region` and prove the region is usable.
    ///
    /// Any failure, including name-resolution errors for bogus region
    /// codes, is reported as a configuration error.
    async fn validate_region(&self, region: &str) -> Result<Arc<dyn CloudClient>> {
        let invalid = || {
            self.ctx.config_error(format!(
                "invalid region code of '{}'. It either does not exist or the given \
                 credentials cannot access it",
                region
            ))
        };

        let client = self.ctx.connect(region).map_err(|e| {
            debug!("{}: cannot connect to {}: {}", self.ctx.name(), region, e);
            invalid()
        })?;

        match client.region_available().await {
            Ok(true) => Ok(client),
            Ok(false) => Err(invalid()),
            Err(e) => {
                debug!("{}: region check for {} failed: {}", self.ctx.name(), region, e);
                Err(invalid())
            }
        }
    }

    async fn find_source_image(&self, source: &dyn CloudClient) -> Result<Image> {
        let owner = self
            .ctx
            .config()
            .owner_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_OWNER);
        let filters = self.filters()?;

        let mut images = source.describe_images(owner, &filters).await?;
        match images.len() {
            0 => Err(self
                .ctx
                .config_error("no images were found using the filter settings")),
            1 => Ok(images.remove(0)),
            _ => {
                let ids: Vec<&str> = images.iter().map(|i| i.id.as_str()).collect();
                Err(self.ctx.config_error(format!(
                    "more than one image was found with the filter settings: {}",
                    ids.join(", ")
                )))
            }
        }
    }

    /// Destination image id recorded on the source image, if any.
    ///
    /// A malformed marker is treated as absent, which leads to a fresh copy.
    fn recorded_destination(&self, image: &Image) -> Option<String> {
        match marker::find(&image.tags, self.ctx.destination_region(), None) {
            Ok(found) => found.map(|m| m.resource_identifier),
            Err(e) => {
                warn!(
                    "{}: ignoring sync marker on {}: {}",
                    self.ctx.name(),
                    image.id,
                    e
                );
                None
            }
        }
    }

    async fn plan(&self) -> Result<ImagePlan> {
        let source = self.validate_region(self.ctx.source_region()).await?;
        let destination = self.validate_region(self.ctx.destination_region()).await?;

        let image = self.find_source_image(source.as_ref()).await?;

        let exists = match self.recorded_destination(&image) {
            // Any failure counts as missing: a redundant copy beats a missed one.
            Some(id) => destination.image_exists(&id).await.unwrap_or(false),
            None => false,
        };

        Ok(ImagePlan {
            source,
            destination,
            image,
            required: !exists,
        })
    }
}

#[async_trait]
impl SyncPolicy for ImageSyncPolicy {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn validate_config(&self) -> Result<()> {
        self.ctx.validate_common()
    }

    async fn sync(&self) -> Result<Option<String>> {
        let plan = self.plan().await?;
        if !plan.required {
            debug!(
                "{}: image {} already synced to {}",
                self.ctx.name(),
                plan.image.id,
                self.ctx.destination_region()
            );
            return Ok(None);
        }

        // No client token: the marker check above is the only idempotency guard.
        let copied = plan
            .destination
            .copy_image(self.ctx.source_region(), &plan.image.id, &plan.image.name)
            .await?;

        let Some(destination_id) = copied else {
            warn!(
                "{}: copy of {} reported no destination image id",
                self.ctx.name(),
                plan.image.id
            );
            return Ok(None);
        };

        let tag = marker::encode(
            self.ctx.destination_region(),
            &destination_id,
            &Utc::now(),
            None,
        );
        plan.source.create_tags(&plan.image.id, &[tag]).await?;

        info!(
            "{}: copied image {} to {} as {}",
            self.ctx.name(),
            plan.image.id,
            self.ctx.destination_region(),
            destination_id
        );
        Ok(Some(destination_id))
    }

    async fn sync_required(&self) -> Result<bool> {
        Ok(self.plan().await?.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use xregion_common::{Error, Tag};
    use xregion_provider::{
        create_default_registry, CloudState, MemoryCloud, Mutation, RegionState,
    };

    const SOURCE: &str = "us-east-1";
    const DESTINATION: &str = "us-west-2";

    fn image(id: &str, tags: Vec<Tag>) -> Image {
        Image {
            id: id.to_string(),
            name: format!("{}-name", id),
            owner_id: "123456789012".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            tags,
            attributes: Default::default(),
        }
    }

    fn cloud(images: Vec<Image>) -> Arc<MemoryCloud> {
        let mut state = CloudState {
            account_id: Some("123456789012".to_string()),
            ..Default::default()
        };
        state.regions.insert(
            SOURCE.to_string(),
            RegionState {
                images,
                ..Default::default()
            },
        );
        state
            .regions
            .insert(DESTINATION.to_string(), RegionState::default());
        Arc::new(MemoryCloud::from_state(state))
    }

    fn job() -> JobConfig {
        JobConfig {
            sync_type: Some("ec2_ami".to_string()),
            source_region: Some(SOURCE.to_string()),
            destination_region: Some(DESTINATION.to_string()),
            sync_identifier: Some("web".to_string()),
            ..Default::default()
        }
    }

    fn policy(cloud: &Arc<MemoryCloud>, config: JobConfig) -> ImageSyncPolicy {
        let registry = create_default_registry(cloud.clone()).unwrap();
        ImageSyncPolicy::new("SYNC_web_ami", Arc::new(config), Arc::new(registry))
    }

    fn identified(id: &str) -> Image {
        image(id, vec![Tag::new(IDENTIFIER_TAG, "web")])
    }

    #[tokio::test]
    async fn test_sync_copies_and_marks_source() {
        let cloud = cloud(vec![identified("ami-src")]);
        let policy = policy(&cloud, job());

        let before = Utc::now() - Duration::seconds(1);
        let destination_id = policy.sync().await.unwrap().unwrap();

        let state = cloud.state().await;
        assert!(state.regions[DESTINATION]
            .images
            .iter()
            .any(|i| i.id == destination_id && i.name == "ami-src-name"));

        let source = &state.regions[SOURCE].images[0];
        let marker = marker::find(&source.tags, DESTINATION, None)
            .unwrap()
            .unwrap();
        assert_eq!(marker.resource_identifier, destination_id);
        assert!(marker.timestamp >= before);
        assert!(marker.timestamp <= Utc::now());
    }

    #[tokio::test]
    async fn test_sync_twice_copies_once() {
        let cloud = cloud(vec![identified("ami-src")]);
        let policy = policy(&cloud, job());

        assert!(policy.sync().await.unwrap().is_some());
        assert_eq!(policy.sync().await.unwrap(), None);

        let copies = cloud
            .mutations()
            .await
            .into_iter()
            .filter(|m| matches!(m, Mutation::CopyImage { .. }))
            .count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn test_deleted_destination_triggers_fresh_copy() {
        let cloud = cloud(vec![identified("ami-src")]);
        let policy = policy(&cloud, job());

        let first = policy.sync().await.unwrap().unwrap();
        cloud
            .update(|state| {
                state
                    .regions
                    .get_mut(DESTINATION)
                    .unwrap()
                    .images
                    .retain(|i| i.id != first)
            })
            .await;

        assert!(policy.sync_required().await.unwrap());
        let second = policy.sync().await.unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_existence_check_failure_means_copy() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let tags = vec![
            Tag::new(IDENTIFIER_TAG, "web"),
            marker::encode(DESTINATION, "ami-old", &ts, None),
        ];
        let cloud = cloud(vec![image("ami-src", tags)]);
        cloud
            .update(|state| {
                state
                    .regions
                    .get_mut(DESTINATION)
                    .unwrap()
                    .images
                    .push(image("ami-old", vec![]))
            })
            .await;
        let policy = policy(&cloud, job());

        assert!(!policy.sync_required().await.unwrap());

        cloud
            .fail_operation(xregion_provider::CloudOperation::ImageExists)
            .await;
        assert!(policy.sync_required().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_marker_leads_to_fresh_copy() {
        let tags = vec![
            Tag::new(IDENTIFIER_TAG, "web"),
            Tag::new(marker::marker_key(DESTINATION, None), "garbage / ami-old"),
        ];
        let cloud = cloud(vec![image("ami-src", tags)]);
        let policy = policy(&cloud, job());

        assert!(policy.sync_required().await.unwrap());
        let destination_id = policy.sync().await.unwrap().unwrap();

        let state = cloud.state().await;
        let marker = marker::find(&state.regions[SOURCE].images[0].tags, DESTINATION, None)
            .unwrap()
            .unwrap();
        assert_eq!(marker.resource_identifier, destination_id);
    }

    #[tokio::test]
    async fn test_copy_without_id_writes_no_marker() {
        let cloud = cloud(vec![identified("ami-src")]);
        cloud.set_copies_without_id(true).await;
        let policy = policy(&cloud, job());

        assert_eq!(policy.sync().await.unwrap(), None);

        let mutations = cloud.mutations().await;
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], Mutation::CopyImage { .. }));
        let state = cloud.state().await;
        assert!(marker::find(&state.regions[SOURCE].images[0].tags, DESTINATION, None)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sync_required_never_mutates() {
        let cloud = cloud(vec![identified("ami-src")]);
        let policy = policy(&cloud, job());

        for _ in 0..3 {
            assert!(policy.sync_required().await.unwrap());
        }
        assert!(cloud.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_matching_image() {
        let cloud = cloud(vec![image("ami-other", vec![])]);
        let err = policy(&cloud, job()).sync().await.unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("no images"));
    }

    #[tokio::test]
    async fn test_ambiguous_match_lists_ids() {
        let cloud = cloud(vec![identified("ami-a"), identified("ami-b")]);
        let err = policy(&cloud, job()).sync().await.unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("ami-a, ami-b"));
    }

    #[tokio::test]
    async fn test_user_filters_narrow_match() {
        let mut web = identified("ami-a");
        web.tags.push(Tag::new("Tier", "front"));
        let cloud = cloud(vec![web, identified("ami-b")]);

        let config = JobConfig {
            filters: Some(json!(["tag:Tier=front"])),
            ..job()
        };
        let policy = policy(&cloud, config);
        policy.validate_config().unwrap();

        assert!(policy.sync().await.unwrap().is_some());
        let state = cloud.state().await;
        let tagged = state.regions[SOURCE]
            .images
            .iter()
            .find(|i| i.id == "ami-a")
            .unwrap();
        assert!(marker::find(&tagged.tags, DESTINATION, None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_region_is_configuration_error() {
        let cloud = cloud(vec![identified("ami-src")]);
        let config = JobConfig {
            destination_region: Some("xx-bogus-9".to_string()),
            ..job()
        };

        let err = policy(&cloud, config).sync().await.unwrap_err();
        assert!(err.to_string().contains("'xx-bogus-9'"));
    }

    #[tokio::test]
    async fn test_unreachable_region_is_configuration_error() {
        let cloud = cloud(vec![identified("ami-src")]);
        cloud.set_unreachable(SOURCE).await;

        let err = policy(&cloud, job()).sync().await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_copy_failure_propagates_as_provider_error() {
        let cloud = cloud(vec![identified("ami-src")]);
        cloud
            .fail_operation(xregion_provider::CloudOperation::CopyImage)
            .await;

        let err = policy(&cloud, job()).sync().await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
