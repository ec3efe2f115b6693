//! Automated database snapshot sync policy.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use xregion_common::Result;
use xregion_provider::{CloudClient, DbSnapshot, ProviderRegistry, SnapshotCatalog, SnapshotKind};

use crate::config::{literal, JobConfig, DEFAULT_MAX_SNAPSHOTS_TO_RETAIN};
use crate::marker::{self, SyncMarker, FROM_SUBTYPE};
use crate::policy::{JobContext, SyncPolicy};

/// A destination snapshot carrying a marker back to its source.
#[derive(Debug, Clone)]
pub struct SyncedSnapshot {
    pub snapshot: DbSnapshot,
    pub marker: SyncMarker,
}

/// Fully-qualified reference for a snapshot.
///
/// Every non-digit character is stripped from the account number.
pub fn snapshot_reference(region: &str, account_id: &str, snapshot_id: &str) -> String {
    let account: String = account_id.chars().filter(char::is_ascii_digit).collect();
    format!("arn:aws:rds:{}:{}:snapshot:{}", region, account, snapshot_id)
}

/// Make an automated snapshot id usable as a manual snapshot name.
///
/// Automated ids look like `rds:db-2024-01-01-00-00`; the `:` is not allowed.
pub fn sanitize_snapshot_id(id: &str) -> String {
    id.replace(':', "-")
}

/// Pick the newest snapshot by creation time, the last one seen winning ties.
pub fn newest_snapshot(snapshots: &[DbSnapshot]) -> Option<&DbSnapshot> {
    snapshots
        .iter()
        .fold(None, |newest: Option<&DbSnapshot>, candidate| match newest {
            Some(current) if current.created_at > candidate.created_at => Some(current),
            _ => Some(candidate),
        })
}

/// Whether `source` is newer, at second precision, than every synced copy.
///
/// `synced` must be sorted ascending by marker timestamp.
pub fn copy_required(synced: &[SyncedSnapshot], source: &DbSnapshot) -> bool {
    match synced.last() {
        None => true,
        Some(newest) => source.created_at.timestamp() > newest.marker.timestamp.timestamp(),
    }
}

/// The synced snapshots retention removes: the oldest `len - max_to_retain`.
///
/// `synced` must be sorted ascending by marker timestamp.
pub fn expired_snapshots(synced: &[SyncedSnapshot], max_to_retain: usize) -> &[SyncedSnapshot] {
    let excess = synced.len().saturating_sub(max_to_retain);
    &synced[..excess]
}

/// Syncs the newest automated snapshot of a database instance.
///
/// Destination copies carry a `Sync-From-<source region>` marker with the
/// source snapshot's creation time. The newest such marker decides whether a
/// newer source snapshot exists. Destination snapshots without the marker
/// are user-made and never touched.
pub struct SnapshotSyncPolicy {
    ctx: JobContext,
}

struct SnapshotPlan {
    source: Arc<dyn CloudClient>,
    destination: Arc<dyn CloudClient>,
    account_id: String,
    candidate: DbSnapshot,
    synced: Vec<SyncedSnapshot>,
    required: bool,
}

impl SnapshotSyncPolicy {
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

    fn db_instance(&self) -> &str {
        self.ctx.config().db_instance.as_deref().unwrap_or_default()
    }

    /// Parse `max_snapshots_to_retain`, defaulting to 2.
    ///
    /// # Errors
    /// - `Configuration` naming the literal if it is not a non-negative integer
    pub fn max_snapshots(&self) -> Result<usize> {
        let parsed = match &self.ctx.config().max_snapshots_to_retain {
            None | Some(Value::Null) => Some(DEFAULT_MAX_SNAPSHOTS_TO_RETAIN),
            Some(Value::Number(n)) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
            Some(Value::String(s)) => s.trim().parse::<usize>().ok(),
            Some(_) => None,
        };

        parsed.ok_or_else(|| {
            let raw = self
                .ctx
                .config()
                .max_snapshots_to_retain
                .as_ref()
                .map(literal)
                .unwrap_or_default();
            self.ctx.config_error(format!(
                "it must provide a valid 'max_snapshots_to_retain' option. '{}' is not valid",
                raw
            ))
        })
    }

    /// Resolve a client for `region`, validated by looking up the instance.
    async fn connect(&self, region: &str) -> Result<Arc<dyn CloudClient>> {
        let invalid = || {
            self.ctx.config_error(format!(
                "region '{}' is invalid. It either does not exist or the given credentials \
                 cannot access it",
                region
            ))
        };

        let client = self.ctx.connect(region).map_err(|e| {
            debug!("{}: cannot connect to {}: {}", self.ctx.name(), region, e);
            invalid()
        })?;

        match client.describe_db_instance(self.db_instance()).await {
            Ok(_) => Ok(client),
            Err(e) => {
                debug!("{}: instance lookup in {} failed: {}", self.ctx.name(), region, e);
                Err(invalid())
            }
        }
    }

    /// Destination snapshots of the instance that carry a marker from the
    /// source region, sorted ascending by marker timestamp.
    ///
    /// # Errors
    /// - `Configuration` naming the snapshot if its marker cannot be decoded
    async fn synced_snapshots(
        &self,
        destination: &dyn CloudClient,
        account_id: &str,
    ) -> Result<Vec<SyncedSnapshot>> {
        let source_region = self.ctx.source_region();
        let snapshots = destination
            .describe_db_snapshots(self.db_instance(), SnapshotKind::Manual)
            .await?;

        let mut synced = Vec::new();
        for snapshot in snapshots {
            let reference = snapshot_reference(destination.region(), account_id, &snapshot.id);
            let tags = destination.list_tags_for_resource(&reference).await?;

            match marker::find(&tags, source_region, Some(FROM_SUBTYPE)) {
                Ok(Some(marker)) => synced.push(SyncedSnapshot { snapshot, marker }),
                Ok(None) => {}
                Err(e) => {
                    return Err(self.ctx.config_error(format!(
                        "destination snapshot '{}' has an unreadable sync marker: {}",
                        snapshot.id, e
                    )))
                }
            }
        }

        synced.sort_by_key(|s| s.marker.timestamp);
        Ok(synced)
    }

    async fn plan(&self) -> Result<SnapshotPlan> {
        let source = self.connect(self.ctx.source_region()).await?;
        let destination = self.connect(self.ctx.destination_region()).await?;

        let instance = source
            .describe_db_instance(self.db_instance())
            .await?
            .ok_or_else(|| {
                self.ctx.config_error(format!(
                    "no DB instance with identifier '{}' is available for these credentials \
                     in region {}",
                    self.db_instance(),
                    self.ctx.source_region()
                ))
            })?;

        let snapshots = source
            .describe_db_snapshots(&instance.id, SnapshotKind::Automated)
            .await?;
        let candidate = newest_snapshot(&snapshots).cloned().ok_or_else(|| {
            self.ctx.config_error(format!(
                "no automated snapshots for db '{}' are available for these credentials \
                 in region {}",
                instance.id,
                self.ctx.source_region()
            ))
        })?;

        // Resource references for tag lookups need the account id.
        let account_id = self
            .ctx
            .account()
            .resolve(source.as_ref(), true)
            .await?
            .unwrap_or_default();

        let synced = self
            .synced_snapshots(destination.as_ref(), &account_id)
            .await?;
        let required = copy_required(&synced, &candidate);

        Ok(SnapshotPlan {
            source,
            destination,
            account_id,
            candidate,
            synced,
            required,
        })
    }

    async fn cleanup(&self, plan: &SnapshotPlan, max_to_retain: usize) -> Result<()> {
        for expired in expired_snapshots(&plan.synced, max_to_retain) {
            info!(
                "{}: deleting expired snapshot {} in {}",
                self.ctx.name(),
                expired.snapshot.id,
                self.ctx.destination_region()
            );
            plan.destination
                .delete_db_snapshot(&expired.snapshot.id)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncPolicy for SnapshotSyncPolicy {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn validate_config(&self) -> Result<()> {
        if self.db_instance().is_empty() {
            return Err(self.ctx.config_error(
                "it must provide a 'db_instance' option to use to locate automated snapshots",
            ));
        }
        self.max_snapshots()?;
        self.ctx.validate_common()
    }

    async fn sync(&self) -> Result<Option<String>> {
        let max_to_retain = self.max_snapshots()?;
        let plan = self.plan().await?;
        if !plan.required {
            debug!(
                "{}: snapshot {} already synced to {}",
                self.ctx.name(),
                plan.candidate.id,
                self.ctx.destination_region()
            );
            return Ok(None);
        }

        let source_region = self.ctx.source_region();
        let destination_region = self.ctx.destination_region();
        let candidate = &plan.candidate;

        let copied = plan
            .destination
            .copy_db_snapshot(
                &snapshot_reference(source_region, &plan.account_id, &candidate.id),
                &sanitize_snapshot_id(&candidate.id),
            )
            .await?;

        let Some(destination_id) = copied else {
            warn!(
                "{}: copy of {} reported no destination snapshot id",
                self.ctx.name(),
                candidate.id
            );
            return Ok(None);
        };

        // Both sides record the source creation time, not the copy time.
        let from_tag = marker::encode(
            source_region,
            &candidate.id,
            &candidate.created_at,
            Some(FROM_SUBTYPE),
        );
        let to_tag = marker::encode(
            destination_region,
            &destination_id,
            &candidate.created_at,
            None,
        );

        plan.destination
            .add_tags_to_resource(
                &snapshot_reference(destination_region, &plan.account_id, &destination_id),
                &[from_tag],
            )
            .await?;
        plan.source
            .add_tags_to_resource(
                &snapshot_reference(source_region, &plan.account_id, &candidate.id),
                &[to_tag],
            )
            .await?;

        info!(
            "{}: copied snapshot {} to {} as {}",
            self.ctx.name(),
            candidate.id,
            destination_region,
            destination_id
        );

        self.cleanup(&plan, max_to_retain).await?;
        Ok(Some(destination_id))
    }

    async fn sync_required(&self) -> Result<bool> {
        Ok(self.plan().await?.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use xregion_common::Tag;
    use xregion_provider::{
        create_default_registry, CloudOperation, CloudState, DbInstance, MemoryCloud, Mutation,
        RegionState,
    };

    const SOURCE: &str = "us-east-1";
    const DESTINATION: &str = "us-west-2";
    const ACCOUNT: &str = "123456789012";

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn snapshot(id: &str, kind: SnapshotKind, created_at: DateTime<Utc>, tags: Vec<Tag>) -> DbSnapshot {
        DbSnapshot {
            id: id.to_string(),
            db_instance_id: "orders".to_string(),
            kind,
            created_at,
            tags,
        }
    }

    fn automated(hours: i64) -> DbSnapshot {
        snapshot(
            &format!("rds:orders-h{}", hours),
            SnapshotKind::Automated,
            at(hours),
            vec![],
        )
    }

    /// A destination copy whose marker records the source time `hours`.
    fn synced_copy(hours: i64) -> DbSnapshot {
        let source_id = format!("rds:orders-h{}", hours);
        snapshot(
            &sanitize_snapshot_id(&source_id),
            SnapshotKind::Manual,
            at(hours) + Duration::minutes(30),
            vec![marker::encode(SOURCE, &source_id, &at(hours), Some(FROM_SUBTYPE))],
        )
    }

    fn cloud(source: Vec<DbSnapshot>, destination: Vec<DbSnapshot>) -> Arc<MemoryCloud> {
        let mut state = CloudState {
            account_id: Some(ACCOUNT.to_string()),
            principals: vec![format!("arn:aws:iam::{}:user/backup", ACCOUNT)],
            ..Default::default()
        };
        state.regions.insert(
            SOURCE.to_string(),
            RegionState {
                db_instances: vec![DbInstance {
                    id: "orders".to_string(),
                }],
                db_snapshots: source,
                ..Default::default()
            },
        );
        state.regions.insert(
            DESTINATION.to_string(),
            RegionState {
                db_snapshots: destination,
                ..Default::default()
            },
        );
        Arc::new(MemoryCloud::from_state(state))
    }

    fn job() -> JobConfig {
        JobConfig {
            sync_type: Some("rds_automated_snapshot".to_string()),
            source_region: Some(SOURCE.to_string()),
            destination_region: Some(DESTINATION.to_string()),
            db_instance: Some("orders".to_string()),
            ..Default::default()
        }
    }

    fn policy(cloud: &Arc<MemoryCloud>, config: JobConfig) -> SnapshotSyncPolicy {
        let registry = create_default_registry(cloud.clone()).unwrap();
        SnapshotSyncPolicy::new("SYNC_orders", Arc::new(config), Arc::new(registry))
    }

    fn deleted(mutations: &[Mutation]) -> Vec<String> {
        mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::DeleteDbSnapshot { snapshot_id, .. } => Some(snapshot_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_snapshot_reference() {
        assert_eq!(
            snapshot_reference("us-east-1", "1234-5678-9012", "rds:db-1"),
            "arn:aws:rds:us-east-1:123456789012:snapshot:rds:db-1"
        );
    }

    #[test]
    fn test_sanitize_snapshot_id() {
        assert_eq!(
            sanitize_snapshot_id("rds:orders-2024-05-01-00-00"),
            "rds-orders-2024-05-01-00-00"
        );
    }

    #[test]
    fn test_newest_snapshot_ties_pick_last_seen() {
        let mut first = automated(3);
        first.id = "first".to_string();
        let mut second = automated(3);
        second.id = "second".to_string();

        let snapshots = vec![automated(1), first, second, automated(2)];
        assert_eq!(newest_snapshot(&snapshots).unwrap().id, "second");
        assert!(newest_snapshot(&[]).is_none());
    }

    #[test]
    fn test_expired_snapshots() {
        let synced: Vec<SyncedSnapshot> = (0..5)
            .map(|h| SyncedSnapshot {
                snapshot: synced_copy(h),
                marker: marker::decode(Some(&synced_copy(h).tags[0].value))
                    .unwrap()
                    .unwrap(),
            })
            .collect();

        let expired: Vec<i64> = expired_snapshots(&synced, 2)
            .iter()
            .map(|s| (s.marker.timestamp - at(0)).num_hours())
            .collect();
        assert_eq!(expired, vec![0, 1, 2]);
        assert_eq!(expired_snapshots(&synced, 0).len(), 5);
        assert!(expired_snapshots(&synced, 9).is_empty());
    }

    #[test]
    fn test_validate_config() {
        let cloud = cloud(vec![], vec![]);
        policy(&cloud, job()).validate_config().unwrap();

        let err = policy(
            &cloud,
            JobConfig {
                db_instance: None,
                ..job()
            },
        )
        .validate_config()
        .unwrap_err();
        assert!(err.to_string().contains("db_instance"));

        let err = policy(
            &cloud,
            JobConfig {
                max_snapshots_to_retain: Some(json!("three")),
                ..job()
            },
        )
        .validate_config()
        .unwrap_err();
        assert!(err.to_string().contains("'three'"));
    }

    #[test]
    fn test_max_snapshots_parsing() {
        let cloud = cloud(vec![], vec![]);
        let retain = |value| {
            policy(
                &cloud,
                JobConfig {
                    max_snapshots_to_retain: value,
                    ..job()
                },
            )
            .max_snapshots()
        };

        assert_eq!(retain(None).unwrap(), 2);
        assert_eq!(retain(Some(json!(5))).unwrap(), 5);
        assert_eq!(retain(Some(json!("0"))).unwrap(), 0);
        assert!(retain(Some(json!(-1))).is_err());
        assert!(retain(Some(json!(1.5))).is_err());
    }

    #[tokio::test]
    async fn test_sync_stale_destination_copies_and_tags_both_sides() {
        let cloud = cloud(vec![automated(1), automated(5)], vec![synced_copy(1)]);
        let policy = policy(&cloud, job());

        let destination_id = policy.sync().await.unwrap().unwrap();
        assert_eq!(destination_id, "rds-orders-h5");

        let state = cloud.state().await;
        let copy = state.regions[DESTINATION]
            .db_snapshots
            .iter()
            .find(|s| s.id == destination_id)
            .unwrap();
        let from = marker::find(&copy.tags, SOURCE, Some(FROM_SUBTYPE))
            .unwrap()
            .unwrap();
        assert_eq!(from.timestamp, at(5));
        assert_eq!(from.resource_identifier, "rds:orders-h5");

        let source = state.regions[SOURCE]
            .db_snapshots
            .iter()
            .find(|s| s.id == "rds:orders-h5")
            .unwrap();
        let to = marker::find(&source.tags, DESTINATION, None).unwrap().unwrap();
        assert_eq!(to.timestamp, at(5));
        assert_eq!(to.resource_identifier, destination_id);
    }

    #[tokio::test]
    async fn test_sync_twice_copies_once() {
        let cloud = cloud(vec![automated(2)], vec![]);
        let policy = policy(&cloud, job());

        assert!(policy.sync().await.unwrap().is_some());
        assert_eq!(policy.sync().await.unwrap(), None);

        let copies = cloud
            .mutations()
            .await
            .iter()
            .filter(|m| matches!(m, Mutation::CopyDbSnapshot { .. }))
            .count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn test_up_to_date_destination_is_skipped() {
        let cloud = cloud(vec![automated(1), automated(3)], vec![synced_copy(3)]);
        let policy = policy(&cloud, job());

        assert!(!policy.sync_required().await.unwrap());
        assert_eq!(policy.sync().await.unwrap(), None);
        assert!(cloud.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_retention_deletes_oldest_synced_only() {
        let mut manual = snapshot("user-copy", SnapshotKind::Manual, at(0), vec![]);
        manual.tags.push(Tag::new("Owner", "dba"));
        let destination: Vec<DbSnapshot> = (1..=5).rev().map(synced_copy).chain([manual]).collect();
        let cloud = cloud(vec![automated(9)], destination);

        let config = JobConfig {
            max_snapshots_to_retain: Some(json!(2)),
            ..job()
        };
        policy(&cloud, config).sync().await.unwrap().unwrap();

        let mut removed = deleted(&cloud.mutations().await);
        removed.sort();
        assert_eq!(removed, vec!["rds-orders-h1", "rds-orders-h2", "rds-orders-h3"]);

        let state = cloud.state().await;
        let mut remaining: Vec<&str> = state.regions[DESTINATION]
            .db_snapshots
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["rds-orders-h4", "rds-orders-h5", "rds-orders-h9", "user-copy"]
        );
    }

    #[tokio::test]
    async fn test_retention_zero_deletes_all_previous() {
        let cloud = cloud(vec![automated(4)], vec![synced_copy(1), synced_copy(2)]);
        let config = JobConfig {
            max_snapshots_to_retain: Some(json!(0)),
            ..job()
        };
        policy(&cloud, config).sync().await.unwrap().unwrap();

        let mut removed = deleted(&cloud.mutations().await);
        removed.sort();
        assert_eq!(removed, vec!["rds-orders-h1", "rds-orders-h2"]);
    }

    #[tokio::test]
    async fn test_copy_without_id_writes_nothing_else() {
        let cloud = cloud(vec![automated(4)], vec![synced_copy(1), synced_copy(2)]);
        cloud.set_copies_without_id(true).await;
        let config = JobConfig {
            max_snapshots_to_retain: Some(json!(0)),
            ..job()
        };

        assert_eq!(policy(&cloud, config).sync().await.unwrap(), None);
        let mutations = cloud.mutations().await;
        assert_eq!(mutations.len(), 1);
        assert!(matches!(mutations[0], Mutation::CopyDbSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_marker_fails_the_job() {
        let broken = snapshot(
            "rds-orders-h1",
            SnapshotKind::Manual,
            at(1),
            vec![Tag::new(
                marker::marker_key(SOURCE, Some(FROM_SUBTYPE)),
                "garbage / rds:orders-h1",
            )],
        );
        let cloud = cloud(vec![automated(1)], vec![broken]);
        let policy = policy(&cloud, job());

        let err = policy.sync().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'rds-orders-h1'"));
        assert!(err.to_string().contains("SYNC_orders"));
        assert!(policy.sync_required().await.unwrap_err().is_configuration());
        assert!(cloud.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_required_never_mutates() {
        let cloud = cloud(vec![automated(4)], vec![synced_copy(1)]);
        let policy = policy(&cloud, job());

        for _ in 0..3 {
            assert!(policy.sync_required().await.unwrap());
        }
        assert!(cloud.mutations().await.is_empty());
        assert_eq!(cloud.call_count(CloudOperation::PrincipalReferences).await, 1);
    }

    #[tokio::test]
    async fn test_source_reference_uses_sanitized_target() {
        let cloud = cloud(vec![automated(2)], vec![]);
        policy(&cloud, job()).sync().await.unwrap();

        let mutations = cloud.mutations().await;
        assert_eq!(
            mutations[0],
            Mutation::CopyDbSnapshot {
                region: DESTINATION.to_string(),
                source_snapshot: format!("arn:aws:rds:{}:{}:snapshot:rds:orders-h2", SOURCE, ACCOUNT),
                snapshot_id: "rds-orders-h2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_no_automated_snapshots() {
        let cloud = cloud(vec![], vec![]);
        let err = policy(&cloud, job()).sync().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no automated snapshots"));
    }

    #[tokio::test]
    async fn test_missing_instance() {
        let cloud = cloud(vec![], vec![]);
        let config = JobConfig {
            db_instance: Some("billing".to_string()),
            ..job()
        };
        let err = policy(&cloud, config).sync().await.unwrap_err();
        assert!(err.to_string().contains("'billing'"));
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_configuration_error() {
        let cloud = cloud(vec![automated(1)], vec![]);
        cloud.set_unreachable(DESTINATION).await;

        let err = policy(&cloud, job()).sync().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains(DESTINATION));
    }

    #[tokio::test]
    async fn test_missing_account_id_is_configuration_error() {
        let cloud = cloud(vec![automated(1)], vec![]);
        cloud.update(|state| state.principals.clear()).await;

        let err = policy(&cloud, job()).sync().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("account_id"));
    }
}
