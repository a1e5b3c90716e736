//! Trash: listing, purge of expired entries, restore and removal

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{run_blocking, ImageService};
use crate::accessor::{map_pool_error, Accessor};
use crate::cache::PoolListing;
use crate::engine::{errno, EngineError};
use crate::models::TrashEntry;
use crate::orchestrator::{TaskContext, TaskHandle, TaskSpec};
use crate::spec::ResourceLocator;
use crate::{Error, Result};

const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// Key of a purge spanning every block pool
const ALL_POOLS: &str = "*";

/// Entries removed by a purge, as `pool[/namespace]/id`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub removed: Vec<String>,
}

fn trash_error(spec: &str) -> impl Fn(EngineError) -> Error + '_ {
    move |err| match err.errno {
        errno::ENOENT => Error::TrashEntryNotFound(spec.to_string()),
        errno::EPERM => Error::NotExpired(spec.to_string()),
        errno::EACCES => Error::PermissionDenied(format!("{spec}: {}", err.message)),
        errno::EBUSY => Error::referential(
            "trash_entry_has_children",
            format!("{spec}: {}", err.message),
        ),
        errno::EEXIST => Error::AlreadyExists(format!("{spec}: {}", err.message)),
        _ => Error::Engine(err),
    }
}

impl ImageService {
    /// Trash listings of one pool, or of every block pool
    pub async fn list_trash(&self, pool: Option<String>) -> Result<Vec<PoolListing<TrashEntry>>> {
        let pools = match pool {
            Some(pool) => vec![pool],
            None => {
                let svc = self.clone();
                run_blocking(move || svc.block_pools()).await?
            }
        };
        let mut listings = Vec::with_capacity(pools.len());
        for pool in pools {
            let accessor = self.accessor.clone();
            let name = pool.clone();
            let listing = self
                .trash
                .get(&pool, move || list_pool_trash(&accessor, &name))
                .await?;
            listings.push(listing);
        }
        Ok(listings)
    }

    /// Remove every entry whose deferment has ended, in one pool or all of them
    pub fn purge_trash(&self, pool: Option<String>) -> Result<TaskHandle> {
        let key = pool.clone().unwrap_or_else(|| ALL_POOLS.to_string());
        let spec = TaskSpec::new("rbd/trash/purge", key).with_metadata(json!({
            "pool_name": pool,
        }));
        // An empty list invalidates every pool once the purge ends
        let pools = pool.iter().cloned().collect();
        let svc = self.clone();
        self.submit(spec, DEFAULT_WAIT, pools, move |task| {
            let pools = match pool {
                Some(pool) => vec![pool],
                None => svc.block_pools()?,
            };
            purge_expired(&svc.accessor, task, &pools, Utc::now())
        })
    }

    /// Restore an entry under `new_name`, or its old name when empty
    pub fn restore_trash(&self, entry: ResourceLocator, new_name: String) -> Result<TaskHandle> {
        entry.validate()?;
        if new_name.contains('/') {
            return Err(Error::InvalidSpec(format!("'{new_name}' contains '/'")));
        }
        let spec = TaskSpec::new("rbd/trash/restore", entry.to_string()).with_metadata(json!({
            "image_id_spec": entry.to_string(),
            "new_image_name": new_name,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![entry.pool.clone()], move |task| {
            let spec = entry.to_string();
            accessor.with_pool(&entry.pool, &entry.namespace, |ctx| {
                task.checkpoint()?;
                ctx.trash_restore(&entry.name, &new_name)
                    .map_err(trash_error(&spec))?;
                tracing::info!(entry = %spec, name = %new_name, "trash entry restored");
                Ok(())
            })
        })
    }

    /// Remove one entry; without `force` it must have expired
    pub fn remove_trash(&self, entry: ResourceLocator, force: bool) -> Result<TaskHandle> {
        entry.validate()?;
        let spec = TaskSpec::new("rbd/trash/remove", entry.to_string()).with_metadata(json!({
            "image_id_spec": entry.to_string(),
            "force": force,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![entry.pool.clone()], move |task| {
            let spec = entry.to_string();
            accessor.with_pool(&entry.pool, &entry.namespace, |ctx| {
                task.checkpoint()?;
                ctx.trash_remove(&entry.name, force)
                    .map_err(trash_error(&spec))?;
                tracing::info!(entry = %spec, force, "trash entry removed");
                Ok(())
            })
        })
    }
}

/// Every trash entry of `pool`, across all of its namespaces
pub(crate) fn list_pool_trash(accessor: &Accessor, pool: &str) -> Result<Vec<TrashEntry>> {
    let mut ctx = accessor.open_pool(pool, "")?;
    let mut namespaces = vec![String::new()];
    namespaces.extend(ctx.namespace_list().map_err(|e| map_pool_error(pool, e))?);

    let mut entries = Vec::new();
    for namespace in namespaces {
        ctx.set_namespace(&namespace);
        let infos = ctx.trash_list().map_err(|e| map_pool_error(pool, e))?;
        entries.extend(
            infos
                .into_iter()
                .map(|info| TrashEntry::from_info(info, pool, &namespace)),
        );
    }
    Ok(entries)
}

/// Remove the entries of `pools` that expired strictly before `now`
///
/// Reads the engine directly; cached listings may lag behind.
pub(crate) fn purge_expired(
    accessor: &Accessor,
    task: &TaskContext,
    pools: &[String],
    now: DateTime<Utc>,
) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    for (idx, pool) in pools.iter().enumerate() {
        task.checkpoint()?;
        let expired: Vec<TrashEntry> = list_pool_trash(accessor, pool)?
            .into_iter()
            .filter(|entry| entry.is_expired(now))
            .collect();
        for entry in expired {
            task.checkpoint()?;
            let namespace = entry.namespace.as_deref().unwrap_or_default();
            let spec = crate::spec::image_spec(pool, entry.namespace.as_deref(), &entry.id);
            accessor.with_pool(pool, namespace, |ctx| {
                ctx.trash_remove(&entry.id, false).map_err(trash_error(&spec))
            })?;
            tracing::info!(entry = %spec, name = %entry.name, "expired trash entry purged");
            report.removed.push(spec);
        }
        task.set_progress((((idx + 1) * 100) / pools.len()) as u8);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskInfo, TaskState};
    use crate::service::tests::service;
    use crate::service::CreateImage;
    use crate::engine::MemoryCluster;
    use crate::ErrorKind;
    use chrono::Duration as ChronoDuration;

    async fn run(handle: Result<TaskHandle>) -> TaskInfo {
        handle.unwrap().wait().await
    }

    fn loc(spec: &str) -> ResourceLocator {
        ResourceLocator::parse(spec).unwrap()
    }

    async fn trashed(svc: &ImageService, pool: &str, name: &str, delay: u64) -> TrashEntry {
        let info = run(svc.create(CreateImage {
            name: name.into(),
            pool_name: pool.into(),
            size: 1 << 20,
            ..Default::default()
        }))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        let info = run(svc.move_to_trash(loc(&format!("{pool}/{name}")), delay)).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        let accessor = svc.accessor().clone();
        list_pool_trash(&accessor, pool)
            .unwrap()
            .into_iter()
            .find(|e| e.name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_entries() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let svc = service(&cluster);
        let now = Utc::now();
        let old = trashed(&svc, "rbd", "old", 0).await;
        let fresh = trashed(&svc, "rbd", "fresh", 0).await;
        let exact = trashed(&svc, "rbd", "exact", 0).await;
        cluster.set_trash_deferment("rbd", "", &old.id, now - ChronoDuration::hours(1)).unwrap();
        cluster.set_trash_deferment("rbd", "", &fresh.id, now + ChronoDuration::hours(1)).unwrap();
        cluster.set_trash_deferment("rbd", "", &exact.id, now).unwrap();

        let accessor = svc.accessor().clone();
        let report = svc
            .orchestrator()
            .submit(TaskSpec::new("rbd/trash/purge", "rbd"), move |task| {
                purge_expired(&accessor, task, &["rbd".to_string()], now)
            })
            .unwrap()
            .wait()
            .await;
        assert_eq!(report.state, TaskState::Success, "{:?}", report.error);
        let report: PurgeReport = serde_json::from_value(report.result.unwrap()).unwrap();
        assert_eq!(report.removed, vec![format!("rbd/{}", old.id)]);

        let left: Vec<String> = list_pool_trash(svc.accessor(), "rbd")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"fresh".to_string()));
        assert!(left.contains(&"exact".to_string()));
    }

    #[tokio::test]
    async fn test_purge_all_pools_covers_namespaces() {
        let cluster = MemoryCluster::new().with_pool("rbd").with_pool("fast");
        let svc = service(&cluster);
        run(svc.create_namespace("rbd".into(), "tenant".into())).await;
        let info = run(svc.create(CreateImage {
            name: "img".into(),
            pool_name: "rbd".into(),
            namespace: Some("tenant".into()),
            size: 1 << 20,
            ..Default::default()
        }))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        run(svc.move_to_trash(loc("rbd/tenant/img"), 0)).await;
        let other = trashed(&svc, "fast", "img2", 0).await;
        let past = Utc::now() - ChronoDuration::minutes(5);
        let tenant = list_pool_trash(svc.accessor(), "rbd").unwrap().remove(0);
        cluster.set_trash_deferment("rbd", "tenant", &tenant.id, past).unwrap();
        cluster.set_trash_deferment("fast", "", &other.id, past).unwrap();

        let handle = svc.purge_trash(None).unwrap();
        assert_eq!(handle.info().resource_key, "*");
        let info = run(Ok(handle)).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(list_pool_trash(svc.accessor(), "rbd").unwrap().is_empty());
        assert!(list_pool_trash(svc.accessor(), "fast").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unexpired_needs_force() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let svc = service(&cluster);
        let entry = trashed(&svc, "rbd", "img", 3600).await;
        let spec = loc(&format!("rbd/{}", entry.id));

        let info = run(svc.remove_trash(spec.clone(), false)).await;
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error.unwrap().kind, ErrorKind::NotExpired);

        let info = run(svc.remove_trash(spec, true)).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(list_pool_trash(svc.accessor(), "rbd").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_under_new_name_and_conflict() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let svc = service(&cluster);
        let entry = trashed(&svc, "rbd", "img", 3600).await;
        let spec = loc(&format!("rbd/{}", entry.id));

        run(svc.create(CreateImage {
            name: "img".into(),
            pool_name: "rbd".into(),
            size: 1 << 20,
            ..Default::default()
        }))
        .await;
        let info = run(svc.restore_trash(spec.clone(), String::new())).await;
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error.unwrap().kind, ErrorKind::AlreadyExists);

        let info = run(svc.restore_trash(spec, "img-restored".into())).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(cluster.image_exists("rbd", "", "img-restored"));
    }

    #[tokio::test]
    async fn test_remove_unknown_entry() {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let svc = service(&cluster);
        let info = run(svc.remove_trash(loc("rbd/deadbeef"), true)).await;
        assert_eq!(info.error.unwrap().kind, ErrorKind::TrashEntryNotFound);
    }
}
