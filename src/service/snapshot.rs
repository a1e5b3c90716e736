//! Snapshot sequencers, including cloning a child from a snapshot

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::image::{validate_configuration, Layout};
use super::{image_error, mirroring, snapshot_error, ImageService};
use crate::accessor::Accessor;
use crate::configuration;
use crate::engine::{errno, CreateOptions};
use crate::orchestrator::{TaskContext, TaskHandle, TaskSpec};
use crate::spec::ResourceLocator;
use crate::{Error, Result};

const DEFAULT_WAIT: Duration = Duration::from_secs(2);
const EDIT_WAIT: Duration = Duration::from_secs(4);
const ROLLBACK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditSnapshot {
    pub new_snap_name: Option<String>,
    pub is_protected: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneImage {
    pub child_pool_name: String,
    pub child_namespace: Option<String>,
    pub child_image_name: String,
    #[serde(flatten)]
    pub layout: Layout,
    #[serde(default)]
    pub configuration: BTreeMap<String, Option<String>>,
}

fn check_snap_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidRequest("snapshot name cannot be empty".into()));
    }
    if name.contains('@') || name.contains('/') {
        return Err(Error::InvalidRequest(format!(
            "snapshot name '{name}' cannot contain '@' or '/'"
        )));
    }
    Ok(())
}

fn snap_metadata(loc: &ResourceLocator, snap: &str) -> serde_json::Value {
    json!({
        "image_spec": loc.to_string(),
        "snapshot_name": snap,
    })
}

impl ImageService {
    /// Take a snapshot; snapshot-mirrored images get a mirror snapshot instead
    pub fn create_snapshot(&self, loc: ResourceLocator, snap: String) -> Result<TaskHandle> {
        loc.validate()?;
        check_snap_name(&snap)?;
        let spec = TaskSpec::new("rbd/snap/create", loc.to_string())
            .with_metadata(snap_metadata(&loc, &snap));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            let spec = loc.to_string();
            accessor.with_image(&loc, |_, image| {
                task.checkpoint()?;
                if mirroring::wants_mirror_snapshot(image, &spec)? {
                    let id = image
                        .mirror_create_snapshot()
                        .map_err(image_error(&spec))?;
                    tracing::info!(image = %spec, snap_id = id, "mirror snapshot created");
                } else {
                    image.snap_create(&snap).map_err(snapshot_error(&spec, &snap))?;
                    tracing::info!(image = %spec, snapshot = %snap, "snapshot created");
                }
                Ok(())
            })
        })
    }

    /// Rename and/or change protection, in that order
    pub fn edit_snapshot(
        &self,
        loc: ResourceLocator,
        snap: String,
        req: EditSnapshot,
    ) -> Result<TaskHandle> {
        loc.validate()?;
        check_snap_name(&snap)?;
        if let Some(name) = &req.new_snap_name {
            check_snap_name(name)?;
        }
        let spec = TaskSpec::new("rbd/snap/edit", loc.to_string())
            .with_metadata(snap_metadata(&loc, &snap));
        let accessor = self.accessor.clone();
        self.submit(spec, EDIT_WAIT, vec![loc.pool.clone()], move |task| {
            edit_snapshot(&accessor, task, &loc, &snap, &req)
        })
    }

    /// Unprotect when needed, then remove
    pub fn delete_snapshot(&self, loc: ResourceLocator, snap: String) -> Result<TaskHandle> {
        loc.validate()?;
        check_snap_name(&snap)?;
        let spec = TaskSpec::new("rbd/snap/delete", loc.to_string())
            .with_metadata(snap_metadata(&loc, &snap));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            let spec = loc.to_string();
            accessor.with_image(&loc, |_, image| {
                task.checkpoint()?;
                let protected = image
                    .snap_is_protected(&snap)
                    .map_err(snapshot_error(&spec, &snap))?;
                if protected {
                    image
                        .snap_unprotect(&snap)
                        .map_err(snapshot_error(&spec, &snap))?;
                }
                image.snap_remove(&snap).map_err(snapshot_error(&spec, &snap))?;
                tracing::info!(image = %spec, snapshot = %snap, "snapshot deleted");
                Ok(())
            })
        })
    }

    pub fn rollback_snapshot(&self, loc: ResourceLocator, snap: String) -> Result<TaskHandle> {
        loc.validate()?;
        check_snap_name(&snap)?;
        let spec = TaskSpec::new("rbd/snap/rollback", loc.to_string())
            .with_metadata(snap_metadata(&loc, &snap));
        let accessor = self.accessor.clone();
        self.submit(spec, ROLLBACK_WAIT, vec![loc.pool.clone()], move |task| {
            let spec = loc.to_string();
            accessor.with_image(&loc, |_, image| {
                task.checkpoint()?;
                image
                    .snap_rollback(&snap, &task.range(0, 100))
                    .map_err(snapshot_error(&spec, &snap))?;
                tracing::info!(image = %spec, snapshot = %snap, "image rolled back");
                Ok(())
            })
        })
    }

    /// Clone `parent@snap` into a new child image
    pub fn clone_image(
        &self,
        parent: ResourceLocator,
        snap: String,
        req: CloneImage,
    ) -> Result<TaskHandle> {
        parent.validate()?;
        check_snap_name(&snap)?;
        let child = ResourceLocator::from_parts(
            &req.child_pool_name,
            req.child_namespace.as_deref(),
            &req.child_image_name,
        )?;
        let opts = req.layout.create_options()?;
        validate_configuration(&req.configuration)?;

        let spec = TaskSpec::new("rbd/clone", child.to_string()).with_metadata(json!({
            "parent_image_spec": parent.to_string(),
            "parent_snap_name": snap,
            "child_pool_name": child.pool,
            "child_namespace": child.namespace_opt(),
            "child_image_name": child.name,
        }));
        let pools = vec![parent.pool.clone(), child.pool.clone()];
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, pools, move |task| {
            clone_image(&accessor, task, &parent, &snap, &child, &req, &opts)
        })
    }
}

fn edit_snapshot(
    accessor: &Accessor,
    task: &TaskContext,
    loc: &ResourceLocator,
    snap: &str,
    req: &EditSnapshot,
) -> Result<()> {
    let spec = loc.to_string();
    accessor.with_image(loc, |_, image| {
        let mut name = snap.to_string();
        if let Some(new_name) = req.new_snap_name.as_deref().filter(|n| *n != snap) {
            task.checkpoint()?;
            image
                .snap_rename(snap, new_name)
                .map_err(snapshot_error(&spec, snap))?;
            tracing::info!(image = %spec, from = %snap, to = %new_name, "snapshot renamed");
            name = new_name.to_string();
        }

        if let Some(wanted) = req.is_protected {
            let protected = image
                .snap_is_protected(&name)
                .map_err(snapshot_error(&spec, &name))?;
            if wanted != protected {
                task.checkpoint()?;
                let changed = if wanted {
                    image.snap_protect(&name)
                } else {
                    image.snap_unprotect(&name)
                };
                changed.map_err(snapshot_error(&spec, &name))?;
                tracing::info!(image = %spec, snapshot = %name, protected = wanted, "snapshot protection changed");
            }
        }
        Ok(())
    })
}

fn clone_image(
    accessor: &Accessor,
    task: &TaskContext,
    parent: &ResourceLocator,
    snap: &str,
    child: &ResourceLocator,
    req: &CloneImage,
    opts: &CreateOptions,
) -> Result<()> {
    let parent_spec = parent.to_string();
    let child_spec = child.to_string();

    accessor.with_pool(&parent.pool, &parent.namespace, |ctx| {
        task.checkpoint()?;
        drop(Accessor::open_image(&*ctx, &parent.name)?);
        let child_ctx = accessor.open_pool(&child.pool, &child.namespace)?;
        ctx.clone_image(&parent.name, snap, child_ctx.as_ref(), &child.name, opts)
            .map_err(|err| match err.errno {
                errno::EEXIST => Error::AlreadyExists(child_spec.clone()),
                errno::ENOENT => Error::SnapshotNotFound(format!("{parent_spec}@{snap}")),
                _ => image_error(&parent_spec)(err),
            })?;
        tracing::info!(parent = %parent_spec, snapshot = %snap, child = %child_spec, "image cloned");
        task.set_progress(80);

        let mut child_image = Accessor::open_image(child_ctx.as_ref(), &child.name)?;
        configuration::apply(child_image.as_mut(), &req.configuration)?;
        drop(child_image);
        drop(child_ctx);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryCluster, MirrorImageMode};
    use crate::models::{TaskInfo, TaskState};
    use crate::service::tests::service;
    use crate::service::{CreateImage, EditImage};
    use crate::ErrorKind;

    async fn run(handle: Result<TaskHandle>) -> TaskInfo {
        handle.unwrap().wait().await
    }

    fn loc(spec: &str) -> ResourceLocator {
        ResourceLocator::parse(spec).unwrap()
    }

    async fn setup() -> (MemoryCluster, ImageService) {
        let cluster = MemoryCluster::new().with_pool("rbd");
        let svc = service(&cluster);
        let info = run(svc.create(CreateImage {
            name: "img".into(),
            pool_name: "rbd".into(),
            size: 8 << 20,
            ..Default::default()
        }))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        (cluster, svc)
    }

    fn protect(value: bool) -> EditSnapshot {
        EditSnapshot {
            is_protected: Some(value),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_list_snapshot() {
        let (_cluster, svc) = setup().await;
        let info = run(svc.create_snapshot(loc("rbd/img"), "s1".into())).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert_eq!(info.name, "rbd/snap/create");
        assert_eq!(info.metadata["snapshot_name"], "s1");
        let image = svc.get_image(&loc("rbd/img")).unwrap();
        assert_eq!(image.snapshots.len(), 1);
        assert_eq!(image.snapshots[0].name, "s1");
        assert!(!image.snapshots[0].is_protected);
    }

    #[tokio::test]
    async fn test_snapshot_name_validation() {
        let (_cluster, svc) = setup().await;
        let err = svc.create_snapshot(loc("rbd/img"), "a@b".into()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        let err = svc.create_snapshot(loc("rbd/img"), " ".into()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_snapshot_mirroring_creates_mirror_snapshot() {
        let (cluster, svc) = setup().await;
        run(svc.edit(
            loc("rbd/img"),
            EditImage {
                enable_mirror: Some(true),
                mirror_mode: Some(MirrorImageMode::Snapshot),
                ..Default::default()
            },
        ))
        .await;
        let info = run(svc.create_snapshot(loc("rbd/img"), "ignored".into())).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(cluster.calls_to("snap_create").is_empty());
        assert_eq!(cluster.calls_to("mirror_create_snapshot").len(), 1);
        let image = svc.get_image(&loc("rbd/img")).unwrap();
        assert!(image.snapshots[0].mirror_snapshot);
    }

    #[tokio::test]
    async fn test_edit_renames_then_protects() {
        let (cluster, svc) = setup().await;
        run(svc.create_snapshot(loc("rbd/img"), "s1".into())).await;
        cluster.clear_calls();

        let info = run(svc.edit_snapshot(
            loc("rbd/img"),
            "s1".into(),
            EditSnapshot {
                new_snap_name: Some("golden".into()),
                is_protected: Some(true),
            },
        ))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        let ops: Vec<String> = cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("snap_"))
            .collect();
        assert_eq!(
            ops,
            vec!["snap_rename rbd/img@s1 -> golden", "snap_protect rbd/img@golden"]
        );
    }

    #[tokio::test]
    async fn test_edit_with_unchanged_values_is_a_no_op() {
        let (cluster, svc) = setup().await;
        run(svc.create_snapshot(loc("rbd/img"), "s1".into())).await;
        cluster.clear_calls();
        let info = run(svc.edit_snapshot(
            loc("rbd/img"),
            "s1".into(),
            EditSnapshot {
                new_snap_name: Some("s1".into()),
                is_protected: Some(false),
            },
        ))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(cluster.calls().iter().all(|c| !c.starts_with("snap_")));
    }

    #[tokio::test]
    async fn test_delete_protected_snapshot_unprotects_first() {
        let (cluster, svc) = setup().await;
        run(svc.create_snapshot(loc("rbd/img"), "s1".into())).await;
        run(svc.edit_snapshot(loc("rbd/img"), "s1".into(), protect(true))).await;
        cluster.clear_calls();

        let info = run(svc.delete_snapshot(loc("rbd/img"), "s1".into())).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        let ops: Vec<String> = cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("snap_"))
            .collect();
        assert_eq!(ops, vec!["snap_unprotect rbd/img@s1", "snap_remove rbd/img@s1"]);
    }

    #[tokio::test]
    async fn test_delete_missing_snapshot() {
        let (_cluster, svc) = setup().await;
        let info = run(svc.delete_snapshot(loc("rbd/img"), "nope".into())).await;
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.error.unwrap().kind, ErrorKind::SnapshotNotFound);
    }

    #[tokio::test]
    async fn test_rollback_restores_size() {
        let (_cluster, svc) = setup().await;
        run(svc.create_snapshot(loc("rbd/img"), "s1".into())).await;
        run(svc.edit(
            loc("rbd/img"),
            EditImage {
                size: Some(16 << 20),
                ..Default::default()
            },
        ))
        .await;
        let info = run(svc.rollback_snapshot(loc("rbd/img"), "s1".into())).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert_eq!(info.progress, 100);
        assert_eq!(svc.get_image(&loc("rbd/img")).unwrap().size, 8 << 20);
    }

    #[tokio::test]
    async fn test_clone_then_flatten() {
        let (cluster, svc) = setup().await;
        cluster.set_config("rbd_default_clone_format", "2");
        run(svc.create_snapshot(loc("rbd/img"), "base".into())).await;

        let mut req = CloneImage {
            child_pool_name: "rbd".into(),
            child_image_name: "child".into(),
            ..Default::default()
        };
        req.configuration
            .insert("rbd_cache".into(), Some("false".into()));
        let info = run(svc.clone_image(loc("rbd/img"), "base".into(), req)).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert_eq!(info.resource_key, "rbd/child");

        let child = svc.get_image(&loc("rbd/child")).unwrap();
        let parent = child.parent.clone().unwrap();
        assert_eq!(parent.snapshot, "base");
        let cache = child.configuration.iter().find(|o| o.name == "rbd_cache").unwrap();
        assert_eq!(cache.value, "false");

        let info = run(svc.flatten(loc("rbd/child"))).await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);
        assert!(svc.get_image(&loc("rbd/child")).unwrap().parent.is_none());
    }

    #[tokio::test]
    async fn test_clone_reports_missing_parent_pool_first() {
        let (_cluster, svc) = setup().await;
        let req = CloneImage {
            child_pool_name: "nowhere".into(),
            child_image_name: "child".into(),
            ..Default::default()
        };
        let info = run(svc.clone_image(loc("gone/img"), "base".into(), req)).await;
        assert_eq!(info.state, TaskState::Failed);
        let error = info.error.unwrap();
        assert_eq!(error.kind, ErrorKind::PoolNotFound);
        assert!(error.message.contains("gone"), "{}", error.message);
    }

    #[tokio::test]
    async fn test_clone_checks_parent_before_child_pool() {
        let (_cluster, svc) = setup().await;
        let req = CloneImage {
            child_pool_name: "nowhere".into(),
            child_image_name: "child".into(),
            ..Default::default()
        };
        let info = run(svc.clone_image(loc("rbd/ghost"), "base".into(), req)).await;
        assert_eq!(info.error.unwrap().kind, ErrorKind::ImageNotFound);
    }

    #[tokio::test]
    async fn test_unprotect_with_children_is_a_conflict() {
        let (cluster, svc) = setup().await;
        cluster.set_config("rbd_default_clone_format", "1");
        run(svc.create_snapshot(loc("rbd/img"), "base".into())).await;
        run(svc.edit_snapshot(loc("rbd/img"), "base".into(), protect(true))).await;
        let info = run(svc.clone_image(
            loc("rbd/img"),
            "base".into(),
            CloneImage {
                child_pool_name: "rbd".into(),
                child_image_name: "child".into(),
                ..Default::default()
            },
        ))
        .await;
        assert_eq!(info.state, TaskState::Success, "{:?}", info.error);

        let info = run(svc.edit_snapshot(loc("rbd/img"), "base".into(), protect(false))).await;
        assert_eq!(info.state, TaskState::Failed);
        let error = info.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ReferentialConflict);
        assert_eq!(error.code, "snapshot_in_use");
    }
}
