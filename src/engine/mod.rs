//! Capability interface of the distributed block storage engine
//!
//! The manager never talks to the cluster directly: it goes through
//! [`StorageEngine`], which hands out pool contexts, which hand out image
//! handles. Dropping a handle releases it.

pub mod memory;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryCluster;

/// errno values reported by the engine
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EXDEV: i32 = 18;
    pub const EINVAL: i32 = 22;
    pub const EROFS: i32 = 30;
    pub const EDOM: i32 = 33;
    pub const ENOSYS: i32 = 38;
    pub const ENOTEMPTY: i32 = 39;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ECANCELED: i32 = 125;
}

/// Native error shape of the engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[errno {errno}] {message}")]
pub struct EngineError {
    pub errno: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    pub fn is(&self, errno: i32) -> bool {
        self.errno == errno
    }

    pub fn errno_name(&self) -> &'static str {
        match self.errno {
            errno::EPERM => "EPERM",
            errno::ENOENT => "ENOENT",
            errno::EIO => "EIO",
            errno::EACCES => "EACCES",
            errno::EBUSY => "EBUSY",
            errno::EEXIST => "EEXIST",
            errno::EXDEV => "EXDEV",
            errno::EINVAL => "EINVAL",
            errno::EROFS => "EROFS",
            errno::EDOM => "EDOM",
            errno::ENOSYS => "ENOSYS",
            errno::ENOTEMPTY => "ENOTEMPTY",
            errno::EOPNOTSUPP => "EOPNOTSUPP",
            errno::ECANCELED => "ECANCELED",
            _ => "EUNKNOWN",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Receives progress of long running engine calls
///
/// Returning `false` asks the engine to stop polling; work already issued
/// is not undone.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, done: u64, total: u64) -> bool;
}

/// Observer for callers that do not track progress
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn update(&self, _done: u64, _total: u64) -> bool {
        true
    }
}

/// Layout options for create, copy and clone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// log2 of the object size
    pub order: Option<u8>,
    /// Feature bitmask; `None` uses the cluster default
    pub features: Option<u64>,
    pub stripe_unit: Option<u64>,
    pub stripe_count: Option<u64>,
    pub data_pool: Option<String>,
}

/// Parent of a cloned image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub pool: String,
    pub namespace: String,
    pub image: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStat {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub order: u8,
    pub features: u64,
    pub block_name_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub data_pool: Option<String>,
    pub parent: Option<ParentInfo>,
    pub create_timestamp: DateTime<Utc>,
}

impl ImageStat {
    pub fn obj_size(&self) -> u64 {
        1u64 << self.order
    }

    pub fn num_objs(&self) -> u64 {
        self.size.div_ceil(self.obj_size())
    }
}

/// Namespace a snapshot lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapNamespace {
    User,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub protected: bool,
    pub namespace: SnapNamespace,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorImageState {
    Disabling,
    Enabling,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorImageMode {
    Journal,
    Snapshot,
}

impl std::str::FromStr for MirrorImageMode {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "journal" => Ok(MirrorImageMode::Journal),
            "snapshot" => Ok(MirrorImageMode::Snapshot),
            other => Err(EngineError::new(errno::EINVAL, format!("unknown mirror mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorInfo {
    pub global_id: String,
    pub state: MirrorImageState,
    pub primary: bool,
}

/// Why an image sits in the trash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrashSource {
    User,
    Mirroring,
    Migration,
    Removing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashInfo {
    pub id: String,
    pub name: String,
    pub source: TrashSource,
    pub deletion_time: DateTime<Utc>,
    pub deferment_end_time: DateTime<Utc>,
}

/// Client compatibility floor of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatClients {
    pub min_compat_client: String,
    pub require_min_compat_client: String,
}

/// Entry point into the cluster
#[cfg_attr(test, mockall::automock)]
pub trait StorageEngine: Send + Sync {
    /// Acquire an I/O context on a pool, in its default namespace
    fn open_pool(&self, pool: &str) -> EngineResult<Box<dyn PoolContext>>;

    /// Pools tagged with the block application
    fn block_pools(&self) -> EngineResult<Vec<String>>;

    /// Cluster configuration value
    fn config_get(&self, key: &str) -> EngineResult<Option<String>>;

    fn compat_clients(&self) -> EngineResult<CompatClients>;

    /// Register a mirror snapshot schedule for an image spec
    fn schedule_add(&self, image_spec: &str, interval: &str) -> EngineResult<()>;

    fn schedule_remove(&self, image_spec: &str) -> EngineResult<()>;

    fn schedule_list(&self, image_spec: &str) -> EngineResult<Vec<String>>;
}

/// Pool I/O context scoped to one namespace
pub trait PoolContext: Send {
    fn pool_name(&self) -> &str;

    fn namespace(&self) -> &str;

    fn set_namespace(&mut self, namespace: &str);

    /// Namespaces of the pool, not including the default one
    fn namespace_list(&self) -> EngineResult<Vec<String>>;

    fn namespace_create(&self, namespace: &str) -> EngineResult<()>;

    fn namespace_remove(&self, namespace: &str) -> EngineResult<()>;

    /// Image names in the current namespace
    fn list_images(&self) -> EngineResult<Vec<String>>;

    fn create_image(&self, name: &str, size: u64, opts: &CreateOptions) -> EngineResult<()>;

    fn open_image(&self, name: &str) -> EngineResult<Box<dyn ImageHandle>>;

    fn remove_image(&self, name: &str, progress: &dyn ProgressObserver) -> EngineResult<()>;

    fn rename_image(&self, src: &str, dest: &str) -> EngineResult<()>;

    /// Clone `parent@snapshot` of this context into `child_ctx`
    fn clone_image(
        &self,
        parent: &str,
        snapshot: &str,
        child_ctx: &dyn PoolContext,
        child: &str,
        opts: &CreateOptions,
    ) -> EngineResult<()>;

    fn trash_move(&self, name: &str, delay_secs: u64) -> EngineResult<()>;

    fn trash_list(&self) -> EngineResult<Vec<TrashInfo>>;

    fn trash_remove(&self, id: &str, force: bool) -> EngineResult<()>;

    fn trash_restore(&self, id: &str, name: &str) -> EngineResult<()>;

    /// Pool level metadata
    fn metadata_list(&self) -> EngineResult<BTreeMap<String, String>>;
}

/// Open image; reads go to the snapshot selected by `set_snap`
pub trait ImageHandle: Send {
    fn stat(&self) -> EngineResult<ImageStat>;

    fn size(&self) -> EngineResult<u64>;

    fn features(&self) -> EngineResult<u64>;

    fn resize(&mut self, size: u64, progress: &dyn ProgressObserver) -> EngineResult<()>;

    fn update_features(&mut self, features: u64, enabled: bool) -> EngineResult<()>;

    fn snap_list(&self) -> EngineResult<Vec<SnapInfo>>;

    fn snap_create(&mut self, name: &str) -> EngineResult<()>;

    fn snap_remove(&mut self, name: &str) -> EngineResult<()>;

    fn snap_rename(&mut self, src: &str, dest: &str) -> EngineResult<()>;

    fn snap_protect(&mut self, name: &str) -> EngineResult<()>;

    fn snap_unprotect(&mut self, name: &str) -> EngineResult<()>;

    fn snap_is_protected(&self, name: &str) -> EngineResult<bool>;

    fn snap_rollback(&mut self, name: &str, progress: &dyn ProgressObserver) -> EngineResult<()>;

    fn set_snap(&mut self, name: Option<&str>) -> EngineResult<()>;

    fn copy_to(
        &self,
        dest_ctx: &dyn PoolContext,
        dest: &str,
        opts: &CreateOptions,
        progress: &dyn ProgressObserver,
    ) -> EngineResult<()>;

    fn flatten(&mut self, progress: &dyn ProgressObserver) -> EngineResult<()>;

    fn mirror_info(&self) -> EngineResult<MirrorInfo>;

    fn mirror_mode(&self) -> EngineResult<MirrorImageMode>;

    fn mirror_enable(&mut self, mode: MirrorImageMode) -> EngineResult<()>;

    fn mirror_disable(&mut self, force: bool) -> EngineResult<()>;

    fn mirror_promote(&mut self, force: bool) -> EngineResult<()>;

    fn mirror_demote(&mut self) -> EngineResult<()>;

    fn mirror_resync(&mut self) -> EngineResult<()>;

    /// Create a mirror snapshot, returning its id
    fn mirror_create_snapshot(&mut self) -> EngineResult<u64>;

    fn metadata_list(&self) -> EngineResult<BTreeMap<String, String>>;

    fn metadata_set(&mut self, key: &str, value: &str) -> EngineResult<()>;

    fn metadata_remove(&mut self, key: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_names() {
        assert_eq!(EngineError::new(errno::ENOENT, "x").errno_name(), "ENOENT");
        assert_eq!(EngineError::new(4242, "x").errno_name(), "EUNKNOWN");
        assert!(EngineError::new(errno::EBUSY, "x").is(errno::EBUSY));
    }

    #[test]
    fn test_object_layout() {
        let stat = ImageStat {
            id: "abc".into(),
            name: "img".into(),
            size: (4 << 20) * 3 + 1,
            order: 22,
            features: 0,
            block_name_prefix: "rbd_data.abc".into(),
            stripe_unit: 4 << 20,
            stripe_count: 1,
            data_pool: None,
            parent: None,
            create_timestamp: Utc::now(),
        };
        assert_eq!(stat.obj_size(), 4 << 20);
        assert_eq!(stat.num_objs(), 4);
    }

    #[test]
    fn test_mirror_mode_parse() {
        assert_eq!("snapshot".parse::<MirrorImageMode>().unwrap(), MirrorImageMode::Snapshot);
        assert!("bogus".parse::<MirrorImageMode>().is_err());
    }
}
