//! Image model

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::configuration::ConfigOption;
use crate::engine::{
    ImageStat, MirrorImageMode, MirrorImageState, MirrorInfo, ParentInfo, SnapInfo, SnapNamespace,
};
use crate::features::format_bitmask;

/// Snapshot of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDescriptor {
    pub id: u64,
    pub name: String,
    pub size: u64,
    /// Protected snapshots cannot be removed until unprotected
    pub is_protected: bool,
    /// Created by snapshot based mirroring
    pub mirror_snapshot: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<SnapInfo> for SnapshotDescriptor {
    fn from(snap: SnapInfo) -> Self {
        Self {
            id: snap.id,
            mirror_snapshot: snap.namespace == SnapNamespace::Mirror,
            name: snap.name,
            size: snap.size,
            is_protected: snap.protected,
            timestamp: snap.timestamp,
        }
    }
}

/// Mirroring state of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirroringDescriptor {
    pub state: MirrorImageState,
    pub primary: bool,
    pub mode: Option<MirrorImageMode>,
    pub global_id: String,
    pub schedule_intervals: Vec<String>,
}

impl MirroringDescriptor {
    pub fn new(info: MirrorInfo, mode: Option<MirrorImageMode>, schedule_intervals: Vec<String>) -> Self {
        Self {
            state: info.state,
            primary: info.primary,
            mode,
            global_id: info.global_id,
            schedule_intervals,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == MirrorImageState::Enabled
    }
}

/// Everything known about one image
#[derive(Debug, Clone, Serialize)]
pub struct ImageDescriptor {
    pub id: String,
    pub name: String,
    pub pool_name: String,
    pub namespace: Option<String>,
    pub size: u64,
    pub order: u8,
    pub obj_size: u64,
    pub num_objs: u64,
    pub block_name_prefix: String,
    /// Raw engine bitmask
    pub features: u64,
    /// Feature names in enable order
    pub features_name: Vec<String>,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub data_pool: Option<String>,
    pub parent: Option<ParentInfo>,
    pub timestamp: DateTime<Utc>,
    pub mirroring: MirroringDescriptor,
    pub snapshots: Vec<SnapshotDescriptor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub configuration: Vec<ConfigOption>,
}

impl ImageDescriptor {
    pub fn new(
        stat: ImageStat,
        pool: &str,
        namespace: &str,
        mirroring: MirroringDescriptor,
        snapshots: Vec<SnapshotDescriptor>,
    ) -> Self {
        Self {
            obj_size: stat.obj_size(),
            num_objs: stat.num_objs(),
            features_name: format_bitmask(stat.features),
            id: stat.id,
            name: stat.name,
            pool_name: pool.to_string(),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            size: stat.size,
            order: stat.order,
            block_name_prefix: stat.block_name_prefix,
            features: stat.features,
            stripe_unit: stat.stripe_unit,
            stripe_count: stat.stripe_count,
            data_pool: stat.data_pool,
            parent: stat.parent,
            timestamp: stat.create_timestamp,
            mirroring,
            snapshots,
            configuration: Vec::new(),
        }
    }

    pub fn with_configuration(mut self, configuration: Vec<ConfigOption>) -> Self {
        self.configuration = configuration;
        self
    }

    /// `pool[/namespace]/name`
    pub fn spec(&self) -> String {
        crate::spec::image_spec(&self.pool_name, self.namespace.as_deref(), &self.name)
    }
}
