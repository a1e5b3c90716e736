//! Block image service
//!
//! Every mutation is a sequencer submitted to the [`Orchestrator`] under the
//! key of the resource it changes; the sequencer runs its engine calls
//! inside an [`Accessor`] scope. Reads go through the listing caches or
//! straight to the engine.

pub mod image;
pub mod mirroring;
pub mod namespace;
pub mod snapshot;
pub mod trash;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accessor::Accessor;
use crate::cache::ListingCache;
use crate::config::ServiceConfig;
use crate::engine::{errno, EngineError, StorageEngine};
use crate::features::FeatureSet;
use crate::models::{ImageDescriptor, TrashEntry};
use crate::orchestrator::{Orchestrator, TaskContext, TaskHandle, TaskSpec};
use crate::{Error, Result};

pub use image::{CopyImage, CreateImage, EditImage, ImageCreated};
pub use snapshot::{CloneImage, EditSnapshot};
pub use trash::PurgeReport;

/// Releases in the order they shipped, oldest first
const RELEASES: &[&str] = &[
    "argonaut", "bobtail", "cuttlefish", "dumpling", "emperor", "firefly", "giant", "hammer",
    "infernalis", "jewel", "kraken", "luminous", "mimic", "nautilus", "octopus", "pacific",
    "quincy", "reef", "squid", "tentacle",
];

/// First release that understands clone format 2
const CLONE_V2_RELEASE: &str = "mimic";

/// Whether the block service can be used at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub available: bool,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct ImageService {
    engine: Arc<dyn StorageEngine>,
    accessor: Accessor,
    orchestrator: Orchestrator,
    images: ListingCache<ImageDescriptor>,
    trash: ListingCache<TrashEntry>,
    config: ServiceConfig,
}

impl ImageService {
    pub fn new(engine: Arc<dyn StorageEngine>, config: ServiceConfig) -> Self {
        Self {
            accessor: Accessor::new(engine.clone()),
            orchestrator: Orchestrator::with_config(config.orchestrator_config()),
            images: ListingCache::new(config.cache_config()),
            trash: ListingCache::new(config.cache_config()),
            engine,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Submit a sequencer; listings of `pools` are invalidated once it ends
    fn submit<T, F>(
        &self,
        spec: TaskSpec,
        default_wait: Duration,
        pools: Vec<String>,
        op: F,
    ) -> Result<TaskHandle>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        let spec = spec.with_wait_for(self.config.wait_for(default_wait));
        let images = self.images.clone();
        let trash = self.trash.clone();
        self.orchestrator.submit(spec, move |ctx| {
            let out = op(ctx);
            if pools.is_empty() {
                images.invalidate_all();
                trash.invalidate_all();
            }
            for pool in &pools {
                images.invalidate(pool);
                trash.invalidate(pool);
            }
            out
        })
    }

    /// Pools carrying the block application
    pub fn block_pools(&self) -> Result<Vec<String>> {
        Ok(self.engine.block_pools()?)
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        if self.block_pools()?.is_empty() {
            return Ok(ServiceStatus {
                available: false,
                message: Some(
                    "No block pools in the cluster. Please create a pool with the \"rbd\" application label."
                        .to_string(),
                ),
            });
        }
        Ok(ServiceStatus {
            available: true,
            message: None,
        })
    }

    /// Names of the features new images get by default
    pub fn default_features(&self) -> Result<Vec<String>> {
        match self.engine.config_get("rbd_default_features")? {
            Some(raw) => Ok(FeatureSet::parse_setting(&raw)?.names()),
            None => Ok(Vec::new()),
        }
    }

    /// Clone format the cluster will use for new clones
    pub fn clone_format_version(&self) -> Result<u8> {
        if let Some(raw) = self.engine.config_get("rbd_default_clone_format")? {
            if raw != "auto" {
                return raw.trim().parse::<u8>().map_err(|_| {
                    Error::Internal(format!("invalid rbd_default_clone_format '{raw}'"))
                });
            }
        }
        let compat = self.engine.compat_clients()?;
        let newest = release_rank(&compat.min_compat_client)
            .max(release_rank(&compat.require_min_compat_client));
        if newest < release_rank(CLONE_V2_RELEASE) {
            Ok(1)
        } else {
            Ok(2)
        }
    }
}

/// Position of a release name; empty sorts first, unknown names last
fn release_rank(name: &str) -> usize {
    if name.is_empty() {
        return 0;
    }
    RELEASES
        .iter()
        .position(|r| *r == name)
        .map(|idx| idx + 1)
        .unwrap_or(usize::MAX)
}

/// log2 of the object size, rounded; `None` leaves the default to the engine
pub fn order_from_obj_size(obj_size: Option<u64>) -> Option<u8> {
    obj_size
        .filter(|size| *size > 0)
        .map(|size| (size as f64).log2().round() as u8)
}

/// Run blocking engine work off the async executor
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("worker failed: {e}")))?
}

/// Engine failures on an open image
fn image_error(spec: &str) -> impl Fn(EngineError) -> Error + '_ {
    move |err| match err.errno {
        errno::ENOENT => Error::ImageNotFound(spec.to_string()),
        errno::EEXIST => Error::AlreadyExists(format!("{spec}: {}", err.message)),
        errno::EPERM | errno::EACCES => Error::PermissionDenied(format!("{spec}: {}", err.message)),
        errno::EBUSY => Error::Busy(format!("{spec}: {}", err.message)),
        _ => Error::Engine(err),
    }
}

/// Engine failures of snapshot calls on an open image
fn snapshot_error<'a>(spec: &'a str, snap: &'a str) -> impl Fn(EngineError) -> Error + 'a {
    move |err| match err.errno {
        errno::ENOENT => Error::SnapshotNotFound(format!("{spec}@{snap}")),
        errno::EEXIST => Error::AlreadyExists(format!("{spec}@{snap}: {}", err.message)),
        errno::EBUSY => Error::referential("snapshot_in_use", format!("{spec}@{snap}: {}", err.message)),
        errno::EPERM | errno::EACCES => Error::PermissionDenied(format!("{spec}@{snap}: {}", err.message)),
        _ => Error::Engine(err),
    }
}
