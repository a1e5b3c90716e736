//! In-memory engine backend
//!
//! Enforces the same rules a cluster would (feature dependencies, watchers,
//! protected snapshots, clone children, trash deferment, mirroring state)
//! so the service can run against it end to end. Every call is journaled,
//! and `fail_next` injects a one-shot failure for a named call.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::{
    errno, CompatClients, CreateOptions, EngineError, EngineResult, ImageHandle, ImageStat,
    MirrorImageMode, MirrorImageState, MirrorInfo, ParentInfo, PoolContext, ProgressObserver,
    SnapInfo, SnapNamespace, StorageEngine, TrashInfo, TrashSource,
};
use crate::features::{Feature, FeatureSet, ALLOW_DISABLE, ALLOW_ENABLE};
use crate::spec::image_spec;

const MIN_ORDER: u8 = 12;
const MAX_ORDER: u8 = 32;
const DEFAULT_ORDER: u8 = 22;
const DEFAULT_FEATURES: &str = "61";
const PROGRESS_STEPS: u64 = 4;
const MAX_DEFERMENT_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone)]
struct SnapState {
    id: u64,
    name: String,
    size: u64,
    protected: bool,
    namespace: SnapNamespace,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ParentRef {
    pool: String,
    namespace: String,
    image_id: String,
    snapshot: String,
}

#[derive(Debug, Clone)]
struct MirrorState {
    global_id: String,
    mode: MirrorImageMode,
    primary: bool,
}

#[derive(Debug, Clone)]
struct ImageState {
    id: String,
    size: u64,
    order: u8,
    features: u64,
    stripe_unit: u64,
    stripe_count: u64,
    data_pool: Option<String>,
    parent: Option<ParentRef>,
    snaps: Vec<SnapState>,
    metadata: BTreeMap<String, String>,
    mirror: Option<MirrorState>,
    watchers: usize,
    created: DateTime<Utc>,
}

impl ImageState {
    fn new(size: u64, order: u8, features: u64) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        Self {
            id,
            size,
            order,
            features,
            stripe_unit: 1 << order,
            stripe_count: 1,
            data_pool: None,
            parent: None,
            snaps: Vec::new(),
            metadata: BTreeMap::new(),
            mirror: None,
            watchers: 0,
            created: Utc::now(),
        }
    }

    fn snap(&self, name: &str) -> EngineResult<&SnapState> {
        self.snaps
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found(format!("snapshot {name}")))
    }

    fn snap_mut(&mut self, name: &str) -> EngineResult<&mut SnapState> {
        self.snaps
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found(format!("snapshot {name}")))
    }

    fn mirror_mut(&mut self) -> EngineResult<&mut MirrorState> {
        self.mirror
            .as_mut()
            .ok_or_else(|| invalid("mirroring is not enabled on this image"))
    }
}

#[derive(Debug, Clone)]
struct TrashedImage {
    name: String,
    image: ImageState,
    source: TrashSource,
    deletion_time: DateTime<Utc>,
    deferment_end_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct NamespaceState {
    images: BTreeMap<String, ImageState>,
    /// Keyed by image id
    trash: BTreeMap<String, TrashedImage>,
}

#[derive(Debug)]
struct PoolState {
    block: bool,
    namespaces: BTreeMap<String, NamespaceState>,
    metadata: BTreeMap<String, String>,
}

impl PoolState {
    fn new(block: bool) -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(String::new(), NamespaceState::default());
        Self {
            block,
            namespaces,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    pools: BTreeMap<String, PoolState>,
    config: BTreeMap<String, String>,
    compat: CompatClients,
    schedules: BTreeMap<String, Vec<String>>,
    calls: Vec<String>,
    faults: Vec<(String, EngineError)>,
    next_snap_id: u64,
}

impl ClusterState {
    fn record(&mut self, call: String) {
        tracing::trace!(call = %call, "engine call");
        self.calls.push(call);
    }

    fn take_fault(&mut self, op: &str) -> EngineResult<()> {
        match self.faults.iter().position(|(name, _)| name == op) {
            Some(idx) => Err(self.faults.remove(idx).1),
            None => Ok(()),
        }
    }

    fn pool(&self, pool: &str) -> EngineResult<&PoolState> {
        self.pools
            .get(pool)
            .ok_or_else(|| not_found(format!("pool {pool}")))
    }

    fn pool_mut(&mut self, pool: &str) -> EngineResult<&mut PoolState> {
        self.pools
            .get_mut(pool)
            .ok_or_else(|| not_found(format!("pool {pool}")))
    }

    fn namespace(&self, pool: &str, ns: &str) -> EngineResult<&NamespaceState> {
        self.pool(pool)?
            .namespaces
            .get(ns)
            .ok_or_else(|| not_found(format!("namespace {pool}/{ns}")))
    }

    fn namespace_mut(&mut self, pool: &str, ns: &str) -> EngineResult<&mut NamespaceState> {
        self.pool_mut(pool)?
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| not_found(format!("namespace {pool}/{ns}")))
    }

    fn image(&self, pool: &str, ns: &str, name: &str) -> EngineResult<&ImageState> {
        self.namespace(pool, ns)?
            .images
            .get(name)
            .ok_or_else(|| not_found(format!("image {}", image_spec(pool, Some(ns), name))))
    }

    fn image_by_id(&self, pool: &str, ns: &str, id: &str) -> EngineResult<&ImageState> {
        self.namespace(pool, ns)?
            .images
            .values()
            .find(|img| img.id == id)
            .ok_or_else(|| not_found(format!("image id {id}")))
    }

    fn image_by_id_mut(&mut self, pool: &str, ns: &str, id: &str) -> EngineResult<&mut ImageState> {
        self.namespace_mut(pool, ns)?
            .images
            .values_mut()
            .find(|img| img.id == id)
            .ok_or_else(|| not_found(format!("image id {id}")))
    }

    fn default_features(&self) -> u64 {
        let raw = self
            .config
            .get("rbd_default_features")
            .map(String::as_str)
            .unwrap_or(DEFAULT_FEATURES);
        FeatureSet::parse_setting(raw).map(|set| set.bits()).unwrap_or(0)
    }

    /// Live or trashed images cloned from `image_id`, optionally from one snapshot
    fn children_of(&self, pool: &str, ns: &str, image_id: &str, snap: Option<&str>) -> usize {
        self.pools
            .values()
            .flat_map(|p| p.namespaces.values())
            .flat_map(|n| n.images.values().chain(n.trash.values().map(|t| &t.image)))
            .filter(|img| {
                img.parent.as_ref().is_some_and(|p| {
                    p.pool == pool
                        && p.namespace == ns
                        && p.image_id == image_id
                        && snap.map_or(true, |s| p.snapshot == s)
                })
            })
            .count()
    }

    fn parent_info(&self, parent: &ParentRef) -> ParentInfo {
        let image = self
            .namespace(&parent.pool, &parent.namespace)
            .ok()
            .and_then(|n| {
                n.images
                    .iter()
                    .find(|(_, img)| img.id == parent.image_id)
                    .map(|(name, _)| name.clone())
                    .or_else(|| n.trash.get(&parent.image_id).map(|t| t.name.clone()))
            })
            .unwrap_or_else(|| parent.image_id.clone());
        ParentInfo {
            pool: parent.pool.clone(),
            namespace: parent.namespace.clone(),
            image,
            snapshot: parent.snapshot.clone(),
        }
    }

    fn next_snap_id(&mut self) -> u64 {
        self.next_snap_id += 1;
        self.next_snap_id
    }
}

fn not_found(what: String) -> EngineError {
    EngineError::new(errno::ENOENT, format!("{what} does not exist"))
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::new(errno::EINVAL, message)
}

fn check_order(order: u8) -> EngineResult<()> {
    if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
        return Err(EngineError::new(
            errno::EDOM,
            format!("order {order} is outside {MIN_ORDER}..={MAX_ORDER}"),
        ));
    }
    Ok(())
}

fn check_dependencies(features: u64) -> EngineResult<()> {
    match FeatureSet::from_bits(features).missing_prerequisite() {
        Some((feature, prerequisite)) => Err(invalid(format!(
            "feature {feature} requires {prerequisite}"
        ))),
        None => Ok(()),
    }
}

fn report_progress(progress: &dyn ProgressObserver) -> EngineResult<()> {
    for done in 1..=PROGRESS_STEPS {
        if !progress.update(done, PROGRESS_STEPS) {
            return Err(EngineError::new(
                errno::ECANCELED,
                "operation interrupted by progress callback",
            ));
        }
    }
    Ok(())
}

/// Apply layout options on top of a fresh image
fn layout(size: u64, order: u8, features: u64, opts: &CreateOptions) -> EngineResult<ImageState> {
    check_order(order)?;
    let mut image = ImageState::new(size, order, features);
    let obj_size = 1u64 << order;
    if let Some(unit) = opts.stripe_unit {
        if unit == 0 || obj_size % unit != 0 {
            return Err(invalid(format!("stripe unit {unit} must divide object size {obj_size}")));
        }
        image.stripe_unit = unit;
    }
    if let Some(count) = opts.stripe_count {
        if count == 0 {
            return Err(invalid("stripe count must be positive"));
        }
        image.stripe_count = count;
    }
    if image.stripe_unit != obj_size || image.stripe_count != 1 {
        image.features |= Feature::Striping.bit();
    }
    if let Some(data_pool) = &opts.data_pool {
        image.data_pool = Some(data_pool.clone());
        image.features |= Feature::DataPool.bit();
    }
    check_dependencies(image.features)?;
    Ok(image)
}

/// Cluster kept entirely in memory
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state
            .config
            .insert("rbd_default_features".into(), DEFAULT_FEATURES.into());
        state
            .config
            .insert("rbd_default_clone_format".into(), "auto".into());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Add a pool tagged with the block application
    pub fn with_pool(self, pool: &str) -> Self {
        self.add_pool(pool, true);
        self
    }

    pub fn add_pool(&self, pool: &str, block: bool) {
        self.state
            .lock()
            .pools
            .entry(pool.to_string())
            .or_insert_with(|| PoolState::new(block));
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.state
            .lock()
            .config
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_compat_clients(&self, min_compat_client: &str, require_min_compat_client: &str) {
        self.state.lock().compat = CompatClients {
            min_compat_client: min_compat_client.to_string(),
            require_min_compat_client: require_min_compat_client.to_string(),
        };
    }

    pub fn set_pool_metadata(&self, pool: &str, key: &str, value: &str) -> EngineResult<()> {
        self.state
            .lock()
            .pool_mut(pool)?
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Make the next call named `op` fail with `err`
    pub fn fail_next(&self, op: &str, err: EngineError) {
        self.state.lock().faults.push((op.to_string(), err));
    }

    /// Journal of every call made so far
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Journal entries for calls named `op`
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Move the deferment deadline of a trash entry
    pub fn set_trash_deferment(
        &self,
        pool: &str,
        namespace: &str,
        id: &str,
        deferment_end_time: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .namespace_mut(pool, namespace)?
            .trash
            .get_mut(id)
            .ok_or_else(|| not_found(format!("trash entry {id}")))?;
        entry.deferment_end_time = deferment_end_time;
        Ok(())
    }

    pub fn image_exists(&self, pool: &str, namespace: &str, name: &str) -> bool {
        self.state.lock().image(pool, namespace, name).is_ok()
    }

    /// Number of open handles on an image
    pub fn watchers(&self, pool: &str, namespace: &str, name: &str) -> usize {
        self.state
            .lock()
            .image(pool, namespace, name)
            .map(|img| img.watchers)
            .unwrap_or(0)
    }
}

impl StorageEngine for MemoryCluster {
    fn open_pool(&self, pool: &str) -> EngineResult<Box<dyn PoolContext>> {
        let mut state = self.state.lock();
        state.take_fault("open_pool")?;
        state.pool(pool)?;
        state.record(format!("open_pool {pool}"));
        Ok(Box::new(MemoryPool {
            state: self.state.clone(),
            pool: pool.to_string(),
            namespace: String::new(),
        }))
    }

    fn block_pools(&self) -> EngineResult<Vec<String>> {
        let mut state = self.state.lock();
        state.take_fault("block_pools")?;
        Ok(state
            .pools
            .iter()
            .filter(|(_, p)| p.block)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn config_get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut state = self.state.lock();
        state.take_fault("config_get")?;
        Ok(state.config.get(key).cloned())
    }

    fn compat_clients(&self) -> EngineResult<CompatClients> {
        let mut state = self.state.lock();
        state.take_fault("compat_clients")?;
        Ok(state.compat.clone())
    }

    fn schedule_add(&self, image_spec: &str, interval: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("schedule_add")?;
        let intervals = state.schedules.entry(image_spec.to_string()).or_default();
        if !intervals.iter().any(|i| i == interval) {
            intervals.push(interval.to_string());
        }
        state.record(format!("schedule_add {image_spec} {interval}"));
        Ok(())
    }

    fn schedule_remove(&self, image_spec: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("schedule_remove")?;
        state
            .schedules
            .remove(image_spec)
            .ok_or_else(|| not_found(format!("schedule for {image_spec}")))?;
        state.record(format!("schedule_remove {image_spec}"));
        Ok(())
    }

    fn schedule_list(&self, image_spec: &str) -> EngineResult<Vec<String>> {
        let mut state = self.state.lock();
        state.take_fault("schedule_list")?;
        Ok(state.schedules.get(image_spec).cloned().unwrap_or_default())
    }
}

struct MemoryPool {
    state: Arc<Mutex<ClusterState>>,
    pool: String,
    namespace: String,
}

impl MemoryPool {
    fn spec(&self, name: &str) -> String {
        image_spec(&self.pool, Some(&self.namespace), name)
    }

    fn pool_spec(&self) -> String {
        if self.namespace.is_empty() {
            self.pool.clone()
        } else {
            format!("{}/{}", self.pool, self.namespace)
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let call = format!("release_pool {}", self.pool);
        self.state.lock().record(call);
    }
}

impl PoolContext for MemoryPool {
    fn pool_name(&self) -> &str {
        &self.pool
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn set_namespace(&mut self, namespace: &str) {
        self.namespace = namespace.to_string();
    }

    fn namespace_list(&self) -> EngineResult<Vec<String>> {
        let mut state = self.state.lock();
        state.take_fault("namespace_list")?;
        Ok(state
            .pool(&self.pool)?
            .namespaces
            .keys()
            .filter(|ns| !ns.is_empty())
            .cloned()
            .collect())
    }

    fn namespace_create(&self, namespace: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("namespace_create")?;
        if namespace.is_empty() || namespace.contains('/') {
            return Err(invalid(format!("invalid namespace name '{namespace}'")));
        }
        let pool = state.pool_mut(&self.pool)?;
        if pool.namespaces.contains_key(namespace) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("namespace {namespace} already exists"),
            ));
        }
        pool.namespaces
            .insert(namespace.to_string(), NamespaceState::default());
        state.record(format!("namespace_create {}/{namespace}", self.pool));
        Ok(())
    }

    fn namespace_remove(&self, namespace: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("namespace_remove")?;
        if namespace.is_empty() {
            return Err(invalid("the default namespace cannot be removed"));
        }
        let ns = state.namespace(&self.pool, namespace)?;
        if !ns.images.is_empty() || !ns.trash.is_empty() {
            return Err(EngineError::new(
                errno::EBUSY,
                format!("namespace {namespace} is not empty"),
            ));
        }
        state.pool_mut(&self.pool)?.namespaces.remove(namespace);
        state.record(format!("namespace_remove {}/{namespace}", self.pool));
        Ok(())
    }

    fn list_images(&self) -> EngineResult<Vec<String>> {
        let mut state = self.state.lock();
        state.take_fault("list_images")?;
        Ok(state
            .namespace(&self.pool, &self.namespace)?
            .images
            .keys()
            .cloned()
            .collect())
    }

    fn create_image(&self, name: &str, size: u64, opts: &CreateOptions) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("create_image")?;
        if let Some(data_pool) = &opts.data_pool {
            state.pool(data_pool)?;
        }
        let order = opts.order.unwrap_or(DEFAULT_ORDER);
        let features = opts.features.unwrap_or_else(|| state.default_features());
        let image = layout(size, order, features, opts)?;
        let ns = state.namespace_mut(&self.pool, &self.namespace)?;
        if ns.images.contains_key(name) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("image {} already exists", self.spec(name)),
            ));
        }
        let call = format!(
            "create_image {} size={size} order={order} features={}",
            self.spec(name),
            image.features
        );
        ns.images.insert(name.to_string(), image);
        state.record(call);
        Ok(())
    }

    fn open_image(&self, name: &str) -> EngineResult<Box<dyn ImageHandle>> {
        let mut state = self.state.lock();
        state.take_fault("open_image")?;
        let ns = state.namespace_mut(&self.pool, &self.namespace)?;
        let image = ns
            .images
            .get_mut(name)
            .ok_or_else(|| not_found(format!("image {}", self.spec(name))))?;
        image.watchers += 1;
        let id = image.id.clone();
        state.record(format!("open_image {}", self.spec(name)));
        Ok(Box::new(MemoryImage {
            state: self.state.clone(),
            pool: self.pool.clone(),
            namespace: self.namespace.clone(),
            id,
            name: name.to_string(),
            snap: None,
        }))
    }

    fn remove_image(&self, name: &str, progress: &dyn ProgressObserver) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            state.take_fault("remove_image")?;
            let image = state.image(&self.pool, &self.namespace, name)?;
            if image.watchers > 0 {
                return Err(EngineError::new(
                    errno::EBUSY,
                    format!("image {} still has watchers", self.spec(name)),
                ));
            }
            if !image.snaps.is_empty() {
                return Err(EngineError::new(
                    errno::ENOTEMPTY,
                    format!("image {} has snapshots", self.spec(name)),
                ));
            }
        }
        report_progress(progress)?;
        let mut state = self.state.lock();
        state
            .namespace_mut(&self.pool, &self.namespace)?
            .images
            .remove(name)
            .ok_or_else(|| not_found(format!("image {}", self.spec(name))))?;
        state.record(format!("remove_image {}", self.spec(name)));
        Ok(())
    }

    fn rename_image(&self, src: &str, dest: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("rename_image")?;
        let ns = state.namespace_mut(&self.pool, &self.namespace)?;
        if ns.images.contains_key(dest) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("image {} already exists", self.spec(dest)),
            ));
        }
        let image = ns
            .images
            .remove(src)
            .ok_or_else(|| not_found(format!("image {}", self.spec(src))))?;
        ns.images.insert(dest.to_string(), image);
        state.record(format!("rename_image {} -> {dest}", self.spec(src)));
        Ok(())
    }

    fn clone_image(
        &self,
        parent: &str,
        snapshot: &str,
        child_ctx: &dyn PoolContext,
        child: &str,
        opts: &CreateOptions,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("clone_image")?;
        let parent_image = state.image(&self.pool, &self.namespace, parent)?;
        let snap = parent_image.snap(snapshot)?;
        if parent_image.features & Feature::Layering.bit() == 0 {
            return Err(invalid(format!("parent {} lacks layering", self.spec(parent))));
        }
        let v1 = state.config.get("rbd_default_clone_format").map(String::as_str) == Some("1");
        if v1 && !snap.protected {
            return Err(invalid(format!(
                "snapshot {}@{snapshot} must be protected",
                self.spec(parent)
            )));
        }
        let (parent_id, snap_size, parent_order) = (parent_image.id.clone(), snap.size, parent_image.order);

        let order = opts.order.unwrap_or(parent_order);
        let features = opts.features.unwrap_or_else(|| state.default_features()) | Feature::Layering.bit();
        let mut image = layout(snap_size, order, features, opts)?;
        image.parent = Some(ParentRef {
            pool: self.pool.clone(),
            namespace: self.namespace.clone(),
            image_id: parent_id,
            snapshot: snapshot.to_string(),
        });

        let child_spec = image_spec(child_ctx.pool_name(), Some(child_ctx.namespace()), child);
        let ns = state.namespace_mut(child_ctx.pool_name(), child_ctx.namespace())?;
        if ns.images.contains_key(child) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("image {child_spec} already exists"),
            ));
        }
        ns.images.insert(child.to_string(), image);
        state.record(format!(
            "clone_image {}@{snapshot} -> {child_spec}",
            self.spec(parent)
        ));
        Ok(())
    }

    fn trash_move(&self, name: &str, delay_secs: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("trash_move")?;
        let spec = self.spec(name);
        let ns = state.namespace_mut(&self.pool, &self.namespace)?;
        let image = ns
            .images
            .get(name)
            .ok_or_else(|| not_found(format!("image {spec}")))?;
        if image.watchers > 0 {
            return Err(EngineError::new(
                errno::EBUSY,
                format!("image {spec} still has watchers"),
            ));
        }
        let image = ns
            .images
            .remove(name)
            .ok_or_else(|| not_found(format!("image {spec}")))?;
        let now = Utc::now();
        let delay = i64::try_from(delay_secs.min(MAX_DEFERMENT_SECS)).unwrap_or(0);
        ns.trash.insert(
            image.id.clone(),
            TrashedImage {
                name: name.to_string(),
                image,
                source: TrashSource::User,
                deletion_time: now,
                deferment_end_time: now + Duration::seconds(delay),
            },
        );
        state.record(format!("trash_move {spec} delay={delay_secs}"));
        Ok(())
    }

    fn trash_list(&self) -> EngineResult<Vec<TrashInfo>> {
        let mut state = self.state.lock();
        state.take_fault("trash_list")?;
        Ok(state
            .namespace(&self.pool, &self.namespace)?
            .trash
            .iter()
            .map(|(id, entry)| TrashInfo {
                id: id.clone(),
                name: entry.name.clone(),
                source: entry.source,
                deletion_time: entry.deletion_time,
                deferment_end_time: entry.deferment_end_time,
            })
            .collect())
    }

    fn trash_remove(&self, id: &str, force: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("trash_remove")?;
        let entry = state
            .namespace(&self.pool, &self.namespace)?
            .trash
            .get(id)
            .ok_or_else(|| not_found(format!("trash entry {id}")))?;
        if !force && entry.deferment_end_time > Utc::now() {
            return Err(EngineError::new(
                errno::EPERM,
                format!("deferment time of trash entry {id} has not expired"),
            ));
        }
        if state.children_of(&self.pool, &self.namespace, id, None) > 0 {
            return Err(EngineError::new(
                errno::EBUSY,
                format!("trash entry {id} has clone children"),
            ));
        }
        state.namespace_mut(&self.pool, &self.namespace)?.trash.remove(id);
        state.record(format!("trash_remove {}/{id}", self.pool_spec()));
        Ok(())
    }

    fn trash_restore(&self, id: &str, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("trash_restore")?;
        let ns = state.namespace_mut(&self.pool, &self.namespace)?;
        let entry = ns
            .trash
            .get(id)
            .ok_or_else(|| not_found(format!("trash entry {id}")))?;
        let target = if name.is_empty() {
            entry.name.clone()
        } else {
            name.to_string()
        };
        if ns.images.contains_key(&target) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("image {} already exists", self.spec(&target)),
            ));
        }
        if let Some(entry) = ns.trash.remove(id) {
            ns.images.insert(target.clone(), entry.image);
        }
        state.record(format!("trash_restore {}/{id} -> {target}", self.pool_spec()));
        Ok(())
    }

    fn metadata_list(&self) -> EngineResult<BTreeMap<String, String>> {
        let mut state = self.state.lock();
        state.take_fault("pool_metadata_list")?;
        Ok(state.pool(&self.pool)?.metadata.clone())
    }
}

struct MemoryImage {
    state: Arc<Mutex<ClusterState>>,
    pool: String,
    namespace: String,
    id: String,
    name: String,
    snap: Option<String>,
}

impl MemoryImage {
    fn spec(&self) -> String {
        image_spec(&self.pool, Some(&self.namespace), &self.name)
    }

    /// Run `f` on this image under the cluster lock
    fn read<T>(&self, op: &str, f: impl FnOnce(&ClusterState, &ImageState) -> EngineResult<T>) -> EngineResult<T> {
        let mut guard = self.state.lock();
        guard.take_fault(op)?;
        let state: &ClusterState = &guard;
        let image = state.image_by_id(&self.pool, &self.namespace, &self.id)?;
        f(state, image)
    }

    /// Mutate this image and journal `call` on success
    fn write<T>(
        &self,
        op: &str,
        call: String,
        f: impl FnOnce(&mut ImageState) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut state = self.state.lock();
        state.take_fault(op)?;
        let image = state.image_by_id_mut(&self.pool, &self.namespace, &self.id)?;
        let out = f(image)?;
        state.record(call);
        Ok(out)
    }

    fn children(&self, snap: &str) -> usize {
        self.state
            .lock()
            .children_of(&self.pool, &self.namespace, &self.id, Some(snap))
    }
}

impl Drop for MemoryImage {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Ok(image) = state.image_by_id_mut(&self.pool, &self.namespace, &self.id) {
            image.watchers = image.watchers.saturating_sub(1);
        }
        let call = format!("close_image {}", self.spec());
        state.record(call);
    }
}

impl ImageHandle for MemoryImage {
    fn stat(&self) -> EngineResult<ImageStat> {
        self.read("stat", |state, image| {
            let size = match &self.snap {
                Some(snap) => image.snap(snap)?.size,
                None => image.size,
            };
            Ok(ImageStat {
                id: image.id.clone(),
                name: self.name.clone(),
                size,
                order: image.order,
                features: image.features,
                block_name_prefix: format!("rbd_data.{}", image.id),
                stripe_unit: image.stripe_unit,
                stripe_count: image.stripe_count,
                data_pool: image.data_pool.clone(),
                parent: image.parent.as_ref().map(|p| state.parent_info(p)),
                create_timestamp: image.created,
            })
        })
    }

    fn size(&self) -> EngineResult<u64> {
        self.stat().map(|s| s.size)
    }

    fn features(&self) -> EngineResult<u64> {
        self.read("features", |_, image| Ok(image.features))
    }

    fn resize(&mut self, size: u64, progress: &dyn ProgressObserver) -> EngineResult<()> {
        if self.snap.is_some() {
            return Err(EngineError::new(errno::EROFS, "cannot resize a snapshot"));
        }
        self.read("resize", |_, _| Ok(()))?;
        report_progress(progress)?;
        let call = format!("resize {} size={size}", self.spec());
        self.write("resize_commit", call, |image| {
            image.size = size;
            Ok(())
        })
    }

    fn update_features(&mut self, features: u64, enabled: bool) -> EngineResult<()> {
        let requested = FeatureSet::from_bits(features);
        let verb = if enabled { "enable" } else { "disable" };
        let call = format!(
            "update_features {} {} {verb}",
            self.spec(),
            requested.names().join(",")
        );
        self.write("update_features", call, |image| {
            if requested.is_empty() {
                return Err(invalid("no features requested"));
            }
            let allowed: &[Feature] = if enabled { &ALLOW_ENABLE } else { &ALLOW_DISABLE };
            if let Some(f) = requested.iter().find(|f| !allowed.contains(f)) {
                return Err(invalid(format!(
                    "feature {f} cannot be {verb}d on an existing image"
                )));
            }
            let next = if enabled {
                if image.features & features != 0 {
                    return Err(invalid("one or more features are already enabled"));
                }
                image.features | features
            } else {
                if image.features & features != features {
                    return Err(invalid("one or more features are already disabled"));
                }
                image.features & !features
            };
            check_dependencies(next)?;
            image.features = next;
            Ok(())
        })
    }

    fn snap_list(&self) -> EngineResult<Vec<SnapInfo>> {
        self.read("snap_list", |_, image| {
            Ok(image
                .snaps
                .iter()
                .map(|s| SnapInfo {
                    id: s.id,
                    name: s.name.clone(),
                    size: s.size,
                    protected: s.protected,
                    namespace: s.namespace,
                    timestamp: s.timestamp,
                })
                .collect())
        })
    }

    fn snap_create(&mut self, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.take_fault("snap_create")?;
        let id = state.next_snap_id();
        let image = state.image_by_id_mut(&self.pool, &self.namespace, &self.id)?;
        if image.snaps.iter().any(|s| s.name == name) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("snapshot {name} already exists"),
            ));
        }
        let size = image.size;
        image.snaps.push(SnapState {
            id,
            name: name.to_string(),
            size,
            protected: false,
            namespace: SnapNamespace::User,
            timestamp: Utc::now(),
        });
        state.record(format!("snap_create {}@{name}", self.spec()));
        Ok(())
    }

    fn snap_remove(&mut self, name: &str) -> EngineResult<()> {
        let children = self.children(name);
        let call = format!("snap_remove {}@{name}", self.spec());
        self.write("snap_remove", call, |image| {
            if image.snap(name)?.protected {
                return Err(EngineError::new(
                    errno::EBUSY,
                    format!("snapshot {name} is protected"),
                ));
            }
            if children > 0 {
                return Err(EngineError::new(
                    errno::EBUSY,
                    format!("snapshot {name} has clone children"),
                ));
            }
            image.snaps.retain(|s| s.name != name);
            Ok(())
        })
    }

    fn snap_rename(&mut self, src: &str, dest: &str) -> EngineResult<()> {
        let call = format!("snap_rename {}@{src} -> {dest}", self.spec());
        self.write("snap_rename", call, |image| {
            if image.snaps.iter().any(|s| s.name == dest) {
                return Err(EngineError::new(
                    errno::EEXIST,
                    format!("snapshot {dest} already exists"),
                ));
            }
            image.snap_mut(src)?.name = dest.to_string();
            Ok(())
        })
    }

    fn snap_protect(&mut self, name: &str) -> EngineResult<()> {
        let call = format!("snap_protect {}@{name}", self.spec());
        self.write("snap_protect", call, |image| {
            let snap = image.snap_mut(name)?;
            if snap.protected {
                return Err(EngineError::new(
                    errno::EBUSY,
                    format!("snapshot {name} is already protected"),
                ));
            }
            snap.protected = true;
            Ok(())
        })
    }

    fn snap_unprotect(&mut self, name: &str) -> EngineResult<()> {
        let children = self.children(name);
        let call = format!("snap_unprotect {}@{name}", self.spec());
        self.write("snap_unprotect", call, |image| {
            let snap = image.snap_mut(name)?;
            if !snap.protected {
                return Err(invalid(format!("snapshot {name} is not protected")));
            }
            if children > 0 {
                return Err(EngineError::new(
                    errno::EBUSY,
                    format!("snapshot {name} has clone children"),
                ));
            }
            snap.protected = false;
            Ok(())
        })
    }

    fn snap_is_protected(&self, name: &str) -> EngineResult<bool> {
        self.read("snap_is_protected", |_, image| Ok(image.snap(name)?.protected))
    }

    fn snap_rollback(&mut self, name: &str, progress: &dyn ProgressObserver) -> EngineResult<()> {
        self.read("snap_rollback", |_, image| image.snap(name).map(|_| ()))?;
        report_progress(progress)?;
        let call = format!("snap_rollback {}@{name}", self.spec());
        self.write("snap_rollback_commit", call, |image| {
            let size = image.snap(name)?.size;
            image.size = size;
            Ok(())
        })
    }

    fn set_snap(&mut self, name: Option<&str>) -> EngineResult<()> {
        if let Some(name) = name {
            self.read("set_snap", |_, image| image.snap(name).map(|_| ()))?;
        }
        self.snap = name.map(str::to_string);
        Ok(())
    }

    fn copy_to(
        &self,
        dest_ctx: &dyn PoolContext,
        dest: &str,
        opts: &CreateOptions,
        progress: &dyn ProgressObserver,
    ) -> EngineResult<()> {
        let dest_pool = dest_ctx.pool_name().to_string();
        let dest_ns = dest_ctx.namespace().to_string();
        let dest_spec = image_spec(&dest_pool, Some(&dest_ns), dest);

        let image = self.read("copy", |state, src| {
            if let Some(data_pool) = &opts.data_pool {
                state.pool(data_pool)?;
            }
            let size = match &self.snap {
                Some(snap) => src.snap(snap)?.size,
                None => src.size,
            };
            let order = opts.order.unwrap_or(src.order);
            let features = opts.features.unwrap_or(src.features);
            let mut image = layout(size, order, features, opts)?;
            image.metadata = src.metadata.clone();
            if state.image(&dest_pool, &dest_ns, dest).is_ok() {
                return Err(EngineError::new(
                    errno::EEXIST,
                    format!("image {dest_spec} already exists"),
                ));
            }
            Ok(image)
        })?;
        report_progress(progress)?;

        let mut state = self.state.lock();
        let ns = state.namespace_mut(&dest_pool, &dest_ns)?;
        if ns.images.contains_key(dest) {
            return Err(EngineError::new(
                errno::EEXIST,
                format!("image {dest_spec} already exists"),
            ));
        }
        ns.images.insert(dest.to_string(), image);
        let source = match &self.snap {
            Some(snap) => format!("{}@{snap}", self.spec()),
            None => self.spec(),
        };
        state.record(format!("copy {source} -> {dest_spec}"));
        Ok(())
    }

    fn flatten(&mut self, progress: &dyn ProgressObserver) -> EngineResult<()> {
        self.read("flatten", |_, image| match image.parent {
            Some(_) => Ok(()),
            None => Err(invalid(format!("image {} has no parent", self.spec()))),
        })?;
        report_progress(progress)?;
        let call = format!("flatten {}", self.spec());
        self.write("flatten_commit", call, |image| {
            image.parent = None;
            Ok(())
        })
    }

    fn mirror_info(&self) -> EngineResult<MirrorInfo> {
        self.read("mirror_info", |_, image| {
            Ok(match &image.mirror {
                Some(m) => MirrorInfo {
                    global_id: m.global_id.clone(),
                    state: MirrorImageState::Enabled,
                    primary: m.primary,
                },
                None => MirrorInfo {
                    global_id: String::new(),
                    state: MirrorImageState::Disabled,
                    primary: false,
                },
            })
        })
    }

    fn mirror_mode(&self) -> EngineResult<MirrorImageMode> {
        self.read("mirror_mode", |_, image| {
            image
                .mirror
                .as_ref()
                .map(|m| m.mode)
                .ok_or_else(|| invalid("mirroring is not enabled on this image"))
        })
    }

    fn mirror_enable(&mut self, mode: MirrorImageMode) -> EngineResult<()> {
        let call = format!("mirror_enable {} {}", self.spec(), mode_name(mode));
        self.write("mirror_enable", call, |image| {
            if image.mirror.is_some() {
                return Err(invalid("mirroring is already enabled"));
            }
            if mode == MirrorImageMode::Journal {
                if image.features & Feature::ExclusiveLock.bit() == 0 {
                    return Err(invalid("journal mirroring requires exclusive-lock"));
                }
                image.features |= Feature::Journaling.bit();
            }
            image.mirror = Some(MirrorState {
                global_id: uuid::Uuid::new_v4().to_string(),
                mode,
                primary: true,
            });
            Ok(())
        })
    }

    fn mirror_disable(&mut self, force: bool) -> EngineResult<()> {
        let call = format!("mirror_disable {}", self.spec());
        self.write("mirror_disable", call, |image| {
            let mirror = image.mirror_mut()?;
            if !mirror.primary && !force {
                return Err(invalid("cannot disable mirroring on a non-primary image"));
            }
            image.mirror = None;
            image.snaps.retain(|s| s.namespace != SnapNamespace::Mirror);
            Ok(())
        })
    }

    fn mirror_promote(&mut self, force: bool) -> EngineResult<()> {
        let call = format!("mirror_promote {} force={force}", self.spec());
        self.write("mirror_promote", call, |image| {
            let mirror = image.mirror_mut()?;
            if mirror.primary {
                return Err(invalid("image is already primary"));
            }
            mirror.primary = true;
            Ok(())
        })
    }

    fn mirror_demote(&mut self) -> EngineResult<()> {
        let call = format!("mirror_demote {}", self.spec());
        self.write("mirror_demote", call, |image| {
            let mirror = image.mirror_mut()?;
            if !mirror.primary {
                return Err(invalid("image is already non-primary"));
            }
            mirror.primary = false;
            Ok(())
        })
    }

    fn mirror_resync(&mut self) -> EngineResult<()> {
        let call = format!("mirror_resync {}", self.spec());
        self.write("mirror_resync", call, |image| {
            if image.mirror_mut()?.primary {
                return Err(invalid("cannot resync a primary image"));
            }
            Ok(())
        })
    }

    fn mirror_create_snapshot(&mut self) -> EngineResult<u64> {
        let mut state = self.state.lock();
        state.take_fault("mirror_create_snapshot")?;
        let id = state.next_snap_id();
        let image = state.image_by_id_mut(&self.pool, &self.namespace, &self.id)?;
        let global_id = match &image.mirror {
            Some(m) if m.mode == MirrorImageMode::Snapshot && m.primary => m.global_id.clone(),
            Some(_) => return Err(invalid("image is not a snapshot mirroring primary")),
            None => return Err(invalid("mirroring is not enabled on this image")),
        };
        let size = image.size;
        image.snaps.push(SnapState {
            id,
            name: format!(".mirror.primary.{global_id}.{id}"),
            size,
            protected: false,
            namespace: SnapNamespace::Mirror,
            timestamp: Utc::now(),
        });
        state.record(format!("mirror_create_snapshot {}", self.spec()));
        Ok(id)
    }

    fn metadata_list(&self) -> EngineResult<BTreeMap<String, String>> {
        self.read("metadata_list", |_, image| Ok(image.metadata.clone()))
    }

    fn metadata_set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        let call = format!("metadata_set {} {key}={value}", self.spec());
        self.write("metadata_set", call, |image| {
            image.metadata.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn metadata_remove(&mut self, key: &str) -> EngineResult<()> {
        let call = format!("metadata_remove {} {key}", self.spec());
        self.write("metadata_remove", call, |image| {
            image
                .metadata
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| not_found(format!("metadata key {key}")))
        })
    }
}

fn mode_name(mode: MirrorImageMode) -> &'static str {
    match mode {
        MirrorImageMode::Journal => "journal",
        MirrorImageMode::Snapshot => "snapshot",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoProgress;

    fn cluster() -> MemoryCluster {
        MemoryCluster::new().with_pool("rbd")
    }

    fn opts(order: u8, features: u64) -> CreateOptions {
        CreateOptions {
            order: Some(order),
            features: Some(features),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_stat() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 30, &opts(30, 12)).unwrap();
        let image = pool.open_image("img").unwrap();
        let stat = image.stat().unwrap();
        assert_eq!(stat.order, 30);
        assert_eq!(stat.features, 12);
        assert_eq!(stat.num_objs(), 1);
        assert_eq!(cluster.calls_to("create_image"), vec![
            "create_image rbd/img size=1073741824 order=30 features=12".to_string()
        ]);
    }

    #[test]
    fn test_open_unknown_pool() {
        let err = cluster().open_pool("nope").err().unwrap();
        assert_eq!(err.errno, errno::ENOENT);
    }

    #[test]
    fn test_create_rejects_broken_dependencies() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        let err = pool.create_image("img", 1 << 20, &opts(22, 8)).unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);
        let err = pool.create_image("img", 1 << 20, &opts(40, 0)).unwrap_err();
        assert_eq!(err.errno, errno::EDOM);
    }

    #[test]
    fn test_watchers_block_removal_until_closed() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        let image = pool.open_image("img").unwrap();
        assert_eq!(cluster.watchers("rbd", "", "img"), 1);
        let err = pool.remove_image("img", &NoProgress).unwrap_err();
        assert_eq!(err.errno, errno::EBUSY);
        drop(image);
        pool.remove_image("img", &NoProgress).unwrap();
        assert!(!cluster.image_exists("rbd", "", "img"));
    }

    #[test]
    fn test_feature_updates_respect_dependencies() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        let mut image = pool.open_image("img").unwrap();
        let om = Feature::ObjectMap.bit();
        let el = Feature::ExclusiveLock.bit();
        assert_eq!(image.update_features(om, true).unwrap_err().errno, errno::EINVAL);
        image.update_features(el, true).unwrap();
        image.update_features(om, true).unwrap();
        assert_eq!(image.update_features(el, false).unwrap_err().errno, errno::EINVAL);
        assert_eq!(image.update_features(om, true).unwrap_err().errno, errno::EINVAL);
        let err = image.update_features(Feature::Layering.bit(), false).unwrap_err();
        assert_eq!(err.errno, errno::EINVAL);
    }

    #[test]
    fn test_protected_snapshot_and_children() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("parent", 1 << 20, &opts(22, 1)).unwrap();
        let mut parent = pool.open_image("parent").unwrap();
        parent.snap_create("base").unwrap();
        parent.snap_protect("base").unwrap();
        assert_eq!(parent.snap_remove("base").unwrap_err().errno, errno::EBUSY);

        let child_ctx = cluster.open_pool("rbd").unwrap();
        pool.clone_image("parent", "base", child_ctx.as_ref(), "child", &CreateOptions::default())
            .unwrap();
        assert_eq!(parent.snap_unprotect("base").unwrap_err().errno, errno::EBUSY);

        let mut child = pool.open_image("child").unwrap();
        assert_eq!(child.stat().unwrap().parent.unwrap().image, "parent");
        child.flatten(&NoProgress).unwrap();
        parent.snap_unprotect("base").unwrap();
        parent.snap_remove("base").unwrap();
    }

    #[test]
    fn test_trash_deferment() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        pool.trash_move("img", 3600).unwrap();
        let entries = pool.trash_list().unwrap();
        assert_eq!(entries.len(), 1);
        let id = entries[0].id.clone();

        assert_eq!(pool.trash_remove(&id, false).unwrap_err().errno, errno::EPERM);
        cluster
            .set_trash_deferment("rbd", "", &id, Utc::now() - Duration::seconds(1))
            .unwrap();
        pool.trash_remove(&id, false).unwrap();
        assert!(pool.trash_list().unwrap().is_empty());
    }

    #[test]
    fn test_trash_restore_conflict() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        pool.trash_move("img", 0).unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        let id = pool.trash_list().unwrap()[0].id.clone();
        assert_eq!(pool.trash_restore(&id, "img").unwrap_err().errno, errno::EEXIST);
        pool.trash_restore(&id, "img2").unwrap();
        assert!(cluster.image_exists("rbd", "", "img2"));
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let cluster = cluster();
        cluster.fail_next("open_pool", EngineError::new(errno::EACCES, "denied"));
        assert_eq!(cluster.open_pool("rbd").err().unwrap().errno, errno::EACCES);
        assert!(cluster.open_pool("rbd").is_ok());
    }

    #[test]
    fn test_progress_callback_cancels() {
        struct Stop;
        impl ProgressObserver for Stop {
            fn update(&self, _done: u64, _total: u64) -> bool {
                false
            }
        }
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        let err = pool.remove_image("img", &Stop).unwrap_err();
        assert_eq!(err.errno, errno::ECANCELED);
        assert!(cluster.image_exists("rbd", "", "img"));
    }

    #[test]
    fn test_snapshot_mirroring() {
        let cluster = cluster();
        let pool = cluster.open_pool("rbd").unwrap();
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        let mut image = pool.open_image("img").unwrap();
        assert_eq!(image.mirror_info().unwrap().state, MirrorImageState::Disabled);
        image.mirror_enable(MirrorImageMode::Snapshot).unwrap();
        assert!(image.mirror_info().unwrap().primary);
        image.mirror_create_snapshot().unwrap();
        let snaps = image.snap_list().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].namespace, SnapNamespace::Mirror);
        image.mirror_demote().unwrap();
        image.mirror_resync().unwrap();
        image.mirror_promote(false).unwrap();
        image.mirror_disable(false).unwrap();
        assert!(image.snap_list().unwrap().is_empty());
    }

    #[test]
    fn test_namespace_lifecycle() {
        let cluster = cluster();
        let mut pool = cluster.open_pool("rbd").unwrap();
        pool.namespace_create("ns1").unwrap();
        assert_eq!(pool.namespace_create("ns1").unwrap_err().errno, errno::EEXIST);
        assert_eq!(pool.namespace_list().unwrap(), vec!["ns1".to_string()]);
        pool.set_namespace("ns1");
        pool.create_image("img", 1 << 20, &opts(22, 1)).unwrap();
        assert_eq!(pool.namespace_remove("ns1").unwrap_err().errno, errno::EBUSY);
        pool.remove_image("img", &NoProgress).unwrap();
        pool.namespace_remove("ns1").unwrap();
    }
}
