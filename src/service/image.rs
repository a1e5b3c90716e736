//! Image sequencers: create, edit, copy, delete, flatten, move to trash

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{image_error, mirroring, order_from_obj_size, run_blocking, snapshot_error, ImageService};
use crate::accessor::{map_pool_error, Accessor};
use crate::cache::PoolListing;
use crate::configuration::{self, OptionDef};
use crate::engine::{
    errno, CreateOptions, ImageHandle, MirrorImageMode, MirrorImageState, PoolContext,
    StorageEngine,
};
use crate::features::{format_features, order_for_disable, order_for_enable, FeatureSet, ALLOW_DISABLE, ALLOW_ENABLE};
use crate::models::{ImageDescriptor, SnapshotDescriptor};
use crate::orchestrator::{TaskContext, TaskHandle, TaskSpec};
use crate::spec::{image_spec, ResourceLocator};
use crate::{Error, Result};

const DEFAULT_WAIT: Duration = Duration::from_secs(2);
const EDIT_WAIT: Duration = Duration::from_secs(4);

/// Object layout shared by create, copy and clone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Object size in bytes, rounded to a power of two
    pub obj_size: Option<u64>,
    /// Feature names; absent uses the cluster default
    pub features: Option<Vec<String>>,
    pub stripe_unit: Option<u64>,
    pub stripe_count: Option<u64>,
    pub data_pool: Option<String>,
}

impl Layout {
    pub fn create_options(&self) -> Result<CreateOptions> {
        Ok(CreateOptions {
            order: order_from_obj_size(self.obj_size),
            features: format_features(self.features.as_deref())?,
            stripe_unit: self.stripe_unit,
            stripe_count: self.stripe_count,
            data_pool: self.data_pool.clone(),
        })
    }

    /// Requested features in the order they are enabled
    fn feature_names(&self) -> Result<Vec<String>> {
        match &self.features {
            Some(names) => Ok(FeatureSet::parse_names(names)?.names()),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateImage {
    pub name: String,
    pub pool_name: String,
    pub namespace: Option<String>,
    pub size: u64,
    #[serde(flatten)]
    pub layout: Layout,
    /// Option overrides; `null` removes one
    #[serde(default)]
    pub configuration: BTreeMap<String, Option<String>>,
    pub mirror_mode: Option<MirrorImageMode>,
    pub schedule_interval: Option<String>,
}

/// Result of a create task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCreated {
    pub image_spec: String,
    pub order: Option<u8>,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditImage {
    /// New name, in the same pool and namespace
    pub name: Option<String>,
    pub size: Option<u64>,
    /// Desired feature set; only flippable features are changed
    pub features: Option<Vec<String>>,
    #[serde(default)]
    pub configuration: BTreeMap<String, Option<String>>,
    pub enable_mirror: Option<bool>,
    pub mirror_mode: Option<MirrorImageMode>,
    pub primary: Option<bool>,
    /// Promote even when the peer is still primary
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub resync: bool,
    pub schedule_interval: Option<String>,
    #[serde(default)]
    pub remove_scheduling: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyImage {
    pub dest_pool_name: String,
    pub dest_namespace: Option<String>,
    pub dest_image_name: String,
    /// Copy the image as of this snapshot
    pub snapshot_name: Option<String>,
    #[serde(flatten)]
    pub layout: Layout,
    #[serde(default)]
    pub configuration: BTreeMap<String, Option<String>>,
}

/// Reject unknown or malformed overrides before anything is submitted
pub(crate) fn validate_configuration(overrides: &BTreeMap<String, Option<String>>) -> Result<()> {
    for (name, value) in overrides {
        let def = OptionDef::lookup(name)?;
        if let Some(value) = value {
            def.validate(value)?;
        }
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl ImageService {
    pub fn create(&self, req: CreateImage) -> Result<TaskHandle> {
        let loc = ResourceLocator::from_parts(&req.pool_name, req.namespace.as_deref(), &req.name)?;
        let opts = req.layout.create_options()?;
        validate_configuration(&req.configuration)?;

        let spec = TaskSpec::new("rbd/create", loc.to_string()).with_metadata(json!({
            "pool_name": loc.pool,
            "namespace": loc.namespace_opt(),
            "image_name": loc.name,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            create_image(&accessor, task, &loc, &req, &opts)
        })
    }

    pub fn edit(&self, loc: ResourceLocator, req: EditImage) -> Result<TaskHandle> {
        loc.validate()?;
        if let Some(name) = &req.name {
            loc.with_name(name.clone()).validate()?;
        }
        let requested = req
            .features
            .as_deref()
            .map(FeatureSet::parse_names)
            .transpose()?;
        validate_configuration(&req.configuration)?;
        if req.enable_mirror == Some(true) && req.mirror_mode.is_none() {
            return Err(Error::InvalidRequest(
                "mirror_mode is required to enable mirroring".into(),
            ));
        }

        let spec = TaskSpec::new("rbd/edit", loc.to_string()).with_metadata(json!({
            "image_spec": loc.to_string(),
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, EDIT_WAIT, vec![loc.pool.clone()], move |task| {
            edit_image(&accessor, task, &loc, &req, requested.as_ref())
        })
    }

    pub fn delete(&self, loc: ResourceLocator) -> Result<TaskHandle> {
        loc.validate()?;
        let spec = TaskSpec::new("rbd/delete", loc.to_string()).with_metadata(json!({
            "image_spec": loc.to_string(),
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            delete_image(&accessor, task, &loc)
        })
    }

    pub fn copy(&self, src: ResourceLocator, req: CopyImage) -> Result<TaskHandle> {
        src.validate()?;
        let dest = ResourceLocator::from_parts(
            &req.dest_pool_name,
            req.dest_namespace.as_deref(),
            &req.dest_image_name,
        )?;
        let opts = req.layout.create_options()?;
        validate_configuration(&req.configuration)?;

        let spec = TaskSpec::new("rbd/copy", dest.to_string()).with_metadata(json!({
            "src_image_spec": src.to_string(),
            "dest_pool_name": dest.pool,
            "dest_namespace": dest.namespace_opt(),
            "dest_image_name": dest.name,
        }));
        let pools = vec![src.pool.clone(), dest.pool.clone()];
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, pools, move |task| {
            copy_image(&accessor, task, &src, &dest, &req, &opts)
        })
    }

    pub fn flatten(&self, loc: ResourceLocator) -> Result<TaskHandle> {
        loc.validate()?;
        let spec = TaskSpec::new("rbd/flatten", loc.to_string()).with_metadata(json!({
            "image_spec": loc.to_string(),
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            let spec = loc.to_string();
            accessor.with_image(&loc, |_, image| {
                task.checkpoint()?;
                image.flatten(&task.range(0, 100)).map_err(image_error(&spec))?;
                tracing::info!(image = %spec, "image flattened");
                Ok(())
            })
        })
    }

    /// Move an image to the trash, removable by purge after `delay_secs`
    pub fn move_to_trash(&self, loc: ResourceLocator, delay_secs: u64) -> Result<TaskHandle> {
        loc.validate()?;
        let spec = TaskSpec::new("rbd/trash/move", loc.to_string()).with_metadata(json!({
            "image_spec": loc.to_string(),
            "delay": delay_secs,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![loc.pool.clone()], move |task| {
            let spec = loc.to_string();
            accessor.with_pool(&loc.pool, &loc.namespace, |ctx| {
                task.checkpoint()?;
                ctx.trash_move(&loc.name, delay_secs).map_err(image_error(&spec))?;
                tracing::info!(image = %spec, delay = delay_secs, "image moved to trash");
                Ok(())
            })
        })
    }

    /// Full description of one image, read directly from the engine
    pub fn get_image(&self, loc: &ResourceLocator) -> Result<ImageDescriptor> {
        loc.validate()?;
        let engine = self.accessor.engine();
        self.accessor
            .with_image(loc, |ctx, image| describe(engine, ctx, image))
    }

    /// Image listings of one pool, or of every block pool
    pub async fn list_images(&self, pool: Option<String>) -> Result<Vec<PoolListing<ImageDescriptor>>> {
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
                .images
                .get(&pool, move || list_pool_images(&accessor, &name))
                .await?;
            listings.push(listing);
        }
        Ok(listings)
    }
}

fn create_image(
    accessor: &Accessor,
    task: &TaskContext,
    loc: &ResourceLocator,
    req: &CreateImage,
    opts: &CreateOptions,
) -> Result<ImageCreated> {
    let spec = loc.to_string();
    task.checkpoint()?;
    accessor.with_pool(&loc.pool, &loc.namespace, |ctx| {
        ctx.create_image(&loc.name, req.size, opts)
            .map_err(image_error(&spec))?;
        tracing::info!(image = %spec, size = req.size, "image created");
        task.set_progress(50);

        // The image stays even when a later step fails
        create_follow_ups(accessor, &*ctx, &spec, loc, req).map_err(|err| {
            tracing::warn!(image = %spec, error = %err, "image created but a follow-up step failed");
            err
        })
    })?;

    Ok(ImageCreated {
        image_spec: spec,
        order: opts.order,
        features: req.layout.feature_names()?,
    })
}

fn create_follow_ups(
    accessor: &Accessor,
    ctx: &dyn PoolContext,
    spec: &str,
    loc: &ResourceLocator,
    req: &CreateImage,
) -> Result<()> {
    let mut image = Accessor::open_image(ctx, &loc.name)?;
    configuration::apply(image.as_mut(), &req.configuration)?;
    if let Some(mode) = req.mirror_mode {
        mirroring::enable(image.as_mut(), spec, mode)?;
    }
    if let Some(interval) = non_empty(&req.schedule_interval) {
        mirroring::schedule_add(accessor.engine(), spec, interval)?;
    }
    Ok(())
}

fn edit_image(
    accessor: &Accessor,
    task: &TaskContext,
    loc: &ResourceLocator,
    req: &EditImage,
    requested: Option<&FeatureSet>,
) -> Result<()> {
    let engine = accessor.engine();
    accessor.with_image(loc, |ctx, image| {
        let mut spec = loc.to_string();

        if let Some(name) = req.name.as_deref().filter(|n| *n != loc.name) {
            task.checkpoint()?;
            ctx.rename_image(&loc.name, name).map_err(image_error(&spec))?;
            tracing::info!(image = %spec, to = %name, "image renamed");
            spec = loc.with_name(name).to_string();
        }

        if let Some(size) = req.size {
            if size != image.size().map_err(image_error(&spec))? {
                task.checkpoint()?;
                image
                    .resize(size, &task.range(10, 60))
                    .map_err(image_error(&spec))?;
                tracing::info!(image = %spec, size, "image resized");
            }
        }

        if let Some(requested) = requested {
            task.checkpoint()?;
            update_features(image, &spec, requested)?;
        }
        task.set_progress(70);

        configuration::apply(image, &req.configuration)?;
        edit_mirroring(engine, image, &spec, req)
    })
}

/// Flip features towards `requested`: dependents off first, prerequisites on first
fn update_features(image: &mut dyn ImageHandle, spec: &str, requested: &FeatureSet) -> Result<()> {
    let current = FeatureSet::from_bits(image.features().map_err(image_error(spec))?);

    for feature in order_for_disable(&current) {
        if requested.contains(feature) || !ALLOW_DISABLE.contains(&feature) {
            continue;
        }
        let now = FeatureSet::from_bits(image.features().map_err(image_error(spec))?);
        if !now.contains(feature) {
            continue;
        }
        tracing::debug!(image = %spec, feature = %feature, "disabling feature");
        image
            .update_features(feature.bit(), false)
            .map_err(image_error(spec))?;
    }

    for feature in order_for_enable(requested) {
        if current.contains(feature) || !ALLOW_ENABLE.contains(&feature) {
            continue;
        }
        let now = FeatureSet::from_bits(image.features().map_err(image_error(spec))?);
        if now.contains(feature) {
            continue;
        }
        tracing::debug!(image = %spec, feature = %feature, "enabling feature");
        image
            .update_features(feature.bit(), true)
            .map_err(image_error(spec))?;
    }
    Ok(())
}

fn edit_mirroring(
    engine: &dyn StorageEngine,
    image: &mut dyn ImageHandle,
    spec: &str,
    req: &EditImage,
) -> Result<()> {
    let info = image.mirror_info().map_err(image_error(spec))?;
    match req.enable_mirror {
        Some(true) if info.state == MirrorImageState::Disabled => {
            let mode = req.mirror_mode.ok_or_else(|| {
                Error::InvalidRequest("mirror_mode is required to enable mirroring".into())
            })?;
            mirroring::enable(image, spec, mode)?;
        }
        Some(false) if info.state == MirrorImageState::Enabled => {
            mirroring::disable(image, spec)?;
        }
        _ => {}
    }

    // Promotion only applies to an image that is mirrored now
    let info = image.mirror_info().map_err(image_error(spec))?;
    if info.state == MirrorImageState::Enabled {
        match req.primary {
            Some(true) if !info.primary => mirroring::promote(image, spec, req.force)?,
            Some(false) if info.primary => mirroring::demote(image, spec)?,
            _ => {}
        }
        if req.resync {
            mirroring::resync(image, spec)?;
        }
    }

    if let Some(interval) = non_empty(&req.schedule_interval) {
        mirroring::schedule_add(engine, spec, interval)?;
    }
    if req.remove_scheduling {
        mirroring::schedule_remove(engine, spec)?;
    }
    Ok(())
}

/// Unprotect every protected snapshot, remove every snapshot, then the image
fn delete_image(accessor: &Accessor, task: &TaskContext, loc: &ResourceLocator) -> Result<()> {
    let spec = loc.to_string();
    accessor.with_pool(&loc.pool, &loc.namespace, |ctx| {
        let mut image = Accessor::open_image(&*ctx, &loc.name)?;
        let snaps = image.snap_list().map_err(image_error(&spec))?;

        for snap in snaps.iter().filter(|s| s.protected) {
            task.checkpoint()?;
            image
                .snap_unprotect(&snap.name)
                .map_err(snapshot_error(&spec, &snap.name))?;
        }
        for (idx, snap) in snaps.iter().enumerate() {
            task.checkpoint()?;
            image
                .snap_remove(&snap.name)
                .map_err(snapshot_error(&spec, &snap.name))?;
            task.set_progress(((idx + 1) * 50 / snaps.len()) as u8);
        }
        drop(image);

        task.checkpoint()?;
        ctx.remove_image(&loc.name, &task.range(50, 100))
            .map_err(image_error(&spec))?;
        tracing::info!(image = %spec, snapshots = snaps.len(), "image deleted");
        Ok(())
    })
}

fn copy_image(
    accessor: &Accessor,
    task: &TaskContext,
    src: &ResourceLocator,
    dest: &ResourceLocator,
    req: &CopyImage,
    opts: &CreateOptions,
) -> Result<()> {
    let src_spec = src.to_string();
    let dest_spec = dest.to_string();

    // Source first, destination nested inside it
    accessor.with_image(src, |_, image| {
        if let Some(snap) = non_empty(&req.snapshot_name) {
            image
                .set_snap(Some(snap))
                .map_err(snapshot_error(&src_spec, snap))?;
        }
        task.checkpoint()?;
        let dest_ctx = accessor.open_pool(&dest.pool, &dest.namespace)?;
        image
            .copy_to(dest_ctx.as_ref(), &dest.name, opts, &task.range(0, 90))
            .map_err(|err| match err.errno {
                errno::EEXIST => Error::AlreadyExists(dest_spec.clone()),
                _ => image_error(&src_spec)(err),
            })?;
        tracing::info!(src = %src_spec, dest = %dest_spec, "image copied");

        let mut dest_image = Accessor::open_image(dest_ctx.as_ref(), &dest.name)?;
        configuration::apply(dest_image.as_mut(), &req.configuration)?;
        drop(dest_image);
        drop(dest_ctx);
        Ok(())
    })
}

/// Describe an open image, including its effective configuration
pub(crate) fn describe(
    engine: &dyn StorageEngine,
    ctx: &dyn PoolContext,
    image: &dyn ImageHandle,
) -> Result<ImageDescriptor> {
    let stat = image.stat()?;
    let spec = image_spec(ctx.pool_name(), Some(ctx.namespace()), &stat.name);
    let mirroring = mirroring::describe(engine, image, &spec)?;
    let snapshots = image
        .snap_list()?
        .into_iter()
        .map(SnapshotDescriptor::from)
        .collect();
    let configuration = configuration::list(engine, ctx, image)?;
    Ok(
        ImageDescriptor::new(stat, ctx.pool_name(), ctx.namespace(), mirroring, snapshots)
            .with_configuration(configuration),
    )
}

/// Every image of `pool`, across all of its namespaces
///
/// Images removed while the listing runs are skipped.
pub(crate) fn list_pool_images(accessor: &Accessor, pool: &str) -> Result<Vec<ImageDescriptor>> {
    let engine = accessor.engine();
    let mut ctx = accessor.open_pool(pool, "")?;
    let mut namespaces = vec![String::new()];
    namespaces.extend(ctx.namespace_list().map_err(|e| map_pool_error(pool, e))?);

    let mut images = Vec::new();
    for namespace in namespaces {
        ctx.set_namespace(&namespace);
        let names = ctx.list_images().map_err(|e| map_pool_error(pool, e))?;
        for name in names {
            let image = match ctx.open_image(&name) {
                Ok(image) => image,
                Err(err) if err.is(errno::ENOENT) => {
                    tracing::debug!(pool = %pool, image = %name, "image vanished while listing");
                    continue;
                }
                Err(err) => return Err(map_pool_error(pool, err)),
            };
            match describe(engine, ctx.as_ref(), image.as_ref()) {
                Ok(descriptor) => images.push(descriptor),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
    }
    Ok(images)
}
