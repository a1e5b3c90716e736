//! Per-image mirroring steps shared by the image sequencers

use crate::engine::{ImageHandle, MirrorImageMode, MirrorImageState, StorageEngine};
use crate::models::MirroringDescriptor;
use crate::Result;

use super::image_error;

/// Current mirroring state with the configured snapshot schedules
pub fn describe(
    engine: &dyn StorageEngine,
    image: &dyn ImageHandle,
    spec: &str,
) -> Result<MirroringDescriptor> {
    let info = image.mirror_info().map_err(image_error(spec))?;
    let mode = if info.state == MirrorImageState::Enabled {
        Some(image.mirror_mode().map_err(image_error(spec))?)
    } else {
        None
    };
    let intervals = engine.schedule_list(spec)?;
    Ok(MirroringDescriptor::new(info, mode, intervals))
}

pub fn enable(image: &mut dyn ImageHandle, spec: &str, mode: MirrorImageMode) -> Result<()> {
    tracing::info!(image = %spec, mode = ?mode, "enabling mirroring");
    image.mirror_enable(mode).map_err(image_error(spec))
}

pub fn disable(image: &mut dyn ImageHandle, spec: &str) -> Result<()> {
    tracing::info!(image = %spec, "disabling mirroring");
    image.mirror_disable(false).map_err(image_error(spec))
}

pub fn promote(image: &mut dyn ImageHandle, spec: &str, force: bool) -> Result<()> {
    tracing::info!(image = %spec, force, "promoting image");
    image.mirror_promote(force).map_err(image_error(spec))
}

pub fn demote(image: &mut dyn ImageHandle, spec: &str) -> Result<()> {
    tracing::info!(image = %spec, "demoting image");
    image.mirror_demote().map_err(image_error(spec))
}

pub fn resync(image: &mut dyn ImageHandle, spec: &str) -> Result<()> {
    tracing::info!(image = %spec, "requesting resync");
    image.mirror_resync().map_err(image_error(spec))
}

/// Snapshot-mode images get a mirror snapshot instead of a user one
pub fn wants_mirror_snapshot(image: &dyn ImageHandle, spec: &str) -> Result<bool> {
    let info = image.mirror_info().map_err(image_error(spec))?;
    if info.state != MirrorImageState::Enabled {
        return Ok(false);
    }
    Ok(image.mirror_mode().map_err(image_error(spec))? == MirrorImageMode::Snapshot)
}

pub fn schedule_add(engine: &dyn StorageEngine, spec: &str, interval: &str) -> Result<()> {
    tracing::info!(image = %spec, interval = %interval, "adding mirror snapshot schedule");
    Ok(engine.schedule_add(spec, interval)?)
}

pub fn schedule_remove(engine: &dyn StorageEngine, spec: &str) -> Result<()> {
    tracing::info!(image = %spec, "removing mirror snapshot schedule");
    Ok(engine.schedule_remove(spec)?)
}
