//! Scoped access to pools and images
//!
//! Every engine call runs inside a pool context scoped to a namespace, and
//! most also need an open image. Handles are released on every path, the
//! image before its pool context.

use std::sync::Arc;

use crate::engine::{errno, EngineError, ImageHandle, PoolContext, StorageEngine};
use crate::spec::ResourceLocator;
use crate::{Error, Result};

/// Opens pool contexts and images on behalf of the sequencers
#[derive(Clone)]
pub struct Accessor {
    engine: Arc<dyn StorageEngine>,
}

impl Accessor {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    /// Open `pool` and switch to `namespace`, which must exist
    pub fn open_pool(&self, pool: &str, namespace: &str) -> Result<Box<dyn PoolContext>> {
        let mut ctx = self
            .engine
            .open_pool(pool)
            .map_err(|e| map_open_error(e, Error::PoolNotFound(pool.to_string()), pool))?;
        if !namespace.is_empty() {
            let namespaces = ctx.namespace_list().map_err(|e| map_pool_error(pool, e))?;
            if !namespaces.iter().any(|ns| ns == namespace) {
                return Err(Error::NamespaceNotFound(format!("{pool}/{namespace}")));
            }
            ctx.set_namespace(namespace);
        }
        tracing::debug!(pool = %pool, namespace = %namespace, "pool context opened");
        Ok(ctx)
    }

    /// Open an image inside an already scoped context
    pub fn open_image(ctx: &dyn PoolContext, name: &str) -> Result<Box<dyn ImageHandle>> {
        let spec = crate::spec::image_spec(ctx.pool_name(), Some(ctx.namespace()), name);
        ctx.open_image(name)
            .map_err(|e| map_open_error(e, Error::ImageNotFound(spec.clone()), &spec))
    }

    /// Run `f` with a pool context; the context is released when `f` returns
    pub fn with_pool<T>(
        &self,
        pool: &str,
        namespace: &str,
        f: impl FnOnce(&mut dyn PoolContext) -> Result<T>,
    ) -> Result<T> {
        let mut ctx = self.open_pool(pool, namespace)?;
        let out = f(ctx.as_mut());
        drop(ctx);
        out
    }

    /// Run `f` with the image at `loc` open
    pub fn with_image<T>(
        &self,
        loc: &ResourceLocator,
        f: impl FnOnce(&dyn PoolContext, &mut dyn ImageHandle) -> Result<T>,
    ) -> Result<T> {
        let ctx = self.open_pool(&loc.pool, &loc.namespace)?;
        let mut image = Self::open_image(ctx.as_ref(), &loc.name)?;
        let out = f(ctx.as_ref(), image.as_mut());
        drop(image);
        drop(ctx);
        out
    }
}

/// Map a failure to open a pool or an image; `missing` is used for ENOENT
fn map_open_error(err: EngineError, missing: Error, what: &str) -> Error {
    match err.errno {
        errno::ENOENT => missing,
        errno::EPERM | errno::EACCES => Error::PermissionDenied(format!("{what}: {}", err.message)),
        errno::EBUSY => Error::Busy(format!("{what}: {}", err.message)),
        _ => Error::Engine(err),
    }
}

/// Map a pool level failure that is not about opening it
pub fn map_pool_error(pool: &str, err: EngineError) -> Error {
    match err.errno {
        errno::EPERM | errno::EACCES => Error::PermissionDenied(format!("{pool}: {}", err.message)),
        _ => Error::Engine(err),
    }
}
