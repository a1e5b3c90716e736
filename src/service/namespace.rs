//! Namespaces of a pool

use std::time::Duration;

use serde_json::json;

use super::ImageService;
use crate::accessor::map_pool_error;
use crate::engine::errno;
use crate::models::NamespaceInfo;
use crate::orchestrator::{TaskHandle, TaskSpec};
use crate::{Error, Result};

const DEFAULT_WAIT: Duration = Duration::from_secs(2);

fn check_namespace(pool: &str, namespace: &str) -> Result<()> {
    if pool.is_empty() || pool.contains('/') {
        return Err(Error::InvalidSpec(format!("invalid pool name '{pool}'")));
    }
    if namespace.is_empty() || namespace.contains('/') {
        return Err(Error::InvalidSpec(format!("invalid namespace name '{namespace}'")));
    }
    Ok(())
}

impl ImageService {
    /// Named namespaces of `pool` with their image counts
    pub fn list_namespaces(&self, pool: &str) -> Result<Vec<NamespaceInfo>> {
        self.accessor.with_pool(pool, "", |ctx| {
            let namespaces = ctx.namespace_list().map_err(|e| map_pool_error(pool, e))?;
            let mut out = Vec::with_capacity(namespaces.len());
            for namespace in namespaces {
                ctx.set_namespace(&namespace);
                let num_images = ctx
                    .list_images()
                    .map_err(|e| map_pool_error(pool, e))?
                    .len();
                out.push(NamespaceInfo {
                    pool: pool.to_string(),
                    namespace,
                    num_images,
                });
            }
            Ok(out)
        })
    }

    pub fn create_namespace(&self, pool: String, namespace: String) -> Result<TaskHandle> {
        check_namespace(&pool, &namespace)?;
        let key = format!("{pool}/{namespace}");
        let spec = TaskSpec::new("rbd/namespace/create", key.clone()).with_metadata(json!({
            "pool_name": pool,
            "namespace": namespace,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![pool.clone()], move |task| {
            accessor.with_pool(&pool, "", |ctx| {
                task.checkpoint()?;
                let existing = ctx.namespace_list().map_err(|e| map_pool_error(&pool, e))?;
                if existing.iter().any(|ns| *ns == namespace) {
                    return Err(Error::AlreadyExists(format!("namespace {key}")));
                }
                ctx.namespace_create(&namespace)
                    .map_err(|e| map_pool_error(&pool, e))?;
                tracing::info!(namespace = %key, "namespace created");
                Ok(())
            })
        })
    }

    /// Remove an empty namespace
    pub fn delete_namespace(&self, pool: String, namespace: String) -> Result<TaskHandle> {
        check_namespace(&pool, &namespace)?;
        let key = format!("{pool}/{namespace}");
        let spec = TaskSpec::new("rbd/namespace/delete", key.clone()).with_metadata(json!({
            "pool_name": pool,
            "namespace": namespace,
        }));
        let accessor = self.accessor.clone();
        self.submit(spec, DEFAULT_WAIT, vec![pool.clone()], move |task| {
            task.checkpoint()?;
            let images = accessor
                .with_pool(&pool, &namespace, |ctx| {
                    ctx.list_images().map_err(|e| map_pool_error(&pool, e))
                })?;
            let not_empty = || {
                Error::referential(
                    "namespace_contains_images",
                    format!("Namespace {key} contains images which must be deleted first"),
                )
            };
            if !images.is_empty() {
                return Err(not_empty());
            }
            // An image may land between the check and the removal
            accessor.with_pool(&pool, "", |ctx| {
                ctx.namespace_remove(&namespace).map_err(|e| match e.errno {
                    errno::EBUSY | errno::ENOTEMPTY => not_empty(),
                    _ => map_pool_error(&pool, e),
                })
            })?;
            tracing::info!(namespace = %key, "namespace deleted");
            Ok(())
        })
    }
}
