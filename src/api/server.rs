//! HTTP server

use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};
use crate::service::ImageService;

/// HTTP API Server
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Create a new server
    pub fn new(service: ImageService, addr: SocketAddr) -> Self {
        Self {
            router: router(Arc::new(service)),
            addr,
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind the configured address and serve until the process stops
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), std::io::Error> {
        tracing::info!("Starting API server on {}", listener.local_addr()?);
        axum::serve(listener, self.router).await
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/api/block/rbd/status", get(handlers::status))

        // Images
        .route(
            "/api/block/image",
            get(handlers::list_images).post(handlers::create_image),
        )
        .route("/api/block/image/default_features", get(handlers::default_features))
        .route(
            "/api/block/image/clone_format_version",
            get(handlers::clone_format_version),
        )
        .route(
            "/api/block/image/:spec",
            get(handlers::get_image)
                .put(handlers::edit_image)
                .delete(handlers::delete_image),
        )
        .route("/api/block/image/:spec/copy", post(handlers::copy_image))
        .route("/api/block/image/:spec/flatten", post(handlers::flatten_image))
        .route("/api/block/image/:spec/move_trash", post(handlers::move_trash))

        // Snapshots
        .route("/api/block/image/:spec/snap", post(handlers::create_snapshot))
        .route(
            "/api/block/image/:spec/snap/:snap",
            put(handlers::edit_snapshot).delete(handlers::delete_snapshot),
        )
        .route(
            "/api/block/image/:spec/snap/:snap/rollback",
            post(handlers::rollback_snapshot),
        )
        .route(
            "/api/block/image/:spec/snap/:snap/clone",
            post(handlers::clone_snapshot),
        )

        // Trash
        .route("/api/block/image/trash", get(handlers::list_trash))
        .route("/api/block/image/trash/purge", post(handlers::purge_trash))
        .route(
            "/api/block/image/trash/:id_spec",
            axum::routing::delete(handlers::remove_trash),
        )
        .route(
            "/api/block/image/trash/:id_spec/restore",
            post(handlers::restore_trash),
        )

        // Pools and namespaces
        .route("/api/block/pool/:pool/images", get(handlers::list_pool_images))
        .route(
            "/api/block/pool/:pool/namespace",
            get(handlers::list_namespaces).post(handlers::create_namespace),
        )
        .route(
            "/api/block/pool/:pool/namespace/:namespace",
            axum::routing::delete(handlers::delete_namespace),
        )

        // Tasks
        .route("/api/task", get(handlers::list_tasks))
        .route(
            "/api/task/:id",
            get(handlers::get_task).delete(handlers::cancel_task),
        )

        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
