//! Block Image Manager
//!
//! A management plane for block storage images: create, edit, copy, clone,
//! snapshot, trash and namespace operations exposed over a REST API, each
//! mutation running as a tracked background task.
//!
//! # Key Features
//!
//! - **Task tracking** - mutations are serialized per resource and can be polled
//! - **Feature ordering** - dependent image features flip in a valid order
//! - **Cached listings** - pool listings are served from a stale-while-revalidate cache
//! - **Pluggable engine** - any [`engine::StorageEngine`] can back the service
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rbd_manager::engine::MemoryCluster;
//! use rbd_manager::service::CreateImage;
//! use rbd_manager::{ImageService, ServiceConfig};
//!
//! # async fn run() -> rbd_manager::Result<()> {
//! let cluster = MemoryCluster::new().with_pool("rbd");
//! let service = ImageService::new(Arc::new(cluster), ServiceConfig::default());
//!
//! let task = service
//!     .create(CreateImage {
//!         name: "disk0".into(),
//!         pool_name: "rbd".into(),
//!         size: 1 << 30,
//!         ..Default::default()
//!     })?
//!     .wait()
//!     .await;
//! println!("{:?}", task.state);
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod api;
pub mod cache;
pub mod config;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod features;
pub mod models;
pub mod orchestrator;
pub mod service;
pub mod spec;

pub use config::ServiceConfig;
pub use error::{Error, ErrorKind, Result};
pub use features::{Feature, FeatureSet};
pub use orchestrator::{DuplicatePolicy, Orchestrator, TaskHandle};
pub use service::ImageService;
pub use spec::ResourceLocator;
