//! Namespace model

use serde::{Deserialize, Serialize};

/// Namespace inside a pool, with its image count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub pool: String,
    pub namespace: String,
    pub num_images: usize,
}
