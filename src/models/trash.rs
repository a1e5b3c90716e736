//! Trash model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{TrashInfo, TrashSource};

/// Image waiting in the trash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashEntry {
    /// Image id, which addresses the entry
    pub id: String,
    /// Name the image had before it was moved
    pub name: String,
    pub pool_name: String,
    pub namespace: Option<String>,
    pub source: TrashSource,
    pub deletion_time: DateTime<Utc>,
    /// Purge may only remove the entry after this instant
    pub deferment_end_time: DateTime<Utc>,
}

impl TrashEntry {
    pub fn from_info(info: TrashInfo, pool: &str, namespace: &str) -> Self {
        Self {
            id: info.id,
            name: info.name,
            pool_name: pool.to_string(),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            source: info.source,
            deletion_time: info.deletion_time,
            deferment_end_time: info.deferment_end_time,
        }
    }

    /// Strictly past the deferment end
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deferment_end_time < now
    }
}
