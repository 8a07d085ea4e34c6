//! Types for cluster state management.

use crate::types::ClusterSnapshotMeta;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Number of applied request ids remembered for replay detection.
pub const REQUEST_CACHE_CAPACITY: usize = 1024;

/// Response from applying a command to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Whether local state changed. `false` for idempotent no-ops.
    pub changed: bool,
    /// Error message if failed.
    pub error: Option<String>,
}

impl ClusterResponse {
    /// Create a success response that changed state.
    pub fn ok() -> Self {
        Self {
            success: true,
            changed: true,
            error: None,
        }
    }

    /// Create a success response for an idempotent no-op.
    pub fn unchanged() -> Self {
        Self {
            success: true,
            changed: false,
            error: None,
        }
    }

    /// Success, changed or not.
    pub fn ok_if(changed: bool) -> Self {
        if changed {
            Self::ok()
        } else {
            Self::unchanged()
        }
    }

    /// Create an error response.
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            changed: false,
            error: Some(msg.into()),
        }
    }
}

/// Bounded memory of applied request ids and their responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCache {
    order: VecDeque<Uuid>,
    responses: HashMap<Uuid, ClusterResponse>,
}

impl RequestCache {
    /// Cached response for `id`, if it was applied recently.
    pub fn get(&self, id: &Uuid) -> Option<&ClusterResponse> {
        self.responses.get(id)
    }

    /// Remember the response for `id`, evicting the oldest entry when full.
    pub fn remember(&mut self, id: Uuid, response: ClusterResponse) {
        if self.responses.insert(id, response).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > REQUEST_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.responses.remove(&evicted);
            }
        }
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> Vec<(Uuid, ClusterResponse)> {
        self.order
            .iter()
            .filter_map(|id| self.responses.get(id).map(|r| (*id, r.clone())))
            .collect()
    }

    /// Rebuild from entries in insertion order.
    pub fn from_entries(entries: Vec<(Uuid, ClusterResponse)>) -> Self {
        let mut cache = Self::default();
        for (id, response) in entries {
            cache.remember(id, response);
        }
        cache
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Stored snapshot data.
#[derive(Debug)]
pub struct StoredSnapshot {
    /// Snapshot metadata.
    pub meta: ClusterSnapshotMeta,
    /// Serialized snapshot image.
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_evicts_oldest() {
        let mut cache = RequestCache::default();
        let first = Uuid::new_v4();
        cache.remember(first, ClusterResponse::ok());
        for _ in 0..REQUEST_CACHE_CAPACITY {
            cache.remember(Uuid::new_v4(), ClusterResponse::unchanged());
        }
        assert_eq!(cache.len(), REQUEST_CACHE_CAPACITY);
        assert!(cache.get(&first).is_none());
    }

    #[test]
    fn entries_round_trip_in_order() {
        let mut cache = RequestCache::default();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.remember(*id, ClusterResponse::ok());
        }
        let rebuilt = RequestCache::from_entries(cache.entries());
        assert_eq!(rebuilt, cache);
    }
}
