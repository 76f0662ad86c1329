//! Cluster topology held by a connection factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relaymq_protocol::{ConnectionFactoryDelegate, TopologySnapshot};
use tracing::debug;

/// Current topology of one connection factory.
///
/// Readers get an `Arc` to an immutable snapshot; a replacement swaps the
/// pointer, so a reader sees either the old or the new topology in full.
#[derive(Debug)]
pub struct TopologyManager {
    current: RwLock<Arc<TopologySnapshot>>,
}

impl TopologyManager {
    /// Creates an empty topology for the named factory.
    pub fn new(factory_name: impl Into<String>) -> Self {
        let snapshot = TopologySnapshot {
            factory_name: factory_name.into(),
            ..Default::default()
        };
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replaces delegates and failover map in one step.
    pub fn replace(
        &self,
        delegates: Vec<ConnectionFactoryDelegate>,
        failover_map: BTreeMap<u32, u32>,
    ) -> Arc<TopologySnapshot> {
        let mut current = self.current.write();
        let next = Arc::new(TopologySnapshot {
            factory_name: current.factory_name.clone(),
            delegates,
            failover_map,
        });
        debug!(
            factory = %next.factory_name,
            delegates = next.delegates.len(),
            failover_entries = next.failover_map.len(),
            "Topology replaced"
        );
        *current = Arc::clone(&next);
        next
    }
}
