//! Mapping from engine-assigned node identifiers to handles of live surface
//! nodes.

use std::collections::HashMap;

use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::marshal::NodeId;

/// One live surface object per node id at a time. Replacement hands the
/// displaced handle back to the caller, which is responsible for releasing
/// it so the slot does not leak.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Handle>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: NodeId, handle: Handle) -> Option<Handle> {
        let displaced = self.nodes.insert(id, handle);
        if displaced.is_some() {
            log::warn!("node id {id} remapped to {handle} while still registered");
        }
        displaced
    }

    pub fn get(&self, id: NodeId) -> Result<Handle> {
        self.nodes
            .get(&id)
            .copied()
            .ok_or(BridgeError::UnknownNode(id))
    }

    pub fn remove(&mut self, id: NodeId) -> Result<Handle> {
        self.nodes.remove(&id).ok_or(BridgeError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
