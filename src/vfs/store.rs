use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::driver::Resource;
use crate::vfs::node::{BranchState, Node};
use crate::vfs::types::{NodeId, NodeKind, Stat};

/// The root node's id. Allocated first at init and never freed.
pub const ROOT_NODE: NodeId = NodeId(1);

/// Owns node memory: the id-keyed arena and the id allocator.
///
/// The store does not manage reference counts or locks; deletion eligibility
/// is the graph's business. Freeing a node only drops it from the table; the
/// memory goes away when the last outstanding `Arc` does.
pub(crate) struct NodeStore {
    nodes: RwLock<FxHashMap<u64, Arc<Node>>>,
    next_id: Mutex<u64>,
}

impl NodeStore {
    pub fn new() -> Self {
        NodeStore {
            nodes: RwLock::new(FxHashMap::default()),
            next_id: Mutex::new(ROOT_NODE.0),
        }
    }

    fn alloc_id(&self) -> NodeId {
        let mut next = self.next_id.lock();
        let id = *next;
        // wrapping_add for parity with handle allocators elsewhere - exhausting
        // u64 is not a practical concern
        *next = next.wrapping_add(1);
        NodeId(id)
    }

    /// Allocate and register a node. The caller is responsible for attaching
    /// it to a parent's child list.
    pub fn new_node(
        &self,
        name: String,
        parent: Option<NodeId>,
        kind: NodeKind,
        mount: Option<NodeId>,
        stat: Stat,
        resource: Option<Arc<Resource>>,
    ) -> Arc<Node> {
        let id = self.alloc_id();
        let node = Arc::new(Node::new(id, name, parent, kind, mount, stat, resource));
        self.nodes.write().insert(id.0, Arc::clone(&node));
        node
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(&id.0).cloned()
    }

    /// Drop a node from the arena. Returns the node so the caller can finish
    /// releasing its resource.
    pub fn free(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.write().remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }
}

/// Prepend a child at the head of a parent's child list. The caller holds the
/// parent's branch lock.
pub(crate) fn attach_child(parent: &mut BranchState, child: NodeId) {
    parent.children.insert(0, child);
}

/// Remove a child from a parent's child list. The caller holds the parent's
/// branch lock.
pub(crate) fn detach_child(parent: &mut BranchState, child: NodeId) {
    parent.children.retain(|&id| id != child);
}
