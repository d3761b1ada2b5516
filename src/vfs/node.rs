use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::driver::Resource;
use crate::vfs::types::{NodeId, NodeKind, Stat};

/// Tree-shape state of a node, guarded by the branch lock.
///
/// Children are ordered head-first: attaching prepends, so the most recently
/// created child is scanned first.
#[derive(Debug, Default)]
pub(crate) struct BranchState {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Attribute state of a node, guarded by the property lock.
pub(crate) struct Properties {
    pub kind: NodeKind,
    /// Nearest ancestor of kind Mount, inclusive. Cached; recomputable by
    /// walking up.
    pub mount: Option<NodeId>,
    pub stat: Stat,
    pub resource: Option<Arc<Resource>>,
    /// For Link nodes, the resolved target. Holds exactly one reference on
    /// the target, released when the link is deleted.
    pub link_target: Option<NodeId>,
}

/// A single vertex of the VFS graph.
///
/// The branch lock guards the child list, the parent link, and (together with
/// the parent's branch lock) the name. The property lock guards kind, mount,
/// stat, resource, and link target. The reference count is atomic and may be
/// read without either lock.
pub struct Node {
    id: NodeId,
    ref_count: AtomicU64,
    name: RwLock<String>,
    branch: Mutex<BranchState>,
    property: Mutex<Properties>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        parent: Option<NodeId>,
        kind: NodeKind,
        mount: Option<NodeId>,
        stat: Stat,
        resource: Option<Arc<Resource>>,
    ) -> Self {
        Node {
            id,
            ref_count: AtomicU64::new(0),
            name: RwLock::new(name),
            branch: Mutex::new(BranchState {
                parent,
                children: Vec::new(),
            }),
            property: Mutex::new(Properties {
                kind,
                mount,
                stat,
                resource,
                link_target: None,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Compare the name against a path component without cloning. Safe during
    /// a parent-locked child scan: renames hold the parent's branch lock.
    pub(crate) fn name_matches(&self, component: &str) -> bool {
        *self.name.read() == *component
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Increment the reference count, returning the previous value.
    pub(crate) fn retain(&self) -> u64 {
        self.ref_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrement the reference count, returning the previous value.
    pub(crate) fn release(&self) -> u64 {
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reference count underflow on node {}", self.id);
        prev
    }

    pub(crate) fn branch(&self) -> MutexGuard<'_, BranchState> {
        self.branch.lock()
    }

    pub(crate) fn property(&self) -> MutexGuard<'_, Properties> {
        self.property.lock()
    }

    pub fn kind(&self) -> NodeKind {
        self.property.lock().kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.branch.lock().parent
    }

    pub fn mount(&self) -> Option<NodeId> {
        self.property.lock().mount
    }

    pub fn stat(&self) -> Stat {
        self.property.lock().stat
    }

    pub fn link_target(&self) -> Option<NodeId> {
        self.property.lock().link_target
    }

    /// The node's own resource handle, cloned out so I/O can proceed without
    /// holding the property lock across a blocking driver call.
    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.property.lock().resource.clone()
    }

    pub fn has_children(&self) -> bool {
        !self.branch.lock().children.is_empty()
    }

    /// Snapshot of the child list, head first.
    pub fn children(&self) -> Vec<NodeId> {
        self.branch.lock().children.clone()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("kind", &self.property.lock().kind)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
