use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::vfs::types::NodeId;

/// Bounded ring of nodes whose reference count dropped to zero.
///
/// An inserted node stays linked in the tree; the ring entry is the deletion
/// authority for it. When a slot is reused, the previous occupant is handed
/// back to the graph for in-memory deletion. A node that becomes referenced
/// again must be forgotten before its reference is used, so the ring never
/// holds a live node.
pub(crate) struct EvictionCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    slots: Vec<Option<NodeId>>,
    /// Reverse map from node id to occupied slot, for O(1) forget.
    index: FxHashMap<u64, usize>,
    idx: usize,
}

impl EvictionCache {
    pub fn new(capacity: usize) -> Self {
        EvictionCache {
            inner: Mutex::new(CacheInner {
                slots: vec![None; capacity],
                index: FxHashMap::default(),
                idx: 0,
            }),
        }
    }

    /// Insert a zero-ref node, returning the evicted previous occupant of the
    /// slot, if any. Inserting an already-cached node is a no-op.
    pub fn push(&self, id: NodeId) -> Option<NodeId> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&id.0) {
            return None;
        }

        inner.idx = (inner.idx + 1) % inner.slots.len();
        let slot = inner.idx;

        let evicted = inner.slots[slot].take();
        if let Some(old) = evicted {
            inner.index.remove(&old.0);
        }

        inner.slots[slot] = Some(id);
        inner.index.insert(id.0, slot);

        evicted
    }

    /// Drop a node from the ring without deleting it. Called when a cached
    /// node is referenced again or removed explicitly.
    pub fn forget(&self, id: NodeId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.index.remove(&id.0) {
            inner.slots[slot] = None;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.lock().index.contains_key(&id.0)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }
}
