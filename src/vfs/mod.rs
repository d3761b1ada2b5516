//! The VFS node graph core.
//!
//! A `Vfs` owns the node arena, the eviction ring, the driver registry, and
//! the immortal root. Graph operations live in `ops.rs`, the path walker in
//! `traverse.rs`, mounting in `mount.rs`; this module holds the aggregate,
//! the reference-count plumbing, and the thin descriptor-level facade.

mod cache;
pub mod node;
mod mount;
mod ops;
pub mod path;
mod store;
mod traverse;
pub mod types;

pub use path::relative_path_between;
pub use store::ROOT_NODE;
pub use traverse::Traversal;

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::{validate_config, VfsConfig};
use crate::driver::{DriverRegistry, Resource};
use crate::error::{Result, VfsError};
use cache::EvictionCache;
use node::Node;
use store::{detach_child, NodeStore};
use types::{
    mode_from_kind, ListEntry, MutationEvent, MutationType, NodeId, NodeInfo, NodeKind, Stat,
};

/// The filesystem core.
pub struct Vfs {
    pub(crate) store: NodeStore,
    pub(crate) cache: EvictionCache,
    pub(crate) registry: DriverRegistry,
    pub(crate) config: VfsConfig,
    /// Channel for signaling graph mutations to an external observer.
    /// Unbounded because mutation events must never block VFS operations.
    mutation_tx: Option<UnboundedSender<MutationEvent>>,
}

/// An open descriptor: a referenced node plus a byte offset.
///
/// Obtained from [`Vfs::open`] and returned through [`Vfs::close`], which
/// releases the node reference. Dropping a `File` without closing it leaks
/// the reference (the node stays pinned in the graph).
pub struct File {
    node: Arc<Node>,
    offset: u64,
    flags: i32,
    mode: u32,
}

impl File {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }
}

impl Vfs {
    pub fn new(
        config: VfsConfig,
        mutation_tx: Option<UnboundedSender<MutationEvent>>,
    ) -> Result<Self> {
        validate_config(&config)?;

        let vfs = Vfs {
            store: NodeStore::new(),
            cache: EvictionCache::new(config.eviction_cache_size),
            registry: DriverRegistry::new(),
            config,
            mutation_tx,
        };

        let root = vfs.store.new_node(
            String::new(),
            None,
            NodeKind::Root,
            None,
            Stat {
                mode: mode_from_kind(NodeKind::Root) | 0o755,
                nlink: 1,
                ..Stat::default()
            },
            None,
        );
        debug_assert_eq!(root.id(), ROOT_NODE);
        // The eternal pin: the root is never deletable.
        root.retain();

        tracing::info!("Created VFS root ({})", root.id());
        Ok(vfs)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(VfsConfig::default(), None)
    }

    pub fn root(&self) -> Arc<Node> {
        self.store.get(ROOT_NODE).expect("VFS root is immortal")
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Number of nodes currently held in the arena, the root included.
    pub fn node_count(&self) -> usize {
        self.store.len()
    }

    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.store.get(id)
    }

    /// Resolve a path against the in-memory graph only: no materialization,
    /// no link resolution, no reference owed to the caller.
    pub fn peek(&self, path: &str) -> Option<Arc<Node>> {
        let traversal = self
            .traverse(path, &self.root(), Default::default(), None)
            .ok()?;
        let found = traversal.remainder.is_empty();
        let node = Arc::clone(&traversal.node);
        self.release_node(&traversal.node);
        found.then_some(node)
    }

    pub(crate) fn signal_mutation(&self, mutation: MutationType, path: &str) {
        if let Some(tx) = &self.mutation_tx {
            let event = MutationEvent {
                path: path.to_string(),
                mutation,
            };
            if let Err(e) = tx.send(event) {
                tracing::debug!("Failed to signal mutation for {:?}: {}", path, e);
            }
        }
    }

    // --- reference counting -------------------------------------------------

    /// Take a reference on a node. A node revived from zero leaves the
    /// eviction ring.
    pub fn retain_node(&self, node: &Arc<Node>) {
        if node.retain() == 0 {
            self.cache.forget(node.id());
        }
    }

    /// Give back a reference. On the drop to zero the node enters the
    /// eviction ring (mounts and the root are exempt), which may push out and
    /// delete the oldest cached node.
    pub fn release_node(&self, node: &Arc<Node>) {
        if node.release() == 1 && node.kind().is_evictable() {
            if let Some(victim) = self.cache.push(node.id()) {
                self.evict(victim);
            }
        }
    }

    fn evict(&self, id: NodeId) {
        if let Some(node) = self.store.get(id) {
            if self.delete_node(&node) {
                tracing::trace!("Evicted node {}", id);
            }
        }
    }

    // --- deletion ----------------------------------------------------------

    /// Delete a node from the graph: detach from the parent, release the
    /// resource, free the arena slot, and drop a link's target reference.
    ///
    /// Re-verifies eligibility under the parent's branch lock and returns
    /// false if the node was revived, grew children, or is not deletable.
    /// The driver is never consulted here; physical removal is the remove
    /// operation's business.
    pub(crate) fn delete_node(&self, node: &Arc<Node>) -> bool {
        if !node.kind().is_evictable() {
            return false;
        }
        let Some(parent) = node.parent().and_then(|id| self.store.get(id)) else {
            return false;
        };

        {
            let mut guard = parent.branch();
            // A concurrent rename may have moved the node.
            if node.parent() != Some(parent.id()) {
                return false;
            }
            if node.ref_count() > 0 || node.has_children() {
                return false;
            }
            detach_child(&mut guard, node.id());
        }

        let (resource, link_target) = {
            let mut props = node.property();
            (props.resource.take(), props.link_target.take())
        };
        if let Some(resource) = resource {
            resource.uninit();
        }

        self.cache.forget(node.id());
        self.store.free(node.id());

        if let Some(target_id) = link_target {
            if let Some(target) = self.store.get(target_id) {
                {
                    let mut props = target.property();
                    props.stat.nlink = props.stat.nlink.saturating_sub(1);
                }
                self.release_node(&target);
            }
        }

        tracing::trace!("Deleted node {}", node.id());
        true
    }

    // --- descriptor facade --------------------------------------------------

    /// Open a file, materializing graph nodes from the backing store as
    /// needed. `O_CREAT` creates the terminal through the enclosing mount's
    /// driver.
    pub fn open(&self, path: &str, flags: i32, mode: u32) -> Result<File> {
        tracing::debug!("open({:?}, {:#x}, {:o})", path, flags, mode);
        check_absolute(path)?;

        let creating = flags & libc::O_CREAT != 0;
        if creating && mode == 0 {
            return Err(VfsError::InvalidArgument("mode 0 on create"));
        }

        let root = self.root();
        let traversal = if creating {
            self.create_path(path, &root, &NodeInfo::new(NodeKind::File, mode))?
        } else {
            self.load_path(path, &root)?
        };
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }
        let node = traversal.node;

        if let Some(resource) = self.effective_resource(&node) {
            if let Err(e) = resource.driver().open(&resource, flags, mode) {
                self.release_node(&node);
                return Err(e);
            }
        }

        Ok(File {
            node,
            offset: 0,
            flags,
            mode,
        })
    }

    pub fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let node = self.effective_node(&file.node);
        let resource = node
            .resource()
            .ok_or_else(|| VfsError::Driver("node has no resource".to_string()))?;
        let n = resource.read(buf, file.offset)?;
        file.offset += n as u64;
        Ok(n)
    }

    pub fn write(&self, file: &mut File, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.write_at(&file.node, buf, file.offset)?;
        file.offset += n as u64;
        Ok(n)
    }

    /// Write through a node's effective resource, growing the cached size.
    /// Shared by the descriptor write path and link body installation.
    pub(crate) fn write_at(&self, node: &Arc<Node>, buf: &[u8], offset: u64) -> Result<usize> {
        let node = self.effective_node(node);
        let resource = node
            .resource()
            .ok_or_else(|| VfsError::Driver("node has no resource".to_string()))?;
        let n = resource.write(buf, offset)?;

        let mut props = node.property();
        let end = offset + n as u64;
        if end > props.stat.size {
            props.stat.size = end;
        }
        Ok(n)
    }

    /// Move a descriptor's offset. Positions are clamped to the file size;
    /// `End(0)` lands on the last byte.
    pub fn seek(&self, file: &mut File, pos: SeekFrom) -> Result<u64> {
        let node = self.effective_node(&file.node);
        let size = node.stat().size;

        let new_offset = match pos {
            SeekFrom::Start(offset) => {
                if offset < size {
                    offset
                } else {
                    file.offset
                }
            }
            SeekFrom::Current(delta) => {
                let target = file.offset as i64 + delta;
                target.clamp(0, size as i64) as u64
            }
            SeekFrom::End(delta) => {
                let target = size as i64 - delta - 1;
                target.clamp(0, size as i64) as u64
            }
        };

        file.offset = new_offset;
        if let Some(resource) = node.resource() {
            resource.driver().seek(&resource, new_offset)?;
        }
        Ok(new_offset)
    }

    /// Close a descriptor, releasing its node reference. At zero references
    /// the node enters the eviction ring.
    pub fn close(&self, file: File) -> Result<()> {
        tracing::debug!("close({})", file.node.id());
        if let Some(resource) = self.effective_resource(&file.node) {
            if let Err(e) = resource.driver().close(&resource) {
                tracing::warn!("Driver close failed for {}: {}", file.node.id(), e);
            }
        }
        self.release_node(&file.node);
        Ok(())
    }

    /// Attributes of the entry at `path`, through a terminal link.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        check_absolute(path)?;
        let traversal = self.load_path(path, &self.root())?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }
        let stat = self.effective_node(&traversal.node).stat();
        self.release_node(&traversal.node);
        Ok(stat)
    }

    /// List the children of the entry at `path`, descending `depth` levels
    /// into subdirectories. Link entries carry their body.
    pub fn list(&self, path: &str, depth: usize) -> Result<Vec<ListEntry>> {
        check_absolute(path)?;
        let traversal = self.traverse(path, &self.root(), Default::default(), None)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }

        let mut entries = Vec::new();
        self.list_children(&traversal.node, depth, 0, &mut entries);
        self.release_node(&traversal.node);
        Ok(entries)
    }

    fn list_children(
        &self,
        node: &Arc<Node>,
        remaining: usize,
        depth: usize,
        out: &mut Vec<ListEntry>,
    ) {
        for child_id in node.children() {
            let Some(child) = self.store.get(child_id) else {
                continue;
            };
            let stat = child.stat();
            let kind = child.kind();
            let link_to = if kind == NodeKind::Link {
                self.read_link_body(&child)
            } else {
                None
            };
            out.push(ListEntry {
                name: child.name(),
                kind,
                mode: stat.mode,
                size: stat.size,
                depth,
                link_to,
            });
            if remaining > 0 && kind.is_directory_like() {
                self.list_children(&child, remaining - 1, depth + 1, out);
            }
        }
    }

    /// Create the entry at `path` and release it immediately: the node stays
    /// cached in the graph at zero references.
    pub fn create(&self, path: &str, info: &NodeInfo) -> Result<()> {
        check_absolute(path)?;
        if info.mode == 0 {
            return Err(VfsError::InvalidArgument("mode 0 on create"));
        }
        let traversal = self.create_path(path, &self.root(), info)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }
        self.release_node(&traversal.node);
        Ok(())
    }

    // --- internals ----------------------------------------------------------

    /// Follow a resolved link to the node that actually does I/O.
    fn effective_node(&self, node: &Arc<Node>) -> Arc<Node> {
        if node.kind() == NodeKind::Link {
            if let Some(target) = node.link_target().and_then(|id| self.store.get(id)) {
                return target;
            }
        }
        Arc::clone(node)
    }

    fn effective_resource(&self, node: &Arc<Node>) -> Option<Arc<Resource>> {
        self.effective_node(node).resource()
    }
}

pub(crate) fn check_absolute(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(VfsError::InvalidArgument("empty path"));
    }
    if !path.starts_with('/') {
        return Err(VfsError::InvalidArgument("path must be absolute"));
    }
    Ok(())
}
