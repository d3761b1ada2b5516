//! Graph operations: load, create, remove, rename, link.
//!
//! Load and create are traversals with a materialization callback; the rest
//! interpret a traversal's outcome and mutate the graph under the branch
//! locks of the parents involved.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::driver::{buffer_resource, Resource};
use crate::error::{Result, VfsError};
use crate::vfs::node::{BranchState, Node};
use crate::vfs::path::relative_path_between;
use crate::vfs::store::{attach_child, detach_child};
use crate::vfs::traverse::{MaterializeRequest, Traversal, TraverseFlags};
use crate::vfs::types::{
    kind_from_mode, mode_from_kind, MutationType, NodeId, NodeInfo, NodeKind, RemoveFlags, Stat,
};
use crate::vfs::{check_absolute, Vfs};

impl Vfs {
    /// Resolve a path, materializing nodes from the backing store of the
    /// enclosing mount on a miss. Terminal links are resolved.
    ///
    /// A non-empty remainder means the deepest resolved node is returned and
    /// the path suffix starting at the missing component is the remainder.
    pub fn load_path(&self, path: &str, start: &Arc<Node>) -> Result<Traversal> {
        self.load_path_with(path, start, true)
    }

    pub(crate) fn load_path_with(
        &self,
        path: &str,
        start: &Arc<Node>,
        resolve_links: bool,
    ) -> Result<Traversal> {
        tracing::debug!("load_path({:?})", path);
        let materializer = |req: &MaterializeRequest<'_>| self.load_callback(req);
        self.traverse(
            path,
            start,
            TraverseFlags {
                resolve_links,
                ignore_last: false,
            },
            Some(&materializer),
        )
    }

    /// Resolve a path, creating missing components: intermediate directories
    /// graph-only, the terminal through the enclosing mount's driver (or as
    /// an in-memory buffer-backed node outside any mount).
    ///
    /// Creation converges: an existing terminal of a compatible kind is
    /// returned as-is. A kind conflict is `AlreadyExists`.
    pub fn create_path(&self, path: &str, start: &Arc<Node>, info: &NodeInfo) -> Result<Traversal> {
        tracing::debug!("create_path({:?}, {:o}, {})", path, info.mode, info.kind);
        let created = Cell::new(false);
        let materializer =
            |req: &MaterializeRequest<'_>| self.create_callback(req, info, &created);
        let traversal = self.traverse(
            path,
            start,
            TraverseFlags {
                // A link terminal cannot resolve the link it is about to
                // create; its body is still empty.
                resolve_links: info.kind != NodeKind::Link,
                ignore_last: false,
            },
            Some(&materializer),
        )?;

        if traversal.remainder.is_empty() && !created.get() {
            let existing = traversal.node.kind();
            if !kinds_compatible(info.kind, existing) {
                self.release_node(&traversal.node);
                return Err(VfsError::AlreadyExists(format!(
                    "{} (existing kind {})",
                    path, existing
                )));
            }
        }
        if created.get() {
            self.signal_mutation(MutationType::Created, path);
        }
        Ok(traversal)
    }

    fn load_callback(&self, req: &MaterializeRequest<'_>) -> Result<Option<Arc<Node>>> {
        let Some(mount) = req.mount else {
            // No mount in the ancestry, nothing to load from.
            return Ok(None);
        };
        let Some(mount_res) = mount.resource() else {
            return Ok(None);
        };

        if !req.is_last {
            // Unverified intermediate directory, synthesized for speed.
            return Ok(Some(self.synthesize_dir(req.parent, req.name)));
        }

        let rel = req.mount_rel.unwrap_or(req.name);

        let stat = match mount_res.stat(rel) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::trace!("Driver stat miss for {:?}: {}", rel, e);
                return Ok(None);
            }
        };

        let kind = kind_from_mode(stat.mode);
        if kind == NodeKind::Null {
            return Ok(None);
        }

        let resource = self.instantiate_resource(&mount_res, rel, kind, None)?;
        Ok(Some(self.store.new_node(
            req.name.to_string(),
            Some(req.parent.id()),
            kind,
            req.parent.mount(),
            stat,
            resource,
        )))
    }

    fn create_callback(
        &self,
        req: &MaterializeRequest<'_>,
        info: &NodeInfo,
        created: &Cell<bool>,
    ) -> Result<Option<Arc<Node>>> {
        if !req.is_last {
            return Ok(Some(self.synthesize_dir(req.parent, req.name)));
        }

        let stat = Stat {
            mode: info.mode | mode_from_kind(info.kind),
            nlink: 1,
            ..Stat::default()
        };

        let node = match req.mount {
            Some(mount) => {
                let mount_res = mount.resource().ok_or_else(|| {
                    VfsError::Driver("mount node has no resource".to_string())
                })?;
                let rel = req.mount_rel.unwrap_or(req.name);
                mount_res.create(rel, info.mode, info.kind)?;

                let resource =
                    self.instantiate_resource(&mount_res, rel, info.kind, info.driver_index)?;
                self.store.new_node(
                    req.name.to_string(),
                    Some(req.parent.id()),
                    info.kind,
                    req.parent.mount(),
                    stat,
                    resource,
                )
            }
            None => {
                // In-memory only: buffer-backed where the kind does I/O.
                let resource = if info.kind.is_file_like() {
                    Some(Arc::new(buffer_resource(&self.registry)?))
                } else {
                    None
                };
                self.store.new_node(
                    req.name.to_string(),
                    Some(req.parent.id()),
                    info.kind,
                    req.parent.mount(),
                    stat,
                    resource,
                )
            }
        };

        created.set(true);
        Ok(Some(node))
    }

    fn synthesize_dir(&self, parent: &Arc<Node>, name: &str) -> Arc<Node> {
        let stat = Stat {
            mode: mode_from_kind(NodeKind::Dir) | 0o755,
            nlink: 1,
            ..Stat::default()
        };
        self.store.new_node(
            name.to_string(),
            Some(parent.id()),
            NodeKind::Dir,
            parent.mount(),
            stat,
            None,
        )
    }

    /// Build the resource for a freshly materialized node: state located
    /// through the mount's driver, served by the driver at the inferred (or
    /// overridden) index.
    fn instantiate_resource(
        &self,
        mount_res: &Arc<Resource>,
        rel: &str,
        kind: NodeKind,
        index_override: Option<u64>,
    ) -> Result<Option<Arc<Resource>>> {
        let index = match index_override {
            Some(index) => index,
            None if kind.is_file_like() || kind == NodeKind::Device => mount_res.index() + 1,
            None => return Ok(None), // directories carry no resource
        };
        let driver = self.registry.get(index).ok_or_else(|| {
            VfsError::Driver(format!("no driver registered at index {}", index))
        })?;
        let state = mount_res.locate(rel)?;
        Ok(Some(Arc::new(Resource::new(driver, index, state))))
    }

    /// Remove the node at `path`. The node must be unreferenced; a directory
    /// must be empty. `physical` asks the enclosing mount's driver to remove
    /// the backing object and is mandatory for in-memory-only nodes.
    pub fn remove(&self, path: &str, flags: RemoveFlags) -> Result<()> {
        tracing::debug!("remove({:?}, {:?})", path, flags);
        check_absolute(path)?;
        let traversal = self.traverse(path, &self.root(), TraverseFlags::default(), None)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }
        let node = Arc::clone(&traversal.node);

        let result = self.remove_checked(path, flags, &traversal);
        if result.is_err() {
            // The walk reference goes back the normal way, re-entering the
            // eviction ring at zero.
            self.release_node(&node);
        }
        result
    }

    fn remove_checked(&self, path: &str, flags: RemoveFlags, t: &Traversal) -> Result<()> {
        let node = &t.node;

        // One reference is the walk's own.
        if node.ref_count() > 1 {
            return Err(VfsError::InUse(node.ref_count() - 1));
        }

        if node.kind() == NodeKind::Dir && node.has_children() {
            return Err(VfsError::HasChildren(path.to_string()));
        }

        if t.mount.is_none() && !flags.physical {
            return Err(VfsError::PhysicalDeleteRequired(path.to_string()));
        }

        // Physical removal first: a driver failure leaves the graph intact.
        if flags.physical {
            if let (Some(mount), Some(rel)) = (&t.mount, &t.mount_rel) {
                let res = mount
                    .resource()
                    .ok_or_else(|| VfsError::Driver("mount node has no resource".to_string()))?;
                res.remove(rel)?;
            }
        }

        let parent = node.parent();
        node.release();
        if !self.delete_node(node) {
            // Lost a race with a concurrent revival; hand the walk reference
            // back so the caller's error path can release it normally.
            node.retain();
            return Err(VfsError::InUse(node.ref_count()));
        }

        if flags.prune_upward {
            self.prune_upward(parent);
        }

        self.signal_mutation(MutationType::Removed, path);
        Ok(())
    }

    /// Remove a whole subtree, depth-first postorder. Returns the number of
    /// subtrees that could not be deleted because they are in use.
    pub fn remove_recursive(&self, path: &str, flags: RemoveFlags) -> Result<usize> {
        tracing::debug!("remove_recursive({:?}, {:?})", path, flags);
        check_absolute(path)?;
        let traversal = self.traverse(path, &self.root(), TraverseFlags::default(), None)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(path.to_string()));
        }
        let node = Arc::clone(&traversal.node);

        if node.ref_count() > 1 {
            self.release_node(&node);
            return Err(VfsError::InUse(node.ref_count() - 1));
        }
        if traversal.mount.is_none() && !flags.physical {
            self.release_node(&node);
            return Err(VfsError::PhysicalDeleteRequired(path.to_string()));
        }

        // The driver removes the whole backing subtree in one call; the graph
        // is pruned node by node below.
        if flags.physical {
            if let (Some(mount), Some(rel)) = (&traversal.mount, &traversal.mount_rel) {
                let remove_result = mount
                    .resource()
                    .ok_or_else(|| VfsError::Driver("mount node has no resource".to_string()))
                    .and_then(|res| res.remove(rel));
                if let Err(e) = remove_result {
                    self.release_node(&node);
                    return Err(e);
                }
            }
        }

        node.release();
        let failed = self.delete_subtree(&node);
        if failed == 0 {
            self.signal_mutation(MutationType::Removed, path);
        } else if self.store.get(node.id()).is_some() {
            // The subtree root survived because something below is in use;
            // put it back into the eviction ring.
            self.retain_node(&node);
            self.release_node(&node);
        }
        Ok(failed)
    }

    /// Move and/or rename a node. Same-mount renames are delegated to the
    /// driver; cross-mount renames are unsupported.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        tracing::debug!("rename({:?} -> {:?})", from, to);
        check_absolute(from)?;
        check_absolute(to)?;
        let root = self.root();

        let t_from = self.load_path_with(from, &root, false)?;
        if !t_from.remainder.is_empty() {
            self.release_node(&t_from.node);
            return Err(VfsError::NotFound(from.to_string()));
        }
        let node = Arc::clone(&t_from.node);

        // Destination parent, creating missing intermediate directories.
        let dir_info = NodeInfo::new(NodeKind::Dir, node.stat().mode & 0o7777);
        let created = Cell::new(false);
        let materializer =
            |req: &MaterializeRequest<'_>| self.create_callback(req, &dir_info, &created);
        let t_to = match self.traverse(
            to,
            &root,
            TraverseFlags {
                resolve_links: false,
                ignore_last: true,
            },
            Some(&materializer),
        ) {
            Ok(t) => t,
            Err(e) => {
                self.release_node(&node);
                return Err(e);
            }
        };
        let dest_parent = Arc::clone(&t_to.node);

        let result = self.rename_inner(&node, &dest_parent, &t_from, &t_to, to);

        self.release_node(&dest_parent);
        self.release_node(&node);

        if result.is_ok() {
            self.signal_mutation(MutationType::Renamed, to);
        }
        result
    }

    fn rename_inner(
        &self,
        node: &Arc<Node>,
        dest_parent: &Arc<Node>,
        t_from: &Traversal,
        t_to: &Traversal,
        to: &str,
    ) -> Result<()> {
        let new_name = t_to.remainder.trim_end_matches('/');
        if new_name.is_empty() || new_name == "." || new_name == ".." {
            return Err(VfsError::InvalidArgument("invalid rename destination"));
        }
        if !dest_parent.kind().is_directory_like() {
            return Err(VfsError::NotADirectory(to.to_string()));
        }

        // Moving a directory into its own subtree would orphan it.
        let mut ancestor = Some(dest_parent.id());
        while let Some(id) = ancestor {
            if id == node.id() {
                return Err(VfsError::InvalidArgument(
                    "cannot move a directory into its own subtree",
                ));
            }
            ancestor = self.store.get(id).and_then(|n| n.parent());
        }

        // Cross-mount moves would be copy-then-delete; refuse before any
        // mutation, graph or physical.
        let from_mount = t_from.mount.as_ref().map(|m| m.id());
        let to_mount = t_to.mount.as_ref().map(|m| m.id());
        if from_mount != to_mount {
            return Err(VfsError::CrossMountUnsupported);
        }

        let src_parent_id = node
            .parent()
            .ok_or(VfsError::InUse(node.ref_count()))?; // the root cannot be renamed
        let src_parent = self
            .store
            .get(src_parent_id)
            .ok_or_else(|| VfsError::NotFound(to.to_string()))?;

        let old_name = node.name();

        // Graph first, collision-checked under the branch locks; the driver
        // rename follows and the graph change is undone if it refuses.
        if src_parent.id() == dest_parent.id() {
            {
                let guard = src_parent.branch();
                if self.child_exists(&guard, new_name, Some(node.id())) {
                    return Err(VfsError::AlreadyExists(to.to_string()));
                }
                node.set_name(new_name.to_string());
            }

            if let Err(e) = self.rename_physical(t_from, t_to) {
                let _guard = src_parent.branch();
                node.set_name(old_name);
                return Err(e);
            }
            return Ok(());
        }

        {
            let (mut src_guard, mut dest_guard) = branch_pair(&src_parent, dest_parent);
            if self.child_exists(&dest_guard, new_name, None) {
                return Err(VfsError::AlreadyExists(to.to_string()));
            }

            detach_child(&mut src_guard, node.id());
            attach_child(&mut dest_guard, node.id());
            node.branch().parent = Some(dest_parent.id());
            node.set_name(new_name.to_string());
        }

        if let Err(e) = self.rename_physical(t_from, t_to) {
            let (mut src_guard, mut dest_guard) = branch_pair(&src_parent, dest_parent);
            detach_child(&mut dest_guard, node.id());
            attach_child(&mut src_guard, node.id());
            node.branch().parent = Some(src_parent.id());
            node.set_name(old_name);
            return Err(e);
        }

        Ok(())
    }

    fn rename_physical(&self, t_from: &Traversal, t_to: &Traversal) -> Result<()> {
        if let (Some(mount), Some(from_rel), Some(to_rel)) =
            (&t_from.mount, &t_from.mount_rel, &t_to.mount_rel)
        {
            let res = mount
                .resource()
                .ok_or_else(|| VfsError::Driver("mount node has no resource".to_string()))?;
            res.rename(from_rel, to_rel)?;
        }
        Ok(())
    }

    fn child_exists(
        &self,
        branch: &BranchState,
        name: &str,
        excluding: Option<NodeId>,
    ) -> bool {
        branch.children.iter().any(|&id| {
            if Some(id) == excluding {
                return false;
            }
            self.store
                .get(id)
                .map(|child| child.name_matches(name))
                .unwrap_or(false)
        })
    }

    /// Create a symbolic link at `link_path` whose body is the relative path
    /// to `source`. `mode = None` inherits the source's mode. The link holds
    /// one reference on the resolved source node until it is deleted.
    pub fn link(&self, source: &str, link_path: &str, mode: Option<u32>) -> Result<()> {
        tracing::debug!("link({:?} -> {:?})", link_path, source);
        check_absolute(source)?;
        check_absolute(link_path)?;
        let root = self.root();

        let t_src = self.load_path(source, &root)?;
        if !t_src.remainder.is_empty() {
            self.release_node(&t_src.node);
            return Err(VfsError::NotFound(source.to_string()));
        }
        let origin = t_src.node;
        let mode = mode.unwrap_or_else(|| origin.stat().mode & 0o7777);

        // A link to a link points at the final target. `transferred` marks
        // whether the walk reference on `origin` doubles as the edge's
        // reference on the target.
        let (target, transferred) = match origin.link_target() {
            Some(target_id) => match self.store.get(target_id) {
                Some(target) => {
                    self.retain_node(&target);
                    (target, false)
                }
                None => {
                    self.release_node(&origin);
                    return Err(VfsError::BrokenLink(source.to_string()));
                }
            },
            None => (Arc::clone(&origin), true),
        };

        let result = self.link_inner(source, link_path, mode, &root, &target);

        match &result {
            Ok(()) => {
                if !transferred {
                    self.release_node(&origin);
                }
                self.signal_mutation(MutationType::Linked, link_path);
            }
            Err(_) => {
                self.release_node(&target);
                if !transferred {
                    self.release_node(&origin);
                }
            }
        }
        result
    }

    fn link_inner(
        &self,
        source: &str,
        link_path: &str,
        mode: u32,
        root: &Arc<Node>,
        target: &Arc<Node>,
    ) -> Result<()> {
        let t_dst = self.traverse(
            link_path,
            root,
            TraverseFlags {
                resolve_links: false,
                ignore_last: true,
            },
            None,
        )?;
        let parent = Arc::clone(&t_dst.node);
        let result = self.link_at(source, link_path, mode, &parent, &t_dst, target);
        self.release_node(&parent);
        result
    }

    fn link_at(
        &self,
        source: &str,
        link_path: &str,
        mode: u32,
        parent: &Arc<Node>,
        t_dst: &Traversal,
        target: &Arc<Node>,
    ) -> Result<()> {
        let name = t_dst.remainder.trim_end_matches('/');
        if name.is_empty() {
            return Err(VfsError::InvalidArgument("link path names no component"));
        }
        if !parent.kind().is_directory_like() {
            return Err(VfsError::NotADirectory(link_path.to_string()));
        }

        let stat = Stat {
            mode: mode | mode_from_kind(NodeKind::Link),
            nlink: 1,
            ..Stat::default()
        };

        let mut guard = parent.branch();
        if self.child_exists(&guard, name, None) {
            return Err(VfsError::AlreadyExists(link_path.to_string()));
        }

        // Driver create runs under the branch lock, like any materialization.
        let resource = match (&t_dst.mount, &t_dst.mount_rel) {
            (Some(mount), Some(rel)) => {
                let mount_res = mount
                    .resource()
                    .ok_or_else(|| VfsError::Driver("mount node has no resource".to_string()))?;
                mount_res.create(rel, mode, NodeKind::Link)?;
                self.instantiate_resource(&mount_res, rel, NodeKind::Link, None)?
            }
            _ => Some(Arc::new(buffer_resource(&self.registry)?)),
        };

        let link_node = self.store.new_node(
            name.to_string(),
            Some(parent.id()),
            NodeKind::Link,
            parent.mount(),
            stat,
            resource,
        );
        // Keep the new node out of the eviction ring until it is finished.
        self.retain_node(&link_node);
        attach_child(&mut guard, link_node.id());
        drop(guard);

        let body = relative_path_between(link_path, source);
        if let Err(e) = self.write_at(&link_node, body.as_bytes(), 0) {
            // A half-made link must not stay behind.
            link_node.release();
            self.delete_node(&link_node);
            return Err(e);
        }

        link_node.property().link_target = Some(target.id());
        target.property().stat.nlink += 1;

        tracing::debug!(
            "Linked {} ({}) -> {} ({}), body {:?}",
            link_path,
            link_node.id(),
            source,
            target.id(),
            body
        );
        self.release_node(&link_node);
        Ok(())
    }

    /// Delete unused ancestors bottom-up, stopping at the first node that has
    /// other children, live references, or is a mountpoint.
    pub(crate) fn prune_upward(&self, start: Option<NodeId>) {
        let mut cur = start;
        while let Some(id) = cur {
            let Some(node) = self.store.get(id) else {
                break;
            };
            if !node.kind().is_evictable() {
                break;
            }
            if node.ref_count() > 0 || node.has_children() {
                break;
            }
            let parent = node.parent();
            if !self.delete_node(&node) {
                break;
            }
            tracing::trace!("Pruned unused ancestor {}", id);
            cur = parent;
        }
    }

    /// Depth-first postorder deletion. Returns the number of subtrees left in
    /// place because a node is still referenced.
    pub(crate) fn delete_subtree(&self, node: &Arc<Node>) -> usize {
        let mut failed = 0;
        for child_id in node.children() {
            if let Some(child) = self.store.get(child_id) {
                failed += self.delete_subtree(&child);
            }
        }
        if failed > 0 {
            return failed;
        }
        if node.ref_count() > 0 || !self.delete_node(node) {
            return 1;
        }
        0
    }
}

/// Lock two parents' branch locks in id order, returning the guards in
/// `(a, b)` argument order.
fn branch_pair<'a>(
    a: &'a Arc<Node>,
    b: &'a Arc<Node>,
) -> (MutexGuard<'a, BranchState>, MutexGuard<'a, BranchState>) {
    if a.id().0 < b.id().0 {
        let a_guard = a.branch();
        let b_guard = b.branch();
        (a_guard, b_guard)
    } else {
        let b_guard = b.branch();
        let a_guard = a.branch();
        (a_guard, b_guard)
    }
}

fn kinds_compatible(requested: NodeKind, existing: NodeKind) -> bool {
    if requested == existing {
        return true;
    }
    match requested {
        NodeKind::Dir => existing.is_directory_like(),
        NodeKind::File | NodeKind::Buffer => {
            matches!(existing, NodeKind::File | NodeKind::Buffer)
        }
        _ => false,
    }
}
