//! Mount and unmount: associating a subtree with a driver resource.

use std::sync::Arc;

use crate::driver::{DriverGroup, Resource};
use crate::error::{Result, VfsError};
use crate::vfs::traverse::TraverseFlags;
use crate::vfs::types::NodeKind;
use crate::vfs::Vfs;

impl Vfs {
    /// Mount a driver resource on an existing, childless directory.
    ///
    /// The node's kind flips to `Mount` (`Device` for device-group
    /// resources), its cached mount id becomes its own id, and one reference
    /// is pinned so no prune can free a mountpoint.
    pub fn mount(&self, mountpoint: &str, resource: Resource) -> Result<()> {
        tracing::debug!("mount({:?})", mountpoint);
        let traversal =
            self.traverse(mountpoint, &self.root(), TraverseFlags::default(), None)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(mountpoint.to_string()));
        }
        let node = traversal.node;

        if node.kind() != NodeKind::Dir {
            self.release_node(&node);
            return Err(VfsError::NotADirectory(format!(
                "{} (or already mounted)",
                mountpoint
            )));
        }
        if node.has_children() {
            self.release_node(&node);
            return Err(VfsError::HasChildren(mountpoint.to_string()));
        }

        let kind = match resource.group() {
            DriverGroup::Device => NodeKind::Device,
            _ => NodeKind::Mount,
        };

        {
            let mut props = node.property();
            props.kind = kind;
            props.resource = Some(Arc::new(resource));
            props.mount = Some(node.id());
        }

        // The walk reference is not released: it is the pin that keeps the
        // mountpoint out of every prune path.
        tracing::info!("Mounted {} at {:?}", node.id(), mountpoint);
        Ok(())
    }

    /// Unmount a mountpoint: drop the pin, close the driver resource, delete
    /// all in-memory descendants, and turn the node back into a plain
    /// directory.
    pub fn unmount(&self, mountpoint: &str) -> Result<()> {
        tracing::debug!("unmount({:?})", mountpoint);
        let traversal =
            self.traverse(mountpoint, &self.root(), TraverseFlags::default(), None)?;
        if !traversal.remainder.is_empty() {
            self.release_node(&traversal.node);
            return Err(VfsError::NotFound(mountpoint.to_string()));
        }
        let node = traversal.node;

        if node.mount() != Some(node.id()) {
            self.release_node(&node);
            return Err(VfsError::InvalidArgument("not a mountpoint"));
        }

        // Descendants go first; their resources are released as they die,
        // which lets the driver flush state before close.
        let mut in_use = 0;
        for child_id in node.children() {
            if let Some(child) = self.store.get(child_id) {
                in_use += self.delete_subtree(&child);
            }
        }
        if in_use > 0 {
            self.release_node(&node);
            return Err(VfsError::InUse(in_use as u64));
        }

        let parent_mount = node
            .parent()
            .and_then(|id| self.store.get(id))
            .and_then(|parent| parent.mount());

        let resource = {
            let mut props = node.property();
            props.kind = NodeKind::Dir;
            props.mount = parent_mount;
            props.resource.take()
        };
        if let Some(resource) = resource {
            resource.uninit();
        }

        // Drop the mount pin, then the walk reference.
        node.release();
        self.release_node(&node);

        tracing::info!("Unmounted {:?}", mountpoint);
        Ok(())
    }
}
