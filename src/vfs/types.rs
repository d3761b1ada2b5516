use serde::{Deserialize, Serialize};

/// Stable identifier of a node in the graph arena.
///
/// Ids are allocated once and never reused while the node is alive; handing
/// out ids instead of references keeps sibling and parent links free of
/// ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of a filesystem entry. Discriminants are part of the public
/// contract and match the driver wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum NodeKind {
    #[default]
    Null = 0,
    File = 1,
    Dir = 2,
    Mount = 3,
    Root = 4,
    Link = 5,
    Buffer = 6,
    Fifo = 7,
    Device = 8,
}

impl NodeKind {
    /// Kinds a traversal may descend through.
    pub fn is_directory_like(&self) -> bool {
        matches!(
            self,
            NodeKind::Dir | NodeKind::Mount | NodeKind::Root | NodeKind::Device
        )
    }

    /// Kinds whose driver index is inferred as the mount's index + 1.
    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            NodeKind::File | NodeKind::Link | NodeKind::Buffer | NodeKind::Fifo
        )
    }

    /// Kinds eligible for the eviction ring. Mounts and the root are pinned.
    pub fn is_evictable(&self) -> bool {
        !matches!(self, NodeKind::Mount | NodeKind::Root)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeKind::Null => "Null",
            NodeKind::File => "File",
            NodeKind::Dir => "Directory",
            NodeKind::Mount => "Mount",
            NodeKind::Root => "Root",
            NodeKind::Link => "Link",
            NodeKind::Buffer => "Buffer",
            NodeKind::Fifo => "FIFO",
            NodeKind::Device => "Device",
        };
        write!(f, "{}", name)
    }
}

/// Attributes of a filesystem entry, as reported by drivers and cached on the
/// node. Timestamps are seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Infer a node kind from stat mode type bits.
pub fn kind_from_mode(mode: u32) -> NodeKind {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => NodeKind::Dir,
        m if m == libc::S_IFLNK as u32 => NodeKind::Link,
        m if m == libc::S_IFREG as u32 => NodeKind::File,
        m if m == libc::S_IFIFO as u32 => NodeKind::Fifo,
        m if m == libc::S_IFCHR as u32 || m == libc::S_IFBLK as u32 => NodeKind::Device,
        _ => NodeKind::Null,
    }
}

/// Mode type bits for a node kind. The inverse of [`kind_from_mode`] for the
/// kinds that have a stat representation.
pub fn mode_from_kind(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::Dir | NodeKind::Mount | NodeKind::Root => libc::S_IFDIR as u32,
        NodeKind::Link => libc::S_IFLNK as u32,
        NodeKind::File | NodeKind::Buffer => libc::S_IFREG as u32,
        NodeKind::Fifo => libc::S_IFIFO as u32,
        NodeKind::Device => libc::S_IFCHR as u32,
        NodeKind::Null => 0,
    }
}

/// Creation parameters for [`Vfs::create`](crate::Vfs::create) and the
/// create-path materialization callback.
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub mode: u32,
    /// Overrides the inferred driver index for the new node's resource.
    pub driver_index: Option<u64>,
}

impl NodeInfo {
    pub fn new(kind: NodeKind, mode: u32) -> Self {
        NodeInfo {
            kind,
            mode,
            driver_index: None,
        }
    }
}

/// Represents a mutation type for event signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    Created,
    Removed,
    Renamed,
    Linked,
}

/// A graph mutation, delivered through the optional mutation channel.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub path: String,
    pub mutation: MutationType,
}

/// Flags for [`Vfs::remove`](crate::Vfs::remove).
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveFlags {
    /// Delete unused ancestors after removing the node.
    pub prune_upward: bool,
    /// Ask the backing driver to remove the on-disk object as well.
    pub physical: bool,
}

/// An entry returned by [`Vfs::list`](crate::Vfs::list).
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub size: u64,
    pub depth: usize,
    /// For links, the stored link body.
    pub link_to: Option<String>,
}
