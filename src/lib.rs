pub mod config;
pub mod driver;
pub mod error;
pub mod vfs;

pub use config::VfsConfig;
pub use config::EVICTION_CACHE_SIZE;
pub use config::MAX_LINK_HOPS;

pub use driver::BufferDriver;
pub use driver::BufferState;
pub use driver::DriverGroup;
pub use driver::DriverRegistry;
pub use driver::DriverState;
pub use driver::Resource;
pub use driver::ResourceDriver;
pub use driver::BUFFER_FILE;

pub use error::{Result, VfsError};

pub use vfs::node::Node;
pub use vfs::types::{
    kind_from_mode, mode_from_kind, ListEntry, MutationEvent, MutationType, NodeId, NodeInfo,
    NodeKind, RemoveFlags, Stat,
};
pub use vfs::{relative_path_between, File, Traversal, Vfs, ROOT_NODE};
