use thiserror::Error;

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory has children: {0}")]
    HasChildren(String),

    #[error("Node in use (ref_count = {0})")]
    InUse(u64),

    #[error("In-memory node requires the physical flag to delete: {0}")]
    PhysicalDeleteRequired(String),

    #[error("Too many link hops (limit {0})")]
    TooManyLinks(usize),

    #[error("Broken link: {0}")]
    BrokenLink(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Rename across mounts is unsupported")]
    CrossMountUnsupported,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Config error: {0}")]
    Config(String),
}
