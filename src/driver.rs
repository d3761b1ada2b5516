//! The driver contract consumed by the node graph.
//!
//! A driver backs a subtree of the graph with real storage: a disk
//! filesystem, a device, a FIFO, or an in-memory buffer. The graph never
//! touches storage directly; it routes mount-relative paths to the driver of
//! the enclosing mount and attaches the opaque per-object state the driver
//! hands back.

use std::any::Any;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VfsError};
use crate::vfs::types::{NodeKind, Stat};

/// Driver index of the built-in in-memory buffer driver. Nodes outside any
/// mount are backed by it.
pub const BUFFER_FILE: u64 = 0;

/// Coarse classification of a driver, registered alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverGroup {
    Filesystem,
    Device,
    Buffer,
    Fifo,
}

/// Opaque per-object state a driver associates with a node's resource.
pub type DriverState = Box<dyn Any + Send + Sync>;

/// A driver handle attached to a node. Carries the driver identity and the
/// driver's per-object state.
pub struct Resource {
    group: DriverGroup,
    index: u64,
    driver: Arc<dyn ResourceDriver>,
    state: DriverState,
}

impl Resource {
    pub fn new(driver: Arc<dyn ResourceDriver>, index: u64, state: DriverState) -> Self {
        Resource {
            group: driver.group(),
            index,
            driver,
            state,
        }
    }

    pub fn group(&self) -> DriverGroup {
        self.group
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn driver(&self) -> &Arc<dyn ResourceDriver> {
        &self.driver
    }

    /// Downcast the driver state to a concrete type.
    pub fn state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        self.driver.stat(self, path)
    }

    pub fn locate(&self, path: &str) -> Result<DriverState> {
        self.driver.locate(self, path)
    }

    pub fn create(&self, path: &str, mode: u32, kind: NodeKind) -> Result<()> {
        self.driver.create(self, path, mode, kind)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.driver.remove(self, path)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.driver.rename(self, from, to)
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.driver.read(self, buf, offset)
    }

    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.driver.write(self, buf, offset)
    }

    /// Release the resource. Called once when the owning node is deleted or
    /// its mount is unmounted.
    pub fn uninit(&self) {
        if let Err(e) = self.driver.close(self) {
            tracing::warn!("Driver close failed during resource release: {}", e);
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("group", &self.group)
            .field("index", &self.index)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// The capability set a backing store exposes to the graph.
///
/// Hierarchical operations (`stat`, `locate`, `create`, `remove`, `rename`)
/// take a path relative to the mount the resource belongs to; the empty path
/// addresses the mount itself. Flat drivers (buffers, FIFOs) may reject them.
pub trait ResourceDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn group(&self) -> DriverGroup;

    /// Metadata of the object at a mount-relative path.
    fn stat(&self, res: &Resource, path: &str) -> Result<Stat>;

    /// Produce the per-object state for a node being instantiated at a
    /// mount-relative path.
    fn locate(&self, res: &Resource, path: &str) -> Result<DriverState>;

    /// Physically create the object at a mount-relative path.
    fn create(&self, res: &Resource, path: &str, mode: u32, kind: NodeKind) -> Result<()>;

    /// Physically remove the object at a mount-relative path.
    fn remove(&self, res: &Resource, path: &str) -> Result<()>;

    fn rename(&self, res: &Resource, from: &str, to: &str) -> Result<()>;

    fn open(&self, res: &Resource, flags: i32, mode: u32) -> Result<()>;

    fn close(&self, res: &Resource) -> Result<()>;

    fn read(&self, res: &Resource, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write(&self, res: &Resource, buf: &[u8], offset: u64) -> Result<usize>;

    /// Notification that a descriptor's offset moved. Most drivers ignore it;
    /// character devices may care.
    fn seek(&self, _res: &Resource, _offset: u64) -> Result<()> {
        Ok(())
    }
}

/// Maps driver indices to registered drivers.
///
/// A filesystem driver occupies two adjacent indices: the mount driver at `i`
/// and its file driver at `i + 1`. The graph infers a child's index from the
/// enclosing mount: file-like children use `i + 1`, nested mounts bring their
/// own resource.
pub struct DriverRegistry {
    table: RwLock<FxHashMap<u64, Arc<dyn ResourceDriver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        let registry = DriverRegistry {
            table: RwLock::new(FxHashMap::default()),
        };
        registry
            .table
            .write()
            .insert(BUFFER_FILE, Arc::new(BufferDriver) as Arc<dyn ResourceDriver>);
        registry
    }

    pub fn register(&self, index: u64, driver: Arc<dyn ResourceDriver>) -> Result<()> {
        let mut table = self.table.write();
        if table.contains_key(&index) {
            return Err(VfsError::Driver(format!(
                "driver index {} already registered",
                index
            )));
        }
        tracing::debug!("Registered driver {:?} at index {}", driver.name(), index);
        table.insert(index, driver);
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<Arc<dyn ResourceDriver>> {
        self.table.read().get(&index).cloned()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-object state of the buffer driver: a growable byte vector.
pub struct BufferState {
    data: Mutex<Vec<u8>>,
}

impl BufferState {
    pub fn new() -> Self {
        BufferState {
            data: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl Default for BufferState {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-memory backing store. Serves nodes that live outside any mount and
/// link bodies for in-memory links.
pub struct BufferDriver;

impl ResourceDriver for BufferDriver {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn group(&self) -> DriverGroup {
        DriverGroup::Buffer
    }

    fn stat(&self, _res: &Resource, _path: &str) -> Result<Stat> {
        Err(VfsError::Driver("buffer driver has no namespace".into()))
    }

    fn locate(&self, _res: &Resource, _path: &str) -> Result<DriverState> {
        Ok(Box::new(BufferState::new()))
    }

    fn create(&self, _res: &Resource, _path: &str, _mode: u32, _kind: NodeKind) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _res: &Resource, _path: &str) -> Result<()> {
        Ok(())
    }

    fn rename(&self, _res: &Resource, _from: &str, _to: &str) -> Result<()> {
        Ok(())
    }

    fn open(&self, _res: &Resource, _flags: i32, _mode: u32) -> Result<()> {
        Ok(())
    }

    fn close(&self, _res: &Resource) -> Result<()> {
        Ok(())
    }

    fn read(&self, res: &Resource, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = res
            .state::<BufferState>()
            .ok_or_else(|| VfsError::Driver("buffer resource has no buffer state".into()))?;
        let data = state.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, res: &Resource, buf: &[u8], offset: u64) -> Result<usize> {
        let state = res
            .state::<BufferState>()
            .ok_or_else(|| VfsError::Driver("buffer resource has no buffer state".into()))?;
        let mut data = state.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// Build a buffer-backed resource for an in-memory node.
pub(crate) fn buffer_resource(registry: &DriverRegistry) -> Result<Resource> {
    let driver = registry
        .get(BUFFER_FILE)
        .ok_or_else(|| VfsError::Driver("buffer driver not registered".into()))?;
    Ok(Resource::new(driver, BUFFER_FILE, Box::new(BufferState::new())))
}
