//! Shared test fixtures: an in-memory hierarchical driver with call counters.
//!
//! `MemFsDriver` plays the role of an on-disk filesystem driver behind a
//! mount; `MemFsFileDriver` is its file-side companion at the next driver
//! index. Both talk to one `MemFsStore`, a flat path-keyed object map, and
//! count driver calls so tests can assert exactly how often the core reached
//! through the mount.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mallorn::{
    mode_from_kind, DriverGroup, DriverState, NodeInfo, NodeKind, Resource, ResourceDriver, Stat,
    Vfs, VfsConfig, VfsError,
};

/// Driver index the mount driver registers at; files live at the next index.
pub const MEMFS_INDEX: u64 = 10;

#[derive(Debug, Clone)]
pub struct MemObject {
    pub kind: NodeKind,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// Backing store shared by the mount and file drivers.
pub struct MemFsStore {
    objects: Mutex<HashMap<String, MemObject>>,
    pub stat_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub rename_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl MemFsStore {
    pub fn new() -> Self {
        MemFsStore {
            objects: Mutex::new(HashMap::new()),
            stat_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            rename_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Put an object into the backing store directly, bypassing the core.
    pub fn seed(&self, path: &str, kind: NodeKind, mode: u32, data: &[u8]) {
        self.objects.lock().insert(
            path.to_string(),
            MemObject {
                kind,
                mode,
                data: data.to_vec(),
            },
        );
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().contains_key(path)
    }

    /// Drop an object behind the core's back, e.g. to provoke driver errors.
    pub fn remove_object(&self, path: &str) {
        self.objects.lock().remove(path);
    }

    pub fn stats(&self) -> (usize, usize, usize, usize) {
        (
            self.stat_calls.load(Ordering::SeqCst),
            self.create_calls.load(Ordering::SeqCst),
            self.remove_calls.load(Ordering::SeqCst),
            self.rename_calls.load(Ordering::SeqCst),
        )
    }
}

/// Per-file state handed out by `locate`.
struct MemFsHandle {
    store: Arc<MemFsStore>,
    path: String,
}

fn store_of(res: &Resource) -> Result<&Arc<MemFsStore>, VfsError> {
    res.state::<Arc<MemFsStore>>()
        .ok_or_else(|| VfsError::Driver("memfs mount state missing".to_string()))
}

fn handle_of(res: &Resource) -> Result<&MemFsHandle, VfsError> {
    res.state::<MemFsHandle>()
        .ok_or_else(|| VfsError::Driver("memfs file state missing".to_string()))
}

/// The mount-side driver: owns the namespace.
pub struct MemFsDriver;

impl ResourceDriver for MemFsDriver {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn group(&self) -> DriverGroup {
        DriverGroup::Filesystem
    }

    fn stat(&self, res: &Resource, path: &str) -> Result<Stat, VfsError> {
        let store = store_of(res)?;
        store.stat_calls.fetch_add(1, Ordering::SeqCst);

        let objects = store.objects.lock();
        let object = objects
            .get(path)
            .ok_or_else(|| VfsError::Driver(format!("memfs: no object at {:?}", path)))?;
        Ok(Stat {
            size: object.data.len() as u64,
            mode: object.mode | mode_from_kind(object.kind),
            nlink: 1,
            ..Stat::default()
        })
    }

    fn locate(&self, res: &Resource, path: &str) -> Result<DriverState, VfsError> {
        let store = store_of(res)?;
        Ok(Box::new(MemFsHandle {
            store: Arc::clone(store),
            path: path.to_string(),
        }))
    }

    fn create(&self, res: &Resource, path: &str, mode: u32, kind: NodeKind) -> Result<(), VfsError> {
        let store = store_of(res)?;
        store.create_calls.fetch_add(1, Ordering::SeqCst);
        store.objects.lock().insert(
            path.to_string(),
            MemObject {
                kind,
                mode,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, res: &Resource, path: &str) -> Result<(), VfsError> {
        let store = store_of(res)?;
        store.remove_calls.fetch_add(1, Ordering::SeqCst);
        let prefix = format!("{}/", path);
        let mut objects = store.objects.lock();
        objects.retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }

    fn rename(&self, res: &Resource, from: &str, to: &str) -> Result<(), VfsError> {
        let store = store_of(res)?;
        store.rename_calls.fetch_add(1, Ordering::SeqCst);

        let mut objects = store.objects.lock();
        let object = objects
            .remove(from)
            .ok_or_else(|| VfsError::Driver(format!("memfs: no object at {:?}", from)))?;
        objects.insert(to.to_string(), object);
        Ok(())
    }

    fn open(&self, _res: &Resource, _flags: i32, _mode: u32) -> Result<(), VfsError> {
        Ok(())
    }

    fn close(&self, res: &Resource) -> Result<(), VfsError> {
        let store = store_of(res)?;
        store.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, _res: &Resource, _buf: &mut [u8], _offset: u64) -> Result<usize, VfsError> {
        Err(VfsError::Driver("memfs mount is not a file".to_string()))
    }

    fn write(&self, _res: &Resource, _buf: &[u8], _offset: u64) -> Result<usize, VfsError> {
        Err(VfsError::Driver("memfs mount is not a file".to_string()))
    }
}

/// The file-side driver, registered at `MEMFS_INDEX + 1`.
pub struct MemFsFileDriver;

impl ResourceDriver for MemFsFileDriver {
    fn name(&self) -> &'static str {
        "memfs-file"
    }

    fn group(&self) -> DriverGroup {
        DriverGroup::Filesystem
    }

    fn stat(&self, res: &Resource, _path: &str) -> Result<Stat, VfsError> {
        let handle = handle_of(res)?;
        let objects = handle.store.objects.lock();
        let object = objects
            .get(&handle.path)
            .ok_or_else(|| VfsError::Driver("memfs: object vanished".to_string()))?;
        Ok(Stat {
            size: object.data.len() as u64,
            mode: object.mode | mode_from_kind(object.kind),
            nlink: 1,
            ..Stat::default()
        })
    }

    fn locate(&self, _res: &Resource, _path: &str) -> Result<DriverState, VfsError> {
        Err(VfsError::Driver("memfs file has no namespace".to_string()))
    }

    fn create(&self, _res: &Resource, _path: &str, _mode: u32, _kind: NodeKind) -> Result<(), VfsError> {
        Err(VfsError::Driver("memfs file has no namespace".to_string()))
    }

    fn remove(&self, _res: &Resource, _path: &str) -> Result<(), VfsError> {
        Err(VfsError::Driver("memfs file has no namespace".to_string()))
    }

    fn rename(&self, _res: &Resource, _from: &str, _to: &str) -> Result<(), VfsError> {
        Err(VfsError::Driver("memfs file has no namespace".to_string()))
    }

    fn open(&self, _res: &Resource, _flags: i32, _mode: u32) -> Result<(), VfsError> {
        Ok(())
    }

    fn close(&self, _res: &Resource) -> Result<(), VfsError> {
        Ok(())
    }

    fn read(&self, res: &Resource, buf: &mut [u8], offset: u64) -> Result<usize, VfsError> {
        let handle = handle_of(res)?;
        let objects = handle.store.objects.lock();
        let object = objects
            .get(&handle.path)
            .ok_or_else(|| VfsError::Driver("memfs: object vanished".to_string()))?;

        let offset = offset as usize;
        if offset >= object.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(object.data.len() - offset);
        buf[..n].copy_from_slice(&object.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, res: &Resource, buf: &[u8], offset: u64) -> Result<usize, VfsError> {
        let handle = handle_of(res)?;
        let mut objects = handle.store.objects.lock();
        let object = objects
            .get_mut(&handle.path)
            .ok_or_else(|| VfsError::Driver("memfs: object vanished".to_string()))?;

        let offset = offset as usize;
        let end = offset + buf.len();
        if end > object.data.len() {
            object.data.resize(end, 0);
        }
        object.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// A fresh Vfs with a memfs mounted at `/mnt`.
#[allow(dead_code)]
pub fn vfs_with_memfs() -> (Vfs, Arc<MemFsStore>) {
    vfs_with_memfs_config(VfsConfig::default())
}

#[allow(dead_code)]
pub fn vfs_with_memfs_config(config: VfsConfig) -> (Vfs, Arc<MemFsStore>) {
    let vfs = Vfs::new(config, None).expect("vfs init");
    vfs.registry()
        .register(MEMFS_INDEX, Arc::new(MemFsDriver))
        .expect("register memfs");
    vfs.registry()
        .register(MEMFS_INDEX + 1, Arc::new(MemFsFileDriver))
        .expect("register memfs-file");

    vfs.create("/mnt", &NodeInfo::new(NodeKind::Dir, 0o755))
        .expect("create mountpoint");

    let store = Arc::new(MemFsStore::new());
    let resource = Resource::new(
        Arc::new(MemFsDriver),
        MEMFS_INDEX,
        Box::new(Arc::clone(&store)),
    );
    vfs.mount("/mnt", resource).expect("mount memfs");

    (vfs, store)
}
