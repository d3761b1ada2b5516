//! Eviction ring behavior: bounded memory for recently closed nodes.

mod common;

use common::vfs_with_memfs_config;
use mallorn::VfsConfig;
use std::sync::atomic::Ordering;

fn tiny_cache() -> VfsConfig {
    VfsConfig {
        eviction_cache_size: 2,
        ..VfsConfig::default()
    }
}

#[test]
fn test_oldest_closed_file_is_evicted() {
    let (vfs, store) = vfs_with_memfs_config(tiny_cache());
    store.seed("a", mallorn::NodeKind::File, 0o644, b"a");
    store.seed("b", mallorn::NodeKind::File, 0o644, b"b");
    store.seed("c", mallorn::NodeKind::File, 0o644, b"c");

    for path in ["/mnt/a", "/mnt/b", "/mnt/c"] {
        let file = vfs.open(path, 0, 0o644).unwrap();
        vfs.close(file).unwrap();
    }

    // Three zero-ref inserts into a two-slot ring: the oldest is gone from
    // memory, the other two are still graph hits.
    assert!(vfs.peek("/mnt/a").is_none());
    assert!(vfs.peek("/mnt/b").is_some());
    assert!(vfs.peek("/mnt/c").is_some());

    // Re-opening the evicted file goes through the driver again.
    let stats_before = store.stat_calls.load(Ordering::SeqCst);
    let file = vfs.open("/mnt/a", 0, 0o644).unwrap();
    vfs.close(file).unwrap();
    assert_eq!(store.stat_calls.load(Ordering::SeqCst), stats_before + 1);
}

#[test]
fn test_eviction_skips_reopened_node() {
    let (vfs, store) = vfs_with_memfs_config(tiny_cache());
    store.seed("a", mallorn::NodeKind::File, 0o644, b"a");
    store.seed("b", mallorn::NodeKind::File, 0o644, b"b");
    store.seed("c", mallorn::NodeKind::File, 0o644, b"c");

    let file_a = vfs.open("/mnt/a", 0, 0o644).unwrap();
    vfs.close(file_a).unwrap();

    // Re-open a: it leaves the ring, so later pressure must not delete it.
    let held = vfs.open("/mnt/a", 0, 0o644).unwrap();

    let file_b = vfs.open("/mnt/b", 0, 0o644).unwrap();
    vfs.close(file_b).unwrap();
    let file_c = vfs.open("/mnt/c", 0, 0o644).unwrap();
    vfs.close(file_c).unwrap();

    assert!(vfs.peek("/mnt/a").is_some());
    vfs.close(held).unwrap();
}

#[test]
fn test_eviction_never_takes_the_mountpoint() {
    let (vfs, _store) = vfs_with_memfs_config(tiny_cache());

    // Churn far more nodes through the ring than it has slots.
    for i in 0..16 {
        let path = format!("/mnt/f{}", i);
        let file = vfs.open(&path, libc::O_CREAT, 0o644).unwrap();
        vfs.close(file).unwrap();
    }

    let mnt = vfs.peek("/mnt").unwrap();
    assert_eq!(mnt.kind(), mallorn::NodeKind::Mount);
    assert_eq!(mnt.ref_count(), 1);
}

#[test]
fn test_evicted_directory_with_children_survives() {
    let (vfs, _store) = vfs_with_memfs_config(tiny_cache());

    // /mnt/d is a zero-ref directory with a child; ring pressure must not
    // free it. The child file itself may be evicted and reloaded.
    vfs.create("/mnt/d/f", &mallorn::NodeInfo::new(mallorn::NodeKind::File, 0o644))
        .unwrap();
    for i in 0..8 {
        let path = format!("/mnt/g{}", i);
        let file = vfs.open(&path, libc::O_CREAT, 0o644).unwrap();
        vfs.close(file).unwrap();
    }

    assert!(vfs.peek("/mnt/d").is_some());
    assert_eq!(vfs.stat("/mnt/d/f").unwrap().mode & 0o777, 0o644);
}
