//! Symbolic link behavior through a mounted backing store.

mod common;

use common::vfs_with_memfs;
use mallorn::{NodeInfo, NodeKind, RemoveFlags, VfsError};
use std::sync::atomic::Ordering;

fn file_info() -> NodeInfo {
    NodeInfo::new(NodeKind::File, 0o644)
}

#[test]
fn test_link_creates_relative_body_and_resolves() {
    let (vfs, store) = vfs_with_memfs();

    let mut file = vfs.open("/mnt/t.txt", libc::O_CREAT, 0o644).unwrap();
    vfs.write(&mut file, b"linked content").unwrap();
    vfs.close(file).unwrap();

    vfs.link("/mnt/t.txt", "/mnt/l", Some(0o777)).unwrap();

    // The link object exists physically and its body is the relative path.
    assert!(store.contains("l"));
    let link = vfs.peek("/mnt/l").unwrap();
    assert_eq!(link.kind(), NodeKind::Link);

    let entries = vfs.list("/mnt", 0).unwrap();
    let entry = entries.iter().find(|e| e.name == "l").unwrap();
    assert_eq!(entry.link_to.as_deref(), Some("t.txt"));

    // Resolution lands on the target's identity.
    let target = vfs.peek("/mnt/t.txt").unwrap();
    let t = vfs.load_path("/mnt/l", &vfs.root()).unwrap();
    assert_eq!(t.node.link_target(), Some(target.id()));
    vfs.release_node(&t.node);

    // The link edge keeps one reference on the target.
    assert_eq!(target.ref_count(), 1);

    // I/O through the link is transparent.
    let mut through = vfs.open("/mnt/l", 0, 0o644).unwrap();
    let mut buf = [0u8; 32];
    let n = vfs.read(&mut through, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"linked content");
    vfs.close(through).unwrap();
}

#[test]
fn test_seeded_link_resolves_through_restart() {
    let (vfs, store) = vfs_with_memfs();
    store.seed("t.txt", NodeKind::File, 0o644, b"target data");
    store.seed("raw", NodeKind::Link, 0o777, b"t.txt");

    // Loading the link materializes it, reads its body, and restarts the
    // walk from the link's parent.
    let t = vfs.load_path("/mnt/raw", &vfs.root()).unwrap();
    assert!(t.remainder.is_empty());
    assert_eq!(t.node.kind(), NodeKind::Link);

    let target = vfs.peek("/mnt/t.txt").unwrap();
    assert_eq!(t.node.link_target(), Some(target.id()));
    assert_eq!(target.kind(), NodeKind::File);
    vfs.release_node(&t.node);

    // Resolution is cached on the link: a reload does not re-read the body
    // or re-stat the target.
    let stats_before = store.stat_calls.load(Ordering::SeqCst);
    let t = vfs.load_path("/mnt/raw", &vfs.root()).unwrap();
    assert_eq!(t.node.link_target(), Some(target.id()));
    vfs.release_node(&t.node);
    assert_eq!(store.stat_calls.load(Ordering::SeqCst), stats_before);
}

#[test]
fn test_broken_link_is_distinguished_from_not_found() {
    let (vfs, store) = vfs_with_memfs();
    store.seed("dangling", NodeKind::Link, 0o777, b"/nonexistent");

    assert!(matches!(
        vfs.load_path("/mnt/dangling", &vfs.root()),
        Err(VfsError::BrokenLink(_))
    ));

    // The link node itself survives the failed resolution, unreferenced.
    let link = vfs.peek("/mnt/dangling").unwrap();
    assert_eq!(link.kind(), NodeKind::Link);
    assert_eq!(link.ref_count(), 0);
    assert_eq!(link.link_target(), None);

    // A plain miss is still NotFound, not BrokenLink.
    assert!(matches!(
        vfs.stat("/mnt/absent"),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn test_link_target_is_reachable_from_root() {
    let (vfs, _store) = vfs_with_memfs();
    vfs.create("/mnt/d/t", &file_info()).unwrap();
    vfs.link("/mnt/d/t", "/mnt/l", None).unwrap();

    let link = vfs.peek("/mnt/l").unwrap();
    let target_id = link.link_target().unwrap();

    // Walk up from the target; the chain must end at the root.
    let mut cur = vfs.node(target_id).unwrap();
    loop {
        match cur.parent() {
            Some(parent_id) => {
                cur = vfs.node(parent_id).unwrap();
            }
            None => {
                assert_eq!(cur.kind(), NodeKind::Root);
                break;
            }
        }
    }
}

#[test]
fn test_link_mode_inherits_from_source() {
    let (vfs, _store) = vfs_with_memfs();
    vfs.create("/mnt/t", &NodeInfo::new(NodeKind::File, 0o600)).unwrap();

    vfs.link("/mnt/t", "/mnt/l", None).unwrap();

    let link = vfs.peek("/mnt/l").unwrap();
    assert_eq!(link.stat().mode & 0o777, 0o600);
}

#[test]
fn test_removing_link_leaves_target_intact() {
    let (vfs, store) = vfs_with_memfs();
    vfs.create("/mnt/t", &file_info()).unwrap();
    vfs.link("/mnt/t", "/mnt/l", None).unwrap();

    let target = vfs.peek("/mnt/t").unwrap();
    assert_eq!(target.ref_count(), 1);

    vfs.remove(
        "/mnt/l",
        RemoveFlags {
            physical: true,
            prune_upward: false,
        },
    )
    .unwrap();

    assert_eq!(target.ref_count(), 0);
    assert!(vfs.peek("/mnt/l").is_none());
    assert!(!store.contains("l"));
    assert!(store.contains("t"));
    assert_eq!(vfs.stat("/mnt/t").unwrap().mode & 0o777, 0o644);
}
