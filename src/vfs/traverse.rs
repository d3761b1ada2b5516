//! The path walker.
//!
//! Traversal resolves a path string component by component from a starting
//! node, holding each parent's branch lock only for the child scan and the
//! optional materialization callback, never across a descent. Reference
//! counts are swapped as the walk moves: the next node is retained while the
//! parent's lock is still held (so it cannot be evicted out from under the
//! walk), then the previous node is released.

use std::sync::Arc;

use crate::error::{Result, VfsError};
use crate::vfs::node::Node;
use crate::vfs::path::PathLexer;
use crate::vfs::store::attach_child;
use crate::vfs::types::NodeKind;
use crate::vfs::Vfs;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TraverseFlags {
    /// Resolve a terminal Link node by restarting the walk on its body.
    pub resolve_links: bool,
    /// Stop one component short; the remainder is the unconsumed last
    /// component.
    pub ignore_last: bool,
}

/// Context handed to a materialization callback on a child miss. The parent's
/// branch lock is held for the duration of the callback; this is the
/// deliberate serialization point for same-parent races.
pub(crate) struct MaterializeRequest<'a> {
    pub parent: &'a Arc<Node>,
    pub name: &'a str,
    pub is_last: bool,
    /// Nearest enclosing mount walked through, if any.
    pub mount: Option<&'a Arc<Node>>,
    /// Path suffix from the enclosing mount, terminal component included.
    pub mount_rel: Option<&'a str>,
}

pub(crate) type Materializer<'a> = dyn Fn(&MaterializeRequest<'_>) -> Result<Option<Arc<Node>>> + 'a;

/// Outcome of a traversal. `node` carries one reference owed to the caller;
/// release it with [`Vfs::release_node`] when done. An empty remainder means
/// the path was fully consumed.
pub struct Traversal {
    pub node: Arc<Node>,
    pub remainder: String,
    pub(crate) mount: Option<Arc<Node>>,
    pub(crate) mount_rel: Option<String>,
}

struct Walk {
    node: Arc<Node>,
    remainder: String,
    mount: Option<Arc<Node>>,
    mount_rel: Option<String>,
}

impl Vfs {
    /// Walk `path` from `start`, materializing missing components through the
    /// callback and resolving a terminal link per `flags`.
    pub(crate) fn traverse(
        &self,
        path: &str,
        start: &Arc<Node>,
        flags: TraverseFlags,
        materialize: Option<&Materializer<'_>>,
    ) -> Result<Traversal> {
        let mut cur_path = path.to_string();
        let mut start_node = Arc::clone(start);
        let mut origin: Option<Arc<Node>> = None;
        let mut hops = 0usize;

        loop {
            let walk = match self.walk_once(&cur_path, &start_node, flags, materialize) {
                Ok(walk) => walk,
                Err(e) => {
                    if let Some(origin) = &origin {
                        self.release_node(origin);
                    }
                    return Err(e);
                }
            };

            if !walk.remainder.is_empty() {
                // Partial walk. Past a link hop this is a broken link, not a
                // plain miss.
                if hops > 0 {
                    self.release_node(&walk.node);
                    if let Some(origin) = &origin {
                        self.release_node(origin);
                    }
                    return Err(VfsError::BrokenLink(path.to_string()));
                }
                return Ok(Traversal {
                    node: walk.node,
                    remainder: walk.remainder,
                    mount: walk.mount,
                    mount_rel: walk.mount_rel,
                });
            }

            let is_unresolved_link =
                walk.node.kind() == NodeKind::Link && walk.node.link_target().is_none();

            if !flags.resolve_links || !is_unresolved_link {
                return Ok(self.finish_resolution(walk, origin, path));
            }

            if hops >= self.config.max_link_hops {
                self.release_node(&walk.node);
                if let Some(origin) = &origin {
                    self.release_node(origin);
                }
                return Err(VfsError::TooManyLinks(self.config.max_link_hops));
            }

            let body = match self.read_link_body(&walk.node) {
                Some(body) => body,
                None => {
                    tracing::debug!("Link {} has no readable body", walk.node.id());
                    self.release_node(&walk.node);
                    if let Some(origin) = &origin {
                        self.release_node(origin);
                    }
                    return Err(VfsError::BrokenLink(path.to_string()));
                }
            };

            // Absolute bodies restart from the root; relative ones from the
            // link's parent.
            start_node = if body.starts_with('/') {
                self.root()
            } else {
                match walk.node.parent().and_then(|id| self.store.get(id)) {
                    Some(parent) => parent,
                    None => self.root(),
                }
            };

            if origin.is_none() {
                // The first link keeps its walk reference; it is the
                // caller-visible terminal on success.
                origin = Some(Arc::clone(&walk.node));
            } else {
                self.release_node(&walk.node);
            }

            hops += 1;
            tracing::trace!("Link hop {}: {:?} -> {:?}", hops, cur_path, body);
            cur_path = body;
        }
    }

    /// Install the resolved target on the origin link, if any, and pick the
    /// caller-visible terminal.
    fn finish_resolution(&self, walk: Walk, origin: Option<Arc<Node>>, path: &str) -> Traversal {
        let Some(origin) = origin else {
            return Traversal {
                node: walk.node,
                remainder: walk.remainder,
                mount: walk.mount,
                mount_rel: walk.mount_rel,
            };
        };

        let installed = {
            let mut props = origin.property();
            if props.link_target.is_none() {
                // The target's walk reference is transferred to the link
                // edge, released again when the link is deleted.
                props.link_target = Some(walk.node.id());
                true
            } else {
                false
            }
        };
        if !installed {
            // Lost a resolution race; the edge already holds its increment.
            self.release_node(&walk.node);
        }
        tracing::debug!(
            "Resolved link {} -> {} ({})",
            origin.id(),
            walk.node.id(),
            path
        );

        Traversal {
            node: origin,
            remainder: walk.remainder,
            mount: walk.mount,
            mount_rel: walk.mount_rel,
        }
    }

    fn walk_once(
        &self,
        path: &str,
        start: &Arc<Node>,
        flags: TraverseFlags,
        materialize: Option<&Materializer<'_>>,
    ) -> Result<Walk> {
        let mut cur = Arc::clone(start);
        self.retain_node(&cur);

        let mut mount_at: Option<(Arc<Node>, usize)> = None;
        let mut remainder_at: Option<usize> = None;

        for comp in PathLexer::new(path) {
            // A mountpoint's cached mount id is its own id.
            if cur.mount() == Some(cur.id()) {
                mount_at = Some((Arc::clone(&cur), comp.offset));
            }

            if flags.ignore_last && comp.is_last {
                remainder_at = Some(comp.offset);
                break;
            }

            let next: Arc<Node> = match comp.name {
                ".." => {
                    // The root's parent is the root itself.
                    let parent = cur
                        .parent()
                        .and_then(|id| self.store.get(id))
                        .unwrap_or_else(|| Arc::clone(&cur));
                    if parent.id() == cur.id() {
                        continue;
                    }
                    self.retain_node(&parent);
                    parent
                }
                "." => continue,
                name => {
                    if !cur.kind().is_directory_like() {
                        self.release_node(&cur);
                        return Err(VfsError::NotADirectory(format!(
                            "{} (at {:?})",
                            path, name
                        )));
                    }

                    let mut guard = cur.branch();
                    let mut found = None;
                    for &child_id in guard.children.iter() {
                        if let Some(child) = self.store.get(child_id) {
                            if child.name_matches(name) {
                                found = Some(child);
                                break;
                            }
                        }
                    }

                    if found.is_none() {
                        if let Some(materialize) = materialize {
                            let request = MaterializeRequest {
                                parent: &cur,
                                name,
                                is_last: comp.is_last,
                                mount: mount_at.as_ref().map(|(m, _)| m),
                                mount_rel: mount_at
                                    .as_ref()
                                    .map(|&(_, o)| path[o..].trim_end_matches('/')),
                            };
                            match materialize(&request) {
                                Ok(Some(node)) => {
                                    attach_child(&mut guard, node.id());
                                    found = Some(node);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    drop(guard);
                                    self.release_node(&cur);
                                    return Err(e);
                                }
                            }
                        }
                    }

                    match found {
                        Some(next) => {
                            // Retain while the parent's lock still pins the
                            // child in the tree.
                            self.retain_node(&next);
                            drop(guard);
                            next
                        }
                        None => {
                            drop(guard);
                            remainder_at = Some(comp.offset);
                            break;
                        }
                    }
                }
            };

            let prev = std::mem::replace(&mut cur, next);
            self.release_node(&prev);
        }

        Ok(Walk {
            node: cur,
            remainder: remainder_at
                .map(|o| path[o..].to_string())
                .unwrap_or_default(),
            mount: mount_at.as_ref().map(|(m, _)| Arc::clone(m)),
            mount_rel: mount_at.map(|(_, o)| path[o..].trim_end_matches('/').to_string()),
        })
    }

    /// Read a link node's body. `None` when the body is empty or unreadable.
    pub(crate) fn read_link_body(&self, link: &Arc<Node>) -> Option<String> {
        let size = link.stat().size as usize;
        if size == 0 {
            return None;
        }
        let resource = link.resource()?;

        let mut buf = vec![0u8; size];
        let n = match resource.read(&mut buf, 0) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Failed to read link body from {}: {}", link.id(), e);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        buf.truncate(n);
        String::from_utf8(buf).ok().filter(|s| !s.is_empty())
    }
}
