//! Memory sink
//!
//! Workers send entry events over a bounded channel to a dedicated builder
//! thread that owns the tree outright, so assembly needs no locks at all.
//! The channel is shared, and every event for a directory is sent by the
//! single worker enumerating it, so per-directory ordering survives the
//! trip.
//!
//! Directory lifetime follows the sink contract: a dir is held open by one
//! reference from its creator plus one per open child dir; the last release
//! finalizes it (prune unseen children, refold aggregates, recompute
//! suberr) and releases the parent in turn.
//!
//! The same builder serves refresh: it starts from an existing tree, reuses
//! children that match by name and kind, prunes the ones that disappeared,
//! and adjusts the ancestors of the refresh root by the delta between the
//! subtree's old and new totals.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::debug;

use crate::error::ScanError;
use crate::model::tree::refold_dir;
use crate::model::{
    DirNode, EntryStat, FileNode, HardlinkProgress, LinkNode, Node, NodeId, NodeKind, SpecialKind,
    Totals, Tree,
};

use super::SinkThread;

/// Channel capacity: enough to decouple workers from the builder without
/// letting an import race arbitrarily far ahead of it.
const EVENT_QUEUE: usize = 1024;

/// The root's dir id on the wire.
const ROOT_ID: u64 = 0;

enum Event {
    Root {
        name: Vec<u8>,
        stat: EntryStat,
    },
    Dir {
        parent: u64,
        id: u64,
        name: Vec<u8>,
        stat: EntryStat,
    },
    Stat {
        parent: u64,
        name: Vec<u8>,
        stat: EntryStat,
    },
    Special {
        parent: u64,
        name: Vec<u8>,
        kind: SpecialKind,
    },
    ReadError {
        dir: u64,
    },
    Done {
        dir: u64,
    },
}

/// Handle to one open directory in the memory sink.
#[derive(Clone)]
pub struct MemDir {
    tx: Sender<Event>,
    id: u64,
}

impl MemDir {
    pub(super) fn add_special(&self, name: &[u8], kind: SpecialKind) {
        let _ = self.tx.send(Event::Special {
            parent: self.id,
            name: name.to_vec(),
            kind,
        });
    }

    pub(super) fn add_stat(&self, name: &[u8], stat: &EntryStat) {
        let _ = self.tx.send(Event::Stat {
            parent: self.id,
            name: name.to_vec(),
            stat: stat.clone(),
        });
    }

    pub(super) fn add_dir(&self, t: &mut SinkThread, name: &[u8], stat: &EntryStat) -> MemDir {
        let id = t.alloc_dir_id();
        let _ = self.tx.send(Event::Dir {
            parent: self.id,
            id,
            name: name.to_vec(),
            stat: stat.clone(),
        });
        MemDir {
            tx: self.tx.clone(),
            id,
        }
    }

    pub(super) fn set_read_error(&self) {
        let _ = self.tx.send(Event::ReadError { dir: self.id });
    }

    pub(super) fn done(self) {
        let _ = self.tx.send(Event::Done { dir: self.id });
    }
}

/// The memory sink: owns the channel and the builder thread.
pub struct MemSink {
    tx: Sender<Event>,
    handle: JoinHandle<Option<Tree>>,
}

impl MemSink {
    /// Sink for a fresh scan.
    pub fn new() -> Self {
        Self::spawn(None, None)
    }

    /// Sink for a fresh scan, publishing the hardlink-commit progress
    /// through `progress`.
    pub fn with_progress(progress: Arc<HardlinkProgress>) -> Self {
        Self::spawn(None, Some(progress))
    }

    /// Sink that merges a rescan of `node`'s subtree into `tree`.
    pub fn for_refresh(tree: Tree, node: NodeId) -> Self {
        Self::spawn(Some((tree, node)), None)
    }

    fn spawn(refresh: Option<(Tree, NodeId)>, progress: Option<Arc<HardlinkProgress>>) -> Self {
        let (tx, rx) = bounded::<Event>(EVENT_QUEUE);
        let handle = std::thread::Builder::new()
            .name("tree-builder".to_string())
            .spawn(move || {
                let mut builder = Builder::new(refresh, progress);
                while let Ok(event) = rx.recv() {
                    builder.handle(event);
                }
                builder.into_tree()
            })
            .expect("Failed to spawn tree builder thread");
        Self { tx, handle }
    }

    /// The root handle. Call exactly once per scan.
    pub fn create_root(&self, name: &[u8], stat: &EntryStat) -> MemDir {
        let _ = self.tx.send(Event::Root {
            name: name.to_vec(),
            stat: stat.clone(),
        });
        MemDir {
            tx: self.tx.clone(),
            id: ROOT_ID,
        }
    }

    /// Wait for the builder, commit hardlink aggregates, and hand the tree
    /// back. All dir handles must have been released.
    pub fn finish(self) -> Result<Tree, ScanError> {
        drop(self.tx);
        let mut tree = self
            .handle
            .join()
            .map_err(|_| ScanError::SinkClosed)?
            .ok_or(ScanError::SinkClosed)?;
        tree.commit_hardlinks();
        Ok(tree)
    }
}

impl Default for MemSink {
    fn default() -> Self {
        Self::new()
    }
}

/// One directory currently being delivered.
struct OpenDir {
    node: NodeId,
    parent: Option<u64>,
    /// One reference from the creator plus one per open child dir.
    pending: u32,
    /// Name-hash buckets of the previous pass's children, for refresh
    /// reuse.
    existing: HashMap<u64, Vec<NodeId>>,
    /// Children delivered this pass, in order.
    seen: Vec<NodeId>,
}

struct Builder {
    tree: Option<Tree>,
    /// Refresh root and its pre-refresh contribution, when refreshing.
    refresh: Option<(NodeId, Totals, u32)>,
    progress: Option<Arc<HardlinkProgress>>,
    open: HashMap<u64, OpenDir>,
}

impl Builder {
    fn new(refresh: Option<(Tree, NodeId)>, progress: Option<Arc<HardlinkProgress>>) -> Self {
        match refresh {
            None => Self {
                tree: None,
                refresh: None,
                progress,
                open: HashMap::new(),
            },
            Some((mut tree, node)) => {
                // Classes under the refreshed subtree may gain or lose
                // members; retract them now, while the aggregates still
                // reflect the old membership.
                for link in tree.subtree_links(node) {
                    tree.uncount_link(link);
                }
                let (old_totals, old_items) = tree.removal_totals(node);
                if let Some(p) = &progress {
                    tree.inodes.set_progress(Arc::clone(p));
                }
                Self {
                    tree: Some(tree),
                    refresh: Some((node, old_totals, old_items)),
                    progress,
                    open: HashMap::new(),
                }
            }
        }
    }

    fn tree(&mut self) -> &mut Tree {
        self.tree.as_mut().expect("root event not delivered")
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Root { name, stat } => self.on_root(name, stat),
            Event::Dir {
                parent,
                id,
                name,
                stat,
            } => self.on_dir(parent, id, &name, &stat),
            Event::Stat { parent, name, stat } => self.on_stat(parent, &name, &stat),
            Event::Special { parent, name, kind } => self.on_special(parent, &name, kind),
            Event::ReadError { dir } => {
                if let Some(od) = self.open.get(&dir) {
                    let node = od.node;
                    self.tree().dir_mut(node).err = true;
                }
            }
            Event::Done { dir } => self.release(dir),
        }
    }

    fn on_root(&mut self, name: Vec<u8>, stat: EntryStat) {
        let root = match &self.refresh {
            None => {
                let mut tree = Tree::with_root(name.into_boxed_slice(), stat.dev);
                if let Some(p) = &self.progress {
                    tree.inodes.set_progress(Arc::clone(p));
                }
                self.tree = Some(tree);
                self.tree.as_ref().expect("tree present").root()
            }
            Some((node, _, _)) => *node,
        };
        let tree = self.tree.as_mut().expect("tree present");
        let dev = tree.devices.intern(stat.dev);
        {
            let d = tree.dir_mut(root);
            d.dev = dev;
            d.own = Totals::new(stat.blocks, stat.size);
            d.err = false;
        }
        tree.node_mut(root).ext = stat.ext;
        let existing = existing_map(tree, root);
        self.open.insert(
            ROOT_ID,
            OpenDir {
                node: root,
                parent: None,
                pending: 1,
                existing,
                seen: Vec::new(),
            },
        );
    }

    fn on_dir(&mut self, parent: u64, id: u64, name: &[u8], stat: &EntryStat) {
        let Some(p) = self.open.get_mut(&parent) else {
            return;
        };
        p.pending += 1;
        let parent_node = p.node;
        let reused = take_match(&mut self.open.get_mut(&parent).expect("open").existing, name, |n| {
            matches!(n.kind, NodeKind::Dir(_))
        }, self.tree.as_ref().expect("tree"));

        let tree = self.tree.as_mut().expect("tree present");
        let dev = tree.devices.intern(stat.dev);
        let node = match reused {
            Some(node) => {
                let d = tree.dir_mut(node);
                d.dev = dev;
                d.own = Totals::new(stat.blocks, stat.size);
                d.err = false;
                tree.node_mut(node).ext = stat.ext;
                node
            }
            None => tree.alloc(Node {
                name: name.to_vec().into_boxed_slice(),
                parent: Some(parent_node),
                ext: stat.ext,
                kind: NodeKind::Dir(DirNode {
                    dev,
                    own: Totals::new(stat.blocks, stat.size),
                    ..DirNode::default()
                }),
            }),
        };
        self.open.get_mut(&parent).expect("open").seen.push(node);
        let existing = existing_map(self.tree.as_ref().expect("tree"), node);
        self.open.insert(
            id,
            OpenDir {
                node,
                parent: Some(parent),
                pending: 1,
                existing,
                seen: Vec::new(),
            },
        );
    }

    fn on_stat(&mut self, parent: u64, name: &[u8], stat: &EntryStat) {
        let Some(p) = self.open.get_mut(&parent) else {
            return;
        };
        let parent_node = p.node;
        let is_link = stat.is_link && !stat.is_dir && !stat.is_nonreg;
        let want_nonreg = stat.is_nonreg;
        let reused = take_match(
            &mut self.open.get_mut(&parent).expect("open").existing,
            name,
            |n| match (&n.kind, is_link, want_nonreg) {
                (NodeKind::Link(_), true, _) => true,
                (NodeKind::NonReg(_), false, true) => true,
                (NodeKind::File(_), false, false) => true,
                _ => false,
            },
            self.tree.as_ref().expect("tree"),
        );

        let tree = self.tree.as_mut().expect("tree present");
        let node = match reused {
            Some(node) => {
                if matches!(tree.node(node).kind, NodeKind::Link(_)) {
                    // Re-key before the payload changes.
                    tree.unregister_link(node);
                    if let NodeKind::Link(l) = &mut tree.node_mut(node).kind {
                        l.blocks = stat.blocks;
                        l.size = stat.size;
                        l.ino = stat.ino;
                        l.nlink = stat.nlink;
                    }
                    tree.register_link(node);
                } else if let NodeKind::File(f) | NodeKind::NonReg(f) =
                    &mut tree.node_mut(node).kind
                {
                    f.blocks = stat.blocks;
                    f.size = stat.size;
                }
                tree.node_mut(node).ext = stat.ext;
                node
            }
            None => {
                let kind = if is_link {
                    NodeKind::Link(LinkNode {
                        blocks: stat.blocks,
                        size: stat.size,
                        ino: stat.ino,
                        nlink: stat.nlink,
                    })
                } else if want_nonreg {
                    NodeKind::NonReg(FileNode {
                        blocks: stat.blocks,
                        size: stat.size,
                    })
                } else {
                    NodeKind::File(FileNode {
                        blocks: stat.blocks,
                        size: stat.size,
                    })
                };
                let node = tree.alloc(Node {
                    name: name.to_vec().into_boxed_slice(),
                    parent: Some(parent_node),
                    ext: stat.ext,
                    kind,
                });
                if is_link {
                    tree.register_link(node);
                }
                node
            }
        };
        self.open.get_mut(&parent).expect("open").seen.push(node);
    }

    fn on_special(&mut self, parent: u64, name: &[u8], kind: SpecialKind) {
        let Some(p) = self.open.get_mut(&parent) else {
            return;
        };
        let parent_node = p.node;
        let reused = take_match(
            &mut self.open.get_mut(&parent).expect("open").existing,
            name,
            |n| matches!(&n.kind, NodeKind::Special(k) if *k == kind),
            self.tree.as_ref().expect("tree"),
        );
        let node = match reused {
            Some(node) => node,
            None => self.tree.as_mut().expect("tree").alloc(Node {
                name: name.to_vec().into_boxed_slice(),
                parent: Some(parent_node),
                ext: None,
                kind: NodeKind::Special(kind),
            }),
        };
        self.open.get_mut(&parent).expect("open").seen.push(node);
    }

    /// Release one reference on a dir; at zero, finalize it and release the
    /// parent.
    fn release(&mut self, id: u64) {
        let Some(od) = self.open.get_mut(&id) else {
            return;
        };
        od.pending -= 1;
        if od.pending > 0 {
            return;
        }
        let od = self.open.remove(&id).expect("open dir");
        self.finalize(&od);
        match od.parent {
            Some(parent) => self.release(parent),
            None => self.finish_root(&od),
        }
    }

    fn finalize(&mut self, od: &OpenDir) {
        let tree = self.tree.as_mut().expect("tree present");

        // Children from the previous pass that were not seen again are
        // gone; their hardlink classes must forget them.
        let seen: HashSet<NodeId> = od.seen.iter().copied().collect();
        let old_children = tree.dir(od.node).children.clone();
        for c in old_children {
            if !seen.contains(&c) {
                for link in tree.subtree_links(c) {
                    tree.unregister_link(link);
                }
            }
        }
        tree.dir_mut(od.node).children = od.seen.clone();

        refold_dir(tree, od.node);
        tree.update_suberr(od.node);

        // Directory mtime rises to the newest descendant's.
        if tree.node(od.node).ext.is_some() {
            let mut max_mtime = None;
            for &c in tree.dir(od.node).children.iter() {
                if let Some(ext) = &tree.node(c).ext {
                    if let Some(m) = ext.mtime {
                        max_mtime = Some(max_mtime.map_or(m, |cur: i64| cur.max(m)));
                    }
                }
            }
            if let Some(ext) = &mut tree.node_mut(od.node).ext {
                ext.bump_mtime(max_mtime);
            }
        }
    }

    /// The scan root finished: for a refresh, propagate the delta to the
    /// ancestors above it.
    fn finish_root(&mut self, od: &OpenDir) {
        let Some((node, old_totals, old_items)) = self.refresh else {
            return;
        };
        debug_assert_eq!(od.node, node);
        let tree = self.tree.as_mut().expect("tree present");
        let (new_totals, new_items) = tree.removal_totals(node);

        let ancestors: Vec<NodeId> = tree.ancestors(node).collect();
        for anc in &ancestors {
            let d = tree.dir_mut(*anc);
            d.cum.sub(old_totals);
            d.cum.add(new_totals);
            d.items = d.items.saturating_sub(old_items).saturating_add(new_items);
        }
        for anc in ancestors {
            tree.update_suberr(anc);
        }
        debug!(items = new_items, "refresh subtree merged");
    }

    fn into_tree(mut self) -> Option<Tree> {
        // A scan interrupted mid-delivery leaves dirs open; fold what we
        // have, deepest first, so the partial tree is still internally
        // consistent.
        if !self.open.is_empty() {
            let tree = self.tree.as_ref()?;
            let mut ids: Vec<(usize, u64)> = self
                .open
                .iter()
                .map(|(&id, od)| (tree.ancestors(od.node).count(), id))
                .collect();
            ids.sort_unstable_by_key(|&(depth, _)| std::cmp::Reverse(depth));
            for (_, id) in ids {
                if let Some(od) = self.open.remove(&id) {
                    self.finalize(&od);
                }
            }
            if let Some(tree) = &mut self.tree {
                tree.complete = false;
            }
        }
        self.tree
    }
}

/// Bucket a directory's current children by name hash for O(1) refresh
/// lookups.
fn existing_map(tree: &Tree, dir: NodeId) -> HashMap<u64, Vec<NodeId>> {
    let mut map: HashMap<u64, Vec<NodeId>> = HashMap::new();
    for &c in tree.dir(dir).children.iter() {
        map.entry(name_hash(&tree.node(c).name)).or_default().push(c);
    }
    map
}

/// Take a reusable child matching by name and predicate out of the bucket
/// map.
fn take_match(
    existing: &mut HashMap<u64, Vec<NodeId>>,
    name: &[u8],
    matches: impl Fn(&Node) -> bool,
    tree: &Tree,
) -> Option<NodeId> {
    let bucket = existing.get_mut(&name_hash(name))?;
    let pos = bucket
        .iter()
        .position(|&c| *tree.node(c).name == *name && matches(tree.node(c)))?;
    Some(bucket.swap_remove(pos))
}

fn name_hash(name: &[u8]) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}
