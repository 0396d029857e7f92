//! Hardlink accounting
//!
//! Every hardlink candidate (nlink > 1) belongs to an inode class keyed by
//! `(device index, inode)`. A class is either *counted* — its sizes are
//! reflected in the ancestor aggregates — or pending a (re)count. Counting
//! walks each member's ancestor chain, attributes the class size once per
//! ancestor, and attributes it to `shared` on every ancestor that does not
//! contain the whole class.
//!
//! Membership changes always un-count the class first (subtracting the old
//! attribution) so the later commit starts from a clean slate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::entry::Totals;
use super::tree::{Node, NodeId, NodeKind, Tree};

type ClassKey = (u32, u64);

/// One inode equivalence class.
#[derive(Debug, Default)]
struct InodeClass {
    /// Member link nodes, in registration order.
    links: Vec<NodeId>,
    /// Whether the class is currently reflected in ancestor aggregates.
    counted: bool,
}

/// Progress of the commit pass, sampled by the UI thread.
#[derive(Debug, Default)]
pub struct HardlinkProgress {
    /// Classes processed so far. Monotonic within one commit.
    pub done: AtomicU64,
    /// Classes to process in the current commit.
    pub total: AtomicU64,
}

/// The inode map: `(dev, ino)` → class, plus the incremental-recount state.
#[derive(Debug)]
pub struct InodeTable {
    map: HashMap<ClassKey, InodeClass>,
    /// Classes awaiting a (re)count. Cleared in favor of a full sweep when
    /// it grows past one-eighth of the map.
    pending: HashSet<ClassKey>,
    full_sweep: bool,
    progress: Arc<HardlinkProgress>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            pending: HashSet::new(),
            full_sweep: false,
            progress: Arc::new(HardlinkProgress::default()),
        }
    }

    /// Number of inode classes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no class is registered.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Shared handle to the commit progress counters.
    pub fn progress(&self) -> Arc<HardlinkProgress> {
        Arc::clone(&self.progress)
    }

    /// Publish commit progress through `progress` instead of the table's
    /// own counters, so a UI set up before the scan can watch the commit.
    pub fn set_progress(&mut self, progress: Arc<HardlinkProgress>) {
        self.progress = progress;
    }

    /// Member nodes of a class, if present.
    pub fn class_links(&self, dev: u32, ino: u64) -> Option<&[NodeId]> {
        self.map.get(&(dev, ino)).map(|c| c.links.as_slice())
    }

    fn mark_pending(&mut self, key: ClassKey) {
        if self.full_sweep {
            return;
        }
        self.pending.insert(key);
        if self.pending.len() > self.map.len() / 8 && self.map.len() >= 8 {
            self.pending.clear();
            self.full_sweep = true;
        }
    }

    fn uncount(&mut self, nodes: &mut [Node], key: ClassKey) {
        if let Some(class) = self.map.get_mut(&key) {
            if class.counted {
                set_stats(nodes, &class.links, false);
                class.counted = false;
            }
        }
        self.mark_pending(key);
    }

    fn add(&mut self, nodes: &mut [Node], key: ClassKey, link: NodeId) {
        self.uncount(nodes, key);
        let class = self.map.entry(key).or_default();
        if !class.links.contains(&link) {
            class.links.push(link);
        }
        self.mark_pending(key);
    }

    fn remove(&mut self, nodes: &mut [Node], key: ClassKey, link: NodeId) {
        self.uncount(nodes, key);
        if let Some(class) = self.map.get_mut(&key) {
            class.links.retain(|&l| l != link);
            if class.links.is_empty() {
                self.map.remove(&key);
                self.pending.remove(&key);
            }
        }
    }

    fn commit(&mut self, nodes: &mut [Node]) {
        let keys: Vec<ClassKey> = if self.full_sweep {
            self.map.keys().copied().collect()
        } else {
            self.pending.iter().copied().collect()
        };
        self.progress.total.store(keys.len() as u64, Ordering::Relaxed);
        self.progress.done.store(0, Ordering::Relaxed);

        for (i, key) in keys.iter().enumerate() {
            if i % 64 == 0 {
                self.progress.done.store(i as u64, Ordering::Relaxed);
            }
            if let Some(class) = self.map.get_mut(key) {
                if !class.counted {
                    set_stats(nodes, &class.links, true);
                    class.counted = true;
                }
            }
        }
        self.progress
            .done
            .store(keys.len() as u64, Ordering::Relaxed);
        self.pending.clear();
        self.full_sweep = false;
    }
}

impl Tree {
    /// Register a hardlink node in its inode class and mark the class for
    /// (re)counting. Also used when a refresh updates a reused link in
    /// place.
    pub fn register_link(&mut self, id: NodeId) {
        let key = self.link_key(id);
        let (nodes, table) = self.split_inodes();
        table.add(nodes, key, id);
    }

    /// Remove a hardlink node from its class, un-counting it first. The
    /// class disappears when its last member goes.
    pub fn unregister_link(&mut self, id: NodeId) {
        let key = self.link_key(id);
        let (nodes, table) = self.split_inodes();
        table.remove(nodes, key, id);
    }

    /// Retract a link's class from the aggregates without changing its
    /// membership, leaving it pending. Refresh uses this before rescanning
    /// a subtree, while the aggregates still reflect the old state.
    pub fn uncount_link(&mut self, id: NodeId) {
        let key = self.link_key(id);
        let (nodes, table) = self.split_inodes();
        table.uncount(nodes, key);
    }

    /// Commit all pending (or, after a sweep trigger, all) classes into the
    /// ancestor aggregates. Must run from a quiescent state: no scanner
    /// threads may be mutating the tree.
    pub fn commit_hardlinks(&mut self) {
        let (nodes, table) = self.split_inodes();
        table.commit(nodes);
    }

    /// A link node's class key: the nearest ancestor directory's device and
    /// the link's inode.
    fn link_key(&self, id: NodeId) -> ClassKey {
        let ino = match &self.node(id).kind {
            NodeKind::Link(l) => l.ino,
            _ => panic!("node {:?} is not a hardlink", id),
        };
        (self.node_dev(id), ino)
    }
}

/// Attribute (or retract) a class's size to every ancestor of its members.
///
/// Sizes come from the representative (first) member. The effective nlink is
/// the declared count when all members agree on a non-zero value, the class
/// size otherwise. An ancestor holding fewer than nlink members gets the
/// size attributed to `shared` as well.
fn set_stats(nodes: &mut [Node], links: &[NodeId], add: bool) {
    let Some(&rep) = links.first() else {
        return;
    };
    let (blocks, size) = match &nodes[rep.0 as usize].kind {
        NodeKind::Link(l) => (l.blocks, l.size),
        _ => return,
    };
    let totals = Totals::new(blocks, size);

    let mut declared: Option<u32> = None;
    let mut consistent = true;
    for &l in links {
        if let NodeKind::Link(ln) = &nodes[l.0 as usize].kind {
            match (declared, ln.nlink) {
                (_, 0) => consistent = false,
                (None, n) => declared = Some(n),
                (Some(d), n) if d != n => consistent = false,
                _ => {}
            }
        }
    }
    let nlink = match declared {
        Some(d) if consistent => d as u64,
        _ => links.len() as u64,
    };

    // Census: how many members live under each ancestor.
    let mut census: HashMap<NodeId, u32> = HashMap::new();
    for &l in links {
        let mut cur = nodes[l.0 as usize].parent;
        while let Some(p) = cur {
            if matches!(nodes[p.0 as usize].kind, NodeKind::Dir(_)) {
                *census.entry(p).or_insert(0) += 1;
            }
            cur = nodes[p.0 as usize].parent;
        }
    }

    for (dir, members) in census {
        if let NodeKind::Dir(d) = &mut nodes[dir.0 as usize].kind {
            if add {
                d.cum.add(totals);
            } else {
                d.cum.sub(totals);
            }
            if (members as u64) < nlink {
                if add {
                    d.shared.add(totals);
                } else {
                    d.shared.sub(totals);
                }
            }
        }
    }
}
