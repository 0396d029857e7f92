//! In-memory entry tree
//!
//! The tree is an arena of nodes addressed by [`NodeId`]: parents link down
//! through `children` vectors and every node links back up through `parent`,
//! which is what the hardlink accounting needs for its ancestor walks.
//! Nodes are never freed individually; removal unlinks a subtree and leaves
//! the slots unreachable, which refresh and delete rely on.

use std::path::PathBuf;

use super::devices::DevTable;
use super::entry::{Ext, SpecialKind, Totals};
use super::inodes::InodeTable;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A single entry in the tree.
#[derive(Debug, Clone)]
pub struct Node {
    /// Entry name: opaque bytes, no `/`, no NUL. The root's name is the
    /// full scan path.
    pub name: Box<[u8]>,
    /// Parent directory; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Extended metadata when scanning in extended mode.
    pub ext: Option<Ext>,
    /// Kind-specific payload.
    pub kind: NodeKind,
}

/// Kind-specific node payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Directory with aggregates and children.
    Dir(DirNode),
    /// Regular file.
    File(FileNode),
    /// Non-regular non-directory (device, socket, fifo).
    NonReg(FileNode),
    /// Hardlink candidate, member of an inode class.
    Link(LinkNode),
    /// Sizeless marker entry.
    Special(SpecialKind),
}

/// Directory payload.
#[derive(Debug, Clone, Default)]
pub struct DirNode {
    /// Interned device index.
    pub dev: u32,
    /// The directory's own inode: blocks and apparent size.
    pub own: Totals,
    /// Own plus all transitive descendants, saturating.
    pub cum: Totals,
    /// Contribution of hardlinked inodes that also live outside this dir.
    pub shared: Totals,
    /// Transitive descendant count, saturating at `u32::MAX`.
    pub items: u32,
    /// This directory itself failed to open or list.
    pub err: bool,
    /// Some transitive descendant has a read error.
    pub suberr: bool,
    /// Direct children in delivery order.
    pub children: Vec<NodeId>,
}

/// Regular / non-regular file payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileNode {
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Apparent size in bytes.
    pub size: u64,
}

/// Hardlink payload.
#[derive(Debug, Clone, Copy)]
pub struct LinkNode {
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Apparent size in bytes.
    pub size: u64,
    /// Inode number within the containing device.
    pub ino: u64,
    /// Declared link count; 0 when the import source didn't record it.
    pub nlink: u32,
}

/// The scan result: an arena of entries plus the scan-context resources
/// (device table, inode map) that §-level operations need.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    /// Interned device ids.
    pub devices: DevTable,
    /// Hardlink classes.
    pub inodes: InodeTable,
    /// False when the producing scan was interrupted.
    pub complete: bool,
}

impl Tree {
    /// Create a tree containing only a root directory.
    pub fn with_root(name: Box<[u8]>, dev_raw: u64) -> Self {
        let mut devices = DevTable::new();
        let dev = devices.intern(dev_raw);
        let root = Node {
            name,
            parent: None,
            ext: None,
            kind: NodeKind::Dir(DirNode {
                dev,
                ..DirNode::default()
            }),
        };
        Self {
            nodes: vec![root],
            devices,
            inodes: InodeTable::new(),
            complete: true,
        }
    }

    /// The root directory.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Number of allocated nodes, including unlinked ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the arena holds no nodes (never the case after `with_root`).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.idx()]
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.idx()]
    }

    /// Borrow a node's directory payload; panics if it is not a directory.
    pub fn dir(&self, id: NodeId) -> &DirNode {
        match &self.node(id).kind {
            NodeKind::Dir(d) => d,
            _ => panic!("node {:?} is not a directory", id),
        }
    }

    /// Mutably borrow a node's directory payload.
    pub fn dir_mut(&mut self, id: NodeId) -> &mut DirNode {
        match &mut self.nodes[id.idx()].kind {
            NodeKind::Dir(d) => d,
            _ => panic!("node {:?} is not a directory", id),
        }
    }

    /// Allocate a node without linking it to its parent's child list.
    ///
    /// The caller (the sink builder) links it; `parent` must already be set
    /// on the node.
    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Allocate a node and append it to `parent`'s children.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.parent = Some(parent);
        let id = self.alloc(node);
        self.dir_mut(parent).children.push(id);
        id
    }

    /// Direct children of a directory, in delivery order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.dir(id).children
    }

    /// Iterate the ancestor directories of a node, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            cur: self.node(id).parent,
        }
    }

    /// The device index governing a node: its own for directories, the
    /// nearest ancestor directory's otherwise.
    pub fn node_dev(&self, id: NodeId) -> u32 {
        if let NodeKind::Dir(d) = &self.node(id).kind {
            return d.dev;
        }
        for anc in self.ancestors(id) {
            return self.dir(anc).dev;
        }
        0
    }

    /// Reconstruct the filesystem path of a node.
    pub fn path(&self, id: NodeId) -> PathBuf {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut parts: Vec<&[u8]> = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.node(n);
            parts.push(&node.name);
            cur = node.parent;
        }
        let mut path = PathBuf::new();
        for part in parts.into_iter().rev() {
            path.push(OsStr::from_bytes(part));
        }
        path
    }

    /// The totals a subtree contributes to its ancestors' aggregates, and
    /// the number of entries it holds.
    ///
    /// Hardlinks contribute nothing here: their sizes flow exclusively
    /// through the inode classes, which callers must de-register before
    /// unlinking a subtree.
    pub fn removal_totals(&self, id: NodeId) -> (Totals, u32) {
        match &self.node(id).kind {
            NodeKind::Dir(d) => (d.cum, d.items.saturating_add(1)),
            NodeKind::File(f) | NodeKind::NonReg(f) => (Totals::new(f.blocks, f.size), 1),
            NodeKind::Link(_) | NodeKind::Special(_) => (Totals::default(), 1),
        }
    }

    /// Zero the aggregated counts of a subtree and subtract its totals from
    /// every ancestor, saturating at zero.
    ///
    /// `suberr` is not recomputed; callers follow with [`Tree::update_suberr`]
    /// on the ancestor chain.
    pub fn zero_stats(&mut self, id: NodeId) {
        let (totals, items) = self.removal_totals(id);
        let ancestors: Vec<NodeId> = self.ancestors(id).collect();
        for anc in ancestors {
            let d = self.dir_mut(anc);
            d.cum.sub(totals);
            d.items = d.items.saturating_sub(items);
        }
        self.zero_subtree(id);
    }

    fn zero_subtree(&mut self, id: NodeId) {
        if let NodeKind::Dir(d) = &mut self.nodes[id.idx()].kind {
            d.cum = Totals::default();
            d.shared = Totals::default();
            d.items = 0;
            let children = d.children.clone();
            for c in children {
                self.zero_subtree(c);
            }
        }
    }

    /// Recompute `suberr` from the immediate children only.
    pub fn update_suberr(&mut self, id: NodeId) {
        let mut suberr = false;
        for &c in self.dir(id).children.iter() {
            match &self.node(c).kind {
                NodeKind::Dir(d) => suberr |= d.err || d.suberr,
                NodeKind::Special(SpecialKind::ReadError) => suberr = true,
                _ => {}
            }
            if suberr {
                break;
            }
        }
        self.dir_mut(id).suberr = suberr;
    }

    /// Unlink `child` from `parent`'s child list. The node's slot remains
    /// allocated but unreachable.
    pub fn unlink_child(&mut self, parent: NodeId, child: NodeId) {
        let d = self.dir_mut(parent);
        if let Some(pos) = d.children.iter().position(|&c| c == child) {
            d.children.remove(pos);
        }
    }

    /// Collect every hardlink node in a subtree.
    pub fn subtree_links(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            match &self.node(n).kind {
                NodeKind::Dir(d) => stack.extend(d.children.iter().copied()),
                NodeKind::Link(_) => out.push(n),
                _ => {}
            }
        }
        out
    }

    /// Split-borrow accessor for the hardlink algorithms: the node arena and
    /// the inode table, each exclusively.
    pub(crate) fn split_inodes(&mut self) -> (&mut Vec<Node>, &mut InodeTable) {
        (&mut self.nodes, &mut self.inodes)
    }
}

/// Iterator over ancestor directories, nearest first.
pub struct Ancestors<'a> {
    tree: &'a Tree,
    cur: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.tree.node(id).parent;
        Some(id)
    }
}

/// Fold a child entry's aggregate contribution into running dir totals.
///
/// Hardlinks are excluded: they are attributed through their inode class.
pub fn child_contribution(node: &Node) -> (Totals, u32) {
    match &node.kind {
        NodeKind::Dir(d) => (d.cum, sat_add_u32(d.items, 1)),
        NodeKind::File(f) | NodeKind::NonReg(f) => (Totals::new(f.blocks, f.size), 1),
        NodeKind::Link(_) | NodeKind::Special(_) => (Totals::default(), 1),
    }
}

fn sat_add_u32(a: u32, b: u32) -> u32 {
    a.saturating_add(b)
}

/// Recompute a directory's `cum` and `items` from its own totals and its
/// children's finished aggregates. Hardlink contributions are layered on
/// afterwards by the inode table.
pub fn refold_dir(tree: &mut Tree, id: NodeId) {
    let own = tree.dir(id).own;
    let mut cum = own;
    let mut items: u32 = 0;
    let children = tree.dir(id).children.clone();
    for c in children {
        let (tot, n) = child_contribution(tree.node(c));
        cum.add(tot);
        items = items.saturating_add(n);
    }
    let d = tree.dir_mut(id);
    d.cum = cum;
    d.items = items;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, blocks: u64, size: u64) -> Node {
        Node {
            name: name.as_bytes().into(),
            parent: None,
            ext: None,
            kind: NodeKind::File(FileNode { blocks, size }),
        }
    }

    fn dir_node(name: &str, dev: u32) -> Node {
        Node {
            name: name.as_bytes().into(),
            parent: None,
            ext: None,
            kind: NodeKind::Dir(DirNode {
                dev,
                ..DirNode::default()
            }),
        }
    }

    #[test]
    fn test_path_reconstruction() {
        let mut t = Tree::with_root(b"/data".to_vec().into_boxed_slice(), 1);
        let d = t.add_child(t.root(), dir_node("sub", 0));
        let f = t.add_child(d, leaf("file.txt", 8, 100));
        assert_eq!(t.path(f), PathBuf::from("/data/sub/file.txt"));
    }

    #[test]
    fn test_zero_stats_subtracts_from_ancestors() {
        let mut t = Tree::with_root(b"/".to_vec().into_boxed_slice(), 1);
        let d = t.add_child(t.root(), dir_node("sub", 0));
        let _f = t.add_child(d, leaf("a", 8, 100));
        // Simulate the builder's aggregation.
        refold_dir(&mut t, d);
        let root = t.root();
        refold_dir(&mut t, root);
        assert_eq!(t.dir(t.root()).cum.size, 100);
        assert_eq!(t.dir(t.root()).items, 2);

        t.zero_stats(d);
        assert_eq!(t.dir(t.root()).cum.size, 0);
        assert_eq!(t.dir(t.root()).items, 0);
        assert_eq!(t.dir(d).cum.size, 0);
        assert_eq!(t.dir(d).items, 0);
    }

    #[test]
    fn test_update_suberr() {
        let mut t = Tree::with_root(b"/".to_vec().into_boxed_slice(), 1);
        let d = t.add_child(t.root(), dir_node("sub", 0));
        t.dir_mut(d).err = true;
        t.update_suberr(t.root());
        assert!(t.dir(t.root()).suberr);

        t.dir_mut(d).err = false;
        t.update_suberr(t.root());
        assert!(!t.dir(t.root()).suberr);
    }

    #[test]
    fn test_node_dev_inherits() {
        let mut t = Tree::with_root(b"/".to_vec().into_boxed_slice(), 7);
        let d = t.add_child(t.root(), dir_node("sub", 0));
        let f = t.add_child(d, leaf("a", 0, 0));
        assert_eq!(t.node_dev(f), 0);
        assert_eq!(t.node_dev(t.root()), 0); // interned index of raw dev 7
        assert_eq!(t.devices.get(t.node_dev(t.root())), 7);
    }
}
