//! Entry model: typed entries, the arena tree, device interning, and the
//! hardlink inode map.

pub mod devices;
pub mod entry;
pub mod inodes;
pub mod tree;

pub use devices::DevTable;
pub use entry::{clamp_size, sat_add, EType, EntryStat, Ext, SpecialKind, Totals, SIZE_MAX};
pub use inodes::{HardlinkProgress, InodeTable};
pub use tree::{
    child_contribution, refold_dir, DirNode, FileNode, LinkNode, Node, NodeId, NodeKind, Tree,
};
