//! Filesystem operations on scanned entries
//!
//! Deletion is the one sanctioned mutation of scanned files: remove the
//! entry's filesystem object (depth-first for directories), then unlink it
//! from the tree and rebalance the ancestor aggregates. The abort flag is
//! observed between entries; interrupting mid-way leaves whatever was not
//! yet deleted both on disk and in the tree.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::Error;
use crate::model::{NodeId, Tree};

/// Delete the filesystem object behind `node` and prune it from the tree.
///
/// On partial failure the tree is pruned only if the object is actually
/// gone; otherwise it is left in place (stale) and the caller should
/// refresh the parent.
pub fn delete_entry(tree: &mut Tree, node: NodeId, abort: &AtomicBool) -> Result<(), Error> {
    let Some(parent) = tree.node(node).parent else {
        return Err(Error::Io(io::Error::other("cannot delete the scan root")));
    };
    let path = tree.path(node);
    info!(path = %path.display(), "deleting");

    let result = remove_recursive(&path, abort);
    let gone = matches!(fs::symlink_metadata(&path), Err(ref e) if e.kind() == io::ErrorKind::NotFound);
    if gone {
        prune(tree, parent, node);
    }
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(Error::Interrupted),
        Err(e) => Err(Error::Io(e)),
    }
}

fn remove_recursive(path: &Path, abort: &AtomicBool) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for dent in fs::read_dir(path)? {
            if abort.load(Ordering::Relaxed) {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            remove_recursive(&dent?.path(), abort)?;
        }
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Unlink a deleted subtree from the tree and rebalance ancestors.
fn prune(tree: &mut Tree, parent: NodeId, node: NodeId) {
    for link in tree.subtree_links(node) {
        tree.unregister_link(link);
    }
    tree.zero_stats(node);
    tree.unlink_child(parent, node);
    let mut chain = vec![parent];
    chain.extend(tree.ancestors(parent));
    for anc in chain {
        tree.update_suberr(anc);
    }
    tree.commit_hardlinks();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanOptions, Scanner};

    fn scan(path: &Path) -> Tree {
        Scanner::new(ScanOptions::default())
            .scan_to_tree(path)
            .unwrap()
    }

    fn child_named(tree: &Tree, dir: NodeId, name: &[u8]) -> NodeId {
        tree.children(dir)
            .iter()
            .copied()
            .find(|&c| *tree.node(c).name == *name)
            .unwrap()
    }

    #[test]
    fn test_delete_file_updates_aggregates() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), vec![0u8; 700]).unwrap();
        fs::write(tmp.path().join("b"), vec![0u8; 300]).unwrap();

        let mut tree = scan(tmp.path());
        let before = tree.dir(tree.root()).cum.size;
        let a = child_named(&tree, tree.root(), b"a");
        delete_entry(&mut tree, a, &AtomicBool::new(false)).unwrap();

        assert!(!tmp.path().join("a").exists());
        assert_eq!(tree.dir(tree.root()).cum.size, before - 700);
        assert_eq!(tree.children(tree.root()).len(), 1);
        assert_eq!(tree.dir(tree.root()).items, 1);
    }

    #[test]
    fn test_delete_directory_recursive() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/x"), vec![0u8; 500]).unwrap();
        fs::write(tmp.path().join("keep"), vec![0u8; 100]).unwrap();

        let mut tree = scan(tmp.path());
        let d = child_named(&tree, tree.root(), b"d");
        delete_entry(&mut tree, d, &AtomicBool::new(false)).unwrap();

        assert!(!tmp.path().join("d").exists());
        assert!(tmp.path().join("keep").exists());
        let root = tree.dir(tree.root());
        assert_eq!(root.items, 1);
        assert_eq!(root.cum.size - root.own.size, 100);
    }

    #[test]
    fn test_delete_one_hardlink_makes_other_unshared() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("x"), vec![0u8; 1000]).unwrap();
        fs::hard_link(tmp.path().join("x"), tmp.path().join("y")).unwrap();

        let mut tree = scan(tmp.path());
        assert_eq!(tree.dir(tree.root()).shared.size, 0);

        let y = child_named(&tree, tree.root(), b"y");
        delete_entry(&mut tree, y, &AtomicBool::new(false)).unwrap();

        // One visible link left of what the filesystem still counts as a
        // 2-link inode at scan time; the remaining link's class now has a
        // single member against nlink=2, so it reads as shared.
        let root = tree.dir(tree.root());
        assert_eq!(root.cum.size - root.own.size, 1000);
        assert_eq!(root.shared.size, 1000);
    }

    #[test]
    fn test_delete_root_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tree = scan(tmp.path());
        let root = tree.root();
        assert!(delete_entry(&mut tree, root, &AtomicBool::new(false)).is_err());
    }
}
