//! Integration tests for duscan
//!
//! End-to-end scenarios over real scratch trees: scan aggregation,
//! hardlink accounting, export/import round trips, and the binary
//! container's structural invariants.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use duscan::binfmt::{split_block_header, Reader, BLOCK_DATA};
use duscan::model::{NodeId, NodeKind, SpecialKind, Tree};
use duscan::scan::{ScanOptions, Scanner};
use duscan::sources;
use tempfile::tempdir;

fn scan(path: &Path, threads: usize) -> Tree {
    Scanner::new(ScanOptions {
        threads,
        ..ScanOptions::default()
    })
    .scan_to_tree(path)
    .unwrap()
}

fn child(tree: &Tree, dir: NodeId, name: &[u8]) -> NodeId {
    tree.children(dir)
        .iter()
        .copied()
        .find(|&c| *tree.node(c).name == *name)
        .unwrap_or_else(|| panic!("no child named {:?}", String::from_utf8_lossy(name)))
}

/// Invariant: every directory's cumulative totals equal its own totals
/// plus its children's, with hardlinks attributed through their classes.
/// Holds exactly for trees without hardlinks.
fn verify_additivity(tree: &Tree, dir: NodeId) {
    let d = tree.dir(dir);
    let mut size = d.own.size;
    let mut blocks = d.own.blocks;
    let mut items = 0u32;
    for &c in tree.children(dir) {
        match &tree.node(c).kind {
            NodeKind::Dir(cd) => {
                verify_additivity(tree, c);
                size += cd.cum.size;
                blocks += cd.cum.blocks;
                items += cd.items + 1;
            }
            NodeKind::File(f) | NodeKind::NonReg(f) => {
                size += f.size;
                blocks += f.blocks;
                items += 1;
            }
            NodeKind::Link(_) | NodeKind::Special(_) => items += 1,
        }
    }
    assert_eq!(d.cum.size, size, "cum size mismatch");
    assert_eq!(d.cum.blocks, blocks, "cum blocks mismatch");
    assert_eq!(d.items, items, "items mismatch");
}

#[test]
fn scenario_three_files_one_dir() {
    let tmp = tempdir().unwrap();
    let r = tmp.path();
    fs::write(r.join("a"), vec![1u8; 100]).unwrap();
    fs::write(r.join("b"), vec![1u8; 200]).unwrap();
    fs::write(r.join("c"), vec![1u8; 300]).unwrap();

    let tree = scan(r, 2);
    let root = tree.dir(tree.root());
    assert_eq!(root.items, 3);
    assert_eq!(root.cum.size - root.own.size, 600);
    assert_eq!(root.shared.size, 0);
    assert_eq!(root.shared.blocks, 0);
    verify_additivity(&tree, tree.root());
}

#[test]
fn scenario_hardlink_fully_inside() {
    let tmp = tempdir().unwrap();
    let r = tmp.path();
    fs::write(r.join("x"), vec![1u8; 1000]).unwrap();
    fs::hard_link(r.join("x"), r.join("y")).unwrap();

    let tree = scan(r, 2);
    let root = tree.dir(tree.root());
    assert_eq!(root.items, 2);
    assert_eq!(root.cum.size - root.own.size, 1000);
    assert_eq!(root.shared.size, 0);
    assert_eq!(root.shared.blocks, 0);
}

#[test]
fn scenario_hardlink_partly_outside() {
    let tmp = tempdir().unwrap();
    fs::create_dir(tmp.path().join("r")).unwrap();
    fs::create_dir(tmp.path().join("s")).unwrap();
    fs::write(tmp.path().join("r/x"), vec![1u8; 1000]).unwrap();
    fs::hard_link(tmp.path().join("r/x"), tmp.path().join("s/y")).unwrap();

    // Scan rooted at r sees one of the two links.
    let tree = scan(&tmp.path().join("r"), 1);
    let root = tree.dir(tree.root());
    assert_eq!(root.cum.size - root.own.size, 1000);
    assert_eq!(root.shared.size, 1000);
    assert!(root.shared.blocks > 0);
}

#[test]
fn scenario_read_error_dir() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempdir().unwrap();
    let forbidden = tmp.path().join("forbidden");
    fs::create_dir(&forbidden).unwrap();
    fs::set_permissions(&forbidden, fs::Permissions::from_mode(0o000)).unwrap();
    // Root can read anything; the scenario needs the open to fail.
    let openable = fs::read_dir(&forbidden).is_ok();

    let tree = scan(tmp.path(), 1);
    fs::set_permissions(&forbidden, fs::Permissions::from_mode(0o755)).unwrap();
    if openable {
        return;
    }

    let f = child(&tree, tree.root(), b"forbidden");
    assert!(tree.dir(f).err);
    assert!(tree.dir(tree.root()).suberr);
}

#[test]
fn scenario_binary_round_trip() {
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    fs::write(r.join("a"), vec![1u8; 100]).unwrap();
    fs::write(r.join("b"), vec![1u8; 200]).unwrap();
    fs::create_dir(r.join("d")).unwrap();
    fs::write(r.join("d/c"), vec![1u8; 300]).unwrap();
    fs::hard_link(r.join("a"), r.join("d/a2")).unwrap();

    let orig = scan(&r, 2);
    let bin = tmp.path().join("out.bin");
    sources::export_binary_tree(
        &orig,
        Box::new(fs::File::create(&bin).unwrap()),
        3,
        64 * 1024,
    )
    .unwrap();

    let re = sources::import_to_tree(Some(&bin)).unwrap();
    let (a, b) = (orig.dir(orig.root()), re.dir(re.root()));
    assert_eq!(a.cum, b.cum);
    assert_eq!(a.shared, b.shared);
    assert_eq!(a.items, b.items);

    // Per-directory equality too.
    let (da, db) = (child(&orig, orig.root(), b"d"), child(&re, re.root(), b"d"));
    assert_eq!(orig.dir(da).cum, re.dir(db).cum);
    assert_eq!(orig.dir(da).shared, re.dir(db).shared);
}

#[test]
fn scenario_otherfs_special_round_trips() {
    // Mount points can't be fabricated in a test; the special flows
    // through import/export instead.
    let doc = r#"[1,2,{},
        [{"name":"/r","asize":4096,"dsize":4096},
         {"name":"mnt","excluded":"otherfs"},
         {"name":"proc","excluded":"kernfs"}]]"#;
    let tmp = tempdir().unwrap();
    let json_in = tmp.path().join("in.json");
    fs::write(&json_in, doc).unwrap();

    let tree = sources::import_to_tree(Some(&json_in)).unwrap();
    let mnt = child(&tree, tree.root(), b"mnt");
    assert!(matches!(
        tree.node(mnt).kind,
        NodeKind::Special(SpecialKind::OtherFs)
    ));
    // Specials carry no size.
    assert_eq!(tree.dir(tree.root()).cum.size, 4096);

    let json_out = tmp.path().join("out.json");
    sources::export_json_tree(&tree, Box::new(fs::File::create(&json_out).unwrap()), None).unwrap();
    let text = fs::read_to_string(&json_out).unwrap();
    assert!(text.contains("\"excluded\":\"otherfs\""));
    assert!(text.contains("\"excluded\":\"kernfs\""));
}

#[test]
fn property_block_index_consistency() {
    // Many small blocks: export a wide tree with the minimum block size.
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    for i in 0..200 {
        fs::write(r.join(format!("file-{i:04}")), vec![0u8; 64]).unwrap();
    }
    let tree = scan(&r, 1);
    let bin = tmp.path().join("wide.bin");
    sources::export_binary_tree(&tree, Box::new(fs::File::create(&bin).unwrap()), 3, 4 * 1024)
        .unwrap();

    let data = fs::read(&bin).unwrap();
    let tail = u32::from_be_bytes(data[data.len() - 4..].try_into().unwrap());
    let (_, index_len) = split_block_header(tail);
    let index_start = data.len() - index_len as usize;
    let slots = &data[index_start + 4..data.len() - 4 - 8];

    let mut seen = 0;
    for (n, slot) in slots.chunks_exact(8).enumerate() {
        let slot = u64::from_be_bytes(slot.try_into().unwrap());
        if slot == 0 {
            continue; // reserved but unused
        }
        let (off, len) = ((slot >> 24) as usize, (slot & 0xFF_FFFF) as usize);
        let header = u32::from_be_bytes(data[off..off + 4].try_into().unwrap());
        let (kind, total) = split_block_header(header);
        assert_eq!(kind, BLOCK_DATA);
        assert_eq!(total as usize, len);
        let trailer = u32::from_be_bytes(data[off + len - 4..off + len].try_into().unwrap());
        assert_eq!(header, trailer);
        let num = u32::from_be_bytes(data[off + 4..off + 8].try_into().unwrap());
        assert_eq!(num as usize, n);
        seen += 1;
    }
    assert!(seen > 1, "expected multiple data blocks");
}

#[test]
fn property_reference_closure() {
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    fs::write(r.join("a"), vec![0u8; 10]).unwrap();
    fs::create_dir(r.join("d")).unwrap();
    fs::write(r.join("d/b"), vec![0u8; 20]).unwrap();
    fs::create_dir(r.join("d/e")).unwrap();

    let tree = scan(&r, 2);
    let bin = tmp.path().join("t.bin");
    sources::export_binary_tree(&tree, Box::new(fs::File::create(&bin).unwrap()), 3, 64 * 1024)
        .unwrap();

    // Walk every reachable entry; the count must equal the emitted count
    // (root + items).
    let mut rd = Reader::open(fs::File::open(&bin).unwrap()).unwrap();
    fn walk(rd: &mut Reader, sub: Option<duscan::binfmt::ItemRef>) -> u64 {
        let mut count = 0;
        let mut next = sub;
        while let Some(r) = next {
            let e = rd.parse_entry(r).unwrap();
            next = e.prev;
            count += 1;
            if e.is_dir() {
                count += walk(rd, e.sub);
            }
        }
        count
    }
    let root = rd.parse_entry(rd.root()).unwrap();
    let reached = 1 + walk(&mut rd, root.sub);
    assert_eq!(reached, 1 + u64::from(tree.dir(tree.root()).items));
}

#[test]
fn property_utf8_escape_round_trip() {
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    let weird: &[u8] = b"caf\xe9-\xff\xfe.txt"; // latin-1 and invalid bytes
    fs::write(r.join(OsStr::from_bytes(weird)), b"data").unwrap();

    let tree = scan(&r, 1);
    let json = tmp.path().join("t.json");
    sources::export_json_tree(&tree, Box::new(fs::File::create(&json).unwrap()), None).unwrap();

    let re = sources::import_to_tree(Some(&json)).unwrap();
    let c = tree.children(tree.root())[0];
    let rc = re.children(re.root())[0];
    assert_eq!(tree.node(c).name, re.node(rc).name);
    assert_eq!(&*re.node(rc).name, weird);
}

#[test]
fn property_numeric_clamp() {
    use duscan::model::SIZE_MAX;

    // A fabricated import with sizes beyond the representable range.
    let doc = format!(
        r#"[1,2,{{}},[{{"name":"/r"}},{{"name":"huge","asize":{},"dsize":{}}}]]"#,
        u64::MAX,
        u64::MAX
    );
    let tmp = tempdir().unwrap();
    let json = tmp.path().join("huge.json");
    fs::write(&json, doc).unwrap();

    let tree = sources::import_to_tree(Some(&json)).unwrap();
    let c = tree.children(tree.root())[0];
    match &tree.node(c).kind {
        NodeKind::File(f) => {
            assert_eq!(f.size, SIZE_MAX);
            assert!(f.blocks <= SIZE_MAX);
        }
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(tree.dir(tree.root()).cum.size, SIZE_MAX);
}

#[test]
fn property_idempotent_refresh_with_hardlinks() {
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    fs::create_dir(r.join("d")).unwrap();
    fs::write(r.join("x"), vec![0u8; 400]).unwrap();
    fs::hard_link(r.join("x"), r.join("d/y")).unwrap();

    let scanner = Scanner::new(ScanOptions::default());
    let mut tree = scanner.scan_to_tree(&r).unwrap();
    let root_before = (tree.dir(tree.root()).cum, tree.dir(tree.root()).shared);
    let d = child(&tree, tree.root(), b"d");
    let d_before = (tree.dir(d).cum, tree.dir(d).shared);

    scanner.refresh(&mut tree, d).unwrap();

    let d = child(&tree, tree.root(), b"d");
    assert_eq!(tree.dir(tree.root()).cum, root_before.0);
    assert_eq!(tree.dir(tree.root()).shared, root_before.1);
    assert_eq!(tree.dir(d).cum, d_before.0);
    assert_eq!(tree.dir(d).shared, d_before.1);
}

#[test]
fn scan_to_json_and_back_matches_direct_binary_path() {
    // The same tree through both persistence formats converges.
    let tmp = tempdir().unwrap();
    let r = tmp.path().join("r");
    fs::create_dir(&r).unwrap();
    fs::write(r.join("a"), vec![3u8; 123]).unwrap();
    fs::create_dir(r.join("d")).unwrap();
    fs::write(r.join("d/b"), vec![3u8; 456]).unwrap();

    let tree = scan(&r, 2);
    let json = tmp.path().join("t.json");
    let bin = tmp.path().join("t.bin");
    sources::export_json_tree(&tree, Box::new(fs::File::create(&json).unwrap()), None).unwrap();
    sources::export_binary_tree(&tree, Box::new(fs::File::create(&bin).unwrap()), 3, 64 * 1024)
        .unwrap();

    let from_json = sources::import_to_tree(Some(&json)).unwrap();
    let from_bin = sources::import_to_tree(Some(&bin)).unwrap();
    assert_eq!(
        from_json.dir(from_json.root()).cum,
        from_bin.dir(from_bin.root()).cum
    );
    assert_eq!(
        from_json.dir(from_json.root()).items,
        from_bin.dir(from_bin.root()).items
    );
    verify_additivity(&from_json, from_json.root());
    verify_additivity(&from_bin, from_bin.root());
}
