//! Sources: everything that can feed a sink
//!
//! The scanner is one source; this module holds the other two — replaying
//! a finished in-memory tree (JSON/binary export of a scan) and importing
//! a persisted export (with format sniffing) — plus the convenience
//! drivers the CLI calls.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::info;

use crate::binfmt::{ItemRef, ParsedEntry, Reader, SIGNATURE};
use crate::error::{Error, FormatError, ImportError};
use crate::jsonfmt::import_json;
use crate::model::{clamp_size, EType, EntryStat, NodeId, NodeKind, Tree};
use crate::sink::{BinSink, JsonSink, MemSink, ScanCounters, Sink, SinkDir, SinkThread};

/// Zstd frame magic, for sniffing compressed JSON exports.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// ------------------------------------------------------------ tree replay

/// Feed a finished tree into a sink, depth-first. This is how a scanned
/// tree becomes a JSON or binary export.
pub fn replay_tree(tree: &Tree, sink: &Sink, t: &mut SinkThread) -> Result<(), Error> {
    let root = tree.root();
    let stat = dir_stat(tree, root);
    let dir = sink.create_root(&tree.node(root).name, &stat);
    if tree.dir(root).err {
        dir.set_read_error(t);
    }
    replay_children(tree, root, &dir, t);
    dir.done(t);
    Ok(())
}

fn replay_children(tree: &Tree, id: NodeId, dir: &SinkDir, t: &mut SinkThread) {
    for &c in tree.children(id) {
        let node = tree.node(c);
        match &node.kind {
            NodeKind::Dir(d) => {
                let child = dir.add_dir(t, &node.name, &dir_stat(tree, c));
                if d.err {
                    child.set_read_error(t);
                }
                replay_children(tree, c, &child, t);
                child.done(t);
            }
            NodeKind::File(f) => dir.add_stat(
                t,
                &node.name,
                &EntryStat {
                    blocks: f.blocks,
                    size: f.size,
                    nlink: 1,
                    ext: node.ext,
                    ..EntryStat::default()
                },
            ),
            NodeKind::NonReg(f) => dir.add_stat(
                t,
                &node.name,
                &EntryStat {
                    is_nonreg: true,
                    blocks: f.blocks,
                    size: f.size,
                    nlink: 1,
                    ext: node.ext,
                    ..EntryStat::default()
                },
            ),
            NodeKind::Link(l) => dir.add_stat(
                t,
                &node.name,
                &EntryStat {
                    is_link: true,
                    blocks: l.blocks,
                    size: l.size,
                    dev: tree.devices.get(tree.node_dev(c)),
                    ino: l.ino,
                    nlink: l.nlink,
                    ext: node.ext,
                    ..EntryStat::default()
                },
            ),
            NodeKind::Special(kind) => dir.add_special(t, &node.name, *kind),
        }
    }
}

fn dir_stat(tree: &Tree, id: NodeId) -> EntryStat {
    let d = tree.dir(id);
    EntryStat {
        is_dir: true,
        blocks: d.own.blocks,
        size: d.own.size,
        dev: tree.devices.get(d.dev),
        nlink: 1,
        ext: tree.node(id).ext,
        ..EntryStat::default()
    }
}

// ---------------------------------------------------------- binary import

/// Stream a binary container into a sink, depth-first from the root.
pub fn import_binary(file: File, sink: &Sink, t: &mut SinkThread) -> Result<(), Error> {
    let mut rd = Reader::open(file)?;
    let root = rd.parse_entry(rd.root())?;
    if !root.is_dir() {
        return Err(FormatError::BadEncoding {
            detail: "root entry is not a directory".into(),
            last_ref: rd.last_ref(),
        }
        .into());
    }
    let stat = parsed_stat(&root, true, root.dev.unwrap_or(0));
    let dir = sink.create_root(&root.name, &stat);
    if root.rderr == Some(true) {
        dir.set_read_error(t);
    }
    import_chain(&mut rd, root.sub, &dir, t, stat.dev)?;
    dir.done(t);
    info!(blocks = rd.block_count(), "binary import complete");
    Ok(())
}

fn import_chain(
    rd: &mut Reader,
    sub: Option<ItemRef>,
    dir: &SinkDir,
    t: &mut SinkThread,
    dev: u64,
) -> Result<(), Error> {
    let mut next = sub;
    while let Some(r) = next {
        let entry = rd.parse_entry(r)?;
        next = entry.prev;
        match entry.etype.expect("parse_entry guarantees a type") {
            EType::Dir => {
                let stat = parsed_stat(&entry, true, dev);
                let child = dir.add_dir(t, &entry.name, &stat);
                if entry.rderr == Some(true) {
                    child.set_read_error(t);
                }
                import_chain(rd, entry.sub, &child, t, stat.dev)?;
                child.done(t);
            }
            EType::Special(kind) => dir.add_special(t, &entry.name, kind),
            _ => dir.add_stat(t, &entry.name, &parsed_stat(&entry, false, dev)),
        }
    }
    Ok(())
}

fn parsed_stat(e: &ParsedEntry, is_dir: bool, parent_dev: u64) -> EntryStat {
    EntryStat {
        is_dir,
        is_nonreg: e.etype == Some(EType::NonReg),
        is_link: e.etype == Some(EType::Link),
        blocks: clamp_size(e.dsize.unwrap_or(0) / 512),
        size: clamp_size(e.asize.unwrap_or(0)),
        dev: e.dev.unwrap_or(parent_dev),
        ino: e.ino.unwrap_or(0),
        nlink: u32::try_from(e.nlink.unwrap_or(0)).unwrap_or(u32::MAX),
        ext: (!e.ext.is_empty()).then_some(e.ext),
    }
}

// ------------------------------------------------------ import orchestration

/// Import an export file into a sink, sniffing the format: the binary
/// container by signature, zstd-compressed JSON by frame magic, plain JSON
/// otherwise. `None` reads standard input, which cannot carry the binary
/// format (it needs seeking).
pub fn import_path(path: Option<&Path>, sink: &Sink, t: &mut SinkThread) -> Result<(), Error> {
    match path {
        Some(p) => {
            let mut f = File::open(p).map_err(ImportError::Io)?;
            let mut magic = [0u8; 8];
            let n = read_up_to(&mut f, &mut magic).map_err(ImportError::Io)?;
            f.seek(SeekFrom::Start(0)).map_err(ImportError::Io)?;
            if n >= SIGNATURE.len() && magic == SIGNATURE {
                import_binary(f, sink, t)
            } else if n >= ZSTD_MAGIC.len() && magic[..4] == ZSTD_MAGIC {
                let dec = zstd::stream::read::Decoder::new(f).map_err(ImportError::Io)?;
                import_json(dec, sink, t)
            } else {
                import_json(std::io::BufReader::new(f), sink, t)
            }
        }
        None => {
            let mut stdin = std::io::stdin().lock();
            let mut magic = [0u8; 8];
            let n = read_up_to(&mut stdin, &mut magic).map_err(ImportError::Io)?;
            if n >= SIGNATURE.len() && magic == SIGNATURE {
                return Err(ImportError::NotSeekable.into());
            }
            let chained = std::io::Cursor::new(magic[..n].to_vec()).chain(stdin);
            if n >= ZSTD_MAGIC.len() && magic[..4] == ZSTD_MAGIC {
                let dec = zstd::stream::read::Decoder::new(chained).map_err(ImportError::Io)?;
                import_json(dec, sink, t)
            } else {
                import_json(chained, sink, t)
            }
        }
    }
}

fn read_up_to(rd: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let got = rd.read(&mut buf[n..])?;
        if got == 0 {
            break;
        }
        n += got;
    }
    Ok(n)
}

/// Import an export into a fresh memory tree.
pub fn import_to_tree(path: Option<&Path>) -> Result<Tree, Error> {
    let counters = ScanCounters::new(1);
    let sink = Sink::Memory(MemSink::new());
    let mut threads = sink.create_threads(&counters);
    import_path(path, &sink, &mut threads[0])?;
    drop(threads);
    let Sink::Memory(mem) = sink else {
        unreachable!()
    };
    Ok(mem.finish()?)
}

// ------------------------------------------------------ export orchestration

/// Write a tree as a JSON export, compressed when a level is given.
pub fn export_json_tree(
    tree: &Tree,
    out: Box<dyn Write + Send>,
    compress: Option<i32>,
) -> Result<(), Error> {
    let counters = ScanCounters::new(1);
    let sink = Sink::Json(JsonSink::new(out, compress)?);
    let mut threads = sink.create_threads(&counters);
    replay_tree(tree, &sink, &mut threads[0])?;
    drop(threads);
    let Sink::Json(j) = sink else { unreachable!() };
    j.finish()?;
    Ok(())
}

/// Write a tree as a binary export.
pub fn export_binary_tree(
    tree: &Tree,
    out: Box<dyn Write + Send>,
    level: i32,
    block_size: usize,
) -> Result<(), Error> {
    let counters = ScanCounters::new(1);
    let sink = Sink::Binary(BinSink::new(out, level, block_size)?);
    let mut threads = sink.create_threads(&counters);
    replay_tree(tree, &sink, &mut threads[0])?;
    let Sink::Binary(b) = &sink else {
        unreachable!()
    };
    b.finish_thread(&mut threads[0]);
    drop(threads);
    let Sink::Binary(b) = sink else { unreachable!() };
    b.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Totals;
    use std::fs;

    fn sample_tree() -> Tree {
        let mut tree = Tree::with_root(b"/r".to_vec().into_boxed_slice(), 1);
        let root = tree.root();
        tree.dir_mut(root).own = Totals::new(8, 4096);
        tree.add_child(
            root,
            crate::model::Node {
                name: b"a".to_vec().into_boxed_slice(),
                parent: None,
                ext: None,
                kind: NodeKind::File(crate::model::FileNode {
                    blocks: 8,
                    size: 100,
                }),
            },
        );
        let sub = tree.add_child(
            root,
            crate::model::Node {
                name: b"sub".to_vec().into_boxed_slice(),
                parent: None,
                ext: None,
                kind: NodeKind::Dir(crate::model::DirNode {
                    dev: 0,
                    own: Totals::new(8, 4096),
                    ..crate::model::DirNode::default()
                }),
            },
        );
        tree.add_child(
            sub,
            crate::model::Node {
                name: b"b".to_vec().into_boxed_slice(),
                parent: None,
                ext: None,
                kind: NodeKind::File(crate::model::FileNode {
                    blocks: 16,
                    size: 300,
                }),
            },
        );
        crate::model::refold_dir(&mut tree, sub);
        crate::model::refold_dir(&mut tree, root);
        tree
    }

    #[test]
    fn test_binary_round_trip_preserves_aggregates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.bin");
        let orig = sample_tree();
        export_binary_tree(
            &orig,
            Box::new(fs::File::create(&path).unwrap()),
            3,
            64 * 1024,
        )
        .unwrap();

        let re = import_to_tree(Some(&path)).unwrap();
        let (a, b) = (orig.dir(orig.root()), re.dir(re.root()));
        assert_eq!(a.cum, b.cum);
        assert_eq!(a.items, b.items);
        assert_eq!(&*re.node(re.root()).name, b"/r");
    }

    #[test]
    fn test_json_round_trip_preserves_aggregates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.json");
        let orig = sample_tree();
        export_json_tree(&orig, Box::new(fs::File::create(&path).unwrap()), None).unwrap();

        let re = import_to_tree(Some(&path)).unwrap();
        assert_eq!(orig.dir(orig.root()).cum, re.dir(re.root()).cum);
        assert_eq!(orig.dir(orig.root()).items, re.dir(re.root()).items);
    }

    #[test]
    fn test_compressed_json_sniffed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.json.zst");
        let orig = sample_tree();
        export_json_tree(&orig, Box::new(fs::File::create(&path).unwrap()), Some(5)).unwrap();

        let re = import_to_tree(Some(&path)).unwrap();
        assert_eq!(orig.dir(orig.root()).items, re.dir(re.root()).items);
    }

    #[test]
    fn test_binary_to_json_conversion_streams() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("t.bin");
        let json = tmp.path().join("t.json");
        export_binary_tree(
            &sample_tree(),
            Box::new(fs::File::create(&bin).unwrap()),
            3,
            64 * 1024,
        )
        .unwrap();

        // Stream the container straight into the JSON sink.
        let counters = ScanCounters::new(1);
        let sink = Sink::Json(
            JsonSink::new(Box::new(fs::File::create(&json).unwrap()), None).unwrap(),
        );
        let mut threads = sink.create_threads(&counters);
        import_binary(fs::File::open(&bin).unwrap(), &sink, &mut threads[0]).unwrap();
        drop(threads);
        let Sink::Json(j) = sink else { unreachable!() };
        j.finish().unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&fs::read(&json).unwrap()).unwrap();
        let root = doc.as_array().unwrap()[3].as_array().unwrap();
        assert_eq!(root[0]["name"], "/r");
    }
}
