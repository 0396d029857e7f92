//! Binary container reader
//!
//! Random access by itemref: the index block is loaded up front, data
//! blocks are fetched and decompressed on demand into a small fixed-size
//! LRU. The cache is a linear scan over eight slots; decompressed blocks
//! can be large, so a bigger cache would cost more than it saves.
//!
//! All corruption is fatal. Errors carry the last successfully parsed
//! itemref for diagnostics.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::debug;

use super::cbor::{self, Head};
use super::{keys, split_block_header, ItemRef, BLOCK_DATA, BLOCK_INDEX, MAX_BLOCK_RAW, SIGNATURE};
use crate::error::{FormatError, FormatResult};
use crate::model::{EType, Ext};

const CACHE_SLOTS: usize = 8;

#[derive(Debug)]
struct CacheSlot {
    block: u64,
    stamp: u64,
    data: Arc<Vec<u8>>,
}

/// Random-access reader over a binary export.
#[derive(Debug)]
pub struct Reader {
    file: File,
    file_len: u64,
    /// One `(offset << 24) | length` slot per block.
    slots: Vec<u64>,
    root: ItemRef,
    cache: Vec<CacheSlot>,
    stamp: u64,
    last_ref: u64,
}

impl Reader {
    /// Open a container: validate the signature and load the index block.
    pub fn open(mut file: File) -> FormatResult<Self> {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < (SIGNATURE.len() + 4 + 8 + 4) as u64 {
            return Err(FormatError::BadSignature);
        }

        let mut sig = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut sig)?;
        if sig != SIGNATURE {
            return Err(FormatError::BadSignature);
        }

        let mut word = [0u8; 4];
        file.seek(SeekFrom::End(-4))?;
        file.read_exact(&mut word)?;
        let trailer = u32::from_be_bytes(word);
        let (kind, len) = split_block_header(trailer);
        if kind != BLOCK_INDEX {
            return Err(FormatError::BadBlockKind { kind, last_ref: 0 });
        }
        // Smallest index block: header + root itemref + trailer.
        if u64::from(len) > file_len - SIGNATURE.len() as u64 || len < 4 + 8 + 4 {
            return Err(FormatError::OutOfBounds {
                detail: format!("index block length {len}"),
                last_ref: 0,
            });
        }

        let start = file_len - u64::from(len);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut word)?;
        if u32::from_be_bytes(word) != trailer {
            return Err(FormatError::BadEncoding {
                detail: "index header/trailer mismatch".into(),
                last_ref: 0,
            });
        }

        let body_len = len as usize - 8;
        let mut body = vec![0u8; body_len];
        file.read_exact(&mut body)?;
        if (body_len - 8) % 8 != 0 {
            return Err(FormatError::BadEncoding {
                detail: "index body is not slot-aligned".into(),
                last_ref: 0,
            });
        }

        let root = ItemRef(u64::from_be_bytes(
            body[body_len - 8..].try_into().expect("8-byte root"),
        ));
        let slots = body[..body_len - 8]
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().expect("8-byte slot")))
            .collect::<Vec<u64>>();
        debug!(blocks = slots.len(), root = root.0, "opened container");

        Ok(Self {
            file,
            file_len,
            slots,
            root,
            cache: Vec::with_capacity(CACHE_SLOTS),
            stamp: 0,
            last_ref: 0,
        })
    }

    /// The root directory's itemref.
    pub fn root(&self) -> ItemRef {
        self.root
    }

    /// Number of data blocks the index knows about.
    pub fn block_count(&self) -> usize {
        self.slots.len()
    }

    /// Itemref of the last entry parsed successfully, for diagnostics.
    pub fn last_ref(&self) -> u64 {
        self.last_ref
    }

    fn load_block(&mut self, block: u64) -> FormatResult<Arc<Vec<u8>>> {
        self.stamp += 1;
        if let Some(slot) = self.cache.iter_mut().find(|s| s.block == block) {
            slot.stamp = self.stamp;
            return Ok(Arc::clone(&slot.data));
        }

        let last_ref = self.last_ref;
        let &slot = self
            .slots
            .get(block as usize)
            .ok_or_else(|| FormatError::OutOfBounds {
                detail: format!("block {block} beyond index"),
                last_ref,
            })?;
        let (offset, len) = (slot >> 24, (slot & 0xFF_FFFF) as usize);
        if len < 4 + 4 + 4 + 1 || offset + len as u64 > self.file_len {
            return Err(FormatError::OutOfBounds {
                detail: format!("block {block} slot ({offset}, {len})"),
                last_ref,
            });
        }

        let mut raw = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;

        let header = u32::from_be_bytes(raw[..4].try_into().expect("4-byte header"));
        let (kind, total) = split_block_header(header);
        if kind != BLOCK_DATA {
            return Err(FormatError::BadBlockKind { kind, last_ref });
        }
        if total as usize != len {
            return Err(FormatError::BadBlock {
                block: block as u32,
                detail: format!("header length {total} != slot length {len}"),
                last_ref,
            });
        }

        // Skip header and block number; both were validated at write time.
        let payload = &raw[8..len - 4];
        let data = zstd::bulk::decompress(payload, MAX_BLOCK_RAW).map_err(|e| {
            FormatError::BadBlock {
                block: block as u32,
                detail: e.to_string(),
                last_ref,
            }
        })?;

        let data = Arc::new(data);
        if self.cache.len() < CACHE_SLOTS {
            self.cache.push(CacheSlot {
                block,
                stamp: self.stamp,
                data: Arc::clone(&data),
            });
        } else {
            let evict = self
                .cache
                .iter_mut()
                .min_by_key(|s| s.stamp)
                .expect("cache non-empty");
            *evict = CacheSlot {
                block,
                stamp: self.stamp,
                data: Arc::clone(&data),
            };
        }
        Ok(data)
    }

    /// Position a cursor at an entry and decode its map head.
    pub fn read_item(&mut self, r: ItemRef) -> FormatResult<ItemCursor> {
        let data = self.load_block(r.block())?;
        let mut pos = r.offset();
        if pos >= data.len() {
            return Err(FormatError::OutOfBounds {
                detail: format!("offset {pos} in block {}", r.block()),
                last_ref: self.last_ref,
            });
        }
        let head = cbor::read_head(&data, &mut pos).map_err(|e| self.bad_encoding(e))?;
        if head.major != cbor::MAJOR_MAP || !head.indefinite {
            return Err(self.bad_encoding("entry is not an indefinite-length map"));
        }
        Ok(ItemCursor {
            data,
            pos,
            itemref: r.0,
        })
    }

    /// Read and fully parse one entry, updating the diagnostic itemref.
    pub fn parse_entry(&mut self, r: ItemRef) -> FormatResult<ParsedEntry> {
        let mut cursor = self.read_item(r)?;
        let mut entry = ParsedEntry::default();
        let mut have_type = false;
        while let Some((key, value)) = cursor.next_field()? {
            entry.apply(key, value, r.0)?;
            if key == keys::TYPE {
                have_type = true;
            }
        }
        if !have_type || entry.name.is_empty() {
            return Err(self.bad_encoding("entry missing type or name"));
        }
        self.last_ref = r.0;
        Ok(entry)
    }

    /// Iterate a directory listing from its `sub` reference, following the
    /// backwards `prev` chain.
    pub fn listing(&mut self, sub: Option<ItemRef>) -> ListingIter<'_> {
        ListingIter { reader: self, next: sub }
    }

    fn bad_encoding(&self, detail: impl Into<String>) -> FormatError {
        FormatError::BadEncoding {
            detail: detail.into(),
            last_ref: self.last_ref,
        }
    }
}

/// A decoded value, typed per the key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Unsigned integer fields.
    Uint(u64),
    /// Signed fields (type code, mtime).
    Int(i64),
    /// Name bytes.
    Bytes(Vec<u8>),
    /// Read-error flag: true = own, false = subtree.
    Bool(bool),
    /// A resolved itemref (`prev`, `sub`).
    Ref(ItemRef),
}

/// Cursor over one entry's fields.
pub struct ItemCursor {
    data: Arc<Vec<u8>>,
    pos: usize,
    itemref: u64,
}

impl ItemCursor {
    /// Yield the next known `(key, value)` pair, skipping unknown keys.
    /// Returns `None` at the map break.
    pub fn next_field(&mut self) -> FormatResult<Option<(u64, FieldValue)>> {
        loop {
            let key_head = self.head()?;
            if key_head.is_break() {
                return Ok(None);
            }
            if key_head.major != cbor::MAJOR_UINT {
                return Err(self.err("map key is not an unsigned integer"));
            }
            let key = key_head.arg;
            let value_head = self.head()?;

            let value = match key {
                keys::TYPE | keys::MTIME => match value_head.major {
                    cbor::MAJOR_UINT => FieldValue::Int(self.to_i64(value_head.arg, key)?),
                    cbor::MAJOR_NINT => {
                        let v = self.to_i64(value_head.arg, key)?;
                        FieldValue::Int(-1 - v)
                    }
                    _ => return Err(self.ill_typed(key)),
                },
                keys::NAME => match value_head.major {
                    cbor::MAJOR_BYTES | cbor::MAJOR_TEXT => {
                        let s = cbor::read_string(&self.data, &mut self.pos, &value_head)
                            .map_err(|e| self.err(e))?;
                        FieldValue::Bytes(s.to_vec())
                    }
                    _ => return Err(self.ill_typed(key)),
                },
                keys::PREV | keys::SUB => match value_head.major {
                    cbor::MAJOR_UINT => FieldValue::Ref(ItemRef(value_head.arg)),
                    // Relative back-reference: cur - arg - 1, wrapping.
                    cbor::MAJOR_NINT => FieldValue::Ref(ItemRef(
                        self.itemref.wrapping_sub(value_head.arg).wrapping_sub(1),
                    )),
                    _ => return Err(self.ill_typed(key)),
                },
                keys::RDERR => match (value_head.major, value_head.arg) {
                    (cbor::MAJOR_SIMPLE, cbor::SIMPLE_TRUE) => FieldValue::Bool(true),
                    (cbor::MAJOR_SIMPLE, cbor::SIMPLE_FALSE) => FieldValue::Bool(false),
                    _ => return Err(self.ill_typed(key)),
                },
                keys::ASIZE
                | keys::DSIZE
                | keys::DEV
                | keys::CUMASIZE
                | keys::CUMDSIZE
                | keys::SHRASIZE
                | keys::SHRDSIZE
                | keys::ITEMS
                | keys::INO
                | keys::NLINK
                | keys::UID
                | keys::GID
                | keys::MODE => match value_head.major {
                    cbor::MAJOR_UINT => FieldValue::Uint(value_head.arg),
                    _ => return Err(self.ill_typed(key)),
                },
                _ => {
                    cbor::skip_value(&self.data, &mut self.pos, &value_head)
                        .map_err(|e| self.err(e))?;
                    continue;
                }
            };
            return Ok(Some((key, value)));
        }
    }

    fn head(&mut self) -> FormatResult<Head> {
        cbor::read_head(&self.data, &mut self.pos).map_err(|e| self.err(e))
    }

    fn to_i64(&self, arg: u64, key: u64) -> FormatResult<i64> {
        i64::try_from(arg).map_err(|_| self.ill_typed(key))
    }

    fn err(&self, detail: impl Into<String>) -> FormatError {
        FormatError::BadEncoding {
            detail: detail.into(),
            last_ref: self.itemref,
        }
    }

    fn ill_typed(&self, key: u64) -> FormatError {
        FormatError::BadValue {
            key,
            last_ref: self.itemref,
        }
    }
}

/// One entry, fully decoded.
#[derive(Debug, Clone, Default)]
pub struct ParsedEntry {
    pub etype: Option<EType>,
    pub name: Vec<u8>,
    pub prev: Option<ItemRef>,
    pub asize: Option<u64>,
    pub dsize: Option<u64>,
    pub dev: Option<u64>,
    /// `Some(true)` own read error, `Some(false)` subtree error.
    pub rderr: Option<bool>,
    pub cumasize: Option<u64>,
    pub cumdsize: Option<u64>,
    pub shrasize: Option<u64>,
    pub shrdsize: Option<u64>,
    pub items: Option<u64>,
    pub sub: Option<ItemRef>,
    pub ino: Option<u64>,
    pub nlink: Option<u64>,
    pub ext: Ext,
}

impl ParsedEntry {
    fn apply(&mut self, key: u64, value: FieldValue, itemref: u64) -> FormatResult<()> {
        let ill = || FormatError::BadValue {
            key,
            last_ref: itemref,
        };
        match (key, value) {
            (keys::TYPE, FieldValue::Int(code)) => {
                self.etype = Some(EType::from_code(code).ok_or_else(ill)?);
            }
            (keys::NAME, FieldValue::Bytes(b)) => self.name = b,
            (keys::PREV, FieldValue::Ref(r)) => self.prev = Some(r),
            (keys::SUB, FieldValue::Ref(r)) => self.sub = Some(r),
            (keys::ASIZE, FieldValue::Uint(v)) => self.asize = Some(v),
            (keys::DSIZE, FieldValue::Uint(v)) => self.dsize = Some(v),
            (keys::DEV, FieldValue::Uint(v)) => self.dev = Some(v),
            (keys::RDERR, FieldValue::Bool(own)) => self.rderr = Some(own),
            (keys::CUMASIZE, FieldValue::Uint(v)) => self.cumasize = Some(v),
            (keys::CUMDSIZE, FieldValue::Uint(v)) => self.cumdsize = Some(v),
            (keys::SHRASIZE, FieldValue::Uint(v)) => self.shrasize = Some(v),
            (keys::SHRDSIZE, FieldValue::Uint(v)) => self.shrdsize = Some(v),
            (keys::ITEMS, FieldValue::Uint(v)) => self.items = Some(v),
            (keys::INO, FieldValue::Uint(v)) => self.ino = Some(v),
            (keys::NLINK, FieldValue::Uint(v)) => self.nlink = Some(v),
            (keys::UID, FieldValue::Uint(v)) => {
                self.ext.uid = Some(u32::try_from(v).map_err(|_| ill())?);
            }
            (keys::GID, FieldValue::Uint(v)) => {
                self.ext.gid = Some(u32::try_from(v).map_err(|_| ill())?);
            }
            (keys::MODE, FieldValue::Uint(v)) => {
                self.ext.mode = Some(u32::try_from(v).map_err(|_| ill())?);
            }
            (keys::MTIME, FieldValue::Int(v)) => self.ext.mtime = Some(v),
            _ => return Err(ill()),
        }
        Ok(())
    }

    /// True for directory entries.
    pub fn is_dir(&self) -> bool {
        self.etype == Some(EType::Dir)
    }
}

/// Iterator over one directory's children via the `prev` chain.
pub struct ListingIter<'a> {
    reader: &'a mut Reader,
    next: Option<ItemRef>,
}

impl Iterator for ListingIter<'_> {
    type Item = FormatResult<(ItemRef, ParsedEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let r = self.next?;
        match self.reader.parse_entry(r) {
            Ok(entry) => {
                self.next = entry.prev;
                Some(Ok((r, entry)))
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binfmt::writer::{BlockWriter, EntryRec, WriterShared};
    use std::io::Write;
    use std::sync::Arc as StdArc;

    fn build_container(dir: &std::path::Path) -> (std::path::PathBuf, ItemRef) {
        let path = dir.join("t.bin");
        let file = std::fs::File::create(&path).unwrap();
        let shared = StdArc::new(WriterShared::new(Box::new(file), 3).unwrap());
        let mut w = BlockWriter::new(StdArc::clone(&shared));

        let a = w
            .encode(&EntryRec {
                etype: Some(EType::Reg),
                name: b"a",
                asize: Some(100),
                dsize: Some(8 * 512),
                ..Default::default()
            })
            .unwrap();
        let b = w
            .encode(&EntryRec {
                etype: Some(EType::Link),
                name: b"b",
                prev: Some(a),
                asize: Some(200),
                dsize: Some(8 * 512),
                ino: Some(77),
                nlink: Some(2),
                ..Default::default()
            })
            .unwrap();
        let root = w
            .encode(&EntryRec {
                etype: Some(EType::Dir),
                name: b"/r",
                cumasize: Some(300),
                cumdsize: Some(16 * 512),
                items: Some(2),
                sub: Some(b),
                ..Default::default()
            })
            .unwrap();
        w.finish().unwrap();
        shared.finalize(root).unwrap();
        (path, root)
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, root_ref) = build_container(tmp.path());

        let mut r = Reader::open(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(r.root(), root_ref);
        assert_eq!(r.block_count(), 1);

        let root = r.parse_entry(r.root()).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.name, b"/r");
        assert_eq!(root.cumasize, Some(300));
        assert_eq!(root.items, Some(2));

        let children: Vec<ParsedEntry> = r
            .listing(root.sub)
            .map(|c| c.unwrap().1)
            .collect();
        // prev chains walk the listing backwards.
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name, b"b");
        assert_eq!(children[0].etype, Some(EType::Link));
        assert_eq!(children[0].ino, Some(77));
        assert_eq!(children[1].name, b"a");
        assert_eq!(children[1].asize, Some(100));
    }

    #[test]
    fn test_bad_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.bin");
        std::fs::write(&path, b"this is not a container at all").unwrap();
        let err = Reader::open(std::fs::File::open(&path).unwrap()).unwrap_err();
        assert!(matches!(err, FormatError::BadSignature));
    }

    #[test]
    fn test_truncated_index_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, _) = build_container(tmp.path());
        let data = std::fs::read(&path).unwrap();
        let cut = &data[..data.len() - 6];
        let path2 = tmp.path().join("cut.bin");
        let mut f = std::fs::File::create(&path2).unwrap();
        f.write_all(cut).unwrap();
        drop(f);
        assert!(Reader::open(std::fs::File::open(&path2).unwrap()).is_err());
    }

    #[test]
    fn test_out_of_bounds_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, _) = build_container(tmp.path());
        let mut r = Reader::open(std::fs::File::open(&path).unwrap()).unwrap();
        let err = r.parse_entry(ItemRef::new(99, 0)).unwrap_err();
        assert!(matches!(err, FormatError::OutOfBounds { .. }));
    }

    #[test]
    fn test_corrupt_payload_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, _) = build_container(tmp.path());
        let mut data = std::fs::read(&path).unwrap();
        // Flip bytes inside the compressed payload of block 0.
        data[14] ^= 0xA5;
        data[15] ^= 0x5A;
        let path2 = tmp.path().join("corrupt.bin");
        std::fs::write(&path2, &data).unwrap();
        let mut r = Reader::open(std::fs::File::open(&path2).unwrap()).unwrap();
        assert!(r.parse_entry(r.root()).is_err());
    }

    #[test]
    fn test_lru_eviction() {
        // Build a container with many blocks by flushing tiny buffers.
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("many.bin");
        let file = std::fs::File::create(&path).unwrap();
        let shared = StdArc::new(WriterShared::new(Box::new(file), 1).unwrap());

        let mut refs = Vec::new();
        let mut prev: Option<ItemRef> = None;
        for i in 0..12u32 {
            // One worker per entry forces one block per entry.
            let mut w = BlockWriter::new(StdArc::clone(&shared));
            let name = format!("f{i}");
            let r = w
                .encode(&EntryRec {
                    etype: Some(EType::Reg),
                    name: name.as_bytes(),
                    asize: Some(u64::from(i)),
                    dsize: Some(512),
                    prev,
                    ..Default::default()
                })
                .unwrap();
            w.finish().unwrap();
            refs.push(r);
            prev = Some(r);
        }
        let mut w = BlockWriter::new(StdArc::clone(&shared));
        let root = w
            .encode(&EntryRec {
                etype: Some(EType::Dir),
                name: b"/",
                sub: prev,
                items: Some(refs.len() as u64),
                ..Default::default()
            })
            .unwrap();
        w.finish().unwrap();
        shared.finalize(root).unwrap();

        let mut r = Reader::open(std::fs::File::open(&path).unwrap()).unwrap();
        assert!(r.block_count() >= 13);
        // Walk the whole listing twice; more blocks than cache slots means
        // evictions happen and everything still parses.
        for _ in 0..2 {
            let root_entry = r.parse_entry(r.root()).unwrap();
            let count = r.listing(root_entry.sub).filter(|c| c.is_ok()).count();
            assert_eq!(count, 12);
        }
    }
}
