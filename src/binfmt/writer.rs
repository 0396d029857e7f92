//! Binary container writer
//!
//! Each worker owns a [`BlockWriter`] with a private uncompressed buffer;
//! the file, running offset, and side index live in a [`WriterShared`]
//! behind one mutex held for the duration of a single block write. Blocks
//! are numbered by index-slot reservation, so concurrent workers may write
//! them to the file out of numeric order.

use std::io::Write;

use parking_lot::Mutex;
use tracing::debug;

use super::cbor;
use super::{block_header, keys, ItemRef, SIGNATURE};
use crate::error::{FormatError, FormatResult};
use crate::model::{EType, Ext};

/// Initial per-worker buffer capacity.
const BUF_INITIAL: usize = 64 * 1024;
/// Largest per-worker buffer capacity.
const BUF_MAX: usize = 2 * 1024 * 1024;
/// Emitted-block thresholds at which the buffer doubles, keeping the index
/// small on huge exports.
const GROW_AT: [u64; 5] = [1 << 20, 2 << 20, 4 << 20, 8 << 20, 16 << 20];

/// Shared writer state: output stream, running offset, side index.
pub struct WriterShared {
    state: Mutex<SharedState>,
}

struct SharedState {
    out: Box<dyn Write + Send>,
    offset: u64,
    /// Four header placeholder bytes followed by one 8-byte slot per
    /// reserved block; the root itemref and trailer are appended at
    /// finalization, turning this buffer into the on-disk index block.
    index: Vec<u8>,
    level: i32,
    finalized: bool,
}

impl WriterShared {
    /// Start a container on `out`: writes the signature immediately.
    pub fn new(mut out: Box<dyn Write + Send>, level: i32) -> FormatResult<Self> {
        out.write_all(&SIGNATURE)?;
        Ok(Self {
            state: Mutex::new(SharedState {
                out,
                offset: SIGNATURE.len() as u64,
                index: vec![0u8; 4],
                level,
                finalized: false,
            }),
        })
    }

    /// Reserve the next block number by growing the index with an empty
    /// slot.
    fn reserve(&self) -> u32 {
        let mut st = self.state.lock();
        reserve_slot(&mut st.index)
    }

    /// Compress and write one block, fill its index slot, and hand back the
    /// number reserved for the worker's next block.
    fn flush_block(&self, block_num: u32, raw: &[u8]) -> FormatResult<u32> {
        let mut st = self.state.lock();
        let payload = zstd::bulk::compress(raw, st.level)?;

        let total = 4 + 4 + payload.len() as u64 + 4;
        if st.offset + total >= super::MAX_FILE_OFFSET {
            return Err(FormatError::OffsetOverflow);
        }
        let header = block_header(super::BLOCK_DATA, total as u32);
        st.out.write_all(&header.to_be_bytes())?;
        st.out.write_all(&block_num.to_be_bytes())?;
        st.out.write_all(&payload)?;
        st.out.write_all(&header.to_be_bytes())?;

        let slot = (st.offset << 24) | total;
        let at = 4 + block_num as usize * 8;
        st.index[at..at + 8].copy_from_slice(&slot.to_be_bytes());
        st.offset += total;

        debug!(block = block_num, raw = raw.len(), compressed = payload.len(), "flushed block");
        Ok(reserve_slot(&mut st.index))
    }

    /// Write the index block and flush the stream. All workers must have
    /// finished first.
    pub fn finalize(&self, root: ItemRef) -> FormatResult<()> {
        let mut st = self.state.lock();
        debug_assert!(!st.finalized);

        // Workers reserve one slot past their last flush; drop those
        // trailing empty reservations.
        while st.index.len() > 4 && st.index[st.index.len() - 8..].iter().all(|&b| b == 0) {
            let keep = st.index.len() - 8;
            st.index.truncate(keep);
        }

        st.index.extend_from_slice(&root.0.to_be_bytes());
        let total = st.index.len() as u64 + 4;
        if st.offset + total >= super::MAX_FILE_OFFSET {
            return Err(FormatError::OffsetOverflow);
        }
        let header = block_header(super::BLOCK_INDEX, total as u32);
        st.index[0..4].copy_from_slice(&header.to_be_bytes());
        st.index.extend_from_slice(&header.to_be_bytes());
        let index = std::mem::take(&mut st.index);
        st.out.write_all(&index)?;
        st.out.flush()?;
        st.finalized = true;
        Ok(())
    }
}

fn reserve_slot(index: &mut Vec<u8>) -> u32 {
    let n = ((index.len() - 4) / 8) as u32;
    index.extend_from_slice(&[0u8; 8]);
    n
}

/// One entry, ready for encoding. Optional fields follow the presence rules
/// of the key schema; absent means the key is not emitted.
#[derive(Debug, Clone, Default)]
pub struct EntryRec<'a> {
    pub etype: Option<EType>,
    pub name: &'a [u8],
    pub prev: Option<ItemRef>,
    pub asize: Option<u64>,
    pub dsize: Option<u64>,
    pub dev: Option<u64>,
    /// `Some(true)` = own read error, `Some(false)` = subtree error.
    pub rderr: Option<bool>,
    pub cumasize: Option<u64>,
    pub cumdsize: Option<u64>,
    pub shrasize: Option<u64>,
    pub shrdsize: Option<u64>,
    pub items: Option<u64>,
    pub sub: Option<ItemRef>,
    pub ino: Option<u64>,
    pub nlink: Option<u64>,
    pub ext: Option<Ext>,
}

/// A worker's private encoder: owns the uncompressed buffer for the block
/// currently being filled.
pub struct BlockWriter {
    shared: std::sync::Arc<WriterShared>,
    buf: Vec<u8>,
    block_num: u32,
    emitted: u64,
    initial: usize,
    capacity: usize,
}

impl BlockWriter {
    /// Create a worker encoder with the default initial buffer size,
    /// reserving its first block number.
    pub fn new(shared: std::sync::Arc<WriterShared>) -> Self {
        Self::with_capacity(shared, BUF_INITIAL)
    }

    /// Create a worker encoder with an explicit initial buffer size.
    pub fn with_capacity(shared: std::sync::Arc<WriterShared>, initial: usize) -> Self {
        let block_num = shared.reserve();
        Self {
            shared,
            buf: Vec::with_capacity(initial),
            block_num,
            emitted: 0,
            initial,
            capacity: initial,
        }
    }

    /// The itemref the next encoded entry will receive.
    pub fn next_ref(&self) -> ItemRef {
        ItemRef::new(self.block_num, self.buf.len() as u32)
    }

    /// Encode one entry into the buffer, flushing the block afterwards if
    /// it reached capacity. Returns the entry's itemref.
    pub fn encode(&mut self, rec: &EntryRec) -> FormatResult<ItemRef> {
        let itemref = self.next_ref();
        let buf = &mut self.buf;

        cbor::put_map_indef(buf);
        if let Some(t) = rec.etype {
            cbor::put_uint(buf, keys::TYPE);
            cbor::put_int(buf, t.code());
        }
        cbor::put_uint(buf, keys::NAME);
        cbor::put_bytes(buf, rec.name);
        if let Some(prev) = rec.prev {
            cbor::put_uint(buf, keys::PREV);
            put_ref(buf, itemref, prev);
        }
        for (key, val) in [
            (keys::ASIZE, rec.asize),
            (keys::DSIZE, rec.dsize),
            (keys::DEV, rec.dev),
        ] {
            if let Some(v) = val {
                cbor::put_uint(buf, key);
                cbor::put_uint(buf, v);
            }
        }
        if let Some(own) = rec.rderr {
            cbor::put_uint(buf, keys::RDERR);
            cbor::put_simple(buf, if own { cbor::SIMPLE_TRUE } else { cbor::SIMPLE_FALSE });
        }
        for (key, val) in [
            (keys::CUMASIZE, rec.cumasize),
            (keys::CUMDSIZE, rec.cumdsize),
            (keys::SHRASIZE, rec.shrasize),
            (keys::SHRDSIZE, rec.shrdsize),
            (keys::ITEMS, rec.items),
        ] {
            if let Some(v) = val {
                cbor::put_uint(buf, key);
                cbor::put_uint(buf, v);
            }
        }
        if let Some(sub) = rec.sub {
            cbor::put_uint(buf, keys::SUB);
            put_ref(buf, itemref, sub);
        }
        for (key, val) in [(keys::INO, rec.ino), (keys::NLINK, rec.nlink)] {
            if let Some(v) = val {
                cbor::put_uint(buf, key);
                cbor::put_uint(buf, v);
            }
        }
        if let Some(ext) = &rec.ext {
            for (key, val) in [
                (keys::UID, ext.uid.map(u64::from)),
                (keys::GID, ext.gid.map(u64::from)),
                (keys::MODE, ext.mode.map(u64::from)),
            ] {
                if let Some(v) = val {
                    cbor::put_uint(buf, key);
                    cbor::put_uint(buf, v);
                }
            }
            if let Some(mtime) = ext.mtime {
                cbor::put_uint(buf, keys::MTIME);
                cbor::put_int(buf, mtime);
            }
        }
        cbor::put_break(buf);

        if self.buf.len() >= self.capacity {
            self.flush()?;
        }
        Ok(itemref)
    }

    fn flush(&mut self) -> FormatResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.block_num = self.shared.flush_block(self.block_num, &self.buf)?;
        self.buf.clear();
        self.emitted += 1;
        let doublings = GROW_AT.iter().filter(|&&t| self.emitted >= t).count();
        self.capacity = (self.initial << doublings).min(BUF_MAX.max(self.initial));
        Ok(())
    }

    /// Flush any buffered entries. Must be called per worker before
    /// [`WriterShared::finalize`].
    pub fn finish(mut self) -> FormatResult<()> {
        self.flush()
    }
}

/// Emit an itemref, compressed to a relative negative integer when the
/// target lives in the entry's own block.
fn put_ref(buf: &mut Vec<u8>, cur: ItemRef, target: ItemRef) {
    if cur.block() == target.block() {
        cbor::put_nint_arg(buf, cur.0 - target.0 - 1);
    } else {
        cbor::put_uint(buf, target.0);
    }
}
