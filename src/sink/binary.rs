//! Binary container sink
//!
//! Leaf entries are encoded into the delivering worker's private buffer as
//! they arrive; a directory's own entry is encoded when its last reference
//! goes, after all of its children, which is what the container's
//! backwards sibling chains are built for. Each open directory keeps its
//! running totals and chain tail under a mutex, taken by whichever worker
//! is delivering to it; the lock is held across the child's encode so the
//! chain and the buffer stay in step.
//!
//! Streaming cannot know whether a hardlinked inode has members outside a
//! directory, so cumulative totals count every link occurrence and the
//! shared fields stay empty; importing the container into memory
//! re-derives both from the persisted ino/nlink fields.
//!
//! Write errors are sticky: the first one is kept and surfaced when the
//! sink finalizes, the rest of the stream is abandoned.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::binfmt::{BlockWriter, EntryRec, ItemRef, WriterShared};
use crate::error::{FormatError, FormatResult};
use crate::model::{EType, EntryStat, SpecialKind, Totals};

use super::SinkThread;

struct SinkState {
    root: Mutex<Option<ItemRef>>,
    error: Mutex<Option<FormatError>>,
}

impl SinkState {
    fn record(&self, res: FormatResult<ItemRef>) -> Option<ItemRef> {
        match res {
            Ok(r) => Some(r),
            Err(e) => {
                let mut slot = self.error.lock();
                if slot.is_none() {
                    warn!("binary export failed: {e}");
                    *slot = Some(e);
                }
                None
            }
        }
    }
}

/// The binary export sink.
pub struct BinSink {
    shared: Arc<WriterShared>,
    state: Arc<SinkState>,
    block_size: usize,
}

impl BinSink {
    /// Start a container on `out` with the given zstd level and
    /// uncompressed block size.
    pub fn new(out: Box<dyn Write + Send>, level: i32, block_size: usize) -> FormatResult<Self> {
        Ok(Self {
            shared: Arc::new(WriterShared::new(out, level)?),
            state: Arc::new(SinkState {
                root: Mutex::new(None),
                error: Mutex::new(None),
            }),
            block_size,
        })
    }

    pub(super) fn block_writer(&self) -> BlockWriter {
        BlockWriter::with_capacity(Arc::clone(&self.shared), self.block_size)
    }

    /// Produce the root dir handle.
    pub fn create_root(&self, name: &[u8], stat: &EntryStat) -> BinDir {
        BinDir(Arc::new(BinDirState {
            state: Arc::clone(&self.state),
            parent: None,
            refs: AtomicU32::new(1),
            inner: Mutex::new(BinInner::new(name, stat, stat.dev)),
        }))
    }

    /// Flush a worker's private buffer into the stream. Call once per
    /// worker after the scan, before [`BinSink::finalize`].
    pub fn finish_thread(&self, t: &mut SinkThread) {
        if let Some(bw) = t.bin.take() {
            if let Err(e) = bw.finish() {
                self.state.record(Err(e));
            }
        }
    }

    /// Write the index block and surface any sticky error. Every dir handle
    /// and worker buffer must have been released first.
    pub fn finalize(self) -> FormatResult<ItemRef> {
        if let Some(e) = self.state.error.lock().take() {
            return Err(e);
        }
        let root = self.state.root.lock().take().ok_or_else(|| {
            FormatError::Io(std::io::Error::other("export produced no root entry"))
        })?;
        self.shared.finalize(root)?;
        Ok(root)
    }
}

struct BinInner {
    name: Vec<u8>,
    stat: EntryStat,
    parent_dev: u64,
    err: bool,
    suberr: bool,
    /// Own stats plus everything delivered below, blocks and bytes.
    cum: Totals,
    items: u64,
    last_child: Option<ItemRef>,
}

impl BinInner {
    fn new(name: &[u8], stat: &EntryStat, parent_dev: u64) -> Self {
        Self {
            name: name.to_vec(),
            stat: stat.clone(),
            parent_dev,
            err: false,
            suberr: false,
            cum: Totals::new(stat.blocks, stat.size),
            items: 0,
            last_child: None,
        }
    }
}

struct BinDirState {
    state: Arc<SinkState>,
    parent: Option<BinDir>,
    /// One reference held by the creator plus one per open child dir.
    refs: AtomicU32,
    inner: Mutex<BinInner>,
}

/// Handle to one open directory in the binary export.
pub struct BinDir(Arc<BinDirState>);

impl BinDir {
    pub(super) fn add_stat(&self, t: &mut SinkThread, name: &[u8], stat: &EntryStat) {
        let etype = stat.etype();
        let mut inner = self.0.inner.lock();
        let rec = EntryRec {
            etype: Some(etype),
            name,
            prev: inner.last_child,
            asize: Some(stat.size),
            dsize: Some(stat.blocks.saturating_mul(512)),
            ino: (etype == EType::Link).then_some(stat.ino),
            nlink: (etype == EType::Link).then_some(u64::from(stat.nlink)),
            ext: stat.ext,
            ..EntryRec::default()
        };
        if let Some(r) = self.encode(t, &rec) {
            inner.last_child = Some(r);
            inner.cum.add(Totals::new(stat.blocks, stat.size));
            inner.items += 1;
        }
    }

    pub(super) fn add_special(&self, t: &mut SinkThread, name: &[u8], kind: SpecialKind) {
        let mut inner = self.0.inner.lock();
        let rec = EntryRec {
            etype: Some(EType::Special(kind)),
            name,
            prev: inner.last_child,
            ..EntryRec::default()
        };
        if let Some(r) = self.encode(t, &rec) {
            inner.last_child = Some(r);
            inner.items += 1;
            if kind == SpecialKind::ReadError {
                inner.suberr = true;
            }
        }
    }

    pub(super) fn add_dir(&self, name: &[u8], stat: &EntryStat) -> BinDir {
        self.0.refs.fetch_add(1, Ordering::Relaxed);
        let parent_dev = self.0.inner.lock().stat.dev;
        BinDir(Arc::new(BinDirState {
            state: Arc::clone(&self.0.state),
            parent: Some(BinDir(Arc::clone(&self.0))),
            refs: AtomicU32::new(1),
            inner: Mutex::new(BinInner::new(name, stat, parent_dev)),
        }))
    }

    pub(super) fn set_read_error(&self) {
        self.0.inner.lock().err = true;
    }

    pub(super) fn done(self, t: &mut SinkThread) {
        unref(&self.0, t);
    }

    fn encode(&self, t: &mut SinkThread, rec: &EntryRec) -> Option<ItemRef> {
        let bw = t.bin.as_mut().expect("binary sink thread without writer");
        self.0.state.record(bw.encode(rec))
    }
}

fn unref(state: &Arc<BinDirState>, t: &mut SinkThread) {
    if state.refs.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    std::sync::atomic::fence(Ordering::Acquire);
    finalize(state, t);
}

/// Encode the directory's own entry and fold its totals into the parent.
fn finalize(state: &Arc<BinDirState>, t: &mut SinkThread) {
    let inner = state.inner.lock();
    let stat = inner.stat.clone();
    let name = inner.name.clone();
    let parent_dev = inner.parent_dev;
    let cum = inner.cum;
    let items = inner.items;
    let err = inner.err;
    let suberr = inner.suberr;
    let sub = inner.last_child;
    drop(inner);

    let mut rec = EntryRec {
        etype: Some(EType::Dir),
        name: &name,
        asize: Some(stat.size),
        dsize: Some(stat.blocks.saturating_mul(512)),
        dev: (state.parent.is_none() || stat.dev != parent_dev).then_some(stat.dev),
        rderr: if err {
            Some(true)
        } else if suberr {
            Some(false)
        } else {
            None
        },
        cumasize: Some(cum.size),
        cumdsize: Some(cum.blocks.saturating_mul(512)),
        items: Some(items),
        sub,
        ext: stat.ext,
        ..EntryRec::default()
    };

    match &state.parent {
        Some(parent) => {
            let mut p = parent.0.inner.lock();
            rec.prev = p.last_child;
            let bw = t.bin.as_mut().expect("binary sink thread without writer");
            if let Some(r) = state.state.record(bw.encode(&rec)) {
                p.last_child = Some(r);
            }
            p.cum.add(cum);
            p.items += items + 1;
            p.suberr |= err || suberr;
            drop(p);
            unref(&parent.0, t);
        }
        None => {
            let bw = t.bin.as_mut().expect("binary sink thread without writer");
            if let Some(r) = state.state.record(bw.encode(&rec)) {
                *state.state.root.lock() = Some(r);
            }
        }
    }
}
