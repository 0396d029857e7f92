//! Sink dispatch
//!
//! Sources (the scanner, the importers) deliver entries through the same
//! small surface — create a root, add stats/specials/dirs, flag read
//! errors, release dir handles — and this module routes the calls to one of
//! three backends: the in-memory tree builder, the streaming JSON writer,
//! or the parallel binary container writer.
//!
//! Dir handles are reference counted; releasing the last reference
//! finalizes the directory, and a parent is always finalized after its
//! children. Per-worker [`SinkThread`] state carries the progress counters
//! the UI samples and, for the binary backend, the worker's private encode
//! buffer.

pub mod binary;
pub mod json;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{EntryStat, SpecialKind};

pub use binary::{BinDir, BinSink};
pub use json::{JsonDir, JsonSink};
pub use memory::{MemDir, MemSink};

/// Per-worker progress counters, sampled by the UI thread.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    /// Entries delivered by this worker.
    pub files_seen: AtomicU32,
    /// Apparent bytes delivered by this worker.
    pub bytes_seen: AtomicU64,
    /// The directory this worker is currently enumerating.
    pub current_dir: Mutex<Option<PathBuf>>,
}

/// Shared progress state for one scan.
#[derive(Debug)]
pub struct ScanCounters {
    /// One slot per worker.
    pub workers: Vec<Arc<WorkerCounters>>,
    /// The last error path observed anywhere; no queue, the UI may lag.
    pub last_error: Mutex<Option<PathBuf>>,
}

impl ScanCounters {
    /// Allocate counters for `threads` workers.
    pub fn new(threads: usize) -> Arc<Self> {
        Arc::new(Self {
            workers: (0..threads)
                .map(|_| Arc::new(WorkerCounters::default()))
                .collect(),
            last_error: Mutex::new(None),
        })
    }

    /// Sum of entries and bytes seen across workers.
    pub fn totals(&self) -> (u64, u64) {
        let mut files = 0u64;
        let mut bytes = 0u64;
        for w in &self.workers {
            files += u64::from(w.files_seen.load(Ordering::Relaxed));
            bytes += w.bytes_seen.load(Ordering::Relaxed);
        }
        (files, bytes)
    }

    /// Record the path of a transient error for the UI.
    pub fn record_error(&self, path: &Path) {
        *self.last_error.lock() = Some(path.to_path_buf());
    }
}

/// Per-worker sink state.
pub struct SinkThread {
    /// Worker index, 0-based.
    pub worker: usize,
    counters: Arc<WorkerCounters>,
    next_dir_id: u64,
    /// The binary backend's private block encoder.
    pub(crate) bin: Option<crate::binfmt::BlockWriter>,
}

impl SinkThread {
    pub(crate) fn new(worker: usize, counters: Arc<WorkerCounters>) -> Self {
        Self {
            worker,
            counters,
            next_dir_id: 0,
            bin: None,
        }
    }

    /// Allocate a dir id unique across workers (the root is id 0).
    fn alloc_dir_id(&mut self) -> u64 {
        self.next_dir_id += 1;
        ((self.worker as u64 + 1) << 40) | self.next_dir_id
    }

    /// Publish the directory this worker is working on.
    pub fn set_dir(&self, path: Option<&Path>) {
        *self.counters.current_dir.lock() = path.map(Path::to_path_buf);
    }

    fn count(&self, stat: Option<&EntryStat>) {
        self.counters.files_seen.fetch_add(1, Ordering::Relaxed);
        if let Some(s) = stat {
            self.counters.bytes_seen.fetch_add(s.size, Ordering::Relaxed);
        }
    }
}

/// The selected output backend.
pub enum Sink {
    /// Build the in-memory tree.
    Memory(MemSink),
    /// Stream the binary container.
    Binary(BinSink),
    /// Stream the JSON document. Single-threaded: only the strictly
    /// depth-first import paths use it directly; a scan destined for JSON
    /// goes through the memory sink and converts on finalize.
    Json(JsonSink),
}

impl Sink {
    /// Allocate per-worker sink state.
    pub fn create_threads(&self, counters: &Arc<ScanCounters>) -> Vec<SinkThread> {
        counters
            .workers
            .iter()
            .enumerate()
            .map(|(i, wc)| {
                let mut t = SinkThread::new(i, Arc::clone(wc));
                if let Sink::Binary(b) = self {
                    t.bin = Some(b.block_writer());
                }
                t
            })
            .collect()
    }

    /// Produce the root dir handle.
    pub fn create_root(&self, name: &[u8], stat: &EntryStat) -> SinkDir {
        match self {
            Sink::Memory(m) => SinkDir::Mem(m.create_root(name, stat)),
            Sink::Binary(b) => SinkDir::Bin(b.create_root(name, stat)),
            Sink::Json(j) => SinkDir::Json(j.create_root(name, stat)),
        }
    }
}

/// A reference-counted handle to one directory in the output.
pub enum SinkDir {
    /// Memory backend.
    Mem(MemDir),
    /// Binary backend.
    Bin(BinDir),
    /// JSON backend.
    Json(JsonDir),
}

impl SinkDir {
    /// Add a sizeless special entry.
    pub fn add_special(&self, t: &mut SinkThread, name: &[u8], kind: SpecialKind) {
        t.count(None);
        match self {
            SinkDir::Mem(d) => d.add_special(name, kind),
            SinkDir::Bin(d) => d.add_special(t, name, kind),
            SinkDir::Json(d) => d.add_special(name, kind),
        }
    }

    /// Add a non-directory entry.
    pub fn add_stat(&self, t: &mut SinkThread, name: &[u8], stat: &EntryStat) {
        t.count(Some(stat));
        match self {
            SinkDir::Mem(d) => d.add_stat(name, stat),
            SinkDir::Bin(d) => d.add_stat(t, name, stat),
            SinkDir::Json(d) => d.add_stat(name, stat),
        }
    }

    /// Add a child directory, returning its handle. The parent gains a
    /// reference that the child's finalization releases.
    pub fn add_dir(&self, t: &mut SinkThread, name: &[u8], stat: &EntryStat) -> SinkDir {
        t.count(Some(stat));
        match self {
            SinkDir::Mem(d) => SinkDir::Mem(d.add_dir(t, name, stat)),
            SinkDir::Bin(d) => SinkDir::Bin(d.add_dir(name, stat)),
            SinkDir::Json(d) => SinkDir::Json(d.add_dir(name, stat)),
        }
    }

    /// Flag this directory as unreadable.
    pub fn set_read_error(&self, t: &mut SinkThread) {
        let _ = t;
        match self {
            SinkDir::Mem(d) => d.set_read_error(),
            SinkDir::Bin(d) => d.set_read_error(),
            SinkDir::Json(d) => d.set_read_error(),
        }
    }

    /// Release the creator's reference. The directory finalizes once every
    /// child directory has finalized too.
    pub fn done(self, t: &mut SinkThread) {
        match self {
            SinkDir::Mem(d) => d.done(),
            SinkDir::Bin(d) => d.done(t),
            SinkDir::Json(d) => d.done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_totals() {
        let c = ScanCounters::new(2);
        c.workers[0].files_seen.fetch_add(3, Ordering::Relaxed);
        c.workers[1].files_seen.fetch_add(4, Ordering::Relaxed);
        c.workers[1].bytes_seen.fetch_add(100, Ordering::Relaxed);
        assert_eq!(c.totals(), (7, 100));
    }

    #[test]
    fn test_dir_id_allocation_unique_across_workers() {
        let c = ScanCounters::new(2);
        let mut t0 = SinkThread::new(0, Arc::clone(&c.workers[0]));
        let mut t1 = SinkThread::new(1, Arc::clone(&c.workers[1]));
        let a = t0.alloc_dir_id();
        let b = t1.alloc_dir_id();
        let a2 = t0.alloc_dir_id();
        assert_ne!(a, b);
        assert_ne!(a, a2);
        assert_ne!(a, 0); // 0 is the root
    }
}
