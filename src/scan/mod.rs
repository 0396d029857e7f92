//! Parallel directory scanner
//!
//! Walks a directory tree with a pool of worker threads and delivers typed
//! entries to a sink. Work distribution follows the stealing scheme: a
//! bounded shared injector seeds idle workers, each worker keeps unfinished
//! directories on a private LIFO, and peers steal when both run dry. The
//! scan is complete when no work item is outstanding.

#[cfg(target_os = "linux")]
pub mod kernfs;
mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Stealer, Worker as DequeWorker};
use tracing::info;

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

use crate::error::{Error, ScanError};
use crate::model::{HardlinkProgress, NodeId, Tree};
use crate::patterns::PatternSet;
use crate::sink::{MemSink, ScanCounters, Sink};

use worker::{stat_of, DirWork, WorkerCtx};

/// Scan behavior flags and resources.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Worker thread count, at least 1.
    pub threads: usize,
    /// Stay on the root's filesystem; other mounts become specials.
    pub same_fs: bool,
    /// Follow symlinks to non-directories.
    pub follow_symlinks: bool,
    /// Skip directories tagged with CACHEDIR.TAG.
    pub exclude_caches: bool,
    /// Skip Linux pseudo-filesystem mounts.
    pub exclude_kernfs: bool,
    /// Collect extended metadata (mtime, uid, gid, mode).
    pub extended: bool,
    /// Exclusion rules.
    pub patterns: PatternSet,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            same_fs: false,
            follow_symlinks: false,
            exclude_caches: false,
            exclude_kernfs: false,
            extended: false,
            patterns: PatternSet::default(),
        }
    }
}

/// The scanner: options plus the shared abort flag and progress counters.
pub struct Scanner {
    opts: ScanOptions,
    abort: Arc<AtomicBool>,
    counters: Arc<ScanCounters>,
    hardlinks: Arc<HardlinkProgress>,
}

impl Scanner {
    /// Create a scanner; counters are sized to the worker count.
    pub fn new(opts: ScanOptions) -> Self {
        let threads = opts.threads.max(1);
        Self {
            counters: ScanCounters::new(threads),
            abort: Arc::new(AtomicBool::new(false)),
            hardlinks: Arc::new(HardlinkProgress::default()),
            opts: ScanOptions { threads, ..opts },
        }
    }

    /// The flag a signal handler sets to stop the scan at directory
    /// boundaries.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Progress counters for a reporter thread.
    pub fn counters(&self) -> Arc<ScanCounters> {
        Arc::clone(&self.counters)
    }

    /// Progress of the end-of-scan hardlink commit.
    pub fn hardlink_progress(&self) -> Arc<HardlinkProgress> {
        Arc::clone(&self.hardlinks)
    }

    /// Walk `root` and deliver everything to `sink`. Returns false when the
    /// scan was aborted.
    ///
    /// The JSON sink cannot accept out-of-order delivery; scans destined
    /// for JSON go through a memory sink and are replayed (see
    /// [`crate::sources::replay_tree`]).
    pub fn run(&self, root: &Path, sink: &Sink) -> Result<bool, Error> {
        debug_assert!(
            !matches!(sink, Sink::Json(_)),
            "parallel scans cannot stream JSON"
        );

        let meta = std::fs::metadata(root).map_err(|e| ScanError::RootStat {
            path: root.to_path_buf(),
            source: e,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory {
                path: root.to_path_buf(),
            }
            .into());
        }
        let rd = std::fs::read_dir(root).map_err(|e| ScanError::RootOpen {
            path: root.to_path_buf(),
            source: e,
        })?;

        let stat = stat_of(&meta, self.opts.extended);
        let root_dir = sink.create_root(root.as_os_str().as_bytes(), &stat);

        let injector: Injector<DirWork> = Injector::new();
        let pending = AtomicU64::new(1);
        injector.push(DirWork {
            dir: root_dir,
            rd,
            path: root.to_path_buf(),
            dev: stat.dev,
            patterns: self.opts.patterns.root(),
        });

        let threads = self.opts.threads;
        let mut locals: Vec<DequeWorker<DirWork>> = Vec::with_capacity(threads);
        let mut stealers: Vec<Stealer<DirWork>> = Vec::with_capacity(threads);
        for _ in 0..threads {
            let w = DequeWorker::new_lifo();
            stealers.push(w.stealer());
            locals.push(w);
        }

        let ctx = WorkerCtx {
            opts: &self.opts,
            injector: &injector,
            stealers: &stealers,
            pending: &pending,
            abort: &self.abort,
            counters: &self.counters,
            threads,
        };

        let mut sink_threads = sink.create_threads(&self.counters);
        info!(path = %root.display(), threads, "scan started");

        std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(threads);
            for (id, local) in locals.into_iter().enumerate() {
                let t = sink_threads.remove(0);
                let ctx = &ctx;
                let handle = std::thread::Builder::new()
                    .name(format!("scan-{id}"))
                    .spawn_scoped(s, move || worker::worker_loop(ctx, id, local, t))
                    .expect("Failed to spawn scan worker");
                handles.push(handle);
            }
            for handle in handles {
                let t = handle.join().expect("scan worker panicked");
                sink_threads.push(t);
            }
        });

        // Flush the binary backend's per-worker buffers while the thread
        // state is still ours.
        if let Sink::Binary(b) = sink {
            for t in &mut sink_threads {
                b.finish_thread(t);
            }
        }

        let aborted = self.abort.load(Ordering::Relaxed);
        let (files, bytes) = self.counters.totals();
        info!(files, bytes, aborted, "scan finished");
        Ok(!aborted)
    }

    /// Scan into a fresh in-memory tree.
    pub fn scan_to_tree(&self, root: &Path) -> Result<Tree, Error> {
        let sink = Sink::Memory(MemSink::with_progress(Arc::clone(&self.hardlinks)));
        let complete = self.run(root, &sink)?;
        let Sink::Memory(mem) = sink else {
            unreachable!()
        };
        let mut tree = mem.finish()?;
        tree.complete &= complete;
        Ok(tree)
    }

    /// Rescan the subtree rooted at `node`, merging the result into `tree`
    /// in place. Aggregates of `node`'s ancestors are adjusted by the
    /// difference. Patterns are applied anchored at the refresh root.
    pub fn refresh(&self, tree: &mut Tree, node: NodeId) -> Result<(), Error> {
        let path = tree.path(node);
        let placeholder = Tree::with_root(Box::from(&b"/"[..]), 0);
        let owned = std::mem::replace(tree, placeholder);
        let sink = Sink::Memory(MemSink::for_refresh(owned, node));

        let run_result = self.run(&path, &sink);
        let Sink::Memory(mem) = sink else {
            unreachable!()
        };
        // Recover the tree even when the rescan failed to start.
        let mut rebuilt = mem.finish()?;
        match run_result {
            Ok(complete) => {
                rebuilt.complete &= complete;
                *tree = rebuilt;
                Ok(())
            }
            Err(e) => {
                *tree = rebuilt;
                Err(e)
            }
        }
    }
}
