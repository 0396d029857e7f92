//! Scanner worker loop
//!
//! Each worker drains its private LIFO of open directories, falls back to
//! the shared injector, then steals from peers. A directory is processed
//! entry by entry: exclusion check before stat, symlink handling, same-fs
//! and kernfs policy, then delivery to the sink. Subdirectories become new
//! work items, preferring the shared injector while it has room so idle
//! workers pick them up.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as DequeWorker};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use crate::model::{clamp_size, EntryStat, Ext, SpecialKind};
use crate::patterns::{Match, Patterns};
use crate::sink::{ScanCounters, SinkDir, SinkThread};

use super::ScanOptions;

/// Shared-injector capacity: beyond this, discovered directories stay on
/// the discovering worker's private LIFO.
const SHARED_CAP: usize = 16;

/// The first 43 bytes of a CACHEDIR.TAG file, per the cache-directory
/// tagging convention.
const CACHEDIR_SIG: &[u8; 43] = b"Signature: 8a477f597d28d172789f06886806bc55";

/// One open directory being enumerated.
pub(super) struct DirWork {
    pub dir: SinkDir,
    pub rd: fs::ReadDir,
    pub path: PathBuf,
    pub dev: u64,
    pub patterns: Patterns,
}

/// Read-only worker context shared across the pool.
pub(super) struct WorkerCtx<'a> {
    pub opts: &'a ScanOptions,
    pub injector: &'a Injector<DirWork>,
    pub stealers: &'a [Stealer<DirWork>],
    /// Outstanding work items; the scan is over when this hits zero.
    pub pending: &'a AtomicU64,
    pub abort: &'a AtomicBool,
    pub counters: &'a ScanCounters,
    pub threads: usize,
}

pub(super) fn worker_loop(
    ctx: &WorkerCtx<'_>,
    id: usize,
    local: DequeWorker<DirWork>,
    mut t: SinkThread,
) -> SinkThread {
    debug!("scan worker {id} started");
    let mut idle_spins = 0u32;
    const MAX_IDLE_SPINS: u32 = 1000;

    loop {
        let work = local.pop().or_else(|| {
            loop {
                match ctx.injector.steal() {
                    Steal::Success(w) => return Some(w),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
            for (i, stealer) in ctx.stealers.iter().enumerate() {
                if i == id {
                    continue;
                }
                loop {
                    match stealer.steal() {
                        Steal::Success(w) => return Some(w),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
            None
        });

        match work {
            Some(w) => {
                idle_spins = 0;
                process_dir(ctx, w, &local, &mut t);
                ctx.pending.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if ctx.pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                idle_spins += 1;
                if idle_spins > MAX_IDLE_SPINS {
                    std::thread::sleep(Duration::from_micros(100));
                    idle_spins = 0;
                }
            }
        }
    }

    debug!("scan worker {id} finished");
    t
}

fn process_dir(ctx: &WorkerCtx<'_>, work: DirWork, local: &DequeWorker<DirWork>, t: &mut SinkThread) {
    let DirWork {
        dir,
        rd,
        path,
        dev,
        patterns,
    } = work;
    t.set_dir(Some(&path));

    for dent in rd {
        if ctx.abort.load(Ordering::Relaxed) {
            break;
        }
        let dent = match dent {
            Ok(d) => d,
            Err(_) => {
                // Listing failed midway; keep what we have.
                ctx.counters.record_error(&path);
                dir.set_read_error(t);
                break;
            }
        };
        let name = dent.file_name();
        process_entry(ctx, &dir, &path, dev, &patterns, name.as_bytes(), local, t);
    }

    dir.done(t);
    t.set_dir(None);
}

#[allow(clippy::too_many_arguments)]
fn process_entry(
    ctx: &WorkerCtx<'_>,
    dir: &SinkDir,
    dir_path: &std::path::Path,
    dir_dev: u64,
    patterns: &Patterns,
    name: &[u8],
    local: &DequeWorker<DirWork>,
    t: &mut SinkThread,
) {
    // Exclusion comes before the stat; file-only rules wait for the kind.
    let file_only = match patterns.match_name(name) {
        Match::Both => {
            dir.add_special(t, name, SpecialKind::Pattern);
            return;
        }
        Match::FileOnly => true,
        Match::None => false,
    };

    let path = dir_path.join(std::ffi::OsStr::from_bytes(name));
    let mut meta = match fs::symlink_metadata(&path) {
        Ok(m) => m,
        Err(_) => {
            ctx.counters.record_error(&path);
            dir.add_special(t, name, SpecialKind::ReadError);
            return;
        }
    };

    if file_only && !meta.is_dir() {
        dir.add_special(t, name, SpecialKind::Pattern);
        return;
    }

    // Follow symlinks to non-directories; a target on another device is
    // demoted to a plain file so it neither joins hardlink accounting nor
    // trips the same-fs policy.
    let mut demoted = false;
    if ctx.opts.follow_symlinks && meta.file_type().is_symlink() {
        if let Ok(target) = fs::metadata(&path) {
            if !target.is_dir() {
                demoted = target.dev() != dir_dev;
                meta = target;
            }
        }
    }

    let mut stat = stat_of(&meta, ctx.opts.extended);
    if demoted {
        stat.nlink = 1;
        stat.is_link = false;
        stat.dev = dir_dev;
    }

    if ctx.opts.same_fs && stat.dev != dir_dev {
        dir.add_special(t, name, SpecialKind::OtherFs);
        return;
    }

    if !stat.is_dir {
        dir.add_stat(t, name, &stat);
        return;
    }

    let rd = match fs::read_dir(&path) {
        Ok(rd) => rd,
        Err(_) => {
            // Record the child dir itself, flagged unreadable.
            ctx.counters.record_error(&path);
            let child = dir.add_dir(t, name, &stat);
            child.set_read_error(t);
            child.done(t);
            return;
        }
    };

    #[cfg(target_os = "linux")]
    if ctx.opts.exclude_kernfs && stat.dev != dir_dev && super::kernfs::is_kernfs(&path) {
        dir.add_special(t, name, SpecialKind::KernFs);
        return;
    }

    if ctx.opts.exclude_caches && has_cachedir_tag(&path) {
        dir.add_special(t, name, SpecialKind::Pattern);
        return;
    }

    let child = dir.add_dir(t, name, &stat);
    let work = DirWork {
        dir: child,
        rd,
        path,
        dev: stat.dev,
        patterns: patterns.enter(name),
    };
    ctx.pending.fetch_add(1, Ordering::SeqCst);
    if ctx.threads > 1 && ctx.injector.len() < SHARED_CAP {
        ctx.injector.push(work);
    } else {
        local.push(work);
    }
}

/// Build the sink stat snapshot from metadata.
pub(super) fn stat_of(meta: &fs::Metadata, extended: bool) -> EntryStat {
    let ft = meta.file_type();
    EntryStat {
        is_dir: ft.is_dir(),
        is_nonreg: !ft.is_dir() && !ft.is_file(),
        is_link: ft.is_file() && meta.nlink() > 1,
        blocks: clamp_size(meta.blocks()),
        size: clamp_size(meta.len()),
        dev: meta.dev(),
        ino: meta.ino(),
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        ext: extended.then(|| Ext {
            mtime: Some(meta.mtime()),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            mode: Some(meta.mode()),
        }),
    }
}

/// True when the directory carries a cache-directory tag file.
fn has_cachedir_tag(dir: &std::path::Path) -> bool {
    use std::io::Read;
    let mut buf = [0u8; CACHEDIR_SIG.len()];
    match fs::File::open(dir.join("CACHEDIR.TAG")) {
        Ok(mut f) => f.read_exact(&mut buf).is_ok() && buf == *CACHEDIR_SIG,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cachedir_tag_detection() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_cachedir_tag(tmp.path()));

        fs::write(
            tmp.path().join("CACHEDIR.TAG"),
            b"Signature: 8a477f597d28d172789f06886806bc55 optional trailer",
        )
        .unwrap();
        assert!(has_cachedir_tag(tmp.path()));

        fs::write(tmp.path().join("CACHEDIR.TAG"), b"not a tag").unwrap();
        assert!(!has_cachedir_tag(tmp.path()));
    }

    #[test]
    fn test_stat_of_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f");
        fs::write(&p, vec![0u8; 1000]).unwrap();
        let st = stat_of(&fs::symlink_metadata(&p).unwrap(), true);
        assert!(!st.is_dir);
        assert!(!st.is_nonreg);
        assert_eq!(st.size, 1000);
        assert_eq!(st.nlink, 1);
        let ext = st.ext.unwrap();
        assert!(ext.mtime.is_some());
        assert!(ext.mode.is_some());
    }
}
