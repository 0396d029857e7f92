//! Linux pseudo-filesystem detection
//!
//! A mount is a kernfs when its `statfs.f_type` matches one of the known
//! pseudo-filesystem magics. Only consulted for directories whose device
//! differs from their parent's, so the statfs call stays off the hot path.

use std::path::Path;

/// `statfs.f_type` values of Linux pseudo-filesystems.
const KERNFS_MAGICS: &[u64] = &[
    0x42494e4d, // binfmt_misc
    0xcafe4a11, // bpf
    0x27e0eb,   // cgroup
    0x63677270, // cgroup2
    0x64626720, // debugfs
    0x1cd1,     // devpts
    0x9fa0,     // proc
    0x6165676c, // pstore
    0x73636673, // securityfs
    0xf97cff8c, // selinuxfs
    0x62656572, // sysfs
    0x74726163, // tracefs
];

/// True when the filesystem holding `path` is a kernel pseudo-filesystem.
/// Unstattable mounts are not treated as kernfs.
pub fn is_kernfs(path: &Path) -> bool {
    match rustix::fs::statfs(path) {
        Ok(sfs) => KERNFS_MAGICS.contains(&(sfs.f_type as u64)),
        Err(_) => false,
    }
}
