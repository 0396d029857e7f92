//! Entry records and stat snapshots
//!
//! These types represent filesystem entries flowing from the scanner (or an
//! import) into a sink, and the per-node payloads stored in the in-memory
//! tree. All allocated sizes are in 512-byte blocks; apparent sizes are in
//! bytes. Both saturate at [`SIZE_MAX`]; item counts saturate at `u32::MAX`.

/// Largest representable block count / byte size (2^60 - 1).
///
/// Stat values beyond this are clamped on entry; cumulative arithmetic
/// saturates here so aggregates can never wrap.
pub const SIZE_MAX: u64 = (1 << 60) - 1;

/// Entry kind codes as stored in the binary container.
///
/// Non-negative codes are real filesystem entries; negative codes are
/// special entries that carry no size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EType {
    /// Directory
    Dir,
    /// Regular file
    Reg,
    /// Non-regular, non-directory (device node, socket, fifo)
    NonReg,
    /// Hardlink candidate (regular file with nlink > 1)
    Link,
    /// Special entry
    Special(SpecialKind),
}

/// Reason an entry is present without size information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialKind {
    /// stat or open failed
    ReadError,
    /// Excluded by pattern or CACHEDIR.TAG
    Pattern,
    /// On another filesystem while scanning with same-fs
    OtherFs,
    /// A Linux pseudo-filesystem mount
    KernFs,
    /// A firmlink, only produced by importing exports that record them
    FirmLink,
}

impl EType {
    /// Integer code used by the binary container's `type` key.
    pub fn code(self) -> i64 {
        match self {
            EType::Dir => 0,
            EType::Reg => 1,
            EType::NonReg => 2,
            EType::Link => 3,
            EType::Special(SpecialKind::ReadError) => -1,
            EType::Special(SpecialKind::Pattern) => -2,
            EType::Special(SpecialKind::OtherFs) => -3,
            EType::Special(SpecialKind::KernFs) => -4,
            EType::Special(SpecialKind::FirmLink) => -5,
        }
    }

    /// Decode a container `type` code.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => EType::Dir,
            1 => EType::Reg,
            2 => EType::NonReg,
            3 => EType::Link,
            -1 => EType::Special(SpecialKind::ReadError),
            -2 => EType::Special(SpecialKind::Pattern),
            -3 => EType::Special(SpecialKind::OtherFs),
            -4 => EType::Special(SpecialKind::KernFs),
            -5 => EType::Special(SpecialKind::FirmLink),
            _ => return None,
        })
    }
}

impl SpecialKind {
    /// The `excluded` value used in the JSON format, if this kind has one.
    ///
    /// Read errors are exported through `read_error`, not `excluded`.
    pub fn excluded_label(self) -> Option<&'static str> {
        match self {
            SpecialKind::ReadError => None,
            SpecialKind::Pattern => Some("pattern"),
            SpecialKind::OtherFs => Some("otherfs"),
            SpecialKind::KernFs => Some("kernfs"),
            SpecialKind::FirmLink => Some("frmlnk"),
        }
    }

    /// Parse a JSON `excluded` value.
    pub fn from_excluded_label(label: &str) -> Option<Self> {
        Some(match label {
            "pattern" => SpecialKind::Pattern,
            "otherfs" => SpecialKind::OtherFs,
            "kernfs" => SpecialKind::KernFs,
            "frmlnk" => SpecialKind::FirmLink,
            _ => return None,
        })
    }
}

/// Extended metadata, each field individually optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext {
    /// Modification time, seconds since the epoch
    pub mtime: Option<i64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Full mode bits (type + permissions)
    pub mode: Option<u32>,
}

impl Ext {
    /// True when no field is present.
    pub fn is_empty(&self) -> bool {
        self.mtime.is_none() && self.uid.is_none() && self.gid.is_none() && self.mode.is_none()
    }

    /// Raise `mtime` to at least `other`'s, for directory mtime propagation.
    pub fn bump_mtime(&mut self, other: Option<i64>) {
        if let Some(m) = other {
            self.mtime = Some(self.mtime.map_or(m, |cur| cur.max(m)));
        }
    }
}

/// A stat snapshot delivered from a source (scanner or import) to a sink
///
/// `blocks` and `size` are already clamped to [`SIZE_MAX`]. `dev` is the raw
/// device id; sinks intern it. `nlink` is 0 when unknown (old imports).
#[derive(Debug, Clone, Default)]
pub struct EntryStat {
    /// True for directories
    pub is_dir: bool,
    /// True for non-regular non-directories
    pub is_nonreg: bool,
    /// True for hardlink candidates. Usually `nlink > 1`, but imports of
    /// old exports know an entry is hardlinked without knowing the count.
    pub is_link: bool,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    /// Apparent size in bytes
    pub size: u64,
    /// Raw device id
    pub dev: u64,
    /// Inode number
    pub ino: u64,
    /// Hard link count; 0 when unknown
    pub nlink: u32,
    /// Extended metadata, present only in extended mode
    pub ext: Option<Ext>,
}

impl EntryStat {
    /// The entry kind this stat produces in a sink.
    pub fn etype(&self) -> EType {
        if self.is_dir {
            EType::Dir
        } else if self.is_nonreg {
            EType::NonReg
        } else if self.is_link {
            EType::Link
        } else {
            EType::Reg
        }
    }
}

/// A pair of saturating aggregates: allocated blocks and apparent bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// 512-byte blocks
    pub blocks: u64,
    /// Bytes
    pub size: u64,
}

impl Totals {
    /// Construct from already-clamped components.
    pub fn new(blocks: u64, size: u64) -> Self {
        Self { blocks, size }
    }

    /// Saturating add, clamped at [`SIZE_MAX`].
    pub fn add(&mut self, other: Totals) {
        self.blocks = sat_add(self.blocks, other.blocks);
        self.size = sat_add(self.size, other.size);
    }

    /// Saturating subtract, clamped at zero.
    pub fn sub(&mut self, other: Totals) {
        self.blocks = self.blocks.saturating_sub(other.blocks);
        self.size = self.size.saturating_sub(other.size);
    }
}

/// Saturating add clamped at [`SIZE_MAX`].
pub fn sat_add(a: u64, b: u64) -> u64 {
    a.saturating_add(b).min(SIZE_MAX)
}

/// Clamp a raw stat value to the representable range.
pub fn clamp_size(v: u64) -> u64 {
    v.min(SIZE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etype_codes_round_trip() {
        for t in [
            EType::Dir,
            EType::Reg,
            EType::NonReg,
            EType::Link,
            EType::Special(SpecialKind::ReadError),
            EType::Special(SpecialKind::Pattern),
            EType::Special(SpecialKind::OtherFs),
            EType::Special(SpecialKind::KernFs),
            EType::Special(SpecialKind::FirmLink),
        ] {
            assert_eq!(EType::from_code(t.code()), Some(t));
        }
        assert_eq!(EType::from_code(9), None);
    }

    #[test]
    fn test_stat_kind() {
        let mut st = EntryStat {
            nlink: 1,
            ..Default::default()
        };
        assert_eq!(st.etype(), EType::Reg);
        st.is_link = true;
        assert_eq!(st.etype(), EType::Link);
        st.is_dir = true;
        assert_eq!(st.etype(), EType::Dir);
    }

    #[test]
    fn test_totals_saturate() {
        let mut t = Totals::new(SIZE_MAX - 1, 10);
        t.add(Totals::new(100, 5));
        assert_eq!(t.blocks, SIZE_MAX);
        assert_eq!(t.size, 15);

        t.sub(Totals::new(SIZE_MAX, 20));
        assert_eq!(t.blocks, 0);
        assert_eq!(t.size, 0);
    }

    #[test]
    fn test_ext_bump_mtime() {
        let mut e = Ext::default();
        e.bump_mtime(Some(100));
        e.bump_mtime(Some(50));
        e.bump_mtime(None);
        assert_eq!(e.mtime, Some(100));
        e.bump_mtime(Some(200));
        assert_eq!(e.mtime, Some(200));
    }
}
