//! JSON export primitives
//!
//! The document is `[1, 2, {metadata}, <root element>]`, where a directory
//! element is an array of its object followed by its children and a leaf
//! element is a bare object. Names are opaque byte strings: bytes that do
//! not form valid UTF-8 are emitted as byte-valued `\u00XX` escapes, which
//! the importer folds back into raw bytes.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::Ext;

/// Output stream for the JSON document, optionally zstd-compressed.
pub enum JsonOut {
    /// Plain output.
    Plain(io::BufWriter<Box<dyn Write + Send>>),
    /// Zstd-compressed output.
    Zstd(zstd::stream::write::Encoder<'static, Box<dyn Write + Send>>),
}

impl JsonOut {
    /// Wrap `out`, compressing at `level` when given.
    pub fn new(out: Box<dyn Write + Send>, compress: Option<i32>) -> io::Result<Self> {
        Ok(match compress {
            None => JsonOut::Plain(io::BufWriter::new(out)),
            Some(level) => JsonOut::Zstd(zstd::stream::write::Encoder::new(out, level)?),
        })
    }

    /// Complete the stream; compression trailers are written here.
    pub fn finish(self) -> io::Result<()> {
        match self {
            JsonOut::Plain(mut w) => w.flush(),
            JsonOut::Zstd(enc) => enc.finish().and_then(|mut w| w.flush()),
        }
    }
}

impl Write for JsonOut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            JsonOut::Plain(w) => w.write(buf),
            JsonOut::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            JsonOut::Plain(w) => w.flush(),
            JsonOut::Zstd(w) => w.flush(),
        }
    }
}

/// Write the document header up to (and excluding) the root element.
pub fn write_header(out: &mut impl Write) -> io::Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    write!(
        out,
        "[1,2,{{\"progname\":\"{}\",\"progver\":\"{}\",\"timestamp\":{}}}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        timestamp
    )
}

/// The object fields of one entry.
#[derive(Debug, Clone, Default)]
pub struct EntryFields<'a> {
    pub name: &'a [u8],
    pub asize: u64,
    pub dsize: u64,
    /// Inode and link count, hardlink candidates only.
    pub ino: Option<u64>,
    pub nlink: Option<u64>,
    pub hlnkc: bool,
    pub notreg: bool,
    pub read_error: bool,
    /// `"pattern"`, `"otherfs"`, `"kernfs"`, or `"frmlnk"`.
    pub excluded: Option<&'static str>,
    pub ext: Option<Ext>,
}

impl EntryFields<'_> {
    /// Write the `{...}` object. Zero sizes and absent fields are omitted.
    pub fn write_object(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(b"{\"name\":")?;
        write_name(out, self.name)?;
        if self.asize > 0 {
            write!(out, ",\"asize\":{}", self.asize)?;
        }
        if self.dsize > 0 {
            write!(out, ",\"dsize\":{}", self.dsize)?;
        }
        if self.hlnkc {
            if let Some(ino) = self.ino {
                write!(out, ",\"ino\":{ino},\"hlnkc\":true")?;
            }
            if let Some(nlink) = self.nlink {
                write!(out, ",\"nlink\":{nlink}")?;
            }
        }
        if self.notreg {
            out.write_all(b",\"notreg\":true")?;
        }
        if self.read_error {
            out.write_all(b",\"read_error\":true")?;
        }
        if let Some(reason) = self.excluded {
            write!(out, ",\"excluded\":\"{reason}\"")?;
        }
        if let Some(ext) = &self.ext {
            if let Some(uid) = ext.uid {
                write!(out, ",\"uid\":{uid}")?;
            }
            if let Some(gid) = ext.gid {
                write!(out, ",\"gid\":{gid}")?;
            }
            if let Some(mode) = ext.mode {
                write!(out, ",\"mode\":{mode}")?;
            }
            if let Some(mtime) = ext.mtime {
                write!(out, ",\"mtime\":{mtime}")?;
            }
        }
        out.write_all(b"}")
    }
}

/// Write a name as a JSON string, escaping non-UTF-8 bytes so they survive
/// a round trip.
pub fn write_name(out: &mut impl Write, name: &[u8]) -> io::Result<()> {
    out.write_all(b"\"")?;
    let mut rest = name;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                write_str_escaped(out, valid)?;
                break;
            }
            Err(err) => {
                let (valid, bad) = rest.split_at(err.valid_up_to());
                write_str_escaped(out, std::str::from_utf8(valid).expect("validated prefix"))?;
                let bad_len = err.error_len().unwrap_or(bad.len());
                for &b in &bad[..bad_len] {
                    write!(out, "\\u00{b:02x}")?;
                }
                rest = &bad[bad_len..];
            }
        }
    }
    out.write_all(b"\"")
}

fn write_str_escaped(out: &mut impl Write, s: &str) -> io::Result<()> {
    for c in s.chars() {
        match c {
            '"' => out.write_all(b"\\\"")?,
            '\\' => out.write_all(b"\\\\")?,
            c if (c as u32) < 0x20 => write!(out, "\\u00{:02x}", c as u32)?,
            c => write!(out, "{c}")?,
        }
    }
    Ok(())
}
