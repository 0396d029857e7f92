//! Streaming JSON sink
//!
//! Writes the export document as entries arrive. Only strictly depth-first
//! single-threaded sources (the importers and tree replay) drive this sink
//! directly; a parallel scan cannot produce properly nested output, so a
//! scan destined for JSON goes through the memory sink instead and is
//! replayed here on finalize.
//!
//! A directory's object is buffered until its first child or its release,
//! because a read-error flag may still arrive after the handle is created.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::jsonfmt::export::{write_header, EntryFields, JsonOut};
use crate::model::{EType, EntryStat, Ext, SpecialKind};

struct PendingDir {
    name: Vec<u8>,
    asize: u64,
    dsize: u64,
    ext: Option<Ext>,
    read_error: bool,
}

struct JsonState {
    out: Option<JsonOut>,
    pending: Option<PendingDir>,
    error: Option<io::Error>,
}

impl JsonState {
    fn write(&mut self, f: impl FnOnce(&mut JsonOut) -> io::Result<()>) {
        if self.error.is_some() {
            return;
        }
        if let Some(out) = &mut self.out {
            if let Err(e) = f(out) {
                warn!("JSON export failed: {e}");
                self.error = Some(e);
            }
        }
    }

    fn flush_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            let fields = EntryFields {
                name: &p.name,
                asize: p.asize,
                dsize: p.dsize,
                read_error: p.read_error,
                ext: p.ext,
                ..Default::default()
            };
            self.write(|out| {
                out.write_all(b",[")?;
                fields.write_object(out)
            });
        }
    }
}

/// The streaming JSON export sink.
pub struct JsonSink {
    state: Arc<Mutex<JsonState>>,
}

impl JsonSink {
    /// Start a document on `out`, compressed when `compress` gives a level.
    pub fn new(out: Box<dyn Write + Send>, compress: Option<i32>) -> io::Result<Self> {
        let mut out = JsonOut::new(out, compress)?;
        write_header(&mut out)?;
        Ok(Self {
            state: Arc::new(Mutex::new(JsonState {
                out: Some(out),
                pending: None,
                error: None,
            })),
        })
    }

    /// Produce the root dir handle. The root element's name is the scan
    /// path.
    pub fn create_root(&self, name: &[u8], stat: &EntryStat) -> JsonDir {
        let mut st = self.state.lock();
        st.pending = Some(PendingDir {
            name: name.to_vec(),
            asize: stat.size,
            dsize: stat.blocks.saturating_mul(512),
            ext: stat.ext,
            read_error: false,
        });
        JsonDir {
            state: Arc::clone(&self.state),
        }
    }

    /// Close the document and the stream.
    pub fn finish(self) -> io::Result<()> {
        let mut st = self.state.lock();
        if let Some(e) = st.error.take() {
            return Err(e);
        }
        st.write(|out| out.write_all(b"]"));
        if let Some(e) = st.error.take() {
            return Err(e);
        }
        match st.out.take() {
            Some(out) => out.finish(),
            None => Ok(()),
        }
    }
}

/// Handle to one open directory in the JSON document.
pub struct JsonDir {
    state: Arc<Mutex<JsonState>>,
}

impl JsonDir {
    pub(super) fn add_special(&self, name: &[u8], kind: SpecialKind) {
        let mut st = self.state.lock();
        st.flush_pending();
        let fields = EntryFields {
            name,
            read_error: kind == SpecialKind::ReadError,
            excluded: kind.excluded_label(),
            ..Default::default()
        };
        st.write(|out| {
            out.write_all(b",")?;
            fields.write_object(out)
        });
    }

    pub(super) fn add_stat(&self, name: &[u8], stat: &EntryStat) {
        let mut st = self.state.lock();
        st.flush_pending();
        let link = stat.etype() == EType::Link;
        let fields = EntryFields {
            name,
            asize: stat.size,
            dsize: stat.blocks.saturating_mul(512),
            ino: link.then_some(stat.ino),
            nlink: (link && stat.nlink > 0).then_some(u64::from(stat.nlink)),
            hlnkc: link,
            notreg: stat.is_nonreg,
            ext: stat.ext,
            ..Default::default()
        };
        st.write(|out| {
            out.write_all(b",")?;
            fields.write_object(out)
        });
    }

    pub(super) fn add_dir(&self, name: &[u8], stat: &EntryStat) -> JsonDir {
        let mut st = self.state.lock();
        st.flush_pending();
        st.pending = Some(PendingDir {
            name: name.to_vec(),
            asize: stat.size,
            dsize: stat.blocks.saturating_mul(512),
            ext: stat.ext,
            read_error: false,
        });
        JsonDir {
            state: Arc::clone(&self.state),
        }
    }

    pub(super) fn set_read_error(&self) {
        let mut st = self.state.lock();
        match &mut st.pending {
            Some(p) => p.read_error = true,
            // The object is already out; nothing sensible to patch.
            None => warn!("read error reported after directory was emitted"),
        }
    }

    pub(super) fn done(self) {
        let mut st = self.state.lock();
        st.flush_pending();
        st.write(|out| out.write_all(b"]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[derive(Clone)]
    struct SharedVec(Arc<PMutex<Vec<u8>>>);
    impl Write for SharedVec {
        fn write(&mut self, b: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(b);
            Ok(b.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn dir_stat() -> EntryStat {
        EntryStat {
            is_dir: true,
            blocks: 8,
            size: 4096,
            nlink: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_streamed_document_is_valid_json() {
        let buf = Arc::new(PMutex::new(Vec::new()));
        let sink = JsonSink::new(Box::new(SharedVec(Arc::clone(&buf))), None).unwrap();

        let root = sink.create_root(b"/r", &dir_stat());
        root.add_stat(
            b"a",
            &EntryStat {
                blocks: 8,
                size: 100,
                nlink: 1,
                ..Default::default()
            },
        );
        let sub = root.add_dir(b"sub", &dir_stat());
        sub.set_read_error();
        sub.done();
        root.add_special(b"skipped", SpecialKind::Pattern);
        root.done();
        sink.finish().unwrap();

        let text = String::from_utf8(buf.lock().clone()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        let arr = doc.as_array().unwrap();
        assert_eq!(arr[0], 1);
        assert_eq!(arr[1], 2);
        assert_eq!(arr[2]["progname"], "duscan");

        let root = arr[3].as_array().unwrap();
        assert_eq!(root[0]["name"], "/r");
        assert_eq!(root[1]["name"], "a");
        assert_eq!(root[1]["asize"], 100);
        let sub = root[2].as_array().unwrap();
        assert_eq!(sub[0]["name"], "sub");
        assert_eq!(sub[0]["read_error"], true);
        assert_eq!(root[3]["excluded"], "pattern");
    }

    #[test]
    fn test_compressed_output_round_trips() {
        let buf = Arc::new(PMutex::new(Vec::new()));
        let sink = JsonSink::new(Box::new(SharedVec(Arc::clone(&buf))), Some(3)).unwrap();
        let root = sink.create_root(b"/r", &dir_stat());
        root.done();
        sink.finish().unwrap();

        let compressed = buf.lock().clone();
        assert_eq!(compressed[..4], [0x28, 0xb5, 0x2f, 0xfd]);
        let text = zstd::decode_all(&compressed[..]).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&text).unwrap();
        assert!(doc.as_array().unwrap()[3].is_array());
    }
}
