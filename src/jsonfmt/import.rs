//! Streaming JSON import
//!
//! A recursive-descent parser over raw bytes that feeds entries straight
//! into a sink, never holding more than one object in memory. Positions
//! are tracked per byte so syntax errors report line:column. Unknown
//! object keys are skipped; names are decoded back to raw bytes, folding
//! `\u00XX` escapes into single bytes so non-UTF-8 names survive the round
//! trip.

use std::io::Read;

use tracing::debug;

use crate::error::{Error, ImportError};
use crate::model::{clamp_size, EntryStat, Ext, SpecialKind};
use crate::sink::{Sink, SinkDir, SinkThread};

const READ_CHUNK: usize = 64 * 1024;

/// Parse a JSON export from `rd` and replay it into `sink`.
pub fn import_json(rd: impl Read, sink: &Sink, t: &mut SinkThread) -> Result<(), Error> {
    let mut p = Parser::new(rd);
    p.parse_document(sink, t)
}

struct Parser<R: Read> {
    rd: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
    line: u64,
    col: u64,
}

/// Decoded fields of one entry object.
#[derive(Default)]
struct Fields {
    name: Vec<u8>,
    asize: u64,
    dsize: u64,
    dev: Option<u64>,
    ino: Option<u64>,
    nlink: u64,
    hlnkc: bool,
    notreg: bool,
    read_error: bool,
    excluded: Option<SpecialKind>,
    uid: Option<u32>,
    gid: Option<u32>,
    mode: Option<u32>,
    mtime: Option<i64>,
}

impl Fields {
    fn to_stat(&self, is_dir: bool, parent_dev: u64) -> EntryStat {
        let is_link = !is_dir && !self.notreg && self.hlnkc && self.ino.is_some();
        let ext = Ext {
            mtime: self.mtime,
            uid: self.uid,
            gid: self.gid,
            mode: self.mode,
        };
        EntryStat {
            is_dir,
            is_nonreg: !is_dir && self.notreg,
            is_link,
            blocks: clamp_size(self.dsize / 512),
            size: clamp_size(self.asize),
            dev: self.dev.unwrap_or(parent_dev),
            ino: self.ino.unwrap_or(0),
            // Exports predating the nlink field leave 0 here; hardlink
            // accounting then falls back to the visible class size.
            nlink: if is_link {
                u32::try_from(self.nlink).unwrap_or(u32::MAX)
            } else {
                1
            },
            ext: (!ext.is_empty()).then_some(ext),
        }
    }

    /// The special kind this leaf represents, if any.
    fn special(&self) -> Option<SpecialKind> {
        if let Some(kind) = self.excluded {
            return Some(kind);
        }
        self.read_error.then_some(SpecialKind::ReadError)
    }
}

impl<R: Read> Parser<R> {
    fn new(rd: R) -> Self {
        Self {
            rd,
            buf: Vec::new(),
            pos: 0,
            len: 0,
            eof: false,
            line: 1,
            col: 0,
        }
    }

    fn parse_document(&mut self, sink: &Sink, t: &mut SinkThread) -> Result<(), Error> {
        self.skip_ws()?;
        self.expect(b'[')?;
        self.skip_ws()?;
        let major = self.parse_u64()?;
        if major != 1 {
            return Err(ImportError::NotAnExport(format!("format version {major}")).into());
        }
        self.skip_ws()?;
        self.expect(b',')?;
        self.skip_ws()?;
        let _minor = self.parse_u64()?;
        self.skip_ws()?;
        self.expect(b',')?;
        self.skip_ws()?;
        if self.peek()? != Some(b'{') {
            return Err(ImportError::NotAnExport("missing metadata object".into()).into());
        }
        self.skip_value()?;
        self.skip_ws()?;
        self.expect(b',')?;
        self.skip_ws()?;

        // The root element must be a directory.
        if self.peek()? != Some(b'[') {
            return Err(ImportError::NotAnExport("root element is not a directory".into()).into());
        }
        self.advance()?;
        self.skip_ws()?;
        self.expect(b'{')?;
        let fields = self.parse_fields()?;
        let stat = fields.to_stat(true, fields.dev.unwrap_or(0));
        debug!(name = String::from_utf8_lossy(&fields.name).as_ref(), "importing");
        let root = sink.create_root(&fields.name, &stat);
        if fields.read_error {
            root.set_read_error(t);
        }
        self.parse_children(&root, t, stat.dev)?;
        root.done(t);

        self.skip_ws()?;
        self.expect(b']')?;
        Ok(())
    }

    /// Parse the remaining elements of a directory array, then its `]`.
    fn parse_children(&mut self, dir: &SinkDir, t: &mut SinkThread, dev: u64) -> Result<(), Error> {
        loop {
            self.skip_ws()?;
            match self.peek()? {
                Some(b',') => {
                    self.advance()?;
                    self.skip_ws()?;
                    self.parse_element(dir, t, dev)?;
                }
                Some(b']') => {
                    self.advance()?;
                    return Ok(());
                }
                _ => return Err(self.err("expected ',' or ']'").into()),
            }
        }
    }

    fn parse_element(&mut self, parent: &SinkDir, t: &mut SinkThread, dev: u64) -> Result<(), Error> {
        match self.peek()? {
            Some(b'[') => {
                self.advance()?;
                self.skip_ws()?;
                self.expect(b'{')?;
                let fields = self.parse_fields()?;
                let stat = fields.to_stat(true, dev);
                let child = parent.add_dir(t, &fields.name, &stat);
                if fields.read_error {
                    child.set_read_error(t);
                }
                self.parse_children(&child, t, stat.dev)?;
                child.done(t);
                Ok(())
            }
            Some(b'{') => {
                self.advance()?;
                let fields = self.parse_fields()?;
                match fields.special() {
                    Some(kind) => parent.add_special(t, &fields.name, kind),
                    None => parent.add_stat(t, &fields.name, &fields.to_stat(false, dev)),
                }
                Ok(())
            }
            _ => Err(self.err("expected an object or array element").into()),
        }
    }

    /// Parse an entry object's fields; the opening `{` is already consumed.
    fn parse_fields(&mut self) -> Result<Fields, ImportError> {
        let mut fields = Fields::default();
        self.skip_ws()?;
        if self.peek()? == Some(b'}') {
            self.advance()?;
            return Err(self.err("entry object without a name"));
        }
        loop {
            self.skip_ws()?;
            self.expect(b'"')?;
            let key = self.parse_string_bytes()?;
            self.skip_ws()?;
            self.expect(b':')?;
            self.skip_ws()?;
            match key.as_slice() {
                b"name" => {
                    self.expect(b'"')?;
                    fields.name = self.parse_string_bytes()?;
                }
                b"asize" => fields.asize = self.parse_u64()?,
                b"dsize" => fields.dsize = self.parse_u64()?,
                b"dev" => fields.dev = Some(self.parse_u64()?),
                b"ino" => fields.ino = Some(self.parse_u64()?),
                b"nlink" => fields.nlink = self.parse_u64()?,
                b"hlnkc" => fields.hlnkc = self.parse_bool()?,
                b"notreg" => fields.notreg = self.parse_bool()?,
                b"read_error" => fields.read_error = self.parse_bool()?,
                b"excluded" => {
                    self.expect(b'"')?;
                    let label = self.parse_string_bytes()?;
                    let label = String::from_utf8_lossy(&label).into_owned();
                    fields.excluded = Some(
                        SpecialKind::from_excluded_label(&label)
                            .ok_or_else(|| self.err(&format!("unknown exclusion '{label}'")))?,
                    );
                }
                b"uid" => fields.uid = Some(self.parse_u32()?),
                b"gid" => fields.gid = Some(self.parse_u32()?),
                b"mode" => fields.mode = Some(self.parse_u32()?),
                b"mtime" => fields.mtime = Some(self.parse_i64()?),
                _ => self.skip_value()?,
            }
            self.skip_ws()?;
            match self.next()? {
                b',' => continue,
                b'}' => break,
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
        if fields.name.is_empty() {
            return Err(self.err("entry object without a name"));
        }
        Ok(fields)
    }

    // ------------------------------------------------------------- lexing

    fn fill(&mut self) -> Result<(), ImportError> {
        if self.pos < self.len || self.eof {
            return Ok(());
        }
        self.buf.resize(READ_CHUNK, 0);
        let n = self.rd.read(&mut self.buf)?;
        self.pos = 0;
        self.len = n;
        self.eof = n == 0;
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<u8>, ImportError> {
        self.fill()?;
        Ok(if self.pos < self.len {
            Some(self.buf[self.pos])
        } else {
            None
        })
    }

    fn advance(&mut self) -> Result<u8, ImportError> {
        self.fill()?;
        if self.pos >= self.len {
            return Err(self.err("unexpected end of input"));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Ok(b)
    }

    fn next(&mut self) -> Result<u8, ImportError> {
        self.advance()
    }

    fn expect(&mut self, want: u8) -> Result<(), ImportError> {
        let got = self.next()?;
        if got != want {
            return Err(self.err(&format!("expected '{}'", want as char)));
        }
        Ok(())
    }

    fn skip_ws(&mut self) -> Result<(), ImportError> {
        while matches!(self.peek()?, Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.advance()?;
        }
        Ok(())
    }

    fn err(&self, msg: &str) -> ImportError {
        ImportError::Json {
            line: self.line,
            col: self.col,
            msg: msg.to_string(),
        }
    }

    // ------------------------------------------------------------ values

    fn parse_u64(&mut self) -> Result<u64, ImportError> {
        let mut v: u64 = 0;
        let mut any = false;
        while let Some(b @ b'0'..=b'9') = self.peek()? {
            self.advance()?;
            v = v.saturating_mul(10).saturating_add(u64::from(b - b'0'));
            any = true;
        }
        if !any {
            return Err(self.err("expected a number"));
        }
        Ok(v)
    }

    fn parse_u32(&mut self) -> Result<u32, ImportError> {
        Ok(u32::try_from(self.parse_u64()?).unwrap_or(u32::MAX))
    }

    fn parse_i64(&mut self) -> Result<i64, ImportError> {
        let neg = self.peek()? == Some(b'-');
        if neg {
            self.advance()?;
        }
        let v = self.parse_u64()?;
        Ok(if neg {
            -(i64::try_from(v).unwrap_or(i64::MAX))
        } else {
            i64::try_from(v).unwrap_or(i64::MAX)
        })
    }

    fn parse_bool(&mut self) -> Result<bool, ImportError> {
        match self.next()? {
            b't' => {
                for want in b"rue" {
                    self.expect(*want)?;
                }
                Ok(true)
            }
            b'f' => {
                for want in b"alse" {
                    self.expect(*want)?;
                }
                Ok(false)
            }
            _ => Err(self.err("expected a boolean")),
        }
    }

    /// Parse a string's remaining bytes; the opening quote is consumed.
    ///
    /// `\u00XX` escapes decode to the raw byte XX; larger code points are
    /// encoded as UTF-8, pairing surrogates where given.
    fn parse_string_bytes(&mut self) -> Result<Vec<u8>, ImportError> {
        let mut out = Vec::new();
        loop {
            match self.next()? {
                b'"' => return Ok(out),
                b'\\' => match self.next()? {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'/' => out.push(b'/'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0C),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'u' => {
                        let cp = self.parse_hex4()?;
                        if cp <= 0xFF {
                            out.push(cp as u8);
                        } else if (0xD800..0xDC00).contains(&cp) {
                            // High surrogate; pair it if a low one follows.
                            if self.peek()? == Some(b'\\') {
                                self.advance()?;
                                self.expect(b'u')?;
                                let low = self.parse_hex4()?;
                                if !(0xDC00..0xE000).contains(&low) {
                                    return Err(self.err("unpaired surrogate"));
                                }
                                let c = 0x10000 + ((cp - 0xD800) << 10) + (low - 0xDC00);
                                push_char(&mut out, c);
                            } else {
                                return Err(self.err("unpaired surrogate"));
                            }
                        } else {
                            push_char(&mut out, cp);
                        }
                    }
                    _ => return Err(self.err("invalid escape")),
                },
                b => out.push(b),
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, ImportError> {
        let mut v = 0u32;
        for _ in 0..4 {
            let b = self.next()?;
            let d = match b {
                b'0'..=b'9' => u32::from(b - b'0'),
                b'a'..=b'f' => u32::from(b - b'a') + 10,
                b'A'..=b'F' => u32::from(b - b'A') + 10,
                _ => return Err(self.err("invalid \\u escape")),
            };
            v = (v << 4) | d;
        }
        Ok(v)
    }

    /// Skip one complete JSON value of any shape.
    fn skip_value(&mut self) -> Result<(), ImportError> {
        self.skip_value_depth(0)
    }

    fn skip_value_depth(&mut self, depth: u32) -> Result<(), ImportError> {
        if depth > 512 {
            return Err(self.err("nesting too deep"));
        }
        self.skip_ws()?;
        match self.peek()? {
            Some(b'"') => {
                self.advance()?;
                self.parse_string_bytes()?;
                Ok(())
            }
            Some(b'{') | Some(b'[') => {
                let open = self.next()?;
                let close = if open == b'{' { b'}' } else { b']' };
                loop {
                    self.skip_ws()?;
                    if self.peek()? == Some(close) {
                        self.advance()?;
                        return Ok(());
                    }
                    if open == b'{' {
                        self.skip_ws()?;
                        self.expect(b'"')?;
                        self.parse_string_bytes()?;
                        self.skip_ws()?;
                        self.expect(b':')?;
                    }
                    self.skip_value_depth(depth + 1)?;
                    self.skip_ws()?;
                    match self.peek()? {
                        Some(b',') => {
                            self.advance()?;
                        }
                        Some(c) if c == close => {}
                        _ => return Err(self.err("expected ',' or close")),
                    }
                }
            }
            Some(b't') | Some(b'f') => self.parse_bool().map(|_| ()),
            Some(b'n') => {
                for want in b"null" {
                    self.expect(*want)?;
                }
                Ok(())
            }
            Some(b'-') | Some(b'0'..=b'9') => {
                // Numbers including fractions and exponents.
                while matches!(
                    self.peek()?,
                    Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
                ) {
                    self.advance()?;
                }
                Ok(())
            }
            _ => Err(self.err("expected a value")),
        }
    }
}

fn push_char(out: &mut Vec<u8>, cp: u32) {
    if let Some(c) = char::from_u32(cp) {
        let mut b = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut b).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemSink, ScanCounters};
    use std::sync::Arc;

    fn import_to_tree(doc: &str) -> Result<crate::model::Tree, Error> {
        let counters = ScanCounters::new(1);
        let mut t = SinkThread::new(0, Arc::clone(&counters.workers[0]));
        let sink = Sink::Memory(MemSink::new());
        import_json(doc.as_bytes(), &sink, &mut t)?;
        match sink {
            Sink::Memory(m) => Ok(m.finish().expect("builder alive")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_import_simple() {
        let doc = r#"[1,2,{"progname":"duscan","progver":"0.3.1","timestamp":1},
            [{"name":"/r","asize":4096,"dsize":4096},
             {"name":"a","asize":100,"dsize":4096},
             [{"name":"sub"},{"name":"b","asize":200,"dsize":4096}]]]"#;
        let tree = import_to_tree(doc).unwrap();
        let root = tree.root();
        assert_eq!(tree.dir(root).items, 3);
        assert_eq!(tree.dir(root).cum.size, 4096 + 100 + 200);
        let names: Vec<&[u8]> = tree
            .children(root)
            .iter()
            .map(|&c| &*tree.node(c).name)
            .collect();
        assert_eq!(names, vec![b"a".as_slice(), b"sub".as_slice()]);
    }

    #[test]
    fn test_import_specials_and_errors() {
        let doc = r#"[1,2,{},
            [{"name":"/r"},
             {"name":"skipped","excluded":"pattern"},
             {"name":"broken","read_error":true},
             [{"name":"bad","read_error":true}]]]"#;
        let tree = import_to_tree(doc).unwrap();
        let root = tree.root();
        assert!(tree.dir(root).suberr);
        let kids = tree.children(root);
        assert!(matches!(
            tree.node(kids[0]).kind,
            crate::model::NodeKind::Special(SpecialKind::Pattern)
        ));
        assert!(matches!(
            tree.node(kids[1]).kind,
            crate::model::NodeKind::Special(SpecialKind::ReadError)
        ));
        assert!(tree.dir(kids[2]).err);
    }

    #[test]
    fn test_import_hardlinks_without_nlink() {
        // Old exports omit nlink; the visible class size takes over.
        let doc = r#"[1,2,{},
            [{"name":"/r"},
             {"name":"x","asize":1000,"dsize":8192,"ino":9,"hlnkc":true},
             {"name":"y","asize":1000,"dsize":8192,"ino":9,"hlnkc":true}]]"#;
        let tree = import_to_tree(doc).unwrap();
        let d = tree.dir(tree.root());
        assert_eq!(d.cum.size, 1000);
        assert_eq!(d.shared.size, 0);
    }

    #[test]
    fn test_byte_escape_round_trip() {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"[1,2,{},[{\"name\":\"/r\"},{\"name\":");
        crate::jsonfmt::export::write_name(&mut doc, b"a\xff\xc3\x28b").unwrap();
        doc.extend_from_slice(b",\"asize\":1}]]");
        let counters = ScanCounters::new(1);
        let mut t = SinkThread::new(0, Arc::clone(&counters.workers[0]));
        let sink = Sink::Memory(MemSink::new());
        import_json(&doc[..], &sink, &mut t).unwrap();
        let tree = match sink {
            Sink::Memory(m) => m.finish().unwrap(),
            _ => unreachable!(),
        };
        let child = tree.children(tree.root())[0];
        assert_eq!(&*tree.node(child).name, b"a\xff\xc3\x28b");
    }

    #[test]
    fn test_unknown_keys_skipped() {
        let doc = r#"[1,2,{},
            [{"name":"/r","future":{"nested":[1,2,3]},"other":null},
             {"name":"a","asize":5,"wat":"ok"}]]"#;
        let tree = import_to_tree(doc).unwrap();
        assert_eq!(tree.dir(tree.root()).cum.size, 5);
    }

    #[test]
    fn test_syntax_error_position() {
        let doc = "[1,2,{},\n[{\"name\":\"/r\"}(]]";
        let err = import_to_tree(doc).unwrap_err();
        match err {
            Error::Import(ImportError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_wrong_version_rejected() {
        let doc = "[9,2,{},[{\"name\":\"/r\"}]]";
        assert!(matches!(
            import_to_tree(doc),
            Err(Error::Import(ImportError::NotAnExport(_)))
        ));
    }
}
