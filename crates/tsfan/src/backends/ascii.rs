//! Plain-text backend.
//!
//! Emits one `"<key> <value> <time>"` line per record to stdout, or to a
//! file when a path was configured. A path ending in `.gz` is written
//! through gzip transparently. No batching: every record goes straight to
//! the sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::backend::{BackendId, BackendOps};
use crate::error::{Error, Result};
use crate::kp::KeyPackage;

const BACKEND_NAME: &str = "ascii";

const DEFAULT_COMPRESS_LEVEL: u32 = 6;

#[derive(Parser, Debug)]
#[command(name = BACKEND_NAME)]
struct AsciiArgs {
    /// Output compression level to use
    #[arg(short = 'c', value_name = "level", default_value_t = DEFAULT_COMPRESS_LEVEL)]
    compress_level: u32,

    /// File to write ASCII timeseries metrics to (stdout if omitted)
    #[arg(short = 'f', value_name = "path")]
    file: Option<PathBuf>,
}

/// Where the lines go.
enum Sink {
    Stdout,
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn open(path: &PathBuf, level: u32) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        if path.extension().is_some_and(|ext| ext == "gz") {
            Ok(Self::Gzip(GzEncoder::new(file, Compression::new(level))))
        } else {
            Ok(Self::Plain(file))
        }
    }

    fn write_record(&mut self, key: &str, value: u64, time: u32) -> io::Result<()> {
        match self {
            Self::Stdout => writeln!(io::stdout().lock(), "{key} {value} {time}"),
            Self::Plain(w) => writeln!(w, "{key} {value} {time}"),
            Self::Gzip(w) => writeln!(w, "{key} {value} {time}"),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout => Ok(()),
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => {
                w.try_finish()?;
                w.get_mut().flush()
            }
        }
    }
}

/// Text sink backend; see the module docs.
pub struct AsciiBackend {
    enabled: bool,
    sink: Sink,
    bulk_cnt: u32,
    bulk_expect: u32,
    bulk_time: u32,
}

impl AsciiBackend {
    /// Creates the backend disabled, pointing at stdout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            sink: Sink::Stdout,
            bulk_cnt: 0,
            bulk_expect: 0,
            bulk_time: 0,
        }
    }
}

impl Default for AsciiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendOps for AsciiBackend {
    fn id(&self) -> BackendId {
        BackendId::Ascii
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, args: &[String]) -> Result<()> {
        let parsed =
            AsciiArgs::try_parse_from(std::iter::once(BACKEND_NAME.to_owned()).chain(args.iter().cloned()))
                .map_err(|e| Error::Config(e.to_string()))?;

        if parsed.compress_level > 9 {
            return Err(Error::Config(format!(
                "compression level {} out of range 0-9",
                parsed.compress_level
            )));
        }

        // open before committing any state so a failure leaves us disabled
        let sink = match &parsed.file {
            Some(path) => Sink::open(path, parsed.compress_level).map_err(|e| {
                Error::Config(format!("failed to open output file '{}': {e}", path.display()))
            })?,
            None => Sink::Stdout,
        };

        self.sink = sink;
        self.enabled = true;
        Ok(())
    }

    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()> {
        self.sink.write_record(key, value, time)?;
        Ok(())
    }

    fn resolve_key(&mut self, key: &str) -> Result<Box<[u8]>> {
        // the id is the key string itself, NUL-terminated
        let mut id = Vec::with_capacity(key.len() + 1);
        id.extend_from_slice(key.as_bytes());
        id.push(0);
        Ok(id.into_boxed_slice())
    }

    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()> {
        let bytes = id.strip_suffix(&[0]).unwrap_or(id);
        let key = std::str::from_utf8(bytes).map_err(|_| Error::Resolve {
            backend: BACKEND_NAME,
            detail: "key id is not valid UTF-8".into(),
        })?;
        self.set_single(key, value, time)
    }

    fn set_bulk_init(&mut self, key_cnt: u32, time: u32) -> Result<()> {
        if self.bulk_expect != 0 || self.bulk_cnt != 0 {
            return Err(Error::Config("bulk write already in progress".into()));
        }
        self.bulk_expect = key_cnt;
        self.bulk_time = time;
        Ok(())
    }

    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()> {
        if self.bulk_expect == 0 {
            return Err(Error::Config("no bulk write in progress".into()));
        }
        self.set_single_by_id(id, value, self.bulk_time)?;

        self.bulk_cnt += 1;
        if self.bulk_cnt == self.bulk_expect {
            self.bulk_cnt = 0;
            self.bulk_time = 0;
            self.bulk_expect = 0;
        }
        Ok(())
    }

    fn kp_flush(&mut self, kp: &KeyPackage, time: u32) -> Result<()> {
        for ki in kp.enabled_iter() {
            self.sink.write_record(ki.key(), ki.value(), time)?;
        }
        Ok(())
    }
}

impl Drop for AsciiBackend {
    fn drop(&mut self) {
        if let Err(e) = self.sink.finish() {
            warn!(error = %e, "failed to finalize ascii output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kp::{KeyPackage, ResetMode};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn file_backend(path: &std::path::Path) -> AsciiBackend {
        let mut backend = AsciiBackend::new();
        backend
            .init(&["-f".to_owned(), path.display().to_string()])
            .unwrap();
        backend
    }

    #[test]
    fn test_single_record_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut backend = file_backend(&path);
        backend.set_single("x", 7, 1_234_567_890).unwrap();
        drop(backend);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x 7 1234567890\n");
    }

    #[test]
    fn test_gzip_output_detected_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gz");

        let mut backend = file_backend(&path);
        backend.set_single("a.b", 1, 10).unwrap();
        backend.set_single("a.c", 2, 10).unwrap();
        drop(backend);

        let mut decoder = GzDecoder::new(std::fs::File::open(&path).unwrap());
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        assert_eq!(text, "a.b 1 10\na.c 2 10\n");
    }

    #[test]
    fn test_kp_flush_writes_enabled_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut backend = file_backend(&path);
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let a = kp.add_key("first");
        let b = kp.add_key("second");
        let c = kp.add_key("third");
        kp.set(a, 1);
        kp.set(b, 2);
        kp.set(c, 3);
        kp.disable_key(b);

        backend.kp_flush(&kp, 100).unwrap();
        drop(backend);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first 1 100\nthird 3 100\n"
        );
    }

    #[test]
    fn test_resolve_key_is_identity() {
        let mut backend = AsciiBackend::new();
        let id = backend.resolve_key("metric.one").unwrap();
        assert_eq!(&id[..], b"metric.one\0");
    }

    #[test]
    fn test_set_single_by_id_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut backend = file_backend(&path);
        let id = backend.resolve_key("k").unwrap();
        backend.set_single_by_id(&id, 5, 50).unwrap();
        drop(backend);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "k 5 50\n");
    }

    #[test]
    fn test_bulk_counts_down_and_auto_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let mut backend = file_backend(&path);
        backend.set_bulk_init(2, 30).unwrap();
        backend.set_bulk_by_id(b"a\0", 1).unwrap();
        backend.set_bulk_by_id(b"b\0", 2).unwrap();
        // batch auto-ended, so a new one may start
        backend.set_bulk_init(1, 40).unwrap();
        backend.set_bulk_by_id(b"c\0", 3).unwrap();
        drop(backend);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "a 1 30\nb 2 30\nc 3 40\n"
        );
    }

    #[test]
    fn test_bulk_without_init_fails() {
        let mut backend = AsciiBackend::new();
        assert!(backend.set_bulk_by_id(b"a\0", 1).is_err());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let mut backend = AsciiBackend::new();
        let err = backend
            .init(&["-c".to_owned(), "12".to_owned()])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!backend.is_enabled());
    }

    #[test]
    fn test_init_rejects_unknown_flag() {
        let mut backend = AsciiBackend::new();
        assert!(backend.init(&["-z".to_owned()]).is_err());
        assert!(!backend.is_enabled());
    }

    #[test]
    fn test_init_rejects_unwritable_path() {
        let mut backend = AsciiBackend::new();
        let err = backend
            .init(&["-f".to_owned(), "/nonexistent-dir/out.txt".to_owned()])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!backend.is_enabled());
    }
}
