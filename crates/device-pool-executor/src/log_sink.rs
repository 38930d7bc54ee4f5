use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Where the log fan writes drained log records.
///
/// spec.md §6: "A file path or sink handle provided at construction...
/// This is a diagnostic channel only — no schema stability is promised."
pub trait LogSink: Send + Sync {
    /// Append one record. Implementations should be cheap to call from the
    /// log fan's loop; failures are logged and otherwise ignored by the
    /// caller (spec.md §4.3: "Survives transient sink failures").
    fn write(&self, record: &str) -> std::io::Result<()>;
}

/// Default log sink: appends one record per line to a file, with a
/// trailing blank line as a separator between records.
///
/// Grounded in the original `onnx-web` worker pool's log thread
/// (`logger_worker`), which opens a file and writes
/// `f.write(str(job) + "\n\n")` per drained record.
pub struct FileLogSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileLogSink {
    /// Open (creating if necessary) a log file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path this sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn write(&self, record: &str) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(record.as_bytes())?;
        file.write_all(b"\n\n")?;
        file.flush()
    }
}
