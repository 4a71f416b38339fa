//! Ports consumed from the host.
//!
//! The core never touches the file system, the process lifecycle or the
//! host UI directly; everything outward goes through these traits so the
//! host (and the tests) can substitute implementations.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::broadcast;

/// Directory selection outcome for hosts that can show a picker.
#[derive(Debug, Clone, Error)]
pub enum SelectionError {
    #[error("directory selection was cancelled")]
    UserCancelled,
    #[error("directory selection is not available")]
    Denied,
    #[error("directory selection failed: {0}")]
    Io(String),
}

/// Host file system access.
pub trait FilePort: Send + Sync {
    /// Write `bytes` to `path`, replacing any existing file.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Append `bytes` to `path`, creating the file when absent.
    fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Create `path` and any missing parents.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Ask the host for a directory. Headless implementations refuse.
    fn select_directory(&self) -> Result<PathBuf, SelectionError>;
}

/// Direct `std::fs` implementation used by desktop hosts and tests.
#[derive(Debug, Default, Clone)]
pub struct StdFilePort;

impl FilePort for StdFilePort {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(path, bytes)
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(bytes)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn select_directory(&self) -> Result<PathBuf, SelectionError> {
        // No dialog available without a windowing host.
        Err(SelectionError::Denied)
    }
}

/// Host signal raised just before termination so the engine can flush one
/// final checkpoint. Cloneable; each subscriber gets every signal.
#[derive(Debug, Clone)]
pub struct CrashSignal {
    tx: broadcast::Sender<()>,
}

impl CrashSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Deliver the save-now event to all subscribers.
    pub fn raise(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for CrashSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitter the engine calls whenever the recording flag flips, so the host
/// can drive tray state and power-save inhibition.
pub trait RecordingStatusPort: Send + Sync {
    fn recording_changed(&self, is_recording: bool);
}

/// Default sink for hosts that do not care.
#[derive(Debug, Default)]
pub struct NullStatusPort;

impl RecordingStatusPort for NullStatusPort {
    fn recording_changed(&self, _is_recording: bool) {}
}
