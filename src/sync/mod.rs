//! Cross-process size channels
//!
//! A leading window publishes its configured size; a following window in
//! another process picks it up and resizes to match. Two transports exist:
//!
//! - [`SizeFile`]: a text file holding `height\nwidth\n`, replaced atomically
//!   by the writer and polled by the reader
//! - [`SocketSizeSender`] / [`SocketSizeReceiver`]: a local socket carrying one
//!   JSON object per line, so every resize arrives as a discrete message
//!
//! Readers only report a size when it differs from the last one they saw.

mod file;
mod socket;

pub use file::SizeFile;
pub use socket::{SocketSizeReceiver, SocketSizeSender};

use crate::config::SyncTransport;
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// A window size as exchanged between processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSize {
    pub height: u32,
    pub width: u32,
}

impl SharedSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { height, width }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Writing end of a size channel
pub trait SizePublisher {
    fn publish(&mut self, size: SharedSize) -> Result<(), SyncError>;

    /// Called once per loop iteration so a transport can redeliver after a failure
    fn retry(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Reading end of a size channel
pub trait SizeSource {
    /// Latest size if it changed since the previous poll
    fn poll(&mut self) -> Result<Option<SharedSize>, SyncError>;
}

/// Open the leader side of the configured transport
pub fn publisher(transport: SyncTransport, path: &Path) -> Box<dyn SizePublisher> {
    match transport {
        SyncTransport::File => Box::new(SizeFile::new(path)),
        SyncTransport::Socket => Box::new(SocketSizeSender::new(path)),
    }
}

/// Open the follower side of the configured transport
pub fn source(transport: SyncTransport, path: &Path) -> Result<Box<dyn SizeSource>, SyncError> {
    Ok(match transport {
        SyncTransport::File => Box::new(SizeFile::new(path)),
        SyncTransport::Socket => Box::new(SocketSizeReceiver::bind(path)?),
    })
}

/// Replace `path` with `contents` through a sibling temp file and a rename,
/// so readers never observe a partial write
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(format!(".{}.tmp", std::process::id()));
    let temp = path.with_file_name(temp_name);

    let mut file = fs::File::create(&temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_shared_size_json_field_names() {
        let json = serde_json::to_string(&SharedSize::new(600, 500)).unwrap();
        assert_eq!(json, r#"{"height":500,"width":600}"#);
    }
}
