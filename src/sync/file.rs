//! Polled size file: `height\nwidth\n`

use super::{write_atomic, SharedSize, SizePublisher, SizeSource};
use crate::error::SyncError;
use log::{debug, trace};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Both ends of the file transport
#[derive(Debug, Clone)]
pub struct SizeFile {
    path: PathBuf,
    last_seen: Option<SharedSize>,
    last_written: Option<SharedSize>,
}

impl SizeFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_seen: None,
            last_written: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse `height\nwidth\n`. Anything short of two complete lines is treated
    /// as a write still in progress.
    pub fn parse(contents: &str) -> Option<SharedSize> {
        if !contents.ends_with('\n') {
            return None;
        }
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
        let height = lines.next()?.parse().ok()?;
        let width = lines.next()?.parse().ok()?;
        let size = SharedSize { height, width };
        size.is_valid().then_some(size)
    }
}

impl SizePublisher for SizeFile {
    fn publish(&mut self, size: SharedSize) -> Result<(), SyncError> {
        if self.last_written == Some(size) {
            return Ok(());
        }
        write_atomic(&self.path, format!("{}\n{}\n", size.height, size.width).as_bytes())?;
        debug!(
            "Published {}x{} to {}",
            size.width,
            size.height,
            self.path.display()
        );
        self.last_written = Some(size);
        Ok(())
    }
}

impl SizeSource for SizeFile {
    fn poll(&mut self) -> Result<Option<SharedSize>, SyncError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(size) = Self::parse(&contents) else {
            trace!("Size file {} incomplete: {:?}", self.path.display(), contents);
            return Ok(None);
        };
        if self.last_seen == Some(size) {
            return Ok(None);
        }
        self.last_seen = Some(size);
        Ok(Some(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_height_then_width() {
        assert_eq!(SizeFile::parse("500\n600\n"), Some(SharedSize::new(600, 500)));
    }

    #[test]
    fn test_parse_tolerates_partial_writes() {
        assert_eq!(SizeFile::parse(""), None);
        assert_eq!(SizeFile::parse("500\n"), None);
        assert_eq!(SizeFile::parse("500\n60"), None);
        assert_eq!(SizeFile::parse("abc\n600\n"), None);
        assert_eq!(SizeFile::parse("0\n600\n"), None);
    }

    #[test]
    fn test_poll_reports_changes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share_data.txt");
        let mut writer = SizeFile::new(&path);
        let mut reader = SizeFile::new(&path);

        assert_eq!(reader.poll().unwrap(), None);

        writer.publish(SharedSize::new(600, 500)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "500\n600\n");
        assert_eq!(reader.poll().unwrap(), Some(SharedSize::new(600, 500)));
        assert_eq!(reader.poll().unwrap(), None);

        writer.publish(SharedSize::new(300, 200)).unwrap();
        assert_eq!(reader.poll().unwrap(), Some(SharedSize::new(300, 200)));
    }

    #[test]
    fn test_reader_accepts_foreign_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share_data.txt");
        fs::write(&path, "500\n600\n").unwrap();
        let mut reader = SizeFile::new(&path);
        assert_eq!(reader.poll().unwrap(), Some(SharedSize::new(600, 500)));
    }
}
