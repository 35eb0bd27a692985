//! Where an exported handle goes once the compositor issued it

use crate::sync::write_atomic;
use log::info;
use std::cell::RefCell;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

/// Out-of-band channel carrying the handle to the importing process
pub trait HandlePublisher {
    fn publish(&mut self, handle: &str) -> io::Result<()>;
}

/// Prints `Handle: <token>` on stdout, for copy and paste or a wrapping script
#[derive(Debug, Default)]
pub struct StdoutPublisher;

impl HandlePublisher for StdoutPublisher {
    fn publish(&mut self, handle: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Handle: {}", handle)?;
        out.flush()
    }
}

/// Replaces a file with the handle on a single line
#[derive(Debug, Clone)]
pub struct FilePublisher {
    path: PathBuf,
}

impl FilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HandlePublisher for FilePublisher {
    fn publish(&mut self, handle: &str) -> io::Result<()> {
        write_atomic(&self.path, format!("{}\n", handle).as_bytes())?;
        info!("📝 Wrote handle to {}", self.path.display());
        Ok(())
    }
}

/// Keeps published handles in memory; clones share the same list
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    handles: Rc<RefCell<Vec<String>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handles(&self) -> Vec<String> {
        self.handles.borrow().clone()
    }

    pub fn last(&self) -> Option<String> {
        self.handles.borrow().last().cloned()
    }
}

impl HandlePublisher for MemoryPublisher {
    fn publish(&mut self, handle: &str) -> io::Result<()> {
        self.handles.borrow_mut().push(handle.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::read_handle_file;

    #[test]
    fn test_file_publisher_roundtrips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handle");
        let mut publisher = FilePublisher::new(&path);
        publisher.publish("first").unwrap();
        publisher.publish("abcXYZ123").unwrap();
        assert_eq!(read_handle_file(&path).unwrap(), "abcXYZ123");
    }

    #[test]
    fn test_memory_publisher_clones_share() {
        let publisher = MemoryPublisher::new();
        let mut writer = publisher.clone();
        writer.publish("one").unwrap();
        assert_eq!(publisher.handles(), vec!["one".to_string()]);
    }
}
