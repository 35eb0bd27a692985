//! xdg-foreign handshake between two clients
//!
//! The exporting client turns one of its configured toplevels into an opaque
//! handle issued by the compositor and hands it to the other process through
//! some outside channel. The importing client turns the handle back into a
//! local object and makes the remote toplevel the parent of its own surface
//! before that surface is first committed.
//!
//! Handles are only valid while the exporting connection keeps the export
//! alive. A revoked handle reaches the importer as a `destroyed` event; the
//! importer then carries on unparented and never retries.

mod exporter;
mod importer;
mod publish;

pub use exporter::{ExportState, Exporter};
pub use importer::{ImportState, Importer};
pub use publish::{FilePublisher, HandlePublisher, MemoryPublisher, StdoutPublisher};

use crate::error::ForeignError;
use std::fs;
use std::path::Path;

/// Check a handle received from outside before sending it to the compositor
pub fn validate_handle(handle: &str) -> Result<String, ForeignError> {
    let trimmed = handle.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ForeignError::InvalidHandle(handle.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Read a handle written by [`FilePublisher`]
pub fn read_handle_file(path: &Path) -> Result<String, ForeignError> {
    let contents = fs::read_to_string(path).map_err(|source| ForeignError::HandleFile {
        path: path.to_path_buf(),
        source,
    })?;
    validate_handle(&contents)
}
