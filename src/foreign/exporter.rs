//! Exporting side of the handshake

use super::HandlePublisher;
use crate::error::ForeignError;
use crate::protocol::{Display, ObjectId};
use crate::window::Window;
use log::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    /// Export requested, waiting for the handle event
    Exporting,
    Exported(String),
    /// Export object destroyed; the handle is dead
    Revoked,
}

/// Owns the `zxdg_exported_v2` of one toplevel
pub struct Exporter {
    exporter: ObjectId,
    exported: Option<ObjectId>,
    state: ExportState,
    publishers: Vec<Box<dyn HandlePublisher>>,
}

impl Exporter {
    /// `exporter` is the bound `zxdg_exporter_v2` global
    pub fn new(exporter: ObjectId) -> Self {
        Self {
            exporter,
            exported: None,
            state: ExportState::Idle,
            publishers: Vec::new(),
        }
    }

    pub fn add_publisher(&mut self, publisher: Box<dyn HandlePublisher>) {
        self.publishers.push(publisher);
    }

    /// Request a handle for `window`. The window must have been configured and
    /// have committed a buffer.
    pub fn export(&mut self, display: &mut dyn Display, window: &Window) -> Result<(), ForeignError> {
        if self.state != ExportState::Idle {
            return Err(ForeignError::AlreadyExported);
        }
        if !window.is_configured() || !window.is_presented() {
            return Err(ForeignError::NotConfigured(window.surface()));
        }

        let exported = display.export_toplevel(self.exporter, window.surface())?;
        debug!("Exporting {} as {}", window.surface(), exported);
        self.exported = Some(exported);
        self.state = ExportState::Exporting;
        Ok(())
    }

    /// The compositor issued the handle. Returns false for an unrelated object.
    pub fn on_handle(&mut self, exported: ObjectId, handle: String) -> Result<bool, ForeignError> {
        if self.exported != Some(exported) {
            return Ok(false);
        }
        if let ExportState::Exported(previous) = &self.state {
            warn!("Handle changed from {} to {}", previous, handle);
        }
        info!("🔑 Exported handle {}", handle);

        let mut failure = None;
        for publisher in &mut self.publishers {
            if let Err(e) = publisher.publish(&handle) {
                warn!("Failed to publish handle: {}", e);
                failure.get_or_insert(e);
            }
        }
        self.state = ExportState::Exported(handle);

        match failure {
            Some(e) => Err(ForeignError::Publish(e)),
            None => Ok(true),
        }
    }

    pub fn state(&self) -> &ExportState {
        &self.state
    }

    pub fn handle(&self) -> Option<&str> {
        match &self.state {
            ExportState::Exported(handle) => Some(handle),
            _ => None,
        }
    }

    /// Destroy the export object, revoking the handle
    pub fn destroy(&mut self, display: &mut dyn Display) {
        if let Some(exported) = self.exported.take() {
            debug!("Revoking export {}", exported);
            display.destroy(exported);
            self.state = ExportState::Revoked;
        }
    }
}
