//! Importing side of the handshake

use super::validate_handle;
use crate::error::ForeignError;
use crate::protocol::{Display, ObjectId};
use crate::window::Window;
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Unlinked,
    /// Imported and parent set, own surface not committed yet
    Linking,
    Linked,
    /// The compositor destroyed the import; the window runs unparented
    Revoked,
}

/// Owns the `zxdg_imported_v2` for one handle
#[derive(Debug)]
pub struct Importer {
    importer: ObjectId,
    handle: String,
    imported: Option<ObjectId>,
    state: ImportState,
}

impl Importer {
    /// `importer` is the bound `zxdg_importer_v2` global. Malformed handles are
    /// rejected here, before anything reaches the compositor.
    pub fn new(importer: ObjectId, handle: &str) -> Result<Self, ForeignError> {
        Ok(Self {
            importer,
            handle: validate_handle(handle)?,
            imported: None,
            state: ImportState::Unlinked,
        })
    }

    /// Import the handle and parent `window` to it. Must happen before the
    /// window's first commit.
    pub fn link(&mut self, display: &mut dyn Display, window: &Window) -> Result<(), ForeignError> {
        if self.state != ImportState::Unlinked {
            return Err(ForeignError::AlreadyImported);
        }
        if window.has_committed() {
            return Err(ForeignError::AlreadyCommitted(window.surface()));
        }

        let imported = display.import_toplevel(self.importer, &self.handle)?;
        self.imported = Some(imported);
        display.set_parent_of(imported, window.surface())?;
        self.state = ImportState::Linking;
        debug!("Imported {} as {}, parent of {}", self.handle, imported, window.surface());
        Ok(())
    }

    /// The window made its first commit; the relationship is in effect
    pub fn on_first_commit(&mut self) {
        if self.state == ImportState::Linking {
            info!("🔗 Linked to exported toplevel {}", self.handle);
            self.state = ImportState::Linked;
        }
    }

    /// `zxdg_imported_v2.destroyed`: the handle was invalid or got revoked.
    /// Returns false for an unrelated object.
    pub fn on_destroyed(&mut self, display: &mut dyn Display, imported: ObjectId) -> bool {
        if self.imported != Some(imported) {
            return false;
        }
        warn!(
            "Handle {} is no longer valid, continuing without a parent",
            self.handle
        );
        self.imported = None;
        display.destroy(imported);
        self.state = ImportState::Revoked;
        true
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn destroy(&mut self, display: &mut dyn Display) {
        if let Some(imported) = self.imported.take() {
            display.destroy(imported);
            self.state = ImportState::Unlinked;
        }
    }
}
