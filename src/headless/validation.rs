//! xdg-shell configure sequence validation
//!
//! Tracks the state machine of every xdg_surface a headless client creates
//! and flags sequences a real compositor would answer with a protocol error.
//!
//! # Configure Sequence
//!
//! - The compositor sends configure with serial N
//! - The client must ack_configure N (or a later serial) before committing a buffer
//! - An ack must match a serial that was actually sent

use crate::protocol::ObjectId;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Maximum number of unacknowledged configures tracked per surface
const MAX_PENDING_CONFIGURES: usize = 32;

/// Surface state in the xdg-shell state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdgSurfaceState {
    /// xdg_surface created, no configure sent yet
    Created,
    /// Configure sent, awaiting ack
    WaitingForAck,
    /// Configure acknowledged, no buffer committed yet
    Configured,
    /// A buffer has been committed after an ack
    Mapped,
    /// A null buffer was committed after mapping
    Unmapped,
}

#[derive(Debug, Clone, Copy)]
struct PendingConfigure {
    serial: u32,
    acknowledged: bool,
}

/// Validation state for one xdg_surface
#[derive(Debug, Clone)]
pub struct XdgSurfaceValidation {
    pub xdg_surface: ObjectId,
    pub state: XdgSurfaceState,
    pub has_role: bool,
    pending_configures: VecDeque<PendingConfigure>,
    pub last_acked_serial: Option<u32>,
    pub commit_count: u64,
    pub ever_mapped: bool,
}

/// xdg-shell protocol violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("xdg_surface {0} already has a role")]
    RoleAlreadyAssigned(ObjectId),

    #[error("xdg_surface {xdg_surface} acked unknown serial {serial} (pending: {pending:?})")]
    InvalidAckSerial {
        xdg_surface: ObjectId,
        serial: u32,
        pending: Vec<u32>,
    },

    #[error("xdg_surface {xdg_surface} committed a buffer before ack_configure (commit #{commit})")]
    BufferBeforeAck { xdg_surface: ObjectId, commit: u64 },

    #[error("unknown xdg_surface {0}")]
    UnknownSurface(ObjectId),
}

impl XdgSurfaceValidation {
    pub fn new(xdg_surface: ObjectId) -> Self {
        Self {
            xdg_surface,
            state: XdgSurfaceState::Created,
            has_role: false,
            pending_configures: VecDeque::new(),
            last_acked_serial: None,
            commit_count: 0,
            ever_mapped: false,
        }
    }

    pub fn assign_role(&mut self) -> Result<(), ProtocolError> {
        if self.has_role {
            return Err(ProtocolError::RoleAlreadyAssigned(self.xdg_surface));
        }
        self.has_role = true;
        Ok(())
    }

    pub fn add_configure(&mut self, serial: u32) {
        if self.pending_configures.len() >= MAX_PENDING_CONFIGURES {
            warn!(
                "xdg_surface {} has {} pending configures, dropping oldest",
                self.xdg_surface,
                self.pending_configures.len()
            );
            self.pending_configures.pop_front();
        }
        self.pending_configures.push_back(PendingConfigure {
            serial,
            acknowledged: false,
        });
        if self.state == XdgSurfaceState::Created {
            self.transition_state(XdgSurfaceState::WaitingForAck);
        }
    }

    pub fn ack_configure(&mut self, serial: u32) -> Result<(), ProtocolError> {
        let Some(index) = self.pending_configures.iter().position(|c| c.serial == serial) else {
            return Err(ProtocolError::InvalidAckSerial {
                xdg_surface: self.xdg_surface,
                serial,
                pending: self.pending_configures.iter().map(|c| c.serial).collect(),
            });
        };

        // Acking a serial implicitly acks everything older
        for configure in self.pending_configures.iter_mut().take(index + 1) {
            configure.acknowledged = true;
        }
        self.pending_configures.drain(..index);
        self.last_acked_serial = Some(serial);

        if self.state == XdgSurfaceState::WaitingForAck {
            self.transition_state(XdgSurfaceState::Configured);
        }
        Ok(())
    }

    pub fn validate_commit(&mut self, has_buffer: bool) -> Result<(), ProtocolError> {
        self.commit_count += 1;

        if has_buffer && self.last_acked_serial.is_none() {
            return Err(ProtocolError::BufferBeforeAck {
                xdg_surface: self.xdg_surface,
                commit: self.commit_count,
            });
        }

        match (has_buffer, self.state) {
            (true, XdgSurfaceState::Configured | XdgSurfaceState::Unmapped) => {
                self.transition_state(XdgSurfaceState::Mapped);
                self.ever_mapped = true;
            }
            (false, XdgSurfaceState::Mapped) => self.transition_state(XdgSurfaceState::Unmapped),
            _ => {}
        }
        Ok(())
    }

    fn transition_state(&mut self, new_state: XdgSurfaceState) {
        if self.state != new_state {
            debug!(
                "xdg_surface {} state transition: {:?} -> {:?}",
                self.xdg_surface, self.state, new_state
            );
            self.state = new_state;
        }
    }
}

/// Validator for every xdg_surface of one client
#[derive(Debug, Default)]
pub struct XdgShellValidator {
    surfaces: HashMap<ObjectId, XdgSurfaceValidation>,
    error_count: u64,
}

impl XdgShellValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_surface(&mut self, xdg_surface: ObjectId) {
        self.surfaces
            .insert(xdg_surface, XdgSurfaceValidation::new(xdg_surface));
    }

    pub fn unregister_surface(&mut self, xdg_surface: ObjectId) {
        self.surfaces.remove(&xdg_surface);
    }

    pub fn assign_role(&mut self, xdg_surface: ObjectId) -> Result<(), ProtocolError> {
        let result = self.surface_mut(xdg_surface)?.assign_role();
        self.count(result)
    }

    pub fn add_configure(&mut self, xdg_surface: ObjectId, serial: u32) -> Result<(), ProtocolError> {
        self.surface_mut(xdg_surface)?.add_configure(serial);
        Ok(())
    }

    pub fn ack_configure(&mut self, xdg_surface: ObjectId, serial: u32) -> Result<(), ProtocolError> {
        let result = self.surface_mut(xdg_surface)?.ack_configure(serial);
        self.count(result)
    }

    pub fn validate_commit(&mut self, xdg_surface: ObjectId, has_buffer: bool) -> Result<(), ProtocolError> {
        let result = self.surface_mut(xdg_surface)?.validate_commit(has_buffer);
        self.count(result)
    }

    pub fn get_surface_state(&self, xdg_surface: ObjectId) -> Option<&XdgSurfaceValidation> {
        self.surfaces.get(&xdg_surface)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    fn surface_mut(&mut self, xdg_surface: ObjectId) -> Result<&mut XdgSurfaceValidation, ProtocolError> {
        match self.surfaces.get_mut(&xdg_surface) {
            Some(surface) => Ok(surface),
            None => {
                self.error_count += 1;
                Err(ProtocolError::UnknownSurface(xdg_surface))
            }
        }
    }

    fn count(&mut self, result: Result<(), ProtocolError>) -> Result<(), ProtocolError> {
        if result.is_err() {
            self.error_count += 1;
        }
        result
    }
}
