//! Transport seam between the client state machines and a display server
//!
//! The state machines in this crate never touch a socket. They issue typed
//! requests through [`Display`] and consume typed [`Event`]s that an
//! [`EventSource`] delivers in batches, one batch per blocking dispatch.
//!
//! Two backends implement the seam:
//!
//! - [`crate::wayland::WaylandClient`]: a real `wayland-client` connection
//! - [`crate::headless::HeadlessDisplay`]: an in-process simulated compositor
//!
//! # Handler routing
//!
//! Incoming events are grouped by category and routed by [`route`] to the
//! matching handler trait. The application state implements all of them:
//!
//! ```text
//! EventSource::dispatch ──► Vec<Event> ──► route() ──┬─► ConfigureHandler
//!                                                    ├─► SeatHandler
//!                                                    ├─► InputHandler
//!                                                    ├─► FrameHandler
//!                                                    ├─► ForeignHandler
//!                                                    └─► RegistryHandler
//! ```

use crate::error::{TetherError, TransportError};
use crate::handoff::NativeDisplay;
use std::fmt;
use std::os::fd::BorrowedFd;

/// Crate-local name of a protocol object created through a [`Display`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A global advertised by the server in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

impl Global {
    pub fn new(name: u32, interface: impl Into<String>, version: u32) -> Self {
        Self {
            name,
            interface: interface.into(),
            version,
        }
    }
}

/// Layout of one shm buffer carved out of a pool at offset 0.
/// The pixel format is always ARGB8888.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub pool_size: i32,
}

/// Outbound requests.
///
/// Every method maps to one protocol request (or, for [`Display::create_buffer`],
/// the create-pool / create-buffer / destroy-pool triple). Creation requests
/// return the crate-local id of the new object.
pub trait Display {
    /// Bind an advertised global at `version`
    fn bind(&mut self, global: &Global, version: u32) -> Result<ObjectId, TransportError>;

    fn create_surface(&mut self, compositor: ObjectId) -> Result<ObjectId, TransportError>;

    fn get_xdg_surface(
        &mut self,
        wm_base: ObjectId,
        surface: ObjectId,
    ) -> Result<ObjectId, TransportError>;

    fn get_toplevel(&mut self, xdg_surface: ObjectId) -> Result<ObjectId, TransportError>;

    /// Native `wl_display` handed to external renderers, if there is one
    fn native_display(&self) -> Option<NativeDisplay> {
        None
    }

    fn set_title(&mut self, toplevel: ObjectId, title: &str) -> Result<(), TransportError>;

    fn set_app_id(&mut self, toplevel: ObjectId, app_id: &str) -> Result<(), TransportError>;

    /// xdg_toplevel.set_parent within one client
    fn set_parent(
        &mut self,
        toplevel: ObjectId,
        parent: Option<ObjectId>,
    ) -> Result<(), TransportError>;

    fn ack_configure(&mut self, xdg_surface: ObjectId, serial: u32) -> Result<(), TransportError>;

    /// Wrap `fd` as a pool, create one buffer at offset 0 and destroy the pool
    fn create_buffer(
        &mut self,
        shm: ObjectId,
        fd: BorrowedFd<'_>,
        spec: BufferSpec,
    ) -> Result<ObjectId, TransportError>;

    fn attach(&mut self, surface: ObjectId, buffer: Option<ObjectId>) -> Result<(), TransportError>;

    fn damage_buffer(
        &mut self,
        surface: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Result<(), TransportError>;

    fn commit(&mut self, surface: ObjectId) -> Result<(), TransportError>;

    /// Request a one-shot frame-done callback for the next commit
    fn frame(&mut self, surface: ObjectId) -> Result<ObjectId, TransportError>;

    fn export_toplevel(
        &mut self,
        exporter: ObjectId,
        surface: ObjectId,
    ) -> Result<ObjectId, TransportError>;

    fn import_toplevel(&mut self, importer: ObjectId, handle: &str)
        -> Result<ObjectId, TransportError>;

    fn set_parent_of(&mut self, imported: ObjectId, surface: ObjectId)
        -> Result<(), TransportError>;

    fn get_keyboard(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError>;

    fn get_pointer(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError>;

    /// Destroy (or release, or forget) an object. Unknown ids are ignored.
    fn destroy(&mut self, object: ObjectId);
}

/// Inbound events, already decoded and tagged with crate-local ids
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    GlobalRemoved { name: u32 },
    SurfaceConfigure { xdg_surface: ObjectId, serial: u32 },
    /// Size proposal; non-positive dimensions mean "client chooses"
    ToplevelConfigure { toplevel: ObjectId, width: i32, height: i32 },
    ToplevelClose { toplevel: ObjectId },
    FrameDone { callback: ObjectId, time: u32 },
    BufferReleased { buffer: ObjectId },
    SeatCapabilities { seat: ObjectId, keyboard: bool, pointer: bool },
    Key { key: u32, pressed: bool },
    PointerButton { button: u32, pressed: bool },
    PointerMotion { x: f64, y: f64 },
    ExportedHandle { exported: ObjectId, handle: String },
    ImportedDestroyed { imported: ObjectId },
}

/// Source of event batches
pub trait EventSource {
    /// Block until events are available and append the batch to `events`.
    /// Returns the number of events appended.
    fn dispatch(&mut self, events: &mut Vec<Event>) -> Result<usize, TransportError>;

    /// Send buffered requests to the server
    fn flush(&mut self) -> Result<(), TransportError>;
}

/// A full duplex display connection
pub trait Connection: Display + EventSource {
    /// View the connection as the request half only
    fn as_display(&mut self) -> &mut dyn Display;
}

impl<T: Display + EventSource> Connection for T {
    fn as_display(&mut self) -> &mut dyn Display {
        self
    }
}

pub trait ConfigureHandler {
    fn surface_configure(
        &mut self,
        display: &mut dyn Display,
        xdg_surface: ObjectId,
        serial: u32,
    ) -> Result<(), TetherError>;

    fn toplevel_configure(&mut self, toplevel: ObjectId, width: i32, height: i32);

    fn toplevel_close(&mut self, toplevel: ObjectId);
}

pub trait SeatHandler {
    fn capabilities(
        &mut self,
        display: &mut dyn Display,
        seat: ObjectId,
        keyboard: bool,
        pointer: bool,
    ) -> Result<(), TetherError>;
}

pub trait InputHandler {
    fn key(&mut self, key: u32, pressed: bool);
    fn button(&mut self, button: u32, pressed: bool);
    fn motion(&mut self, x: f64, y: f64);
}

pub trait FrameHandler {
    fn frame_done(
        &mut self,
        display: &mut dyn Display,
        callback: ObjectId,
        time: u32,
    ) -> Result<(), TetherError>;

    fn buffer_released(&mut self, buffer: ObjectId);
}

pub trait ForeignHandler {
    fn handle_exported(&mut self, exported: ObjectId, handle: String) -> Result<(), TetherError>;
    fn imported_destroyed(&mut self, display: &mut dyn Display, imported: ObjectId);
}

pub trait RegistryHandler {
    fn global_removed(&mut self, name: u32);
}

/// Route one event to the handler for its category
pub fn route<H>(display: &mut dyn Display, handler: &mut H, event: Event) -> Result<(), TetherError>
where
    H: ConfigureHandler + SeatHandler + InputHandler + FrameHandler + ForeignHandler + RegistryHandler,
{
    match event {
        Event::GlobalRemoved { name } => handler.global_removed(name),
        Event::SurfaceConfigure { xdg_surface, serial } => {
            handler.surface_configure(display, xdg_surface, serial)?
        }
        Event::ToplevelConfigure {
            toplevel,
            width,
            height,
        } => handler.toplevel_configure(toplevel, width, height),
        Event::ToplevelClose { toplevel } => handler.toplevel_close(toplevel),
        Event::FrameDone { callback, time } => handler.frame_done(display, callback, time)?,
        Event::BufferReleased { buffer } => handler.buffer_released(buffer),
        Event::SeatCapabilities {
            seat,
            keyboard,
            pointer,
        } => handler.capabilities(display, seat, keyboard, pointer)?,
        Event::Key { key, pressed } => handler.key(key, pressed),
        Event::PointerButton { button, pressed } => handler.button(button, pressed),
        Event::PointerMotion { x, y } => handler.motion(x, y),
        Event::ExportedHandle { exported, handle } => handler.handle_exported(exported, handle)?,
        Event::ImportedDestroyed { imported } => handler.imported_destroyed(display, imported),
    }
    Ok(())
}
