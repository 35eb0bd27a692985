//! # tether
//!
//! Wayland client windows that parent each other, in one process or across
//! processes through xdg-foreign handles.
//!
//! ## Architecture
//!
//! - `protocol`: transport seam (typed requests, decoded events, handler routing)
//! - `wayland`: real backend on `wayland-client`
//! - `headless`: in-process simulated compositor for tests and `--headless`
//! - `registry`: global discovery and binding
//! - `window`: xdg_toplevel configure state machine
//! - `shm`: shared-memory pixel buffers
//! - `render`: fills painted into those buffers
//! - `frame_pacing`: one frame callback in flight per surface
//! - `foreign`: export/import handshake and handle distribution
//! - `input`: seat capability tracking and key/button routing
//! - `sync`: size channels between a leader and a follower process
//! - `handoff`: surface/size hand-off to external renderers
//! - `client`: the application state that ties it all together
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tether::{Client, Mode, ShutdownFlag, TetherConfig, WaylandClient};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut conn = WaylandClient::connect()?;
//!     let globals = conn.globals();
//!     let mut client = Client::new(Mode::Pair, TetherConfig::default(), ShutdownFlag::new());
//!     client.bootstrap(&mut conn, &globals)?;
//!     client.run(&mut conn)?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod foreign;
pub mod frame_pacing;
pub mod handoff;
pub mod headless;
pub mod input;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod shm;
pub mod sync;
pub mod wayland;
pub mod window;

// Re-export main types for easy access
pub use client::{Client, Mode, ShutdownFlag};
pub use config::{SyncTransport, TetherConfig};
pub use error::{AllocError, ForeignError, StartupError, SyncError, TetherError, TransportError};
pub use handoff::{NativeDisplay, RenderTarget, ResizeListener};
pub use headless::{HeadlessDisplay, HeadlessServer};
pub use protocol::{Connection, Display, Event, EventSource, Global, ObjectId};
pub use wayland::WaylandClient;
pub use window::Window;
