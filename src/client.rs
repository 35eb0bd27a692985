//! Client core
//!
//! [`Client`] is the one application-state struct every event handler gets.
//! It owns the bound globals, the windows, the shared render state, the input
//! router, the xdg-foreign endpoints and the size channels, and it drives the
//! single-threaded loop: flush, one blocking dispatch, route the batch, then
//! the per-batch housekeeping (polling the size channel, redraws). A shutdown
//! request from a handler or a signal is observed after the current batch.

use crate::config::TetherConfig;
use crate::error::{StartupError, TetherError, TransportError};
use crate::foreign::{validate_handle, Exporter, HandlePublisher, Importer};
use crate::frame_pacing::FrameAction;
use crate::handoff::{RenderTarget, ResizeListener};
use crate::input::{InputAction, InputRouter};
use crate::protocol::{
    route, ConfigureHandler, Connection, Display, Event, FrameHandler, ForeignHandler, Global,
    InputHandler, ObjectId, RegistryHandler, SeatHandler,
};
use crate::registry::{GlobalRegistry, Interface};
use crate::render::{Fill, RenderState};
use crate::shm::ShmPool;
use crate::sync::{SharedSize, SizePublisher, SizeSource};
use crate::window::{ConfigureOutcome, Window, WindowSettings};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Parent color in `pair` mode
const PARENT_COLOR: u32 = 0xFF0000FF;
/// Child color in `pair` mode
const CHILD_COLOR: u32 = 0xFF00FF00;
/// Background of a size follower
const FOLLOWER_COLOR: u32 = 0xFF646464;

/// What this process does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Checkerboard window whose handle is exported
    Export,
    /// Window parented to the toplevel behind `handle`
    Import { handle: String },
    /// Parent and child toplevel in one process
    Pair,
    /// Publishes its size to a follower
    Lead,
    /// Resizes to whatever the leader publishes
    Follow,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Export => "export",
            Mode::Import { .. } => "import",
            Mode::Pair => "pair",
            Mode::Lead => "lead",
            Mode::Follow => "follow",
        }
    }
}

/// Cooperative shutdown request, shared with signal handlers
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Application state of one display connection
pub struct Client {
    mode: Mode,
    config: TetherConfig,
    registry: GlobalRegistry,
    pool: Option<ShmPool>,
    windows: Vec<Window>,
    render: RenderState,
    input: InputRouter,
    exporter: Option<Exporter>,
    importer: Option<Importer>,
    publishers: Vec<Box<dyn HandlePublisher>>,
    listeners: Vec<Box<dyn ResizeListener>>,
    size_publisher: Option<Box<dyn SizePublisher>>,
    size_source: Option<Box<dyn SizeSource>>,
    /// Size received from the leader, not applied yet
    pending_follow: Option<SharedSize>,
    shutdown: ShutdownFlag,
    frame_limit: Option<u64>,
    /// Colors changed and frame pacing is off
    dirty: bool,
    torn_down: bool,
}

impl Client {
    pub fn new(mode: Mode, config: TetherConfig, shutdown: ShutdownFlag) -> Self {
        let render = RenderState::from_config(&config.render);
        Self {
            mode,
            config,
            registry: GlobalRegistry::new(),
            pool: None,
            windows: Vec::new(),
            render,
            input: InputRouter::new(),
            exporter: None,
            importer: None,
            publishers: Vec::new(),
            listeners: Vec::new(),
            size_publisher: None,
            size_source: None,
            pending_follow: None,
            shutdown,
            frame_limit: None,
            dirty: false,
            torn_down: false,
        }
    }

    /// Stop after `frames` paced redraws
    pub fn with_frame_limit(mut self, frames: Option<u64>) -> Self {
        self.frame_limit = frames;
        self
    }

    /// Where an exported handle is sent
    pub fn add_handle_publisher(&mut self, publisher: Box<dyn HandlePublisher>) {
        self.publishers.push(publisher);
    }

    /// Renderer notified about the first window's geometry
    pub fn add_resize_listener(&mut self, listener: Box<dyn ResizeListener>) {
        match self.windows.first_mut() {
            Some(window) => window.add_resize_listener(listener),
            None => self.listeners.push(listener),
        }
    }

    pub fn set_size_publisher(&mut self, publisher: Box<dyn SizePublisher>) {
        self.size_publisher = Some(publisher);
    }

    pub fn set_size_source(&mut self, source: Box<dyn SizeSource>) {
        self.size_source = Some(source);
    }

    /// Bind globals, create the windows and make their initial commits
    pub fn bootstrap(&mut self, display: &mut dyn Display, globals: &[Global]) -> Result<(), TetherError> {
        info!("🏗️ Starting {} client", self.mode.name());

        // A malformed handle is a usage error, whatever the compositor supports
        if let Mode::Import { handle } = &self.mode {
            validate_handle(handle)?;
        }

        self.registry.bind_all(display, globals)?;
        self.registry.require()?;
        let compositor = self.registry.required(Interface::Compositor)?;
        let wm_base = self.registry.required(Interface::WmBase)?;
        self.pool = Some(ShmPool::new(self.registry.required(Interface::Shm)?));

        for settings in self.window_settings() {
            let window = Window::create(display, compositor, wm_base, settings)?;
            self.windows.push(window);
        }
        if let Some(window) = self.windows.first_mut() {
            for listener in self.listeners.drain(..) {
                window.add_resize_listener(listener);
            }
        }

        match &self.mode {
            Mode::Export => match self.registry.get(Interface::Exporter) {
                Some(id) => {
                    let mut exporter = Exporter::new(id);
                    for publisher in self.publishers.drain(..) {
                        exporter.add_publisher(publisher);
                    }
                    self.exporter = Some(exporter);
                }
                None => warn!("Compositor lacks zxdg_exporter_v2, nothing will be exported"),
            },
            Mode::Import { handle } => match self.registry.get(Interface::Importer) {
                Some(id) => {
                    let mut importer = Importer::new(id, handle)?;
                    if let Some(window) = self.windows.first() {
                        importer.link(display, window)?;
                    }
                    self.importer = Some(importer);
                }
                None => warn!("Compositor lacks zxdg_importer_v2, running unparented"),
            },
            Mode::Pair => {
                if let [parent, child] = self.windows.as_mut_slice() {
                    child.set_parent(display, Some(&*parent))?;
                }
            }
            Mode::Lead if self.size_publisher.is_none() => {
                warn!("No size channel configured, the size will not be published")
            }
            Mode::Follow if self.size_source.is_none() => {
                warn!("No size channel configured, nothing to follow")
            }
            Mode::Lead | Mode::Follow => {}
        }

        for window in &mut self.windows {
            window.commit_initial(display)?;
        }
        if let Some(importer) = self.importer.as_mut() {
            importer.on_first_commit();
        }

        info!("✅ {} window(s) created, waiting for configure", self.windows.len());
        Ok(())
    }

    fn window_settings(&self) -> Vec<WindowSettings> {
        let render = &self.config.render;
        let (title, app_id, width, height, fill) = match &self.mode {
            Mode::Export => (
                "tether exporter",
                "exporter",
                500,
                500,
                Fill::Checkerboard {
                    tile: render.tile_size,
                },
            ),
            Mode::Import { .. } => ("tether importer", "importer", 400, 400, Fill::Solid(render.fill_color)),
            Mode::Pair => ("Parent", "parent", 400, 400, Fill::Solid(PARENT_COLOR)),
            Mode::Lead => ("Controller Window", "controller", 400, 400, Fill::Solid(render.fill_color)),
            Mode::Follow => ("Follower Window", "follower", 400, 400, Fill::Solid(FOLLOWER_COLOR)),
        };

        let window = &self.config.window;
        let primary = WindowSettings::new(
            window.title.as_deref().unwrap_or(title),
            window.app_id.as_deref().unwrap_or(app_id),
            window.width.unwrap_or(width),
            window.height.unwrap_or(height),
        )
        .with_fill(fill)
        .with_pacing(render.frame_pacing);

        if self.mode != Mode::Pair {
            return vec![primary];
        }
        let child = WindowSettings::new(
            "Child",
            "child",
            (primary.width / 2).max(1),
            (primary.height / 2).max(1),
        )
        .with_fill(Fill::Solid(CHILD_COLOR))
        .with_pacing(render.frame_pacing);
        vec![primary, child]
    }

    /// Route one event to its handler
    pub fn handle_event(&mut self, display: &mut dyn Display, event: Event) -> Result<(), TetherError> {
        route(display, self, event)
    }

    /// Flush, block for one batch of events and handle it. Returns the number
    /// of events handled.
    pub fn pump(&mut self, conn: &mut dyn Connection) -> Result<usize, TetherError> {
        conn.flush()?;
        let mut events = Vec::new();
        let count = conn.dispatch(&mut events)?;
        for event in events {
            match self.handle_event(conn.as_display(), event) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("{}", e),
                Ok(()) => {}
            }
        }
        self.after_batch(conn.as_display())?;
        Ok(count)
    }

    /// Loop until shutdown, then tear down. Fatal errors end the loop but
    /// still go through teardown.
    pub fn run(&mut self, conn: &mut dyn Connection) -> Result<(), TetherError> {
        info!("🎬 Entering event loop");
        let result = loop {
            if self.shutdown.is_requested() {
                info!("🛑 Shutdown requested");
                break Ok(());
            }
            match self.pump(conn) {
                Ok(_) => {}
                Err(TetherError::Transport(TransportError::Drained)) => {
                    info!("📭 Event source drained");
                    break Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("❌ {}", e);
                    break Err(e);
                }
                Err(e) => warn!("{}", e),
            }
        };

        self.teardown(conn.as_display());
        if let Err(e) = conn.flush() {
            debug!("Final flush failed: {}", e);
        }
        result
    }

    /// Release every protocol object in dependency order. Runs once.
    pub fn teardown(&mut self, display: &mut dyn Display) {
        if self.torn_down {
            return;
        }
        info!("🔽 Tearing down...");
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.destroy(display);
        }
        if let Some(importer) = self.importer.as_mut() {
            importer.destroy(display);
        }
        // Children before parents
        while let Some(window) = self.windows.pop() {
            window.destroy(display);
        }
        self.input.destroy(display);
        self.registry.destroy(display);
        self.torn_down = true;
        info!("✅ Teardown complete");
    }

    fn after_batch(&mut self, display: &mut dyn Display) -> Result<(), TetherError> {
        if let Some(source) = self.size_source.as_mut() {
            match source.poll() {
                Ok(Some(size)) => {
                    debug!("Leader size {}x{}", size.width, size.height);
                    self.pending_follow = Some(size);
                }
                Ok(None) => {}
                Err(e) => warn!("Size channel: {}", e),
            }
        }
        self.apply_follow(display)?;

        if let Some(publisher) = self.size_publisher.as_mut() {
            if let Err(e) = publisher.retry() {
                warn!("Size channel: {}", e);
            }
        }

        if std::mem::take(&mut self.dirty) {
            for window in self.windows.iter_mut().filter(|w| w.is_configured()) {
                window.redraw(display, &self.render)?;
            }
        }
        Ok(())
    }

    /// Resize to the leader's size. The size stays pending until a buffer of
    /// that size is actually attached, so a failed allocation is retried on the
    /// next batch even though the channel will not report the size again.
    fn apply_follow(&mut self, display: &mut dyn Display) -> Result<(), TetherError> {
        let Some(size) = self.pending_follow else {
            return Ok(());
        };
        let (Some(pool), Some(window)) = (self.pool.as_ref(), self.windows.first_mut()) else {
            return Ok(());
        };
        if !window.is_configured() {
            return Ok(());
        }
        if window.size() == (size.width, size.height) {
            self.pending_follow = None;
            return Ok(());
        }
        if window.resize_to(display, pool, &self.render, size.width, size.height)? {
            info!("↔️ Following leader to {}x{}", size.width, size.height);
            self.pending_follow = None;
        } else {
            debug!("Still at {:?}, retrying {}x{} next batch", window.size(), size.width, size.height);
        }
        Ok(())
    }

    fn after_configure(&mut self, display: &mut dyn Display, index: usize) -> Result<(), TetherError> {
        let Some(window) = self.windows.get(index) else {
            return Ok(());
        };

        if let Some(exporter) = self.exporter.as_mut() {
            if index == 0 && *exporter.state() == crate::foreign::ExportState::Idle {
                exporter.export(display, window)?;
            }
        }

        if let Some(publisher) = self.size_publisher.as_mut() {
            let (width, height) = window.size();
            if let Err(e) = publisher.publish(SharedSize::new(width, height)) {
                warn!("Failed to publish size: {}", e);
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn window(&self, index: usize) -> Option<&Window> {
        self.windows.get(index)
    }

    pub fn registry(&self) -> &GlobalRegistry {
        &self.registry
    }

    pub fn render(&self) -> &RenderState {
        &self.render
    }

    pub fn input(&self) -> &InputRouter {
        &self.input
    }

    pub fn exporter(&self) -> Option<&Exporter> {
        self.exporter.as_ref()
    }

    pub fn importer(&self) -> Option<&Importer> {
        self.importer.as_ref()
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Allocator behind every window's buffers, once bootstrapped
    pub fn shm_pool(&self) -> Option<&ShmPool> {
        self.pool.as_ref()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Surface and size of the first window for an external renderer
    pub fn render_target(&self) -> Option<RenderTarget> {
        self.windows.first().and_then(Window::render_target)
    }
}

impl ConfigureHandler for Client {
    fn surface_configure(
        &mut self,
        display: &mut dyn Display,
        xdg_surface: ObjectId,
        serial: u32,
    ) -> Result<(), TetherError> {
        let Some(index) = self.windows.iter().position(|w| w.xdg_surface() == xdg_surface) else {
            debug!("Configure for unknown xdg_surface {}", xdg_surface);
            return Ok(());
        };
        let pool = self
            .pool
            .clone()
            .ok_or(StartupError::MissingGlobal { interface: "wl_shm" })?;

        let outcome = self.windows[index].on_surface_configure(display, &pool, &self.render, serial)?;
        if matches!(outcome, ConfigureOutcome::Mapped | ConfigureOutcome::Resized) {
            self.after_configure(display, index)?;
        }
        Ok(())
    }

    fn toplevel_configure(&mut self, toplevel: ObjectId, width: i32, height: i32) {
        if let Some(window) = self.windows.iter_mut().find(|w| w.toplevel() == toplevel) {
            window.on_toplevel_configure(width, height);
        }
    }

    fn toplevel_close(&mut self, toplevel: ObjectId) {
        if let Some(window) = self.windows.iter_mut().find(|w| w.toplevel() == toplevel) {
            window.on_close();
            self.shutdown.request();
        }
    }
}

impl SeatHandler for Client {
    fn capabilities(
        &mut self,
        display: &mut dyn Display,
        seat: ObjectId,
        keyboard: bool,
        pointer: bool,
    ) -> Result<(), TetherError> {
        self.input.on_capabilities(display, seat, keyboard, pointer)?;
        Ok(())
    }
}

impl InputHandler for Client {
    fn key(&mut self, key: u32, pressed: bool) {
        if let Some(InputAction::Quit) = self.input.on_key(key, pressed) {
            self.shutdown.request();
        }
    }

    fn button(&mut self, button: u32, pressed: bool) {
        if let Some(InputAction::SwapColors) = self.input.on_button(button, pressed) {
            self.render.swap_colors();
            self.dirty = !self.config.render.frame_pacing;
        }
    }

    fn motion(&mut self, x: f64, y: f64) {
        self.input.on_motion(x, y);
    }
}

impl FrameHandler for Client {
    fn frame_done(
        &mut self,
        display: &mut dyn Display,
        callback: ObjectId,
        time: u32,
    ) -> Result<(), TetherError> {
        let shutting_down = self.shutdown.is_requested();
        for window in &mut self.windows {
            match window.on_frame_done(display, &self.render, callback, time, shutting_down)? {
                FrameAction::Ignored => continue,
                FrameAction::Stopped => break,
                FrameAction::Redraw => {
                    self.render.advance_frame();
                    if let Some(limit) = self.frame_limit {
                        if self.render.frames >= limit {
                            info!("🏁 Reached {} frames", limit);
                            self.shutdown.request();
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn buffer_released(&mut self, buffer: ObjectId) {
        if !self.windows.iter_mut().any(|w| w.on_buffer_released(buffer)) {
            debug!("Release for unknown buffer {}", buffer);
        }
    }
}

impl ForeignHandler for Client {
    fn handle_exported(&mut self, exported: ObjectId, handle: String) -> Result<(), TetherError> {
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.on_handle(exported, handle)?;
        }
        Ok(())
    }

    fn imported_destroyed(&mut self, display: &mut dyn Display, imported: ObjectId) {
        if let Some(importer) = self.importer.as_mut() {
            importer.on_destroyed(display, imported);
        }
    }
}

impl RegistryHandler for Client {
    fn global_removed(&mut self, name: u32) {
        self.registry.global_removed(name);
    }
}
