//! One toplevel window and its surface configure state machine
//!
//! ```text
//!  Created ──get_toplevel──► AwaitingFirstConfigure ──configure──► Configured
//!                                      │                              │  ▲
//!                                      │                              └──┘ reconfigure
//!                                      └──────────── close ──────────► Closing
//! ```
//!
//! Every `xdg_surface.configure` is acknowledged with its exact serial before
//! anything else happens. The first one allocates the initial buffer; later
//! ones either resize (allocate, paint, attach, damage, commit, then release
//! the old buffer) or are answered with a plain commit when the size did not
//! change. Exactly one buffer belongs to a configured window at any time.

use crate::error::{AllocError, ForeignError, StartupError, TetherError, TransportError};
use crate::frame_pacing::{FrameAction, FramePacer, FrameStats};
use crate::handoff::{NativeDisplay, RenderTarget, ResizeListener};
use crate::protocol::{Display, ObjectId};
use crate::render::{Fill, RenderState};
use crate::shm::{PixelBuffer, ShmPool};
use log::{debug, info, trace, warn};

/// Lifecycle of a window's surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    /// Surface exists, no role yet
    Created,
    /// Toplevel role requested, no configure acknowledged yet
    AwaitingFirstConfigure,
    Configured,
    /// Close requested; the window waits for teardown
    Closing,
}

/// How a window looks before the compositor has a say
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSettings {
    pub title: String,
    pub app_id: String,
    /// Size used when the first configure leaves the choice to the client
    pub width: u32,
    pub height: u32,
    pub fill: Fill,
    /// Redraw on every frame-done callback
    pub pacing: bool,
}

impl WindowSettings {
    pub fn new(title: impl Into<String>, app_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            title: title.into(),
            app_id: app_id.into(),
            width,
            height,
            fill: Fill::Solid(0xFFFFFFFF),
            pacing: true,
        }
    }

    pub fn with_fill(mut self, fill: Fill) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_pacing(mut self, pacing: bool) -> Self {
        self.pacing = pacing;
        self
    }
}

/// What a surface configure changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// First configure: the initial buffer is attached
    Mapped,
    Resized,
    /// Acknowledged and committed without reallocating
    Unchanged,
    /// Arrived while closing; acknowledged only
    Ignored,
}

/// A toplevel window
pub struct Window {
    settings: WindowSettings,
    native_display: Option<NativeDisplay>,
    surface: ObjectId,
    xdg_surface: ObjectId,
    toplevel: ObjectId,
    state: SurfaceState,
    width: u32,
    height: u32,
    /// Size from the latest toplevel configure, applied on the surface configure
    pending_size: Option<(u32, u32)>,
    buffer: Option<PixelBuffer>,
    pacer: FramePacer,
    /// Any commit so far, with or without a buffer
    committed: bool,
    /// A buffer has been committed
    presented: bool,
    listeners: Vec<Box<dyn ResizeListener>>,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("title", &self.settings.title)
            .field("surface", &self.surface)
            .field("state", &self.state)
            .field("size", &(self.width, self.height))
            .field("buffer", &self.buffer.as_ref().map(|b| b.id()))
            .finish()
    }
}

impl Window {
    /// Create the surface and give it the toplevel role. Nothing is committed;
    /// parents must be set before [`Window::commit_initial`].
    pub fn create(
        display: &mut dyn Display,
        compositor: ObjectId,
        wm_base: ObjectId,
        settings: WindowSettings,
    ) -> Result<Self, TransportError> {
        let surface = display.create_surface(compositor)?;
        let mut window = Self {
            settings,
            native_display: display.native_display(),
            surface,
            xdg_surface: surface,
            toplevel: surface,
            state: SurfaceState::Created,
            width: 0,
            height: 0,
            pending_size: None,
            buffer: None,
            pacer: FramePacer::new(),
            committed: false,
            presented: false,
            listeners: Vec::new(),
        };

        window.xdg_surface = display.get_xdg_surface(wm_base, surface)?;
        window.toplevel = display.get_toplevel(window.xdg_surface)?;
        display.set_title(window.toplevel, &window.settings.title)?;
        display.set_app_id(window.toplevel, &window.settings.app_id)?;
        window.state = SurfaceState::AwaitingFirstConfigure;

        debug!(
            "Created window '{}' (surface {}, toplevel {})",
            window.settings.title, window.surface, window.toplevel
        );
        Ok(window)
    }

    /// Make `parent` this window's parent within the same client
    pub fn set_parent(
        &mut self,
        display: &mut dyn Display,
        parent: Option<&Window>,
    ) -> Result<(), ForeignError> {
        if self.committed {
            return Err(ForeignError::AlreadyCommitted(self.surface));
        }
        display.set_parent(self.toplevel, parent.map(|p| p.toplevel))?;
        Ok(())
    }

    /// The initial bufferless commit that asks the compositor for a configure
    pub fn commit_initial(&mut self, display: &mut dyn Display) -> Result<(), TransportError> {
        if self.committed {
            return Ok(());
        }
        display.commit(self.surface)?;
        self.committed = true;
        trace!("Initial commit on {}", self.surface);
        Ok(())
    }

    /// Remember the proposed size. Non-positive dimensions leave the choice to
    /// the client and are ignored.
    pub fn on_toplevel_configure(&mut self, width: i32, height: i32) {
        if width <= 0 || height <= 0 {
            trace!(
                "Ignoring {}x{} configure for {}",
                width,
                height,
                self.surface
            );
            return;
        }
        self.pending_size = Some((width as u32, height as u32));
    }

    /// Acknowledge `serial`, then map or resize
    pub fn on_surface_configure(
        &mut self,
        display: &mut dyn Display,
        pool: &ShmPool,
        render: &RenderState,
        serial: u32,
    ) -> Result<ConfigureOutcome, TetherError> {
        display.ack_configure(self.xdg_surface, serial)?;

        match self.state {
            SurfaceState::Closing => Ok(ConfigureOutcome::Ignored),
            SurfaceState::Created | SurfaceState::AwaitingFirstConfigure => {
                let (width, height) = self
                    .pending_size
                    .take()
                    .unwrap_or((self.settings.width, self.settings.height));
                let mut buffer = pool
                    .allocate(display, width, height, self.settings.fill.background(render))
                    .map_err(StartupError::FirstBuffer)?;
                self.settings.fill.paint(&mut buffer, render);
                self.attach_and_commit(display, &mut buffer)?;
                self.buffer = Some(buffer);
                self.width = width;
                self.height = height;
                self.state = SurfaceState::Configured;
                info!(
                    "🪟 '{}' configured at {}x{}",
                    self.settings.title, width, height
                );
                self.notify();
                Ok(ConfigureOutcome::Mapped)
            }
            SurfaceState::Configured => match self.pending_size.take() {
                Some((width, height)) if (width, height) != (self.width, self.height) => {
                    if self.resize_to(display, pool, render, width, height)? {
                        Ok(ConfigureOutcome::Resized)
                    } else {
                        display.commit(self.surface)?;
                        Ok(ConfigureOutcome::Unchanged)
                    }
                }
                _ => {
                    display.commit(self.surface)?;
                    Ok(ConfigureOutcome::Unchanged)
                }
            },
        }
    }

    /// Replace the buffer with a `width`×`height` one. Returns whether the
    /// size changed. Allocation failures keep the previous buffer.
    pub fn resize_to(
        &mut self,
        display: &mut dyn Display,
        pool: &ShmPool,
        render: &RenderState,
        width: u32,
        height: u32,
    ) -> Result<bool, TransportError> {
        if self.state != SurfaceState::Configured || (width, height) == (self.width, self.height) {
            return Ok(false);
        }

        let mut next = match pool.allocate(display, width, height, self.settings.fill.background(render)) {
            Ok(buffer) => buffer,
            Err(AllocError::Server(e)) => return Err(e),
            Err(e) => {
                warn!(
                    "Keeping {}x{} for '{}', resize to {}x{} failed: {}",
                    self.width, self.height, self.settings.title, width, height, e
                );
                return Ok(false);
            }
        };
        self.settings.fill.paint(&mut next, render);
        self.attach_and_commit(display, &mut next)?;

        if let Some(previous) = self.buffer.replace(next) {
            previous.release(display);
        }
        debug!(
            "Resized '{}' {}x{} -> {}x{}",
            self.settings.title, self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        self.notify();
        Ok(true)
    }

    /// Repaint and commit the current buffer. A buffer the compositor still
    /// holds is not rewritten; the commit still happens so pacing continues.
    pub fn redraw(&mut self, display: &mut dyn Display, render: &RenderState) -> Result<(), TransportError> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };
        let result = if buffer.is_busy() {
            trace!("Buffer {} still held by the compositor, skipping paint", buffer.id());
            self.pacing_commit(display)
        } else {
            self.settings.fill.paint(&mut buffer, render);
            self.attach_and_commit(display, &mut buffer)
        };
        self.buffer = Some(buffer);
        result
    }

    /// Handle a frame-done callback; redraws unless shutting down
    pub fn on_frame_done(
        &mut self,
        display: &mut dyn Display,
        render: &RenderState,
        callback: ObjectId,
        time: u32,
        shutting_down: bool,
    ) -> Result<FrameAction, TransportError> {
        let action = self.pacer.on_done(display, callback, time, shutting_down);
        if action == FrameAction::Redraw && self.state == SurfaceState::Configured {
            self.redraw(display, render)?;
        }
        Ok(action)
    }

    /// `wl_buffer.release` for one of this window's buffers
    pub fn on_buffer_released(&mut self, buffer: ObjectId) -> bool {
        match self.buffer.as_mut() {
            Some(current) if current.id() == buffer => {
                current.mark_released();
                true
            }
            _ => false,
        }
    }

    /// Close requested by the compositor; teardown does the rest
    pub fn on_close(&mut self) {
        if self.state != SurfaceState::Closing {
            info!("❎ '{}' close requested", self.settings.title);
            self.state = SurfaceState::Closing;
        }
    }

    /// Destroy role objects, then the surface, then the buffer
    pub fn destroy(mut self, display: &mut dyn Display) {
        self.pacer.cancel(display);
        display.destroy(self.toplevel);
        display.destroy(self.xdg_surface);
        display.destroy(self.surface);
        if let Some(buffer) = self.buffer.take() {
            buffer.release(display);
        }
        let stats = self.pacer.stats();
        if stats.total_frames > 0 {
            info!(
                "🎬 '{}': {} frames, avg interval {:.2}ms ({:.1} FPS)",
                self.settings.title,
                stats.total_frames,
                stats.avg_interval.as_secs_f64() * 1000.0,
                stats.current_fps
            );
        }
    }

    /// Listeners added after the first configure hear the current size at once
    pub fn add_resize_listener(&mut self, mut listener: Box<dyn ResizeListener>) {
        if let Some(target) = self.render_target() {
            listener.resized(target);
        }
        self.listeners.push(listener);
    }

    /// Surface and size for a renderer, once configured
    pub fn render_target(&self) -> Option<RenderTarget> {
        (self.state == SurfaceState::Configured).then(|| self.target())
    }

    pub fn surface(&self) -> ObjectId {
        self.surface
    }

    pub fn xdg_surface(&self) -> ObjectId {
        self.xdg_surface
    }

    pub fn toplevel(&self) -> ObjectId {
        self.toplevel
    }

    pub fn title(&self) -> &str {
        &self.settings.title
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.state == SurfaceState::Configured
    }

    /// Current size; (0, 0) before the first configure
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    pub fn has_committed(&self) -> bool {
        self.committed
    }

    /// Configured and at least one buffer committed
    pub fn is_presented(&self) -> bool {
        self.presented
    }

    pub fn frame_stats(&self) -> &FrameStats {
        self.pacer.stats()
    }

    fn attach_and_commit(
        &mut self,
        display: &mut dyn Display,
        buffer: &mut PixelBuffer,
    ) -> Result<(), TransportError> {
        display.attach(self.surface, Some(buffer.id()))?;
        display.damage_buffer(self.surface, 0, 0, buffer.width() as i32, buffer.height() as i32)?;
        self.pacing_commit(display)?;
        buffer.mark_attached();
        self.presented = true;
        Ok(())
    }

    fn pacing_commit(&mut self, display: &mut dyn Display) -> Result<(), TransportError> {
        if self.settings.pacing {
            self.pacer.arm(display, self.surface)?;
        }
        display.commit(self.surface)?;
        self.committed = true;
        Ok(())
    }

    fn target(&self) -> RenderTarget {
        RenderTarget {
            display: self.native_display,
            surface: self.surface,
            width: self.width,
            height: self.height,
        }
    }

    fn notify(&mut self) {
        let target = self.target();
        for listener in &mut self.listeners {
            listener.resized(target);
        }
    }
}
