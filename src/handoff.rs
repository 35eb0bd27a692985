//! Renderer hand-off
//!
//! Once a window is configured, whatever draws into it (a video player, a GUI
//! toolkit) needs the native surface and its size, and must hear about every
//! later resize. The backend maps the [`ObjectId`] to its native proxy.

use crate::protocol::ObjectId;
use log::info;
use std::ffi::c_void;
use std::ptr::NonNull;

/// Raw `wl_display` pointer of the connection a surface lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDisplay(NonNull<c_void>);

impl NativeDisplay {
    /// `None` for a null pointer (a connection without libwayland behind it)
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Everything a renderer needs to draw into a configured surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    /// Connection the surface belongs to; `None` on the headless compositor
    pub display: Option<NativeDisplay>,
    pub surface: ObjectId,
    pub width: u32,
    pub height: u32,
}

/// Notified on the first configure and on every applied resize
pub trait ResizeListener {
    fn resized(&mut self, target: RenderTarget);
}

impl<F: FnMut(RenderTarget)> ResizeListener for F {
    fn resized(&mut self, target: RenderTarget) {
        self(target)
    }
}

/// Listener that only reports the new geometry
#[derive(Debug, Default)]
pub struct LogListener {
    label: String,
}

impl LogListener {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ResizeListener for LogListener {
    fn resized(&mut self, target: RenderTarget) {
        info!(
            "📐 {} surface {} is now {}x{}",
            self.label, target.surface, target.width, target.height
        );
    }
}
