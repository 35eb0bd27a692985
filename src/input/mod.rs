//! Seat input routing
//!
//! Keyboard and pointer objects follow the seat's capabilities: created when a
//! capability appears, destroyed when it goes away, never duplicated. Key and
//! button presses turn into [`InputAction`]s for the client; everything else is
//! received and dropped.

use crate::error::TransportError;
use crate::protocol::{Display, ObjectId};
use log::{debug, info, trace};

/// Linux evdev code of the escape key
pub const KEY_ESC: u32 = 1;

/// What the client should do in response to input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Exchange the two fill colors
    SwapColors,
    Quit,
}

/// Keyboard and pointer of one seat
#[derive(Debug, Default)]
pub struct InputRouter {
    seat: Option<ObjectId>,
    keyboard: Option<ObjectId>,
    pointer: Option<ObjectId>,
    pointer_position: (f64, f64),
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `wl_seat.capabilities` event
    pub fn on_capabilities(
        &mut self,
        display: &mut dyn Display,
        seat: ObjectId,
        keyboard: bool,
        pointer: bool,
    ) -> Result<(), TransportError> {
        self.seat = Some(seat);

        match (keyboard, self.keyboard) {
            (true, None) => {
                let id = display.get_keyboard(seat)?;
                debug!("⌨️ Keyboard {} available", id);
                self.keyboard = Some(id);
            }
            (false, Some(id)) => {
                debug!("Keyboard {} gone", id);
                display.destroy(id);
                self.keyboard = None;
            }
            _ => {}
        }

        match (pointer, self.pointer) {
            (true, None) => {
                let id = display.get_pointer(seat)?;
                debug!("🖱️ Pointer {} available", id);
                self.pointer = Some(id);
            }
            (false, Some(id)) => {
                debug!("Pointer {} gone", id);
                display.destroy(id);
                self.pointer = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn on_key(&mut self, key: u32, pressed: bool) -> Option<InputAction> {
        trace!("Key {} {}", key, if pressed { "pressed" } else { "released" });
        if pressed && key == KEY_ESC {
            info!("⎋ Escape pressed, shutting down");
            return Some(InputAction::Quit);
        }
        None
    }

    pub fn on_button(&mut self, button: u32, pressed: bool) -> Option<InputAction> {
        if !pressed {
            return None;
        }
        debug!(
            "Button {:#x} pressed at ({:.1}, {:.1})",
            button, self.pointer_position.0, self.pointer_position.1
        );
        Some(InputAction::SwapColors)
    }

    pub fn on_motion(&mut self, x: f64, y: f64) {
        self.pointer_position = (x, y);
        trace!("Pointer at ({:.1}, {:.1})", x, y);
    }

    pub fn keyboard(&self) -> Option<ObjectId> {
        self.keyboard
    }

    pub fn pointer(&self) -> Option<ObjectId> {
        self.pointer
    }

    pub fn pointer_position(&self) -> (f64, f64) {
        self.pointer_position
    }

    /// Release keyboard and pointer
    pub fn destroy(&mut self, display: &mut dyn Display) {
        if let Some(keyboard) = self.keyboard.take() {
            display.destroy(keyboard);
        }
        if let Some(pointer) = self.pointer.take() {
            display.destroy(pointer);
        }
        self.seat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessServer, Request};
    use crate::registry::{GlobalRegistry, Interface};

    fn seat() -> (crate::headless::HeadlessDisplay, ObjectId) {
        let server = HeadlessServer::new();
        let mut display = server.connect();
        let mut registry = GlobalRegistry::new();
        registry.bind_all(&mut display, &server.globals()).unwrap();
        let seat = registry.get(Interface::Seat).unwrap();
        (display, seat)
    }

    fn count(display: &crate::headless::HeadlessDisplay, f: impl Fn(&Request) -> bool) -> usize {
        display.requests().iter().filter(|r| f(r)).count()
    }

    #[test]
    fn test_capabilities_are_idempotent() {
        let (mut display, seat) = seat();
        let mut router = InputRouter::new();

        router.on_capabilities(&mut display, seat, true, true).unwrap();
        router.on_capabilities(&mut display, seat, true, true).unwrap();

        assert_eq!(count(&display, |r| matches!(r, Request::GetKeyboard { .. })), 1);
        assert_eq!(count(&display, |r| matches!(r, Request::GetPointer { .. })), 1);
    }

    #[test]
    fn test_lost_capability_destroys_object() {
        let (mut display, seat) = seat();
        let mut router = InputRouter::new();
        router.on_capabilities(&mut display, seat, true, true).unwrap();
        let pointer = router.pointer().unwrap();

        router.on_capabilities(&mut display, seat, true, false).unwrap();
        assert!(router.pointer().is_none());
        assert!(router.keyboard().is_some());
        assert!(display.requests().contains(&Request::Destroy { object: pointer }));

        router.on_capabilities(&mut display, seat, true, true).unwrap();
        assert!(router.pointer().is_some());
        assert_ne!(router.pointer(), Some(pointer));
    }

    #[test]
    fn test_escape_press_quits() {
        let mut router = InputRouter::new();
        assert_eq!(router.on_key(KEY_ESC, false), None);
        assert_eq!(router.on_key(30, true), None);
        assert_eq!(router.on_key(KEY_ESC, true), Some(InputAction::Quit));
    }

    #[test]
    fn test_button_press_swaps() {
        let mut router = InputRouter::new();
        router.on_motion(10.0, 20.0);
        assert_eq!(router.on_button(0x110, true), Some(InputAction::SwapColors));
        assert_eq!(router.on_button(0x110, false), None);
        assert_eq!(router.pointer_position(), (10.0, 20.0));
    }
}
