//! Real display backend on top of `wayland-client`
//!
//! [`WaylandClient`] owns the connection, one event queue and every proxy the
//! client creates. Proxies carry their crate-local [`ObjectId`] as user data,
//! so the `Dispatch` impls below only translate protocol events into
//! [`Event`]s and queue them for the next [`EventSource::dispatch`] call.
//! Pings from `xdg_wm_base` are answered here and never reach the client.

use crate::error::TransportError;
use crate::handoff::NativeDisplay;
use crate::protocol::{BufferSpec, Display, Event, EventSource, Global, ObjectId};
use crate::registry::Interface;
use log::{debug, info, trace};
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_keyboard, wl_pointer, wl_registry, wl_seat, wl_shm,
    wl_shm_pool, wl_surface,
};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::foreign::zv2::client::{
    zxdg_exported_v2, zxdg_exporter_v2, zxdg_imported_v2, zxdg_importer_v2,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

/// Every proxy type the client creates
#[derive(Debug, Clone)]
enum WlObject {
    Compositor(wl_compositor::WlCompositor),
    Shm(wl_shm::WlShm),
    WmBase(xdg_wm_base::XdgWmBase),
    Seat(wl_seat::WlSeat),
    Exporter(zxdg_exporter_v2::ZxdgExporterV2),
    Importer(zxdg_importer_v2::ZxdgImporterV2),
    Surface(wl_surface::WlSurface),
    XdgSurface(xdg_surface::XdgSurface),
    Toplevel(xdg_toplevel::XdgToplevel),
    Buffer(wl_buffer::WlBuffer),
    Callback(wl_callback::WlCallback),
    Exported(zxdg_exported_v2::ZxdgExportedV2),
    Imported(zxdg_imported_v2::ZxdgImportedV2),
    Keyboard(wl_keyboard::WlKeyboard),
    Pointer(wl_pointer::WlPointer),
}

/// Events decoded since the last dispatch
#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<Event>,
}

/// Clone the proxy behind `$id` if it is a `$variant`
macro_rules! lookup {
    ($self:ident, $id:expr, $variant:ident, $name:literal) => {
        match $self.objects.get(&$id) {
            Some(WlObject::$variant(proxy)) => Ok(proxy.clone()),
            Some(_) => Err(TransportError::WrongInterface {
                object: $id,
                expected: $name,
            }),
            None => Err(TransportError::UnknownObject($id)),
        }
    };
}

/// A connection to the compositor named by `WAYLAND_DISPLAY`
pub struct WaylandClient {
    connection: Connection,
    queue: EventQueue<QueueState>,
    qh: QueueHandle<QueueState>,
    registry: wl_registry::WlRegistry,
    globals: Vec<Global>,
    objects: HashMap<ObjectId, WlObject>,
    next_id: u32,
    state: QueueState,
}

impl WaylandClient {
    /// Connect and perform the initial registry round-trip
    pub fn connect() -> Result<Self, TransportError> {
        let connection =
            Connection::connect_to_env().map_err(|e| TransportError::Connect(e.to_string()))?;
        let (global_list, queue) = registry_queue_init::<QueueState>(&connection)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let globals: Vec<Global> = global_list
            .contents()
            .clone_list()
            .into_iter()
            .map(|g| Global::new(g.name, g.interface, g.version))
            .collect();
        info!("🔌 Connected to Wayland display, {} globals advertised", globals.len());

        Ok(Self {
            qh: queue.handle(),
            registry: global_list.registry().clone(),
            connection,
            queue,
            globals,
            objects: HashMap::new(),
            next_id: 0,
            state: QueueState::default(),
        })
    }

    /// Globals advertised during the initial round-trip
    pub fn globals(&self) -> Vec<Global> {
        self.globals.clone()
    }

    /// Underlying connection, for renderers that bring their own event queue
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Native proxy behind a surface id from a [`crate::handoff::RenderTarget`]
    pub fn native_surface(&self, surface: ObjectId) -> Option<wl_surface::WlSurface> {
        lookup!(self, surface, Surface, "wl_surface").ok()
    }

    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }

    fn insert(&mut self, id: ObjectId, object: WlObject) -> ObjectId {
        trace!("Created {} {:?}", id, object);
        self.objects.insert(id, object);
        id
    }
}

impl Display for WaylandClient {
    fn native_display(&self) -> Option<NativeDisplay> {
        NativeDisplay::new(self.connection().display().id().as_ptr() as *mut std::ffi::c_void)
    }

    fn bind(&mut self, global: &Global, version: u32) -> Result<ObjectId, TransportError> {
        let id = self.allocate_id();
        let (registry, qh, name) = (&self.registry, &self.qh, global.name);
        let object = match Interface::from_name(&global.interface) {
            Some(Interface::Compositor) => WlObject::Compositor(registry.bind(name, version, qh, id)),
            Some(Interface::Shm) => WlObject::Shm(registry.bind(name, version, qh, id)),
            Some(Interface::WmBase) => WlObject::WmBase(registry.bind(name, version, qh, id)),
            Some(Interface::Seat) => WlObject::Seat(registry.bind(name, version, qh, id)),
            Some(Interface::Exporter) => WlObject::Exporter(registry.bind(name, version, qh, id)),
            Some(Interface::Importer) => WlObject::Importer(registry.bind(name, version, qh, id)),
            None => {
                return Err(TransportError::Bind {
                    interface: global.interface.clone(),
                    version,
                    reason: "interface not supported".to_string(),
                })
            }
        };
        Ok(self.insert(id, object))
    }

    fn create_surface(&mut self, compositor: ObjectId) -> Result<ObjectId, TransportError> {
        let compositor = lookup!(self, compositor, Compositor, "wl_compositor")?;
        let id = self.allocate_id();
        let surface = compositor.create_surface(&self.qh, id);
        Ok(self.insert(id, WlObject::Surface(surface)))
    }

    fn get_xdg_surface(
        &mut self,
        wm_base: ObjectId,
        surface: ObjectId,
    ) -> Result<ObjectId, TransportError> {
        let wm_base = lookup!(self, wm_base, WmBase, "xdg_wm_base")?;
        let surface = lookup!(self, surface, Surface, "wl_surface")?;
        let id = self.allocate_id();
        let xdg_surface = wm_base.get_xdg_surface(&surface, &self.qh, id);
        Ok(self.insert(id, WlObject::XdgSurface(xdg_surface)))
    }

    fn get_toplevel(&mut self, xdg_surface: ObjectId) -> Result<ObjectId, TransportError> {
        let xdg_surface = lookup!(self, xdg_surface, XdgSurface, "xdg_surface")?;
        let id = self.allocate_id();
        let toplevel = xdg_surface.get_toplevel(&self.qh, id);
        Ok(self.insert(id, WlObject::Toplevel(toplevel)))
    }

    fn set_title(&mut self, toplevel: ObjectId, title: &str) -> Result<(), TransportError> {
        lookup!(self, toplevel, Toplevel, "xdg_toplevel")?.set_title(title.to_string());
        Ok(())
    }

    fn set_app_id(&mut self, toplevel: ObjectId, app_id: &str) -> Result<(), TransportError> {
        lookup!(self, toplevel, Toplevel, "xdg_toplevel")?.set_app_id(app_id.to_string());
        Ok(())
    }

    fn set_parent(
        &mut self,
        toplevel: ObjectId,
        parent: Option<ObjectId>,
    ) -> Result<(), TransportError> {
        let toplevel = lookup!(self, toplevel, Toplevel, "xdg_toplevel")?;
        let parent = match parent {
            Some(parent) => Some(lookup!(self, parent, Toplevel, "xdg_toplevel")?),
            None => None,
        };
        toplevel.set_parent(parent.as_ref());
        Ok(())
    }

    fn ack_configure(&mut self, xdg_surface: ObjectId, serial: u32) -> Result<(), TransportError> {
        lookup!(self, xdg_surface, XdgSurface, "xdg_surface")?.ack_configure(serial);
        Ok(())
    }

    fn create_buffer(
        &mut self,
        shm: ObjectId,
        fd: BorrowedFd<'_>,
        spec: BufferSpec,
    ) -> Result<ObjectId, TransportError> {
        let shm = lookup!(self, shm, Shm, "wl_shm")?;
        let pool_id = self.allocate_id();
        let id = self.allocate_id();

        let pool = shm.create_pool(fd, spec.pool_size, &self.qh, pool_id);
        let buffer = pool.create_buffer(
            0,
            spec.width,
            spec.height,
            spec.stride,
            wl_shm::Format::Argb8888,
            &self.qh,
            id,
        );
        // The buffer keeps the memory alive on the server side
        pool.destroy();
        Ok(self.insert(id, WlObject::Buffer(buffer)))
    }

    fn attach(&mut self, surface: ObjectId, buffer: Option<ObjectId>) -> Result<(), TransportError> {
        let surface = lookup!(self, surface, Surface, "wl_surface")?;
        let buffer = match buffer {
            Some(buffer) => Some(lookup!(self, buffer, Buffer, "wl_buffer")?),
            None => None,
        };
        surface.attach(buffer.as_ref(), 0, 0);
        Ok(())
    }

    fn damage_buffer(
        &mut self,
        surface: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Result<(), TransportError> {
        lookup!(self, surface, Surface, "wl_surface")?.damage_buffer(x, y, width, height);
        Ok(())
    }

    fn commit(&mut self, surface: ObjectId) -> Result<(), TransportError> {
        lookup!(self, surface, Surface, "wl_surface")?.commit();
        Ok(())
    }

    fn frame(&mut self, surface: ObjectId) -> Result<ObjectId, TransportError> {
        let surface = lookup!(self, surface, Surface, "wl_surface")?;
        let id = self.allocate_id();
        let callback = surface.frame(&self.qh, id);
        Ok(self.insert(id, WlObject::Callback(callback)))
    }

    fn export_toplevel(
        &mut self,
        exporter: ObjectId,
        surface: ObjectId,
    ) -> Result<ObjectId, TransportError> {
        let exporter = lookup!(self, exporter, Exporter, "zxdg_exporter_v2")?;
        let surface = lookup!(self, surface, Surface, "wl_surface")?;
        let id = self.allocate_id();
        let exported = exporter.export_toplevel(&surface, &self.qh, id);
        Ok(self.insert(id, WlObject::Exported(exported)))
    }

    fn import_toplevel(
        &mut self,
        importer: ObjectId,
        handle: &str,
    ) -> Result<ObjectId, TransportError> {
        let importer = lookup!(self, importer, Importer, "zxdg_importer_v2")?;
        let id = self.allocate_id();
        let imported = importer.import_toplevel(handle.to_string(), &self.qh, id);
        Ok(self.insert(id, WlObject::Imported(imported)))
    }

    fn set_parent_of(
        &mut self,
        imported: ObjectId,
        surface: ObjectId,
    ) -> Result<(), TransportError> {
        let imported = lookup!(self, imported, Imported, "zxdg_imported_v2")?;
        let surface = lookup!(self, surface, Surface, "wl_surface")?;
        imported.set_parent_of(&surface);
        Ok(())
    }

    fn get_keyboard(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError> {
        let seat = lookup!(self, seat, Seat, "wl_seat")?;
        let id = self.allocate_id();
        let keyboard = seat.get_keyboard(&self.qh, id);
        Ok(self.insert(id, WlObject::Keyboard(keyboard)))
    }

    fn get_pointer(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError> {
        let seat = lookup!(self, seat, Seat, "wl_seat")?;
        let id = self.allocate_id();
        let pointer = seat.get_pointer(&self.qh, id);
        Ok(self.insert(id, WlObject::Pointer(pointer)))
    }

    fn destroy(&mut self, object: ObjectId) {
        let Some(proxy) = self.objects.remove(&object) else {
            return;
        };
        trace!("Destroying {} {:?}", object, proxy);
        match proxy {
            WlObject::WmBase(wm_base) => wm_base.destroy(),
            WlObject::Exporter(exporter) => exporter.destroy(),
            WlObject::Importer(importer) => importer.destroy(),
            WlObject::Surface(surface) => surface.destroy(),
            WlObject::XdgSurface(xdg_surface) => xdg_surface.destroy(),
            WlObject::Toplevel(toplevel) => toplevel.destroy(),
            WlObject::Buffer(buffer) => buffer.destroy(),
            WlObject::Exported(exported) => exported.destroy(),
            WlObject::Imported(imported) => imported.destroy(),
            WlObject::Keyboard(keyboard) if keyboard.version() >= 3 => keyboard.release(),
            WlObject::Pointer(pointer) if pointer.version() >= 3 => pointer.release(),
            WlObject::Seat(seat) if seat.version() >= 5 => seat.release(),
            WlObject::Shm(shm) if shm.version() >= 2 => shm.release(),
            // No destructor request at this version; dropping the proxy is all there is
            _ => {}
        }
    }
}

impl EventSource for WaylandClient {
    fn dispatch(&mut self, events: &mut Vec<Event>) -> Result<usize, TransportError> {
        self.queue
            .blocking_dispatch(&mut self.state)
            .map_err(|e| match self.connection.protocol_error() {
                Some(protocol) => TransportError::Protocol(protocol.to_string()),
                None => TransportError::Dispatch(e.to_string()),
            })?;
        let count = self.state.pending.len();
        events.append(&mut self.state.pending);
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.connection
            .flush()
            .map_err(|e| TransportError::Flush(e.to_string()))
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for QueueState {
    fn event(
        state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => debug!("Late global {} {} v{} ignored", name, interface, version),
            wl_registry::Event::GlobalRemove { name } => {
                state.pending.push(Event::GlobalRemoved { name })
            }
            _ => {}
        }
    }
}

/// Interfaces whose events the client has no use for
macro_rules! ignore_events {
    ($($iface:ty),* $(,)?) => {
        $(
            impl Dispatch<$iface, ObjectId> for QueueState {
                fn event(
                    _state: &mut Self,
                    _proxy: &$iface,
                    _event: <$iface as Proxy>::Event,
                    _id: &ObjectId,
                    _conn: &Connection,
                    _qh: &QueueHandle<Self>,
                ) {
                }
            }
        )*
    };
}

ignore_events!(
    wl_compositor::WlCompositor,
    wl_shm::WlShm,
    wl_shm_pool::WlShmPool,
    zxdg_exporter_v2::ZxdgExporterV2,
    zxdg_importer_v2::ZxdgImporterV2,
);

impl Dispatch<xdg_wm_base::XdgWmBase, ObjectId> for QueueState {
    fn event(
        _state: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            trace!("Ping {}", serial);
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.pending.push(Event::SurfaceConfigure {
                xdg_surface: *id,
                serial,
            });
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                state.pending.push(Event::ToplevelConfigure {
                    toplevel: *id,
                    width,
                    height,
                })
            }
            xdg_toplevel::Event::Close => state.pending.push(Event::ToplevelClose { toplevel: *id }),
            _ => {}
        }
    }
}

impl Dispatch<wl_surface::WlSurface, ObjectId> for QueueState {
    fn event(
        _state: &mut Self,
        _surface: &wl_surface::WlSurface,
        event: wl_surface::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        trace!("Surface {} event {:?}", id, event);
    }
}

impl Dispatch<wl_callback::WlCallback, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _callback: &wl_callback::WlCallback,
        event: wl_callback::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            state.pending.push(Event::FrameDone {
                callback: *id,
                time: callback_data,
            });
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.pending.push(Event::BufferReleased { buffer: *id });
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_seat::Event::Capabilities {
                capabilities: WEnum::Value(capabilities),
            } => state.pending.push(Event::SeatCapabilities {
                seat: *id,
                keyboard: capabilities.contains(wl_seat::Capability::Keyboard),
                pointer: capabilities.contains(wl_seat::Capability::Pointer),
            }),
            wl_seat::Event::Name { name } => debug!("Seat {} is {:?}", id, name),
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _keyboard: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // The keymap fd is dropped unread; raw evdev codes are enough here
        if let wl_keyboard::Event::Key { key, state: key_state, .. } = event {
            let pressed = matches!(key_state, WEnum::Value(wl_keyboard::KeyState::Pressed));
            state.pending.push(Event::Key { key, pressed });
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _pointer: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_pointer::Event::Enter {
                surface_x,
                surface_y,
                ..
            }
            | wl_pointer::Event::Motion {
                surface_x,
                surface_y,
                ..
            } => state.pending.push(Event::PointerMotion {
                x: surface_x,
                y: surface_y,
            }),
            wl_pointer::Event::Button {
                button,
                state: button_state,
                ..
            } => {
                let pressed = matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));
                state.pending.push(Event::PointerButton { button, pressed });
            }
            _ => {}
        }
    }
}

impl Dispatch<zxdg_exported_v2::ZxdgExportedV2, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _exported: &zxdg_exported_v2::ZxdgExportedV2,
        event: zxdg_exported_v2::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zxdg_exported_v2::Event::Handle { handle } = event {
            state.pending.push(Event::ExportedHandle {
                exported: *id,
                handle,
            });
        }
    }
}

impl Dispatch<zxdg_imported_v2::ZxdgImportedV2, ObjectId> for QueueState {
    fn event(
        state: &mut Self,
        _imported: &zxdg_imported_v2::ZxdgImportedV2,
        event: zxdg_imported_v2::Event,
        id: &ObjectId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zxdg_imported_v2::Event::Destroyed = event {
            state.pending.push(Event::ImportedDestroyed { imported: *id });
        }
    }
}
