//! In-process headless compositor
//!
//! [`HeadlessServer`] simulates just enough of a Wayland compositor to drive
//! the client state machines without a display: it advertises globals, sends
//! the initial configure on a toplevel's first commit, releases shm buffers as
//! soon as they are committed, fires frame callbacks on [`HeadlessDisplay::present`]
//! and mediates xdg-foreign handles between its clients. Every client request
//! is logged as a [`Request`] so tests can assert on ordering, and sequences a
//! real compositor would reject are collected as protocol errors instead of
//! killing the connection.
//!
//! Each [`HeadlessServer::connect`] returns a [`HeadlessDisplay`], the client
//! side of one connection. Dropping it disconnects the client, which revokes
//! every handle it exported.

mod validation;

pub use validation::{ProtocolError, XdgShellValidator, XdgSurfaceState};

use crate::error::TransportError;
use crate::handoff::NativeDisplay;
use crate::protocol::{BufferSpec, Display, Event, EventSource, Global, ObjectId};
use crate::shm::BYTES_PER_PIXEL;
use log::{debug, info, trace, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::fd::BorrowedFd;
use std::rc::Rc;

/// Connection number of a headless client
pub type ClientId = u32;

/// A surface on the headless server: owning client plus the client's id for it
pub type SurfaceKey = (ClientId, ObjectId);

/// Milliseconds between simulated presentations
const FRAME_INTERVAL_MS: u32 = 16;

const DEFAULT_GLOBALS: [(&str, u32); 6] = [
    ("wl_compositor", 4),
    ("wl_shm", 1),
    ("xdg_wm_base", 2),
    ("wl_seat", 7),
    ("zxdg_exporter_v2", 1),
    ("zxdg_importer_v2", 1),
];

/// One request as the server received it
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Bind { global: u32, interface: String, version: u32, id: ObjectId },
    CreateSurface { surface: ObjectId },
    GetXdgSurface { xdg_surface: ObjectId, surface: ObjectId },
    GetToplevel { toplevel: ObjectId, xdg_surface: ObjectId },
    SetTitle { toplevel: ObjectId, title: String },
    SetAppId { toplevel: ObjectId, app_id: String },
    SetParent { toplevel: ObjectId, parent: Option<ObjectId> },
    AckConfigure { xdg_surface: ObjectId, serial: u32 },
    CreateBuffer { buffer: ObjectId, spec: BufferSpec },
    Attach { surface: ObjectId, buffer: Option<ObjectId> },
    DamageBuffer { surface: ObjectId, width: i32, height: i32 },
    Commit { surface: ObjectId },
    Frame { surface: ObjectId, callback: ObjectId },
    ExportToplevel { exported: ObjectId, surface: ObjectId },
    ImportToplevel { imported: ObjectId, handle: String },
    SetParentOf { imported: ObjectId, surface: ObjectId },
    GetKeyboard { keyboard: ObjectId },
    GetPointer { pointer: ObjectId },
    Destroy { object: ObjectId },
}

#[derive(Debug, Clone, Default)]
struct SurfaceData {
    xdg_surface: Option<ObjectId>,
    toplevel: Option<ObjectId>,
    /// Attached since the last commit; `Some(None)` attaches nothing
    pending_buffer: Option<Option<ObjectId>>,
    /// Buffer of the current committed state
    attached: Option<ObjectId>,
    pending_frames: Vec<ObjectId>,
    commits: u64,
}

#[derive(Debug, Clone)]
enum Object {
    Global { interface: String },
    Surface(SurfaceData),
    XdgSurface { surface: ObjectId },
    Toplevel {
        xdg_surface: ObjectId,
        title: String,
        app_id: String,
        parent: Option<ObjectId>,
    },
    Buffer,
    Callback,
    Exported { token: String },
    Imported { token: String, child: Option<ObjectId> },
    Keyboard,
    Pointer,
}

impl Object {
    fn kind(&self) -> &str {
        match self {
            Object::Global { interface } => interface,
            Object::Surface(_) => "wl_surface",
            Object::XdgSurface { .. } => "xdg_surface",
            Object::Toplevel { .. } => "xdg_toplevel",
            Object::Buffer => "wl_buffer",
            Object::Callback => "wl_callback",
            Object::Exported { .. } => "zxdg_exported_v2",
            Object::Imported { .. } => "zxdg_imported_v2",
            Object::Keyboard => "wl_keyboard",
            Object::Pointer => "wl_pointer",
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    objects: HashMap<ObjectId, Object>,
    next_id: u32,
    requests: Vec<Request>,
    events: VecDeque<Event>,
    validator: XdgShellValidator,
    /// Committed frame callbacks waiting for the next presentation
    frames: Vec<ObjectId>,
    last_created: Option<ObjectId>,
    errors: Vec<String>,
    /// Reason the next dispatch fails with, once
    broken: Option<String>,
}

impl ClientState {
    fn create(&mut self, object: Object) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(id, object);
        self.last_created = Some(id);
        id
    }

    fn expect(&mut self, id: ObjectId, expected: &'static str) -> Result<&mut Object, TransportError> {
        match self.objects.get_mut(&id) {
            None => Err(TransportError::UnknownObject(id)),
            Some(object) if object.kind() != expected => Err(TransportError::WrongInterface {
                object: id,
                expected,
            }),
            Some(object) => Ok(object),
        }
    }

    fn surface(&mut self, id: ObjectId) -> Result<&mut SurfaceData, TransportError> {
        match self.expect(id, "wl_surface")? {
            Object::Surface(data) => Ok(data),
            _ => Err(TransportError::WrongInterface {
                object: id,
                expected: "wl_surface",
            }),
        }
    }

    fn error(&mut self, message: String) {
        warn!("Protocol violation: {}", message);
        self.errors.push(message);
    }

    fn references(&self, target: ObjectId) -> bool {
        self.objects.values().any(|object| match object {
            Object::Surface(data) => data.attached == Some(target),
            Object::XdgSurface { surface } => *surface == target,
            Object::Toplevel { xdg_surface, .. } => *xdg_surface == target,
            _ => false,
        })
    }
}

struct Export {
    client: ClientId,
    surface: ObjectId,
}

struct ServerState {
    globals: Vec<Global>,
    clients: HashMap<ClientId, ClientState>,
    next_client: ClientId,
    serial: u32,
    time: u32,
    next_token: Option<String>,
    exports: HashMap<String, Export>,
    /// Child surface → parent surface, across clients
    parents: HashMap<SurfaceKey, SurfaceKey>,
    keyboard: bool,
    pointer: bool,
    initial_size: (i32, i32),
    auto_present: bool,
    native_display: Option<NativeDisplay>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            globals: DEFAULT_GLOBALS
                .iter()
                .enumerate()
                .map(|(i, (interface, version))| Global::new(i as u32 + 1, *interface, *version))
                .collect(),
            clients: HashMap::new(),
            next_client: 0,
            serial: 0,
            time: 0,
            next_token: None,
            exports: HashMap::new(),
            parents: HashMap::new(),
            keyboard: true,
            pointer: true,
            initial_size: (0, 0),
            auto_present: false,
            native_display: None,
        }
    }

    fn client(&mut self, id: ClientId) -> Result<&mut ClientState, TransportError> {
        self.clients
            .get_mut(&id)
            .ok_or_else(|| TransportError::Protocol(format!("client {} is disconnected", id)))
    }

    fn next_serial(&mut self) -> u32 {
        self.serial += 1;
        self.serial
    }

    fn mint_token(&mut self) -> String {
        self.next_token.take().unwrap_or_else(|| {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        })
    }

    fn send_configure(&mut self, client: ClientId, toplevel: ObjectId, width: i32, height: i32) -> Option<u32> {
        let serial = self.next_serial();
        let state = self.clients.get_mut(&client)?;
        let xdg_surface = match state.objects.get(&toplevel) {
            Some(Object::Toplevel { xdg_surface, .. }) => *xdg_surface,
            _ => return None,
        };
        if let Err(e) = state.validator.add_configure(xdg_surface, serial) {
            state.error(e.to_string());
        }
        state.events.push_back(Event::ToplevelConfigure {
            toplevel,
            width,
            height,
        });
        state.events.push_back(Event::SurfaceConfigure {
            xdg_surface,
            serial,
        });
        Some(serial)
    }

    fn bind(&mut self, client: ClientId, global: &Global, version: u32) -> Result<ObjectId, TransportError> {
        let advertised = self
            .globals
            .iter()
            .find(|g| g.name == global.name && g.interface == global.interface)
            .cloned();
        let bind_error = |reason: &str| TransportError::Bind {
            interface: global.interface.clone(),
            version,
            reason: reason.to_string(),
        };
        let advertised = advertised.ok_or_else(|| bind_error("no such global"))?;
        if version == 0 || version > advertised.version {
            return Err(bind_error("version not advertised"));
        }

        let (keyboard, pointer) = (self.keyboard, self.pointer);
        let state = self.client(client)?;
        let id = state.create(Object::Global {
            interface: advertised.interface.clone(),
        });
        state.requests.push(Request::Bind {
            global: advertised.name,
            interface: advertised.interface.clone(),
            version,
            id,
        });
        if advertised.interface == "wl_seat" {
            state.events.push_back(Event::SeatCapabilities {
                seat: id,
                keyboard,
                pointer,
            });
        }
        Ok(id)
    }

    fn commit(&mut self, client: ClientId, surface: ObjectId) -> Result<(), TransportError> {
        let state = self.client(client)?;
        state.requests.push(Request::Commit { surface });

        let data = state.surface(surface)?;
        let newly_attached = data.pending_buffer.take();
        if let Some(buffer) = newly_attached {
            data.attached = buffer;
        }
        data.commits += 1;
        let first_commit = data.commits == 1;
        let has_buffer = data.attached.is_some();
        let (xdg_surface, toplevel) = (data.xdg_surface, data.toplevel);
        let frames: Vec<ObjectId> = data.pending_frames.drain(..).collect();
        state.frames.extend(frames);

        if let Some(xdg_surface) = xdg_surface {
            if let Err(e) = state.validator.validate_commit(xdg_surface, has_buffer) {
                state.error(e.to_string());
            }
        }
        if let Some(Some(buffer)) = newly_attached {
            state.events.push_back(Event::BufferReleased { buffer });
        }

        if let (true, Some(toplevel)) = (first_commit, toplevel) {
            let (width, height) = self.initial_size;
            self.send_configure(client, toplevel, width, height);
        }
        Ok(())
    }

    fn export_toplevel(
        &mut self,
        client: ClientId,
        exporter: ObjectId,
        surface: ObjectId,
    ) -> Result<ObjectId, TransportError> {
        let token = self.mint_token();
        let state = self.client(client)?;
        state.expect(exporter, "zxdg_exporter_v2")?;
        if state.surface(surface)?.toplevel.is_none() {
            return Err(TransportError::Protocol(format!(
                "surface {} exported without a toplevel role",
                surface
            )));
        }
        let exported = state.create(Object::Exported {
            token: token.clone(),
        });
        state.requests.push(Request::ExportToplevel { exported, surface });
        state.events.push_back(Event::ExportedHandle {
            exported,
            handle: token.clone(),
        });
        debug!("Client {} exported {} as {}", client, surface, token);
        self.exports.insert(token, Export { client, surface });
        Ok(exported)
    }

    fn import_toplevel(
        &mut self,
        client: ClientId,
        importer: ObjectId,
        handle: &str,
    ) -> Result<ObjectId, TransportError> {
        let known = self.exports.contains_key(handle);
        let state = self.client(client)?;
        state.expect(importer, "zxdg_importer_v2")?;
        let imported = state.create(Object::Imported {
            token: handle.to_string(),
            child: None,
        });
        state.requests.push(Request::ImportToplevel {
            imported,
            handle: handle.to_string(),
        });
        if !known {
            debug!("Client {} imported unknown handle {}", client, handle);
            state.events.push_back(Event::ImportedDestroyed { imported });
        }
        Ok(imported)
    }

    fn set_parent_of(
        &mut self,
        client: ClientId,
        imported: ObjectId,
        surface: ObjectId,
    ) -> Result<(), TransportError> {
        let state = self.client(client)?;
        state.requests.push(Request::SetParentOf { imported, surface });
        let commits = state.surface(surface)?.commits;
        if commits > 0 {
            state.error(format!(
                "set_parent_of on surface {} after {} commits",
                surface, commits
            ));
        }
        let token = match state.expect(imported, "zxdg_imported_v2")? {
            Object::Imported { token, child } => {
                *child = Some(surface);
                token.clone()
            }
            _ => return Ok(()),
        };

        if let Some(export) = self.exports.get(&token) {
            self.parents
                .insert((client, surface), (export.client, export.surface));
        }
        Ok(())
    }

    fn destroy(&mut self, client: ClientId, object: ObjectId) {
        let Some(state) = self.clients.get_mut(&client) else {
            return;
        };
        state.requests.push(Request::Destroy { object });

        if state.references(object) {
            let kind = state.objects.get(&object).map(|o| o.kind().to_string());
            state.error(format!(
                "{} {} destroyed while still in use",
                kind.unwrap_or_default(),
                object
            ));
        }

        let Some(removed) = state.objects.remove(&object) else {
            trace!("Client {} destroyed unknown object {}", client, object);
            return;
        };
        state.frames.retain(|f| *f != object);

        match removed {
            Object::XdgSurface { surface } => {
                state.validator.unregister_surface(object);
                if let Some(Object::Surface(data)) = state.objects.get_mut(&surface) {
                    data.xdg_surface = None;
                }
            }
            Object::Toplevel { xdg_surface, .. } => {
                let surface = match state.objects.get(&xdg_surface) {
                    Some(Object::XdgSurface { surface }) => Some(*surface),
                    _ => None,
                };
                if let Some(Object::Surface(data)) = surface.and_then(|s| state.objects.get_mut(&s)) {
                    data.toplevel = None;
                }
            }
            Object::Surface(_) => {
                self.parents.remove(&(client, object));
                let revoked: Vec<String> = self
                    .exports
                    .iter()
                    .filter(|(_, e)| e.client == client && e.surface == object)
                    .map(|(token, _)| token.clone())
                    .collect();
                for token in revoked {
                    self.revoke(&token);
                }
            }
            Object::Exported { token } => self.revoke(&token),
            Object::Imported {
                child: Some(child), ..
            } => {
                self.parents.remove(&(client, child));
            }
            _ => {}
        }
    }

    /// Invalidate a handle and tell every importer
    fn revoke(&mut self, token: &str) {
        let Some(export) = self.exports.remove(token) else {
            return;
        };
        info!("🚫 Handle {} revoked", token);
        self.parents
            .retain(|_, parent| *parent != (export.client, export.surface));
        for state in self.clients.values_mut() {
            for (id, object) in &state.objects {
                if matches!(object, Object::Imported { token: t, .. } if t == token) {
                    state.events.push_back(Event::ImportedDestroyed { imported: *id });
                }
            }
        }
    }

    fn disconnect(&mut self, client: ClientId) {
        if self.clients.remove(&client).is_none() {
            return;
        }
        debug!("Client {} disconnected", client);
        self.parents.retain(|child, _| child.0 != client);
        let owned: Vec<String> = self
            .exports
            .iter()
            .filter(|(_, e)| e.client == client)
            .map(|(token, _)| token.clone())
            .collect();
        for token in owned {
            self.revoke(&token);
        }
    }

    fn present(&mut self, client: ClientId) -> usize {
        self.time = self.time.wrapping_add(FRAME_INTERVAL_MS);
        let time = self.time;
        let Some(state) = self.clients.get_mut(&client) else {
            return 0;
        };
        let frames: Vec<ObjectId> = state.frames.drain(..).collect();
        for callback in &frames {
            state.objects.remove(callback);
            state.events.push_back(Event::FrameDone {
                callback: *callback,
                time,
            });
        }
        frames.len()
    }

    fn is_mapped(&self, key: SurfaceKey) -> bool {
        matches!(
            self.clients.get(&key.0).and_then(|c| c.objects.get(&key.1)),
            Some(Object::Surface(data)) if data.attached.is_some()
        )
    }
}

/// Shared handle to the simulated compositor
#[derive(Clone)]
pub struct HeadlessServer {
    state: Rc<RefCell<ServerState>>,
}

impl Default for HeadlessServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessServer {
    /// A server advertising compositor, shm, wm_base, seat, exporter and importer
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ServerState::new())),
        }
    }

    pub fn set_globals(&self, globals: Vec<Global>) {
        self.state.borrow_mut().globals = globals;
    }

    pub fn globals(&self) -> Vec<Global> {
        self.state.borrow().globals.clone()
    }

    /// Open a new client connection
    pub fn connect(&self) -> HeadlessDisplay {
        let mut state = self.state.borrow_mut();
        state.next_client += 1;
        let client = state.next_client;
        state.clients.insert(client, ClientState::default());
        debug!("Client {} connected", client);
        HeadlessDisplay {
            server: self.clone(),
            client,
        }
    }

    /// Hand out `token` for the next export instead of a random one
    pub fn set_next_token(&self, token: impl Into<String>) {
        self.state.borrow_mut().next_token = Some(token.into());
    }

    /// Size proposed in the initial configure; (0, 0) lets the client choose
    pub fn set_initial_size(&self, width: i32, height: i32) {
        self.state.borrow_mut().initial_size = (width, height);
    }

    /// Fire frame callbacks whenever a client runs out of events
    pub fn set_auto_present(&self, enabled: bool) {
        self.state.borrow_mut().auto_present = enabled;
    }

    /// Native display reported to renderers instead of none
    pub fn set_native_display(&self, display: Option<NativeDisplay>) {
        self.state.borrow_mut().native_display = display;
    }

    pub fn parent_of(&self, child: SurfaceKey) -> Option<SurfaceKey> {
        self.state.borrow().parents.get(&child).copied()
    }

    /// `child` is parented to `parent` and both are mapped
    pub fn is_stacked_above(&self, child: SurfaceKey, parent: SurfaceKey) -> bool {
        let state = self.state.borrow();
        state.parents.get(&child) == Some(&parent) && state.is_mapped(child) && state.is_mapped(parent)
    }

    /// Handles currently valid
    pub fn live_handles(&self) -> Vec<String> {
        self.state.borrow().exports.keys().cloned().collect()
    }
}

/// Client end of one headless connection
pub struct HeadlessDisplay {
    server: HeadlessServer,
    client: ClientId,
}

impl HeadlessDisplay {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn server(&self) -> &HeadlessServer {
        &self.server
    }

    /// Key of one of this client's surfaces on the server
    pub fn surface_key(&self, surface: ObjectId) -> SurfaceKey {
        (self.client, surface)
    }

    /// Every request sent so far, in order
    pub fn requests(&self) -> Vec<Request> {
        self.with_client(|c| c.requests.clone()).unwrap_or_default()
    }

    /// Id of the most recently created object
    pub fn last_created(&self) -> Option<ObjectId> {
        self.with_client(|c| c.last_created).flatten()
    }

    pub fn protocol_errors(&self) -> Vec<String> {
        self.with_client(|c| c.errors.clone()).unwrap_or_default()
    }

    pub fn pending_events(&self) -> usize {
        self.with_client(|c| c.events.len()).unwrap_or_default()
    }

    /// Send a configure for `toplevel`, returning its serial
    pub fn configure(&self, toplevel: ObjectId, width: i32, height: i32) -> Option<u32> {
        self.server
            .state
            .borrow_mut()
            .send_configure(self.client, toplevel, width, height)
    }

    pub fn close(&self, toplevel: ObjectId) {
        self.push(Event::ToplevelClose { toplevel });
    }

    /// Change the seat's capabilities and notify every bound seat
    pub fn set_capabilities(&self, keyboard: bool, pointer: bool) {
        let mut state = self.server.state.borrow_mut();
        state.keyboard = keyboard;
        state.pointer = pointer;
        if let Some(client) = state.clients.get_mut(&self.client) {
            let seats: Vec<ObjectId> = client
                .objects
                .iter()
                .filter(|(_, o)| o.kind() == "wl_seat")
                .map(|(id, _)| *id)
                .collect();
            for seat in seats {
                client.events.push_back(Event::SeatCapabilities {
                    seat,
                    keyboard,
                    pointer,
                });
            }
        }
    }

    /// Deliver a key event if the client holds a keyboard
    pub fn send_key(&self, key: u32, pressed: bool) {
        if self.holds("wl_keyboard") {
            self.push(Event::Key { key, pressed });
        }
    }

    pub fn send_button(&self, button: u32, pressed: bool) {
        if self.holds("wl_pointer") {
            self.push(Event::PointerButton { button, pressed });
        }
    }

    pub fn send_motion(&self, x: f64, y: f64) {
        if self.holds("wl_pointer") {
            self.push(Event::PointerMotion { x, y });
        }
    }

    /// Make the next dispatch fail as if the connection dropped. Requests
    /// keep being recorded so the teardown that follows can be inspected.
    pub fn fail_next_dispatch(&self, reason: impl Into<String>) {
        if let Some(client) = self.server.state.borrow_mut().clients.get_mut(&self.client) {
            client.broken = Some(reason.into());
        }
    }

    /// Fire this client's committed frame callbacks
    pub fn present(&self) -> usize {
        self.server.state.borrow_mut().present(self.client)
    }

    /// Parent given to `toplevel` through xdg_toplevel.set_parent
    pub fn toplevel_parent(&self, toplevel: ObjectId) -> Option<ObjectId> {
        self.with_client(|c| match c.objects.get(&toplevel) {
            Some(Object::Toplevel { parent, .. }) => *parent,
            _ => None,
        })
        .flatten()
    }

    /// Title and app id of `toplevel`
    pub fn toplevel_metadata(&self, toplevel: ObjectId) -> Option<(String, String)> {
        self.with_client(|c| match c.objects.get(&toplevel) {
            Some(Object::Toplevel { title, app_id, .. }) => Some((title.clone(), app_id.clone())),
            _ => None,
        })
        .flatten()
    }

    pub fn is_mapped(&self, surface: ObjectId) -> bool {
        self.server.state.borrow().is_mapped((self.client, surface))
    }

    /// Whether `object` is still alive on the server
    pub fn is_alive(&self, object: ObjectId) -> bool {
        self.with_client(|c| c.objects.contains_key(&object))
            .unwrap_or(false)
    }

    fn with_client<T>(&self, f: impl FnOnce(&ClientState) -> T) -> Option<T> {
        self.server.state.borrow().clients.get(&self.client).map(f)
    }

    fn holds(&self, kind: &str) -> bool {
        self.with_client(|c| c.objects.values().any(|o| o.kind() == kind))
            .unwrap_or(false)
    }

    fn push(&self, event: Event) {
        if let Some(client) = self.server.state.borrow_mut().clients.get_mut(&self.client) {
            client.events.push_back(event);
        }
    }

    fn with_state<T>(
        &mut self,
        f: impl FnOnce(&mut ClientState) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.server.state.borrow_mut();
        let client = state.client(self.client)?;
        f(client)
    }
}

impl Display for HeadlessDisplay {
    fn native_display(&self) -> Option<NativeDisplay> {
        self.server.state.borrow().native_display
    }

    fn bind(&mut self, global: &Global, version: u32) -> Result<ObjectId, TransportError> {
        self.server.state.borrow_mut().bind(self.client, global, version)
    }

    fn create_surface(&mut self, compositor: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            c.expect(compositor, "wl_compositor")?;
            let surface = c.create(Object::Surface(SurfaceData::default()));
            c.requests.push(Request::CreateSurface { surface });
            Ok(surface)
        })
    }

    fn get_xdg_surface(&mut self, wm_base: ObjectId, surface: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            c.expect(wm_base, "xdg_wm_base")?;
            let data = c.surface(surface)?;
            if data.xdg_surface.is_some() {
                return Err(TransportError::Protocol(format!(
                    "surface {} already has an xdg_surface",
                    surface
                )));
            }
            if data.attached.is_some() {
                c.error(format!("xdg_surface created for {} with a buffer attached", surface));
            }
            let xdg_surface = c.create(Object::XdgSurface { surface });
            c.surface(surface)?.xdg_surface = Some(xdg_surface);
            c.validator.register_surface(xdg_surface);
            c.requests.push(Request::GetXdgSurface {
                xdg_surface,
                surface,
            });
            Ok(xdg_surface)
        })
    }

    fn get_toplevel(&mut self, xdg_surface: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            let surface = match c.expect(xdg_surface, "xdg_surface")? {
                Object::XdgSurface { surface } => *surface,
                _ => return Err(TransportError::UnknownObject(xdg_surface)),
            };
            if let Err(e) = c.validator.assign_role(xdg_surface) {
                return Err(TransportError::Protocol(e.to_string()));
            }
            let toplevel = c.create(Object::Toplevel {
                xdg_surface,
                title: String::new(),
                app_id: String::new(),
                parent: None,
            });
            c.surface(surface)?.toplevel = Some(toplevel);
            c.requests.push(Request::GetToplevel {
                toplevel,
                xdg_surface,
            });
            Ok(toplevel)
        })
    }

    fn set_title(&mut self, toplevel: ObjectId, new_title: &str) -> Result<(), TransportError> {
        self.with_state(|c| {
            if let Object::Toplevel { title, .. } = c.expect(toplevel, "xdg_toplevel")? {
                *title = new_title.to_string();
            }
            c.requests.push(Request::SetTitle {
                toplevel,
                title: new_title.to_string(),
            });
            Ok(())
        })
    }

    fn set_app_id(&mut self, toplevel: ObjectId, new_app_id: &str) -> Result<(), TransportError> {
        self.with_state(|c| {
            if let Object::Toplevel { app_id, .. } = c.expect(toplevel, "xdg_toplevel")? {
                *app_id = new_app_id.to_string();
            }
            c.requests.push(Request::SetAppId {
                toplevel,
                app_id: new_app_id.to_string(),
            });
            Ok(())
        })
    }

    fn set_parent(&mut self, toplevel: ObjectId, new_parent: Option<ObjectId>) -> Result<(), TransportError> {
        self.with_state(|c| {
            if let Some(parent) = new_parent {
                c.expect(parent, "xdg_toplevel")?;
            }
            if let Object::Toplevel { parent, .. } = c.expect(toplevel, "xdg_toplevel")? {
                *parent = new_parent;
            }
            c.requests.push(Request::SetParent {
                toplevel,
                parent: new_parent,
            });
            Ok(())
        })
    }

    fn ack_configure(&mut self, xdg_surface: ObjectId, serial: u32) -> Result<(), TransportError> {
        self.with_state(|c| {
            c.expect(xdg_surface, "xdg_surface")?;
            c.requests.push(Request::AckConfigure {
                xdg_surface,
                serial,
            });
            if let Err(e) = c.validator.ack_configure(xdg_surface, serial) {
                c.error(e.to_string());
            }
            Ok(())
        })
    }

    fn create_buffer(&mut self, shm: ObjectId, fd: BorrowedFd<'_>, spec: BufferSpec) -> Result<ObjectId, TransportError> {
        let file_size = fd
            .try_clone_to_owned()
            .map(File::from)
            .and_then(|file| file.metadata())
            .map(|meta| meta.len())
            .map_err(|e| TransportError::Protocol(format!("invalid shm descriptor: {}", e)))?;

        self.with_state(|c| {
            c.expect(shm, "wl_shm")?;
            let min_stride = spec.width as i64 * BYTES_PER_PIXEL as i64;
            let invalid = spec.width <= 0
                || spec.height <= 0
                || (spec.stride as i64) < min_stride
                || (spec.pool_size as i64) < spec.stride as i64 * spec.height as i64
                || (spec.pool_size as u64) > file_size;
            if invalid {
                return Err(TransportError::Protocol(format!(
                    "invalid shm buffer {:?} for a {} byte segment",
                    spec, file_size
                )));
            }
            let buffer = c.create(Object::Buffer);
            c.requests.push(Request::CreateBuffer { buffer, spec });
            Ok(buffer)
        })
    }

    fn attach(&mut self, surface: ObjectId, buffer: Option<ObjectId>) -> Result<(), TransportError> {
        self.with_state(|c| {
            if let Some(buffer) = buffer {
                c.expect(buffer, "wl_buffer")?;
            }
            c.surface(surface)?.pending_buffer = Some(buffer);
            c.requests.push(Request::Attach { surface, buffer });
            Ok(())
        })
    }

    fn damage_buffer(&mut self, surface: ObjectId, _x: i32, _y: i32, width: i32, height: i32) -> Result<(), TransportError> {
        self.with_state(|c| {
            c.surface(surface)?;
            c.requests.push(Request::DamageBuffer {
                surface,
                width,
                height,
            });
            Ok(())
        })
    }

    fn commit(&mut self, surface: ObjectId) -> Result<(), TransportError> {
        self.server.state.borrow_mut().commit(self.client, surface)
    }

    fn frame(&mut self, surface: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            c.surface(surface)?;
            let callback = c.create(Object::Callback);
            c.surface(surface)?.pending_frames.push(callback);
            c.requests.push(Request::Frame { surface, callback });
            Ok(callback)
        })
    }

    fn export_toplevel(&mut self, exporter: ObjectId, surface: ObjectId) -> Result<ObjectId, TransportError> {
        self.server
            .state
            .borrow_mut()
            .export_toplevel(self.client, exporter, surface)
    }

    fn import_toplevel(&mut self, importer: ObjectId, handle: &str) -> Result<ObjectId, TransportError> {
        self.server
            .state
            .borrow_mut()
            .import_toplevel(self.client, importer, handle)
    }

    fn set_parent_of(&mut self, imported: ObjectId, surface: ObjectId) -> Result<(), TransportError> {
        self.server
            .state
            .borrow_mut()
            .set_parent_of(self.client, imported, surface)
    }

    fn get_keyboard(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            c.expect(seat, "wl_seat")?;
            let keyboard = c.create(Object::Keyboard);
            c.requests.push(Request::GetKeyboard { keyboard });
            Ok(keyboard)
        })
    }

    fn get_pointer(&mut self, seat: ObjectId) -> Result<ObjectId, TransportError> {
        self.with_state(|c| {
            c.expect(seat, "wl_seat")?;
            let pointer = c.create(Object::Pointer);
            c.requests.push(Request::GetPointer { pointer });
            Ok(pointer)
        })
    }

    fn destroy(&mut self, object: ObjectId) {
        self.server.state.borrow_mut().destroy(self.client, object);
    }
}

impl EventSource for HeadlessDisplay {
    /// Deliver everything queued for this client. An empty queue means the
    /// simulated session is over: [`TransportError::Drained`].
    fn dispatch(&mut self, events: &mut Vec<Event>) -> Result<usize, TransportError> {
        let mut state = self.server.state.borrow_mut();
        if let Some(reason) = state.client(self.client)?.broken.take() {
            return Err(TransportError::Dispatch(reason));
        }
        let empty = state.client(self.client)?.events.is_empty();
        if empty && state.auto_present {
            state.present(self.client);
        }
        let client = state.client(self.client)?;
        if client.events.is_empty() {
            return Err(TransportError::Drained);
        }
        let count = client.events.len();
        events.extend(client.events.drain(..));
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Drop for HeadlessDisplay {
    fn drop(&mut self) {
        if let Ok(mut state) = self.server.state.try_borrow_mut() {
            state.disconnect(self.client);
        }
    }
}
