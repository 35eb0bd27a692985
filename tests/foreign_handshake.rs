// xdg-foreign handshake integration tests for tether
//
// One headless compositor, two clients: an exporter publishing its handle and
// an importer parenting its window to it, including what happens when the
// handle goes away.

use tether::foreign::{
    read_handle_file, ExportState, Exporter, FilePublisher, ImportState, MemoryPublisher,
};
use tether::headless::{HeadlessDisplay, HeadlessServer, Request};
use tether::registry::{GlobalRegistry, Interface};
use tether::window::{Window, WindowSettings};
use tether::{
    Client, ForeignError, Mode, ShutdownFlag, TetherConfig, TetherError, TransportError,
};

const TOKEN: &str = "abcXYZ123";

fn pump_until_idle(client: &mut Client, display: &mut HeadlessDisplay) {
    loop {
        match client.pump(display) {
            Ok(_) => {}
            Err(TetherError::Transport(TransportError::Drained)) => break,
            Err(e) => panic!("pump failed: {}", e),
        }
    }
}

/// A mapped exporter whose handle is `TOKEN`
fn exporter(server: &HeadlessServer, publisher: MemoryPublisher) -> (Client, HeadlessDisplay) {
    let _ = env_logger::builder().is_test(true).try_init();
    server.set_next_token(TOKEN);
    let mut display = server.connect();
    let mut client = Client::new(Mode::Export, TetherConfig::default(), ShutdownFlag::new());
    client.add_handle_publisher(Box::new(publisher));
    client.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut client, &mut display);
    (client, display)
}

fn importer(server: &HeadlessServer, handle: &str) -> (Client, HeadlessDisplay) {
    let mut display = server.connect();
    let mut client = Client::new(
        Mode::Import {
            handle: handle.to_string(),
        },
        TetherConfig::default(),
        ShutdownFlag::new(),
    );
    client.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut client, &mut display);
    (client, display)
}

#[test]
fn test_importer_stacks_above_exporter() {
    let server = HeadlessServer::new();
    let published = MemoryPublisher::new();
    let (exp_client, exp_display) = exporter(&server, published.clone());

    assert_eq!(published.handles(), vec![TOKEN.to_string()]);
    let exporter = exp_client.exporter().unwrap();
    assert_eq!(exporter.state(), &ExportState::Exported(TOKEN.to_string()));
    assert_eq!(server.live_handles(), vec![TOKEN.to_string()]);

    let (imp_client, imp_display) = importer(&server, TOKEN);
    let importer = imp_client.importer().unwrap();
    assert_eq!(importer.state(), ImportState::Linked);
    assert_eq!(importer.handle(), TOKEN);

    let child = imp_display.surface_key(imp_client.window(0).unwrap().surface());
    let parent = exp_display.surface_key(exp_client.window(0).unwrap().surface());
    assert_eq!(server.parent_of(child), Some(parent));
    assert!(server.is_stacked_above(child, parent));
    assert!(exp_display.protocol_errors().is_empty());
    assert!(imp_display.protocol_errors().is_empty());
}

#[test]
fn test_import_happens_before_first_commit() {
    let server = HeadlessServer::new();
    let (_exp_client, _exp_display) = exporter(&server, MemoryPublisher::new());
    let (imp_client, imp_display) = importer(&server, TOKEN);
    let surface = imp_client.window(0).unwrap().surface();

    let requests = imp_display.requests();
    let import = requests
        .iter()
        .position(|r| matches!(r, Request::ImportToplevel { handle, .. } if handle == TOKEN))
        .unwrap();
    let set_parent_of = requests
        .iter()
        .position(|r| matches!(r, Request::SetParentOf { surface: s, .. } if *s == surface))
        .unwrap();
    let first_commit = requests
        .iter()
        .position(|r| *r == Request::Commit { surface })
        .unwrap();
    assert!(import < set_parent_of);
    assert!(set_parent_of < first_commit);
}

#[test]
fn test_export_waits_for_configure() {
    let server = HeadlessServer::new();
    let mut display = server.connect();
    let mut registry = GlobalRegistry::new();
    registry.bind_all(&mut display, &server.globals()).unwrap();

    let window = Window::create(
        &mut display,
        registry.get(Interface::Compositor).unwrap(),
        registry.get(Interface::WmBase).unwrap(),
        WindowSettings::new("early", "early", 100, 100),
    )
    .unwrap();
    let mut exporter = Exporter::new(registry.get(Interface::Exporter).unwrap());

    let err = exporter.export(&mut display, &window).unwrap_err();
    assert!(matches!(err, ForeignError::NotConfigured(s) if s == window.surface()));
    assert_eq!(exporter.state(), &ExportState::Idle);
    assert!(!display
        .requests()
        .iter()
        .any(|r| matches!(r, Request::ExportToplevel { .. })));
}

#[test]
fn test_export_is_requested_once() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = exporter(&server, MemoryPublisher::new());
    let toplevel = client.window(0).unwrap().toplevel();

    display.configure(toplevel, 640, 480).unwrap();
    pump_until_idle(&mut client, &mut display);

    let exports = display
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::ExportToplevel { .. }))
        .count();
    assert_eq!(exports, 1);
    assert_eq!(client.exporter().unwrap().handle(), Some(TOKEN));
}

#[test]
fn test_revoked_handle_keeps_importer_running() {
    let server = HeadlessServer::new();
    let (exp_client, exp_display) = exporter(&server, MemoryPublisher::new());
    let (mut imp_client, mut imp_display) = importer(&server, TOKEN);
    let child = imp_display.surface_key(imp_client.window(0).unwrap().surface());

    // Exporter process goes away
    drop(exp_client);
    drop(exp_display);
    assert!(server.live_handles().is_empty());
    assert_eq!(imp_display.pending_events(), 1);

    pump_until_idle(&mut imp_client, &mut imp_display);
    assert_eq!(imp_client.importer().unwrap().state(), ImportState::Revoked);
    assert_eq!(server.parent_of(child), None);
    assert!(imp_client.window(0).unwrap().is_configured());
    assert!(!imp_client.shutdown().is_requested());
    assert!(imp_display.protocol_errors().is_empty());
}

#[test]
fn test_exporter_teardown_revokes_handle() {
    let server = HeadlessServer::new();
    let (mut exp_client, mut exp_display) = exporter(&server, MemoryPublisher::new());
    let (mut imp_client, mut imp_display) = importer(&server, TOKEN);

    exp_client.teardown(&mut exp_display);
    assert_eq!(exp_client.exporter().unwrap().state(), &ExportState::Revoked);
    assert!(server.live_handles().is_empty());
    assert!(exp_display.protocol_errors().is_empty());

    pump_until_idle(&mut imp_client, &mut imp_display);
    assert_eq!(imp_client.importer().unwrap().state(), ImportState::Revoked);
}

#[test]
fn test_unknown_handle_runs_unparented() {
    let server = HeadlessServer::new();
    let (client, display) = importer(&server, "doesnotexist");

    assert_eq!(client.importer().unwrap().state(), ImportState::Revoked);
    let window = client.window(0).unwrap();
    assert!(window.is_configured());
    assert_eq!(server.parent_of(display.surface_key(window.surface())), None);
    assert!(!client.shutdown().is_requested());
}

#[test]
fn test_importer_without_foreign_support_runs_alone() {
    let server = HeadlessServer::new();
    server.set_globals(
        server
            .globals()
            .into_iter()
            .filter(|g| g.interface != "zxdg_importer_v2")
            .collect(),
    );
    let (client, _display) = importer(&server, TOKEN);
    assert!(client.importer().is_none());
    assert!(client.window(0).unwrap().is_configured());
}

#[test]
fn test_handle_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handle");

    let server = HeadlessServer::new();
    server.set_next_token(TOKEN);
    let mut display = server.connect();
    let mut client = Client::new(Mode::Export, TetherConfig::default(), ShutdownFlag::new());
    client.add_handle_publisher(Box::new(FilePublisher::new(&path)));
    client.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut client, &mut display);

    assert_eq!(read_handle_file(&path).unwrap(), TOKEN);
    let (imp_client, _imp_display) = importer(&server, &read_handle_file(&path).unwrap());
    assert_eq!(imp_client.importer().unwrap().state(), ImportState::Linked);
}

#[test]
fn test_failed_publisher_does_not_drop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let server = HeadlessServer::new();
    server.set_next_token(TOKEN);
    let mut display = server.connect();
    let published = MemoryPublisher::new();
    let mut client = Client::new(Mode::Export, TetherConfig::default(), ShutdownFlag::new());
    client.add_handle_publisher(Box::new(FilePublisher::new(dir.path().join("missing/handle"))));
    client.add_handle_publisher(Box::new(published.clone()));
    client.bootstrap(&mut display, &server.globals()).unwrap();

    // Configure maps the window and requests the export
    client.pump(&mut display).unwrap();
    assert_eq!(client.exporter().unwrap().state(), &ExportState::Exporting);

    // Handle event and a click arrive together; publishing to the file fails
    display.send_button(0x110, true);
    client.pump(&mut display).unwrap();

    assert_eq!(
        client.exporter().unwrap().state(),
        &ExportState::Exported(TOKEN.to_string())
    );
    assert_eq!(published.handles(), vec![TOKEN.to_string()]);
    assert_eq!(client.render().toggles, 1);
    assert!(!client.shutdown().is_requested());
}
