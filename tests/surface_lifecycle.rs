// Surface lifecycle integration tests for tether
//
// Drives whole clients against the headless compositor: the first configure,
// resizes, frame pacing, input and the teardown order.

use std::cell::RefCell;
use std::rc::Rc;

use tether::headless::{HeadlessDisplay, HeadlessServer, Request};
use tether::input::KEY_ESC;
use tether::registry::Interface;
use tether::window::SurfaceState;
use tether::{Client, Mode, ObjectId, RenderTarget, ShutdownFlag, TetherConfig, TetherError, TransportError};

const BTN_LEFT: u32 = 0x110;

fn start(server: &HeadlessServer, mode: Mode) -> (Client, HeadlessDisplay) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut display = server.connect();
    let mut client = Client::new(mode, TetherConfig::default(), ShutdownFlag::new());
    client.bootstrap(&mut display, &server.globals()).unwrap();
    (client, display)
}

fn pump_until_idle(client: &mut Client, display: &mut HeadlessDisplay) {
    loop {
        match client.pump(display) {
            Ok(_) => {}
            Err(TetherError::Transport(TransportError::Drained)) => break,
            Err(e) => panic!("pump failed: {}", e),
        }
    }
}

fn position(requests: &[Request], wanted: &Request) -> usize {
    requests
        .iter()
        .position(|r| r == wanted)
        .unwrap_or_else(|| panic!("{:?} was never sent", wanted))
}

#[test]
fn test_first_configure_maps_window() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    let window = client.window(0).unwrap();
    assert_eq!(window.state(), SurfaceState::AwaitingFirstConfigure);
    assert!(window.buffer().is_none());
    let (surface, xdg_surface, toplevel) = (window.surface(), window.xdg_surface(), window.toplevel());

    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    assert!(window.is_configured());
    assert_eq!(window.size(), (400, 400));
    let buffer = window.buffer().unwrap();
    assert_eq!(buffer.pixel(0, 0), Some(0xFFFFFFFF));
    assert_eq!(buffer.pixel(399, 399), Some(0xFFFFFFFF));
    assert!(display.is_mapped(surface));
    assert_eq!(
        display.toplevel_metadata(toplevel),
        Some(("Controller Window".to_string(), "controller".to_string()))
    );

    // Initial commit, ack, buffer, attach, commit
    let requests = display.requests();
    let first_commit = position(&requests, &Request::Commit { surface });
    let ack = position(&requests, &Request::AckConfigure { xdg_surface, serial: 1 });
    let attach = position(
        &requests,
        &Request::Attach {
            surface,
            buffer: Some(buffer.id()),
        },
    );
    assert!(first_commit < ack);
    assert!(ack < attach);
    assert!(requests[attach..].contains(&Request::Commit { surface }));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_compositor_size_wins_over_default() {
    let server = HeadlessServer::new();
    server.set_initial_size(800, 600);
    let (mut client, mut display) = start(&server, Mode::Export);
    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    assert_eq!(window.size(), (800, 600));
    let buffer = window.buffer().unwrap();
    assert_eq!(buffer.stride(), 3200);
    assert_eq!(buffer.size(), 1_920_000);
}

#[test]
fn test_resize_replaces_buffer_after_commit() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    let (surface, toplevel) = (window.surface(), window.toplevel());
    let old = window.buffer().unwrap().id();

    display.configure(toplevel, 640, 480).unwrap();
    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    assert_eq!(window.size(), (640, 480));
    let new = window.buffer().unwrap().id();
    assert_ne!(old, new);

    let requests = display.requests();
    let destroyed = position(&requests, &Request::Destroy { object: old });
    let destroy_count = requests
        .iter()
        .filter(|r| **r == Request::Destroy { object: old })
        .count();
    assert_eq!(destroy_count, 1);
    let last_commit = requests
        .iter()
        .rposition(|r| *r == Request::Commit { surface })
        .unwrap();
    assert!(last_commit < destroyed);
    assert!(!display.is_alive(old));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_same_size_configure_keeps_buffer() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    pump_until_idle(&mut client, &mut display);
    let window = client.window(0).unwrap();
    let (toplevel, old) = (window.toplevel(), window.buffer().unwrap().id());

    display.configure(toplevel, 400, 400).unwrap();
    display.configure(toplevel, 0, 0).unwrap();
    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    assert_eq!(window.size(), (400, 400));
    assert_eq!(window.buffer().unwrap().id(), old);
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_resize_listener_sees_every_size() {
    let server = HeadlessServer::new();
    let mut display = server.connect();
    let seen = Rc::new(RefCell::new(Vec::<RenderTarget>::new()));
    let sink = seen.clone();

    let mut client = Client::new(Mode::Lead, TetherConfig::default(), ShutdownFlag::new());
    client.add_resize_listener(Box::new(move |target: RenderTarget| sink.borrow_mut().push(target)));
    client.bootstrap(&mut display, &server.globals()).unwrap();
    assert!(client.render_target().is_none());

    pump_until_idle(&mut client, &mut display);
    let toplevel = client.window(0).unwrap().toplevel();
    display.configure(toplevel, 300, 200).unwrap();
    pump_until_idle(&mut client, &mut display);

    let sizes: Vec<(u32, u32)> = seen.borrow().iter().map(|t| (t.width, t.height)).collect();
    assert_eq!(sizes, vec![(400, 400), (300, 200)]);
    assert_eq!(client.render_target(), seen.borrow().last().copied());
}

#[test]
fn test_frame_limit_stops_paced_loop() {
    let server = HeadlessServer::new();
    server.set_auto_present(true);
    let mut display = server.connect();
    let mut client =
        Client::new(Mode::Export, TetherConfig::default(), ShutdownFlag::new()).with_frame_limit(Some(3));
    client.bootstrap(&mut display, &server.globals()).unwrap();

    client.run(&mut display).unwrap();

    assert_eq!(client.render().frames, 3);
    assert!(client.shutdown().is_requested());
    assert!(client.is_torn_down());
    assert!(client.windows().is_empty());
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_close_request_tears_down_in_order() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    pump_until_idle(&mut client, &mut display);
    let window = client.window(0).unwrap();
    let (surface, xdg_surface, toplevel) = (window.surface(), window.xdg_surface(), window.toplevel());
    let buffer = window.buffer().unwrap().id();

    display.close(toplevel);
    client.run(&mut display).unwrap();
    assert!(client.is_torn_down());

    let requests = display.requests();
    let order: Vec<usize> = [toplevel, xdg_surface, surface, buffer]
        .into_iter()
        .map(|object| position(&requests, &Request::Destroy { object }))
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", order);
    assert!(!display.is_alive(surface));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_escape_quits_and_button_swaps_colors() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Export);
    pump_until_idle(&mut client, &mut display);
    assert!(client.input().keyboard().is_some());
    assert!(client.input().pointer().is_some());

    let (first, second) = (client.render().first_color, client.render().second_color);
    display.send_motion(12.0, 34.0);
    display.send_button(BTN_LEFT, true);
    display.send_button(BTN_LEFT, false);
    pump_until_idle(&mut client, &mut display);
    assert_eq!(client.render().toggles, 1);
    assert_eq!(client.render().first_color, second);
    assert_eq!(client.render().second_color, first);
    assert_eq!(client.input().pointer_position(), (12.0, 34.0));
    assert!(!client.shutdown().is_requested());

    display.send_key(KEY_ESC, false);
    pump_until_idle(&mut client, &mut display);
    assert!(!client.shutdown().is_requested());

    display.send_key(KEY_ESC, true);
    client.run(&mut display).unwrap();
    assert!(client.shutdown().is_requested());
    assert!(client.is_torn_down());
}

#[test]
fn test_pair_child_is_parented_before_first_commit() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Pair);
    pump_until_idle(&mut client, &mut display);

    let parent = client.window(0).unwrap();
    let child = client.window(1).unwrap();
    assert_eq!(parent.title(), "Parent");
    assert_eq!(child.title(), "Child");
    assert_eq!(parent.size(), (400, 400));
    assert_eq!(child.size(), (200, 200));
    assert_eq!(parent.buffer().unwrap().pixel(0, 0), Some(0xFF0000FF));
    assert_eq!(child.buffer().unwrap().pixel(0, 0), Some(0xFF00FF00));
    assert_eq!(display.toplevel_parent(child.toplevel()), Some(parent.toplevel()));

    let requests = display.requests();
    let set_parent = position(
        &requests,
        &Request::SetParent {
            toplevel: child.toplevel(),
            parent: Some(parent.toplevel()),
        },
    );
    let child_commit = position(&requests, &Request::Commit { surface: child.surface() });
    assert!(set_parent < child_commit);

    // Child goes first on teardown
    let (parent_surface, child_surface) = (parent.surface(), child.surface());
    client.teardown(&mut display);
    let requests = display.requests();
    let child_gone = position(&requests, &Request::Destroy { object: child_surface });
    let parent_gone = position(&requests, &Request::Destroy { object: parent_surface });
    assert!(child_gone < parent_gone);
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_missing_required_global_is_fatal() {
    let server = HeadlessServer::new();
    server.set_globals(
        server
            .globals()
            .into_iter()
            .filter(|g| g.interface != "wl_shm")
            .collect(),
    );
    let mut display = server.connect();
    let mut client = Client::new(Mode::Pair, TetherConfig::default(), ShutdownFlag::new());
    let err = client.bootstrap(&mut display, &server.globals()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("wl_shm"), "{}", err);
    assert!(client.windows().is_empty());
    assert!(!display
        .requests()
        .iter()
        .any(|r| matches!(r, Request::CreateSurface { .. })));
}

#[test]
fn test_unknown_objects_are_ignored_on_destroy() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    pump_until_idle(&mut client, &mut display);
    tether::Display::destroy(&mut display, ObjectId(9999));
    client.teardown(&mut display);
    client.teardown(&mut display);
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_dispatch_failure_is_fatal_and_tears_down() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Export);
    pump_until_idle(&mut client, &mut display);

    let window = client.window(0).unwrap();
    let (surface, xdg_surface, toplevel) = (window.surface(), window.xdg_surface(), window.toplevel());
    let buffer = window.buffer().unwrap().id();
    let keyboard = client.input().keyboard().unwrap();
    let pointer = client.input().pointer().unwrap();
    let seat = client.registry().get(Interface::Seat).unwrap();
    let compositor = client.registry().get(Interface::Compositor).unwrap();

    display.fail_next_dispatch("connection reset by peer");
    let err = client.run(&mut display).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, TetherError::Transport(TransportError::Dispatch(_))), "{}", err);
    assert!(client.is_torn_down());
    assert!(client.windows().is_empty());
    assert!(!client.shutdown().is_requested());

    // Role objects, surface, buffer, input devices, then globals
    let requests = display.requests();
    let order: Vec<usize> = [toplevel, xdg_surface, surface, buffer, keyboard, seat, compositor]
        .into_iter()
        .map(|object| position(&requests, &Request::Destroy { object }))
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", order);
    assert!(position(&requests, &Request::Destroy { object: pointer }) < order[5]);
    assert!(!display.is_alive(surface));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_shutdown_before_run_skips_dispatch() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    let xdg_surface = client.window(0).unwrap().xdg_surface();
    let queued = display.pending_events();
    assert!(queued > 0);

    // A signal landing before the loop starts
    client.shutdown().request();
    client.run(&mut display).unwrap();

    assert!(client.is_torn_down());
    assert_eq!(display.pending_events(), queued);
    assert!(!display
        .requests()
        .iter()
        .any(|r| matches!(r, Request::AckConfigure { xdg_surface: x, .. } if *x == xdg_surface)));
}

#[test]
fn test_shutdown_mid_batch_is_seen_after_the_batch() {
    let server = HeadlessServer::new();
    let (mut client, mut display) = start(&server, Mode::Lead);
    pump_until_idle(&mut client, &mut display);

    let flag = client.shutdown().clone();
    client.add_resize_listener(Box::new(move |target: RenderTarget| {
        if (target.width, target.height) == (300, 200) {
            flag.request();
        }
    }));
    let toplevel = client.window(0).unwrap().toplevel();
    display.configure(toplevel, 300, 200).unwrap();
    display.send_motion(5.0, 6.0);

    client.run(&mut display).unwrap();

    // The rest of the batch was still handled
    assert_eq!(client.input().pointer_position(), (5.0, 6.0));
    assert!(client.shutdown().is_requested());
    assert!(client.is_torn_down());
    // The release for the resized buffer was never dispatched
    assert_eq!(display.pending_events(), 1);
}
