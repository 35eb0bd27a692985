// Size-sync integration tests for tether
//
// A leader publishes its configured size, a follower picks it up and resizes,
// over both the polled file and the local socket transport.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use tether::headless::{HeadlessDisplay, HeadlessServer};
use tether::sync::{self, SharedSize, SizeFile, SizeSource, SocketSizeReceiver, SocketSizeSender};
use tether::{Client, Mode, ShutdownFlag, SyncTransport, TetherConfig, TetherError, TransportError};

fn pump_until_idle(client: &mut Client, display: &mut HeadlessDisplay) {
    loop {
        match client.pump(display) {
            Ok(_) => {}
            Err(TetherError::Transport(TransportError::Drained)) => break,
            Err(e) => panic!("pump failed: {}", e),
        }
    }
}

fn client(server: &HeadlessServer, mode: Mode) -> (Client, HeadlessDisplay) {
    let _ = env_logger::builder().is_test(true).try_init();
    let display = server.connect();
    let client = Client::new(mode, TetherConfig::default(), ShutdownFlag::new());
    (client, display)
}

#[test]
fn test_follower_applies_size_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("share_data.txt");
    fs::write(&path, "500\n600\n").unwrap();

    let server = HeadlessServer::new();
    let (mut follower, mut display) = client(&server, Mode::Follow);
    follower.set_size_source(Box::new(SizeFile::new(&path)));
    follower.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut follower, &mut display);

    let window = follower.window(0).unwrap();
    assert_eq!(window.title(), "Follower Window");
    assert_eq!(window.size(), (600, 500));
    let buffer = window.buffer().unwrap();
    assert_eq!(buffer.size(), 600 * 500 * 4);
    assert_eq!(buffer.pixel(599, 499), Some(0xFF646464));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_follower_ignores_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("share_data.txt");
    fs::write(&path, "500\n").unwrap();

    let server = HeadlessServer::new();
    let (mut follower, mut display) = client(&server, Mode::Follow);
    follower.set_size_source(Box::new(SizeFile::new(&path)));
    follower.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut follower, &mut display);
    assert_eq!(follower.window(0).unwrap().size(), (400, 400));

    // Writer finished; the next batch picks it up
    fs::write(&path, "500\n600\n").unwrap();
    let toplevel = follower.window(0).unwrap().toplevel();
    display.configure(toplevel, 0, 0).unwrap();
    pump_until_idle(&mut follower, &mut display);
    assert_eq!(follower.window(0).unwrap().size(), (600, 500));
}

#[test]
fn test_follower_retries_after_failed_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("share_data.txt");
    let server = HeadlessServer::new();
    let (mut follower, mut display) = client(&server, Mode::Follow);
    follower.set_size_source(Box::new(SizeFile::new(&path)));
    follower.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut follower, &mut display);
    let window = follower.window(0).unwrap();
    let (toplevel, original) = (window.toplevel(), window.buffer().unwrap().id());

    // The leader's size shows up while shared memory is exhausted
    fs::write(&path, "500\n600\n").unwrap();
    follower.shm_pool().unwrap().fail_next(1);
    display.configure(toplevel, 0, 0).unwrap();
    pump_until_idle(&mut follower, &mut display);
    let window = follower.window(0).unwrap();
    assert_eq!(window.size(), (400, 400));
    assert_eq!(window.buffer().unwrap().id(), original);

    // The file did not change, the next batch still applies it
    display.configure(toplevel, 0, 0).unwrap();
    pump_until_idle(&mut follower, &mut display);
    let window = follower.window(0).unwrap();
    assert_eq!(window.size(), (600, 500));
    assert_ne!(window.buffer().unwrap().id(), original);
    assert!(!display.is_alive(original));
    assert!(display.protocol_errors().is_empty());
}

#[test]
fn test_leader_to_follower_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("share_data.txt");
    let server = HeadlessServer::new();
    server.set_initial_size(800, 600);

    let (mut leader, mut leader_display) = client(&server, Mode::Lead);
    leader.set_size_publisher(sync::publisher(SyncTransport::File, &path));
    leader.bootstrap(&mut leader_display, &server.globals()).unwrap();
    pump_until_idle(&mut leader, &mut leader_display);
    assert_eq!(fs::read_to_string(&path).unwrap(), "600\n800\n");

    let (mut follower, mut follower_display) = client(&server, Mode::Follow);
    follower.set_size_source(sync::source(SyncTransport::File, &path).unwrap());
    follower.bootstrap(&mut follower_display, &server.globals()).unwrap();
    pump_until_idle(&mut follower, &mut follower_display);
    assert_eq!(follower.window(0).unwrap().size(), (800, 600));

    // Leader gets resized, follower catches up on its next batch
    let toplevel = leader.window(0).unwrap().toplevel();
    leader_display.configure(toplevel, 1024, 768).unwrap();
    pump_until_idle(&mut leader, &mut leader_display);
    assert_eq!(fs::read_to_string(&path).unwrap(), "768\n1024\n");

    let toplevel = follower.window(0).unwrap().toplevel();
    follower_display.configure(toplevel, 0, 0).unwrap();
    pump_until_idle(&mut follower, &mut follower_display);
    assert_eq!(follower.window(0).unwrap().size(), (1024, 768));
}

#[test]
fn test_leader_to_follower_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("size.sock");
    let server = HeadlessServer::new();
    server.set_initial_size(640, 360);

    let (mut follower, mut follower_display) = client(&server, Mode::Follow);
    follower.set_size_source(Box::new(SocketSizeReceiver::bind(&path).unwrap()));
    follower.bootstrap(&mut follower_display, &server.globals()).unwrap();
    pump_until_idle(&mut follower, &mut follower_display);

    let (mut leader, mut leader_display) = client(&server, Mode::Lead);
    leader.set_size_publisher(Box::new(SocketSizeSender::new(&path)));
    leader.bootstrap(&mut leader_display, &server.globals()).unwrap();
    pump_until_idle(&mut leader, &mut leader_display);

    // Follower only looks at the socket between batches; keep feeding it some
    let toplevel = follower.window(0).unwrap().toplevel();
    let deadline = Instant::now() + Duration::from_secs(5);
    while follower.window(0).unwrap().size() != (640, 360) {
        assert!(Instant::now() < deadline, "follower never saw the leader's size");
        thread::sleep(Duration::from_millis(10));
        follower_display.configure(toplevel, 0, 0).unwrap();
        pump_until_idle(&mut follower, &mut follower_display);
    }
    assert!(follower_display.protocol_errors().is_empty());
}

#[test]
fn test_socket_sender_without_follower_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nobody.sock");
    let server = HeadlessServer::new();

    let (mut leader, mut display) = client(&server, Mode::Lead);
    leader.set_size_publisher(Box::new(SocketSizeSender::new(&path)));
    leader.bootstrap(&mut display, &server.globals()).unwrap();
    pump_until_idle(&mut leader, &mut display);
    assert!(leader.window(0).unwrap().is_configured());

    // A follower showing up later still gets the size on the next retry
    let mut receiver = SocketSizeReceiver::bind(&path).unwrap();
    let toplevel = leader.window(0).unwrap().toplevel();
    let deadline = Instant::now() + Duration::from_secs(5);
    let size = loop {
        display.configure(toplevel, 0, 0).unwrap();
        pump_until_idle(&mut leader, &mut display);
        if let Some(size) = receiver.poll().unwrap() {
            break size;
        }
        assert!(Instant::now() < deadline, "size never delivered");
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(size, SharedSize::new(400, 400));
}
