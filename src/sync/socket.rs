//! Local socket size channel carrying `{"height":H,"width":W}` lines
//!
//! The follower owns the socket and never blocks on it. The leader connects
//! on demand and, after losing the connection, reconnects and resends the
//! last size on the next [`SizePublisher::retry`].

use super::{SharedSize, SizePublisher, SizeSource};
use crate::error::SyncError;
use interprocess::local_socket::{LocalSocketListener, LocalSocketStream};
use log::{debug, info, trace, warn};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Longest unterminated message a leader may leave in the buffer
const MAX_PENDING: usize = 4096;

struct Peer {
    stream: LocalSocketStream,
    pending: Vec<u8>,
    closed: bool,
}

/// Follower end: listens for leaders, keeps the latest complete message
pub struct SocketSizeReceiver {
    path: PathBuf,
    listener: LocalSocketListener,
    peers: Vec<Peer>,
    last_seen: Option<SharedSize>,
}

impl SocketSizeReceiver {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = LocalSocketListener::bind(path.as_path())?;
        listener.set_nonblocking(true)?;
        info!("🔌 Listening for sizes on {}", path.display());
        Ok(Self {
            path,
            listener,
            peers: Vec::new(),
            last_seen: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn accept_pending(&mut self) -> Result<(), SyncError> {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    debug!("Leader connected to {}", self.path.display());
                    self.peers.push(Peer {
                        stream,
                        pending: Vec::new(),
                        closed: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Peer {
    /// Drain everything readable, returning the last valid message. A peer
    /// that sends more than [`MAX_PENDING`] bytes without a newline is dropped.
    fn read_latest(&mut self) -> Option<SharedSize> {
        let mut chunk = [0u8; 512];
        let mut latest = None;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if let Some(size) = self.take_lines() {
                        latest = Some(size);
                    }
                    if self.pending.len() > MAX_PENDING {
                        warn!(
                            "Dropping size connection: {} bytes without a newline",
                            self.pending.len()
                        );
                        self.pending.clear();
                        self.closed = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Dropping size connection: {}", e);
                    self.closed = true;
                    break;
                }
            }
        }
        latest
    }

    fn take_lines(&mut self) -> Option<SharedSize> {
        let mut latest = None;
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            match decode(&line) {
                Ok(size) if size.is_valid() => latest = Some(size),
                Ok(size) => trace!("Ignoring empty size {:?}", size),
                Err(e) => warn!("{}", e),
            }
        }
        latest
    }
}

fn decode(line: &[u8]) -> Result<SharedSize, SyncError> {
    Ok(serde_json::from_slice(line)?)
}

impl SizeSource for SocketSizeReceiver {
    fn poll(&mut self) -> Result<Option<SharedSize>, SyncError> {
        self.accept_pending()?;

        let mut latest = None;
        for peer in &mut self.peers {
            if let Some(size) = peer.read_latest() {
                latest = Some(size);
            }
        }
        self.peers.retain(|p| !p.closed);

        match latest {
            Some(size) if self.last_seen != Some(size) => {
                self.last_seen = Some(size);
                Ok(Some(size))
            }
            _ => Ok(None),
        }
    }
}

impl Drop for SocketSizeReceiver {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("⚠️ Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Leader end
pub struct SocketSizeSender {
    path: PathBuf,
    stream: Option<LocalSocketStream>,
    last: Option<SharedSize>,
    /// `last` has not been delivered on the current connection
    unsent: bool,
}

impl SocketSizeSender {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stream: None,
            last: None,
            unsent: false,
        }
    }

    fn send_last(&mut self) -> Result<(), SyncError> {
        let Some(size) = self.last else {
            return Ok(());
        };

        if self.stream.is_none() {
            match LocalSocketStream::connect(self.path.as_path()) {
                Ok(stream) => {
                    debug!("Connected to follower at {}", self.path.display());
                    self.stream = Some(stream);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    trace!("No follower at {} yet", self.path.display());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut line = serde_json::to_vec(&size)?;
        line.push(b'\n');
        if let Some(stream) = self.stream.as_mut() {
            match stream.write_all(&line).and_then(|_| stream.flush()) {
                Ok(()) => self.unsent = false,
                Err(e) => {
                    debug!("Follower went away: {}", e);
                    self.stream = None;
                }
            }
        }
        Ok(())
    }
}

impl SizePublisher for SocketSizeSender {
    fn publish(&mut self, size: SharedSize) -> Result<(), SyncError> {
        if self.last == Some(size) && !self.unsent {
            return Ok(());
        }
        self.last = Some(size);
        self.unsent = true;
        self.send_last()
    }

    fn retry(&mut self) -> Result<(), SyncError> {
        if self.unsent {
            self.send_last()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn poll_until(receiver: &mut SocketSizeReceiver) -> Option<SharedSize> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(size) = receiver.poll().unwrap() {
                return Some(size);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_sender_without_receiver_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = SocketSizeSender::new(dir.path().join("size.sock"));
        sender.publish(SharedSize::new(600, 500)).unwrap();
        sender.retry().unwrap();
    }

    #[test]
    fn test_late_receiver_gets_last_size_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size.sock");
        let mut sender = SocketSizeSender::new(&path);
        sender.publish(SharedSize::new(320, 240)).unwrap();
        sender.publish(SharedSize::new(600, 500)).unwrap();

        let mut receiver = SocketSizeReceiver::bind(&path).unwrap();
        sender.retry().unwrap();
        assert_eq!(poll_until(&mut receiver), Some(SharedSize::new(600, 500)));
    }

    #[test]
    fn test_receiver_reports_each_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size.sock");
        let mut receiver = SocketSizeReceiver::bind(&path).unwrap();
        let mut sender = SocketSizeSender::new(&path);

        sender.publish(SharedSize::new(600, 500)).unwrap();
        assert_eq!(poll_until(&mut receiver), Some(SharedSize::new(600, 500)));
        sender.publish(SharedSize::new(600, 500)).unwrap();
        assert_eq!(receiver.poll().unwrap(), None);
    }

    #[test]
    fn test_unterminated_flood_drops_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size.sock");
        let mut receiver = SocketSizeReceiver::bind(&path).unwrap();

        let mut flood = LocalSocketStream::connect(path.as_path()).unwrap();
        flood.write_all(&[b'x'; 2 * MAX_PENDING]).unwrap();
        flood.flush().unwrap();

        // Already queued and fully buffered locally, so one poll sees it all
        assert_eq!(receiver.poll().unwrap(), None);
        assert!(receiver.peers.is_empty());

        // Well-behaved leaders still get through
        let mut sender = SocketSizeSender::new(&path);
        sender.publish(SharedSize::new(640, 480)).unwrap();
        assert_eq!(poll_until(&mut receiver), Some(SharedSize::new(640, 480)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"500 600\n"), Err(SyncError::Malformed(_))));
        assert_eq!(
            decode(b"{\"height\":1,\"width\":2}\n").unwrap(),
            SharedSize::new(2, 1)
        );
    }
}
