//! Test helpers: a fake peer on a real Unix socket, driven from the test
//! thread alongside the client's [`PollReactor`].

use crate::reactor::poll::PollReactor;
use crate::transport::Endpoint;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Monotonic counter to generate unique socket paths per test.
static TEST_ID: AtomicU32 = AtomicU32::new(0);

/// How long any single wait in a test may take before it fails.
pub(crate) const PATIENCE: Duration = Duration::from_secs(3);

/// Create a unique temporary socket path for each test.
pub(crate) fn tmp_socket_path(tag: &str) -> PathBuf {
    let id = TEST_ID.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("barlink-{}-{}-{}.sock", tag, std::process::id(), id))
}

/// The server side of a test connection.
pub(crate) struct Peer {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl Peer {
    /// A peer whose socket path is reserved but not yet listening.
    pub(crate) fn unbound(tag: &str) -> Self {
        let path = tmp_socket_path(tag);
        let _ = std::fs::remove_file(&path);
        Self {
            path,
            listener: None,
        }
    }

    pub(crate) fn bind(tag: &str) -> Self {
        let mut peer = Self::unbound(tag);
        peer.listen();
        peer
    }

    pub(crate) fn listen(&mut self) {
        let listener = UnixListener::bind(&self.path).expect("bind test socket");
        listener.set_nonblocking(true).expect("nonblocking listener");
        self.listener = Some(listener);
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::Unix(self.path.clone())
    }

    /// Accept the client's next connection, turning the reactor meanwhile
    /// so pending reconnect timers can fire.
    pub(crate) fn accept(&self, reactor: &PollReactor) -> UnixStream {
        let listener = self.listener.as_ref().expect("peer is listening");
        let deadline = Instant::now() + PATIENCE;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).expect("nonblocking stream");
                    return stream;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "client never connected");
                    reactor.turn(Some(Duration::from_millis(5))).expect("reactor turn");
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Pump the reactor and collect what the client writes until `done` holds.
pub(crate) fn read_until(
    stream: &mut impl Read,
    reactor: &PollReactor,
    done: impl Fn(&[u8]) -> bool,
) -> Vec<u8> {
    let mut received = Vec::new();
    let deadline = Instant::now() + PATIENCE;
    while !done(&received) {
        assert!(
            Instant::now() < deadline,
            "timed out; received so far: {:?}",
            String::from_utf8_lossy(&received)
        );
        reactor.turn(Some(Duration::from_millis(5))).expect("reactor turn");
        received.extend(drain(stream));
    }
    received
}

/// Read whatever is immediately available.
pub(crate) fn drain(stream: &mut impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("peer read failed: {}", e),
        }
    }
    out
}

/// Write `bytes` in pieces of `chunk` bytes, turning the reactor after each
/// piece so the client sees them as separate readiness events.
pub(crate) fn send_in_chunks(
    stream: &mut impl Write,
    reactor: &PollReactor,
    bytes: &[u8],
    chunk: usize,
) {
    for piece in bytes.chunks(chunk.max(1)) {
        stream.write_all(piece).expect("peer write");
        reactor.turn(Some(Duration::from_millis(5))).expect("reactor turn");
    }
}

/// Turn the reactor until `done` holds, failing the test after [`PATIENCE`].
pub(crate) fn settle(reactor: &PollReactor, done: impl FnMut() -> bool) {
    assert!(
        reactor.run_until(PATIENCE, done).expect("reactor run"),
        "condition not reached in time"
    );
}
