//! Stream sockets the client can connect to.
//!
//! Connecting never blocks the caller.  Unix sockets connect immediately or
//! fail.  TCP endpoints go through a [`Dialer`]: host names are resolved on
//! a helper thread, then each resolved address is tried with a
//! non-blocking `connect(2)` whose completion is reported by writability.

use log::debug;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use crate::traits::Interest;

/// Where the peer listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A Unix stream socket path.
    Unix(PathBuf),
    /// A `host:port` TCP address.
    Tcp(String),
}

impl Endpoint {
    /// Start a non-blocking connection.
    pub fn connect(&self) -> io::Result<Dial> {
        match self {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_nonblocking(true)?;
                Ok(Dial::Connected(Stream::Unix(stream)))
            }
            Endpoint::Tcp(addr) => Dialer::start(addr),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Result of [`Endpoint::connect`].
#[derive(Debug)]
pub enum Dial {
    Connected(Stream),
    /// Still resolving or handshaking; drive it with [`Dialer::advance`].
    Pending(Dialer),
}

/// A TCP connection in progress.
///
/// Watch [`fd`](Self::fd) for [`interest`](Self::interest) and call
/// [`advance`](Self::advance) on every readiness event.  Both may change
/// from one step to the next, so the watch is re-registered each time.
#[derive(Debug)]
pub struct Dialer {
    state: DialState,
    last_error: Option<io::Error>,
}

#[derive(Debug)]
enum DialState {
    /// Waiting for the resolver thread, which writes one byte to `wake`
    /// after sending its answer.
    Resolving {
        answer: Receiver<io::Result<Vec<SocketAddr>>>,
        wake: UnixStream,
    },
    Connecting {
        socket: TcpStream,
        remaining: VecDeque<SocketAddr>,
    },
}

impl Dialer {
    fn start(addr: &str) -> io::Result<Dial> {
        if let Ok(addr) = addr.parse::<SocketAddr>() {
            return Self::try_addresses(VecDeque::from([addr]), None);
        }

        let (answer_tx, answer) = mpsc::channel();
        let (wake, mut notify) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        let host = addr.to_string();
        std::thread::Builder::new()
            .name("barlink-resolve".into())
            .spawn(move || {
                let resolved = host.to_socket_addrs().map(|addrs| addrs.collect());
                // The dialer may be gone by now; nobody is left to tell.
                if answer_tx.send(resolved).is_ok() {
                    let _ = notify.write_all(&[1]);
                }
            })?;
        debug!("resolving {} in the background", addr);
        Ok(Dial::Pending(Dialer {
            state: DialState::Resolving { answer, wake },
            last_error: None,
        }))
    }

    /// Connect to the first address that accepts, falling through on
    /// immediate failures.
    fn try_addresses(
        mut remaining: VecDeque<SocketAddr>,
        mut last_error: Option<io::Error>,
    ) -> io::Result<Dial> {
        while let Some(addr) = remaining.pop_front() {
            match connect_nonblocking(&addr) {
                Ok((socket, true)) => return Ok(Dial::Connected(established(socket)?)),
                Ok((socket, false)) => {
                    debug!("connecting to {}", addr);
                    return Ok(Dial::Pending(Dialer {
                        state: DialState::Connecting { socket, remaining },
                        last_error,
                    }));
                }
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to")
        }))
    }

    /// The descriptor to watch right now.
    pub fn fd(&self) -> RawFd {
        match &self.state {
            DialState::Resolving { wake, .. } => wake.as_raw_fd(),
            DialState::Connecting { socket, .. } => socket.as_raw_fd(),
        }
    }

    pub fn interest(&self) -> Interest {
        match &self.state {
            DialState::Resolving { .. } => Interest::Readable,
            DialState::Connecting { .. } => Interest::Writable,
        }
    }

    /// Make progress after a readiness event.  A still-pending dial comes
    /// back as [`Dial::Pending`].
    pub fn advance(self) -> io::Result<Dial> {
        let Dialer { state, last_error } = self;
        match state {
            DialState::Resolving { answer, mut wake } => {
                let _ = wake.read(&mut [0u8; 1]);
                match answer.try_recv() {
                    Ok(resolved) => Self::try_addresses(VecDeque::from(resolved?), last_error),
                    Err(TryRecvError::Empty) => Ok(Dial::Pending(Dialer {
                        state: DialState::Resolving { answer, wake },
                        last_error,
                    })),
                    Err(TryRecvError::Disconnected) => {
                        Err(io::Error::other("resolver thread exited"))
                    }
                }
            }
            DialState::Connecting { socket, remaining } => {
                let failure = match socket.take_error()? {
                    Some(e) => e,
                    None => match socket.peer_addr() {
                        Ok(_) => return established(socket).map(Dial::Connected),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return Ok(Dial::Pending(Dialer {
                                state: DialState::Connecting { socket, remaining },
                                last_error,
                            }));
                        }
                        Err(e) => e,
                    },
                };
                debug!("connect failed: {}", failure);
                Self::try_addresses(remaining, Some(failure))
            }
        }
    }
}

/// `socket(2)` + `connect(2)` without blocking.  The flag is `true` when
/// the connection completed immediately.
fn connect_nonblocking(addr: &SocketAddr) -> io::Result<(TcpStream, bool)> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owned from here on, so every early return closes it.
    let socket = unsafe { TcpStream::from_raw_fd(fd) };
    socket.set_nonblocking(true)?;

    let (storage, len) = socketaddr_to_storage(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok((socket, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok((socket, false))
    } else {
        Err(err)
    }
}

fn socketaddr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sa.sin_family = libc::AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sa.sin6_family = libc::AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn established(socket: TcpStream) -> io::Result<Stream> {
    socket.set_nodelay(true)?;
    Ok(Stream::Tcp(socket))
}

/// A connected stream socket.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::net::UnixListener;
    use std::time::{Duration, Instant};

    /// Advance a dial to completion, polling every few milliseconds.
    fn finish(dial: io::Result<Dial>) -> io::Result<Stream> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut dial = dial?;
        loop {
            match dial {
                Dial::Connected(stream) => return Ok(stream),
                Dial::Pending(dialer) => {
                    assert!(Instant::now() < deadline, "dial never finished");
                    std::thread::sleep(Duration::from_millis(2));
                    dial = dialer.advance()?;
                }
            }
        }
    }

    #[test]
    fn unix_connect_is_nonblocking() {
        let name = format!("barlink-transport-{}.sock", std::process::id());
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let mut stream = finish(Endpoint::Unix(path.clone()).connect()).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut stream = finish(Endpoint::Tcp(addr).connect()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        stream.write_all(b"ping\n").unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");
    }

    #[test]
    fn host_names_are_resolved_off_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dial = Endpoint::Tcp(format!("localhost:{}", port)).connect();
        match &dial {
            Ok(Dial::Pending(dialer)) => assert_eq!(dialer.interest(), Interest::Readable),
            other => panic!("expected a pending dial, got {:?}", other),
        }
        // `localhost` may resolve to ::1 first; the dialer falls through
        // to 127.0.0.1 when that is refused.
        let _stream = finish(dial).unwrap();
        listener.accept().unwrap();
    }

    #[test]
    fn refused_tcp_connect_reports_the_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = finish(Endpoint::Tcp(addr).connect()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn unroutable_address_returns_without_waiting() {
        let started = Instant::now();
        let dial = Endpoint::Tcp("10.255.255.1:6600".into()).connect();
        assert!(started.elapsed() < Duration::from_millis(500));
        // Either still handshaking or rejected outright by a host with no
        // route; never connected.
        if let Ok(Dial::Pending(dialer)) = dial {
            assert_eq!(dialer.interest(), Interest::Writable);
            assert!(!matches!(dialer.advance(), Ok(Dial::Connected(_))));
        } else {
            assert!(dial.is_err());
        }
    }

    #[test]
    fn missing_socket_fails_to_connect() {
        let path = std::env::temp_dir().join("barlink-definitely-missing.sock");
        assert!(Endpoint::Unix(path).connect().is_err());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Endpoint::Unix("/run/mpd.sock".into()).to_string(), "/run/mpd.sock");
        assert_eq!(Endpoint::Tcp("localhost:6600".into()).to_string(), "tcp://localhost:6600");
    }
}
