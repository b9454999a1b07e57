//! The pipelined IPC client: connection supervision plus the façade widgets
//! talk to.
//!
//! [`Client`] owns at most one connection at a time and drives it entirely
//! from reactor callbacks, never blocking.  Commands can be issued at any
//! time and are pipelined: each one is encoded into the output buffer and
//! queued in the [`Correlator`]; replies are matched back by position.
//!
//! # Connection lifecycle
//!
//! ```text
//!              connect()                 greeting accepted
//! Disconnected ─────────▶ Connecting ─────────────────────▶ Connected
//!      ▲   │ refused: retry after delay   (skipped when the     │
//!      │   ▼                               protocol has none)   │
//!      └──────────── EOF / read or write error / bad frame ◀────┘
//!                    fail pending, reconnect after delay
//! ```
//!
//! `Connecting` covers both the TCP handshake (driven by writability, never
//! blocking the reactor) and the wait for the greeting.
//! [`destroy`](Client::destroy) moves any state to the terminal `Closed`.
//!
//! # Offline policy
//!
//! Commands issued while not `Connected` are held, unencoded, in a backlog
//! and written exactly once when the next connection becomes usable.
//! Commands already handed to a connection are **not** replayed when it
//! drops; their handles receive [`ClientError::ConnectionLost`].
//!
//! # Re-entrancy
//!
//! Completion handles, event subscribers and ready handlers always run
//! after the client's internal state has been released, so they may call
//! back into the client (issue follow-up commands, subscribe, destroy it).

use crate::buffer::DuplexBuffers;
use crate::config::ClientConfig;
use crate::correlator::{Completion, Correlator};
use crate::error::ClientError;
use crate::router::{EventRouter, SubscriptionId};
use crate::traits::{Codec, Frame, Interest, Reactor, Readiness, TimerId, WatchId};
use crate::transport::{Dial, Dialer, Endpoint, Stream};
use log::{debug, error, info, trace, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

/// Observable lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.  A reconnect may be scheduled.
    Disconnected,
    /// Handshake in progress, or waiting for the peer's greeting.
    Connecting,
    /// Requests are being written.
    Connected,
    /// [`Client::destroy`] was called.  Terminal.
    Closed,
}

struct Connection<C: Codec> {
    stream: Stream,
    codec: C,
    buffers: DuplexBuffers,
    read_watch: WatchId,
    /// Present exactly while the output buffer holds unflushed bytes.
    write_watch: Option<WatchId>,
    greeted: bool,
}

struct Queued<C: Codec> {
    request: C::Request,
    handle: Completion<C::Reply>,
    deadline: Option<Instant>,
}

enum Link<C: Codec> {
    Down,
    Dialing { dialer: Dialer, watch: WatchId },
    Up(Connection<C>),
}

struct Inner<C: Codec> {
    endpoint: Endpoint,
    config: ClientConfig,
    reactor: Rc<dyn Reactor>,
    /// Pristine codec, cloned for every new connection.
    template: C,
    link: Link<C>,
    /// What the peer announced when greeting the current connection.
    greeting: Option<String>,
    correlator: Correlator<C::Tag, C::Reply>,
    backlog: VecDeque<Queued<C>>,
    retry: Option<TimerId>,
    failed_attempts: u32,
    closed: bool,
}

struct Shared<C: Codec> {
    inner: RefCell<Inner<C>>,
    events: EventRouter<C::Event>,
    ready: EventRouter<()>,
}

/// Work produced while the state is borrowed, run after it is released.
enum Outcome<C: Codec> {
    Complete(Completion<C::Reply>, Result<C::Reply, ClientError>),
    Event(C::Event),
    Ready,
}

/// Handle to a pipelined IPC client.
///
/// Cloning the handle is cheap and every clone drives the same connection.
/// The client is single-threaded: it must be used on the thread that runs
/// its reactor.
///
/// # Typical usage
///
/// ```ignore
/// let reactor = Rc::new(PollReactor::new());
/// let codec = I3Codec::default();
/// let client = Client::new(reactor.clone(), endpoint, ClientConfig::default(), codec);
/// client.on_ready({
///     let client = client.clone();
///     move || client.command(I3Request::subscribe(&["workspace"]), |_| {})
/// });
/// client.connect();
/// reactor.run()?;
/// ```
pub struct Client<C: Codec> {
    shared: Rc<Shared<C>>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Codec> Client<C> {
    /// Create a disconnected client.  Nothing happens until
    /// [`connect`](Self::connect).
    pub fn new(
        reactor: Rc<dyn Reactor>,
        endpoint: Endpoint,
        config: ClientConfig,
        codec: C,
    ) -> Self {
        let inner = Inner {
            endpoint,
            config,
            reactor,
            template: codec,
            link: Link::Down,
            greeting: None,
            correlator: Correlator::new(),
            backlog: VecDeque::new(),
            retry: None,
            failed_attempts: 0,
            closed: false,
        };
        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(inner),
                events: EventRouter::new(),
                ready: EventRouter::new(),
            }),
        }
    }

    /// Open the connection, retrying in the background until the peer
    /// accepts.  After the first call, reconnection is automatic.
    pub fn connect(&self) {
        self.shared.start();
    }

    /// Send `request`; `on_result` receives its reply or failure exactly
    /// once.
    ///
    /// May be called again before earlier requests are answered.
    pub fn command(
        &self,
        request: C::Request,
        on_result: impl FnOnce(Result<C::Reply, ClientError>) + 'static,
    ) {
        self.shared.command(request, Box::new(on_result));
    }

    /// Receive every unsolicited event.  Subscriptions outlive reconnects;
    /// the peer-side subscription usually has to be renewed from an
    /// [`on_ready`](Self::on_ready) handler.
    pub fn subscribe(&self, handler: impl Fn(&C::Event) + 'static) -> SubscriptionId {
        self.shared.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Run `handler` each time a connection becomes usable.
    pub fn on_ready(&self, handler: impl Fn() + 'static) -> SubscriptionId {
        self.shared.ready.subscribe(move |_: &()| handler())
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.shared.inner.borrow();
        if inner.closed {
            return ConnectionState::Closed;
        }
        match &inner.link {
            Link::Down => ConnectionState::Disconnected,
            Link::Up(conn) if conn.greeted => ConnectionState::Connected,
            Link::Dialing { .. } | Link::Up(_) => ConnectionState::Connecting,
        }
    }

    /// The version or identity the peer announced in its greeting, while
    /// connected to a peer that sends one.
    pub fn greeting(&self) -> Option<String> {
        self.shared.inner.borrow().greeting.clone()
    }

    /// Requests not yet answered: on the wire, or waiting for a connection.
    pub fn pending(&self) -> usize {
        let inner = self.shared.inner.borrow();
        inner.correlator.len() + inner.backlog.len()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.inner.borrow().endpoint.clone()
    }

    /// Close the connection for good.  Every outstanding request fails
    /// with [`ClientError::Closed`], as does every later command.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl<C: Codec> Shared<C> {
    fn run(&self, outcomes: Vec<Outcome<C>>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Complete(handle, result) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| handle(result))).is_err() {
                        error!("completion handler panicked");
                    }
                }
                Outcome::Event(event) => {
                    self.events.dispatch(&event);
                }
                Outcome::Ready => {
                    self.ready.dispatch(&());
                }
            }
        }
    }

    fn start(self: &Rc<Self>) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.closed || !matches!(inner.link, Link::Down) {
                return;
            }
            if let Some(timer) = inner.retry.take() {
                inner.reactor.cancel(timer);
            }
            match inner.endpoint.connect() {
                Ok(dial) => inner.dialed(self, dial, &mut outcomes),
                Err(e) => inner.connect_failed(self, &e),
            }
        }
        self.run(outcomes);
    }

    fn on_dial_progress(self: &Rc<Self>) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let (dialer, watch) = match std::mem::replace(&mut inner.link, Link::Down) {
                Link::Dialing { dialer, watch } => (dialer, watch),
                other => {
                    inner.link = other;
                    return;
                }
            };
            inner.reactor.unwatch(watch);
            match dialer.advance() {
                Ok(dial) => inner.dialed(self, dial, &mut outcomes),
                Err(e) => inner.connect_failed(self, &e),
            }
        }
        self.run(outcomes);
    }

    fn command(self: &Rc<Self>, request: C::Request, handle: Completion<C::Reply>) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.closed {
                outcomes.push(Outcome::Complete(handle, Err(ClientError::Closed)));
            } else {
                let timeout = inner.config.request_timeout();
                let deadline = timeout.map(|t| Instant::now() + t);
                if inner.is_usable() {
                    inner.submit(self, request, handle, deadline, &mut outcomes);
                } else {
                    debug!("not connected to {}; queueing request", inner.endpoint);
                    inner.backlog.push_back(Queued {
                        request,
                        handle,
                        deadline,
                    });
                }
                if let Some(timeout) = timeout {
                    let weak = Rc::downgrade(self);
                    inner.reactor.schedule(
                        timeout,
                        Box::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                shared.on_deadline();
                            }
                        }),
                    );
                }
            }
        }
        self.run(outcomes);
    }

    fn on_readable(self: &Rc<Self>, readiness: Readiness) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if let Err(reason) = inner.pump_input(self, readiness, &mut outcomes) {
                inner.connection_lost(self, reason, &mut outcomes);
            }
        }
        self.run(outcomes);
    }

    fn on_writable(self: &Rc<Self>, readiness: Readiness) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if let Err(reason) = inner.pump_output(readiness) {
                inner.connection_lost(self, reason, &mut outcomes);
            }
        }
        self.run(outcomes);
    }

    fn on_deadline(self: &Rc<Self>) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let Some(timeout) = inner.config.request_timeout() else {
                return;
            };
            let now = Instant::now();
            for handle in inner.correlator.expire(now) {
                outcomes.push(Outcome::Complete(handle, Err(ClientError::Timeout(timeout))));
            }
            let mut kept = VecDeque::with_capacity(inner.backlog.len());
            for queued in inner.backlog.drain(..) {
                if queued.deadline.is_some_and(|d| d <= now) {
                    let expired = Err(ClientError::Timeout(timeout));
                    outcomes.push(Outcome::Complete(queued.handle, expired));
                } else {
                    kept.push_back(queued);
                }
            }
            inner.backlog = kept;
            if !outcomes.is_empty() {
                debug!("{} request(s) to {} timed out", outcomes.len(), inner.endpoint);
            }
        }
        self.run(outcomes);
    }

    fn destroy(self: &Rc<Self>) {
        let mut outcomes = Vec::new();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(timer) = inner.retry.take() {
                inner.reactor.cancel(timer);
            }
            inner.teardown();
            for handle in inner.correlator.fail_all() {
                outcomes.push(Outcome::Complete(handle, Err(ClientError::Closed)));
            }
            for queued in inner.backlog.drain(..) {
                outcomes.push(Outcome::Complete(queued.handle, Err(ClientError::Closed)));
            }
            info!("client for {} closed", inner.endpoint);
        }
        // Handlers commonly capture a clone of the client; dropping them
        // breaks that cycle.
        self.events.clear();
        self.ready.clear();
        self.run(outcomes);
    }
}

fn refused(e: &io::Error) -> ClientError {
    ClientError::ConnectionRefused(e.to_string())
}

fn lost(reason: impl Into<String>) -> ClientError {
    ClientError::ConnectionLost(reason.into())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

impl<C: Codec> Inner<C> {
    fn is_usable(&self) -> bool {
        matches!(&self.link, Link::Up(conn) if conn.greeted)
    }

    /// Adopt a connected socket, or wait on a dial still in progress.
    fn dialed(&mut self, shared: &Rc<Shared<C>>, dial: Dial, outcomes: &mut Vec<Outcome<C>>) {
        let dialer = match dial {
            Dial::Connected(stream) => return self.attach(shared, stream, outcomes),
            Dial::Pending(dialer) => dialer,
        };
        let weak = Rc::downgrade(shared);
        let watch = self.reactor.watch(
            dialer.fd(),
            dialer.interest(),
            Box::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_dial_progress();
                }
            }),
        );
        self.link = Link::Dialing { dialer, watch };
    }

    fn connect_failed(&mut self, shared: &Rc<Shared<C>>, e: &io::Error) {
        let err = refused(e);
        if self.failed_attempts == 0 {
            warn!("failed to connect to {}: {}", self.endpoint, err);
        } else {
            debug!("still cannot connect to {}: {}", self.endpoint, err);
        }
        self.failed_attempts += 1;
        self.schedule_retry(shared);
    }

    /// Adopt a freshly connected socket.
    fn attach(&mut self, shared: &Rc<Shared<C>>, stream: Stream, outcomes: &mut Vec<Outcome<C>>) {
        let weak = Rc::downgrade(shared);
        let read_watch = self.reactor.watch(
            stream.as_raw_fd(),
            Interest::Readable,
            Box::new(move |readiness| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_readable(readiness);
                }
            }),
        );
        let codec = self.template.clone();
        let greeted = !codec.expects_greeting();
        self.link = Link::Up(Connection {
            stream,
            codec,
            buffers: DuplexBuffers::new(self.config.read_chunk),
            read_watch,
            write_watch: None,
            greeted,
        });
        self.failed_attempts = 0;
        info!("connected to {}", self.endpoint);
        if greeted {
            self.become_usable(shared, outcomes);
        } else {
            debug!("waiting for greeting from {}", self.endpoint);
        }
    }

    /// Flush the backlog into the connection and notify ready handlers.
    fn become_usable(&mut self, shared: &Rc<Shared<C>>, outcomes: &mut Vec<Outcome<C>>) {
        let queued: Vec<Queued<C>> = self.backlog.drain(..).collect();
        if !queued.is_empty() {
            debug!("sending {} queued request(s) to {}", queued.len(), self.endpoint);
        }
        for q in queued {
            self.submit(shared, q.request, q.handle, q.deadline, outcomes);
        }
        outcomes.push(Outcome::Ready);
    }

    /// Encode `request` onto the live connection and queue its handle.
    fn submit(
        &mut self,
        shared: &Rc<Shared<C>>,
        request: C::Request,
        handle: Completion<C::Reply>,
        deadline: Option<Instant>,
        outcomes: &mut Vec<Outcome<C>>,
    ) {
        let Link::Up(conn) = &mut self.link else {
            self.backlog.push_back(Queued {
                request,
                handle,
                deadline,
            });
            return;
        };
        let mut bytes = Vec::new();
        match conn.codec.encode(&request, &mut bytes) {
            Ok(tag) => {
                trace!("queued {} bytes for {}", bytes.len(), self.endpoint);
                self.correlator.push(tag, deadline, handle);
                if conn.buffers.enqueue_write(&bytes) {
                    arm_writer(&self.reactor, conn, shared);
                }
            }
            Err(e) => {
                let rejected = Err(ClientError::InvalidRequest(e.to_string()));
                outcomes.push(Outcome::Complete(handle, rejected));
            }
        }
    }

    /// One read, then decode until the codec needs more bytes.
    fn pump_input(
        &mut self,
        shared: &Rc<Shared<C>>,
        readiness: Readiness,
        outcomes: &mut Vec<Outcome<C>>,
    ) -> Result<(), ClientError> {
        let Link::Up(conn) = &mut self.link else {
            return Ok(());
        };
        if readiness.error {
            return Err(lost("socket error"));
        }
        match conn.buffers.fill_from(&mut conn.stream) {
            Ok(0) => return Err(lost("connection closed by peer")),
            Ok(n) => trace!("read {} bytes from {}", n, self.endpoint),
            Err(e) if is_transient(&e) => {
                if readiness.hangup {
                    return Err(lost("peer hung up"));
                }
                return Ok(());
            }
            Err(e) => return Err(lost(e.to_string())),
        }

        let mut frames = Vec::new();
        let decoded = loop {
            match conn.codec.decode(conn.buffers.input()) {
                Ok(step) => {
                    let exhausted = step.is_exhausted();
                    conn.buffers.consume(step.consumed);
                    if let Some(frame) = step.frame {
                        frames.push(frame);
                    }
                    if exhausted {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        conn.buffers.compact();

        let mut greeted_now = false;
        for frame in frames {
            match frame {
                Frame::Greeting(announced) => {
                    conn.greeted = true;
                    greeted_now = true;
                    self.greeting = announced;
                }
                Frame::Reply { tag, body } => match self.correlator.resolve_next(tag.as_ref())? {
                    Some(handle) => {
                        let result = body.map_err(ClientError::Protocol);
                        outcomes.push(Outcome::Complete(handle, result))
                    }
                    None => debug!("discarding late reply from {}", self.endpoint),
                },
                Frame::Event(event) => outcomes.push(Outcome::Event(event)),
            }
        }
        if greeted_now {
            info!("{} is ready", self.endpoint);
            self.become_usable(shared, outcomes);
        }
        decoded.map_err(ClientError::MalformedFrame)
    }

    /// One write of everything pending; disarm the watch once drained.
    fn pump_output(&mut self, readiness: Readiness) -> Result<(), ClientError> {
        let Link::Up(conn) = &mut self.link else {
            return Ok(());
        };
        if readiness.error {
            return Err(lost("socket error"));
        }
        match conn.buffers.flush_to(&mut conn.stream) {
            Ok(0) => {
                if let Some(watch) = conn.write_watch.take() {
                    self.reactor.unwatch(watch);
                }
                Ok(())
            }
            Ok(remaining) => {
                trace!("{} bytes still queued for {}", remaining, self.endpoint);
                Ok(())
            }
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(lost(e.to_string())),
        }
    }

    /// Drop the socket, fail everything on the wire and schedule a
    /// reconnect.
    fn connection_lost(
        &mut self,
        shared: &Rc<Shared<C>>,
        reason: ClientError,
        outcomes: &mut Vec<Outcome<C>>,
    ) {
        let reason = match reason {
            ClientError::ConnectionLost(reason) => reason,
            other => other.to_string(),
        };
        self.teardown();
        warn!("connection to {} lost: {}", self.endpoint, reason);
        for handle in self.correlator.fail_all() {
            let failed = Err(ClientError::ConnectionLost(reason.clone()));
            outcomes.push(Outcome::Complete(handle, failed));
        }
        self.schedule_retry(shared);
    }

    /// Unregister and close the socket.  Its codec and buffers go with it.
    fn teardown(&mut self) {
        self.greeting = None;
        match std::mem::replace(&mut self.link, Link::Down) {
            Link::Down => {}
            Link::Dialing { watch, .. } => self.reactor.unwatch(watch),
            Link::Up(conn) => {
                self.reactor.unwatch(conn.read_watch);
                if let Some(watch) = conn.write_watch {
                    self.reactor.unwatch(watch);
                }
            }
        }
    }

    fn schedule_retry(&mut self, shared: &Rc<Shared<C>>) {
        if self.closed || self.retry.is_some() {
            return;
        }
        let weak = Rc::downgrade(shared);
        let timer = self.reactor.schedule(
            self.config.retry_delay(),
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.inner.borrow_mut().retry = None;
                    shared.start();
                }
            }),
        );
        self.retry = Some(timer);
    }
}

fn arm_writer<C: Codec>(
    reactor: &Rc<dyn Reactor>,
    conn: &mut Connection<C>,
    shared: &Rc<Shared<C>>,
) {
    if conn.write_watch.is_some() {
        return;
    }
    let weak = Rc::downgrade(shared);
    conn.write_watch = Some(reactor.watch(
        conn.stream.as_raw_fd(),
        Interest::Writable,
        Box::new(move |readiness| {
            if let Some(shared) = weak.upgrade() {
                shared.on_writable(readiness);
            }
        }),
    ));
}

impl<C: Codec> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.retry.take() {
            self.reactor.cancel(timer);
        }
        self.teardown();
    }
}

// ── Tests ──
