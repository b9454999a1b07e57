//! Core traits that decouple the client from any specific wire protocol or
//! event loop.
//!
//! Every protocol plugin ([`i3`](crate::i3), [`mpd`](crate::mpd), a test
//! double, …) implements [`Codec`], and every event loop (the built-in
//! [`PollReactor`](crate::reactor::poll::PollReactor), the GLib main loop, …)
//! implements [`Reactor`].  The [`Client`](crate::client::Client) only
//! depends on these abstractions.

use crate::error::{FrameError, ProtocolError};
use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

// ── Codec ──

/// One complete message decoded from the input stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T, R, E> {
    /// The peer's greeting was accepted, with whatever version or identity
    /// it announced.  Protocols without a greeting never produce this.
    Greeting(Option<String>),

    /// The answer to the oldest request still pending.
    ///
    /// `tag` is the echoed request kind, for protocols that carry one.  A
    /// `body` of `Err` is an application-level rejection of that single
    /// request; the stream itself is fine.
    Reply {
        tag: Option<T>,
        body: Result<R, ProtocolError>,
    },

    /// An unsolicited push message.
    Event(E),
}

/// Result of one [`Codec::decode`] step.
///
/// `consumed` bytes must be dropped from the front of the input buffer
/// whether or not a frame was produced: a codec may swallow partial
/// progress (say, the key/value lines of a reply whose terminator has not
/// arrived yet).  A step with no frame and nothing consumed means the codec
/// needs more bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<F> {
    pub frame: Option<F>,
    pub consumed: usize,
}

impl<F> Decoded<F> {
    /// Nothing more can be decoded until more bytes arrive.
    pub fn need_more(consumed: usize) -> Self {
        Self {
            frame: None,
            consumed,
        }
    }

    /// A complete frame spanning `consumed` bytes.
    pub fn frame(frame: F, consumed: usize) -> Self {
        Self {
            frame: Some(frame),
            consumed,
        }
    }

    /// Whether the decode loop should stop and wait for the socket.
    pub fn is_exhausted(&self) -> bool {
        self.frame.is_none() && self.consumed == 0
    }
}

/// Shorthand for the frame type a codec produces.
pub type FrameOf<C> = Frame<<C as Codec>::Tag, <C as Codec>::Reply, <C as Codec>::Event>;

/// Abstraction over a wire protocol: how requests become bytes and how a
/// growing input buffer becomes messages.
///
/// A codec instance lives for exactly one connection.  The client keeps a
/// pristine template and clones it on every connect, so no partial state
/// ever leaks from a dead connection into a new one.
pub trait Codec: Clone + 'static {
    /// What callers pass to [`Client::command`](crate::client::Client::command).
    type Request;
    /// A successful reply payload.
    type Reply;
    /// An unsolicited push message.
    type Event;
    /// The request kind echoed back in replies, if the protocol has one.
    type Tag: fmt::Debug + PartialEq + Clone;

    /// Whether the peer sends a greeting that must be accepted before any
    /// request may be written.
    fn expects_greeting(&self) -> bool {
        false
    }

    /// Append the wire form of `request` to `dst`.
    ///
    /// Returns the tag the matching reply must echo, if any.
    fn encode(
        &mut self,
        request: &Self::Request,
        dst: &mut Vec<u8>,
    ) -> Result<Option<Self::Tag>, FrameError>;

    /// Decode at most one frame from the front of `src`.
    fn decode(&mut self, src: &[u8]) -> Result<Decoded<FrameOf<Self>>, FrameError>;
}

// ── Reactor ──

/// Which readiness a watch is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// What the reactor observed on a descriptor.
///
/// `hangup` and `error` are delivered to every watch on the descriptor
/// regardless of its [`Interest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// Handle of a registered descriptor watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Callback invoked on every readiness notification for a watch.
pub type WatchCallback = Box<dyn FnMut(Readiness)>;

/// Callback invoked once when a timer fires.
pub type TimerCallback = Box<dyn FnOnce()>;

/// A single-threaded readiness-driven event loop.
///
/// The [`Client`](crate::client::Client) is the only component that talks to
/// the reactor.  Implementations must not hold any internal borrow while a
/// callback runs: callbacks routinely add and remove watches and timers.
pub trait Reactor {
    /// Invoke `callback` whenever `fd` is ready for `interest`, until
    /// [`unwatch`](Reactor::unwatch) is called.
    fn watch(&self, fd: RawFd, interest: Interest, callback: WatchCallback) -> WatchId;

    /// Remove a watch.  Unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// Invoke `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancel a timer.  Timers that already fired, or unknown ids, are ignored.
    fn cancel(&self, id: TimerId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    // ── Mock Codec ──

    /// A test double: every request is one byte, every input byte is a
    /// reply echoing it, and `0xff` is an event.
    #[derive(Debug, Clone, Default)]
    struct ByteCodec;

    impl Codec for ByteCodec {
        type Request = u8;
        type Reply = u8;
        type Event = ();
        type Tag = u8;

        fn encode(&mut self, request: &u8, dst: &mut Vec<u8>) -> Result<Option<u8>, FrameError> {
            dst.push(*request);
            Ok(Some(*request))
        }

        fn decode(&mut self, src: &[u8]) -> Result<Decoded<FrameOf<Self>>, FrameError> {
            match src.first() {
                None => Ok(Decoded::need_more(0)),
                Some(0xff) => Ok(Decoded::frame(Frame::Event(()), 1)),
                Some(b) => Ok(Decoded::frame(
                    Frame::Reply {
                        tag: Some(*b),
                        body: Ok(*b),
                    },
                    1,
                )),
            }
        }
    }

    #[test]
    fn mock_codec_decodes_one_frame_per_step() {
        let mut codec = ByteCodec;
        let mut wire = Vec::new();
        assert_eq!(codec.encode(&7, &mut wire).unwrap(), Some(7));
        wire.push(0xff);

        let first = codec.decode(&wire).unwrap();
        assert_eq!(first.consumed, 1);
        assert_eq!(
            first.frame,
            Some(Frame::Reply {
                tag: Some(7),
                body: Ok(7)
            })
        );
        let second = codec.decode(&wire[1..]).unwrap();
        assert_eq!(second.frame, Some(Frame::Event(())));
        assert!(codec.decode(&[]).unwrap().is_exhausted());
    }

    #[test]
    fn default_codec_has_no_greeting() {
        assert!(!ByteCodec.expects_greeting());
    }

    #[test]
    fn partial_progress_is_not_exhausted() {
        let d: Decoded<()> = Decoded::need_more(3);
        assert!(!d.is_exhausted());
        assert!(Decoded::<()>::need_more(0).is_exhausted());
    }

    // ── Mock Reactor ──

    /// A test double that records registrations and fires timers on demand.
    #[derive(Default)]
    struct RecordingReactor {
        watches: RefCell<Vec<(RawFd, Interest)>>,
        timers: RefCell<Vec<TimerCallback>>,
    }

    impl Reactor for RecordingReactor {
        fn watch(&self, fd: RawFd, interest: Interest, _callback: WatchCallback) -> WatchId {
            let mut watches = self.watches.borrow_mut();
            watches.push((fd, interest));
            WatchId(watches.len() as u64)
        }

        fn unwatch(&self, _id: WatchId) {}

        fn schedule(&self, _delay: Duration, callback: TimerCallback) -> TimerId {
            let mut timers = self.timers.borrow_mut();
            timers.push(callback);
            TimerId(timers.len() as u64)
        }

        fn cancel(&self, _id: TimerId) {}
    }

    #[test]
    fn mock_reactor_records_watches_and_timers() {
        let reactor = RecordingReactor::default();
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();

        reactor.watch(3, Interest::Readable, Box::new(|_| {}));
        reactor.schedule(
            Duration::from_millis(1),
            Box::new(move || *flag.borrow_mut() = true),
        );

        assert_eq!(reactor.watches.borrow()[0], (3, Interest::Readable));
        let timer = reactor.timers.borrow_mut().pop().unwrap();
        timer();
        assert!(*fired.borrow());
    }
}
