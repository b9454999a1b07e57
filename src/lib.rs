//! **barlink** — pipelined IPC clients for status-bar widgets.
//!
//! A bar talks to long-running daemons (the window manager, the music
//! player) over stream sockets.  Each daemon speaks its own framing, but
//! the hard parts are shared: writing without blocking, matching replies to
//! pipelined requests, routing unsolicited events, and reconnecting when the
//! daemon restarts.  This crate implements those parts once.
//!
//! # Architecture
//!
//! The crate is organised around two core traits:
//!
//! * [`traits::Codec`] — turns requests into bytes and a growing input
//!   buffer into greetings, replies and events, so the client is not
//!   coupled to any specific wire protocol.
//! * [`traits::Reactor`] — readiness watches and timers, so the client is
//!   not coupled to any specific event loop.
//!
//! [`client::Client`] combines a codec with a reactor.  Concrete protocols
//! live in [`i3`] (binary, length-prefixed, JSON payloads) and [`mpd`]
//! (line-delimited text); concrete event loops live in [`reactor`].

pub mod buffer;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod i3;
pub mod mpd;
pub mod reactor;
pub mod router;
pub mod traits;
pub mod transport;

#[cfg(test)]
mod testing;
