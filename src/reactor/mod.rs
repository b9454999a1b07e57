//! Event-loop backends implementing [`Reactor`](crate::traits::Reactor).
//!
//! [`poll::PollReactor`] is self-contained and drives the daemon and the
//! tests.  With the `glib-reactor` feature, [`glib::GlibReactor`] plugs the
//! client into a GLib main loop instead, next to GTK widgets.

#[cfg(feature = "glib-reactor")]
pub mod glib;
pub mod poll;
