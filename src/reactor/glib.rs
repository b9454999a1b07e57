//! [`Reactor`] backed by the thread-default GLib main context.
//!
//! Lets the clients share the main thread with GTK widgets: descriptor
//! watches become `unix_fd_add_local` sources and timers become
//! `timeout_add_local_once` sources.  Like GTK itself, everything here must
//! stay on the main thread.

use crate::traits::{Interest, Reactor, Readiness, TimerCallback, TimerId, WatchCallback, WatchId};
use gtk4::glib;
use log::info;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Reactor that registers GLib sources on the default main context.
#[derive(Default)]
pub struct GlibReactor {
    watches: RefCell<HashMap<WatchId, glib::SourceId>>,
    // Shared with the timer closures so a fired timer can drop its own id;
    // removing an already-dispatched source id would panic.
    timers: Rc<RefCell<HashMap<TimerId, glib::SourceId>>>,
    next_id: Cell<u64>,
}

impl GlibReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Run a GLib main loop on the current thread until it is quit.
    pub fn run(&self) {
        info!("entering GLib main loop");
        let main_loop = glib::MainLoop::new(None, false);
        main_loop.run();
        info!("GLib main loop exited");
    }
}

fn readiness(condition: glib::IOCondition) -> Readiness {
    Readiness {
        readable: condition.contains(glib::IOCondition::IN),
        writable: condition.contains(glib::IOCondition::OUT),
        hangup: condition.contains(glib::IOCondition::HUP),
        error: condition.intersects(glib::IOCondition::ERR | glib::IOCondition::NVAL),
    }
}

impl Reactor for GlibReactor {
    fn watch(&self, fd: RawFd, interest: Interest, mut callback: WatchCallback) -> WatchId {
        let id = WatchId(self.allocate_id());
        let wanted = match interest {
            Interest::Readable => glib::IOCondition::IN,
            Interest::Writable => glib::IOCondition::OUT,
        };
        let condition = wanted | glib::IOCondition::ERR | glib::IOCondition::HUP;
        let source = glib::unix_fd_add_local(fd, condition, move |_, condition| {
            callback(readiness(condition));
            glib::ControlFlow::Continue
        });
        self.watches.borrow_mut().insert(id, source);
        id
    }

    fn unwatch(&self, id: WatchId) {
        if let Some(source) = self.watches.borrow_mut().remove(&id) {
            source.remove();
        }
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.allocate_id());
        let timers = self.timers.clone();
        let source = glib::timeout_add_local_once(delay, move || {
            timers.borrow_mut().remove(&id);
            callback();
        });
        self.timers.borrow_mut().insert(id, source);
        id
    }

    fn cancel(&self, id: TimerId) {
        let source = self.timers.borrow_mut().remove(&id);
        if let Some(source) = source {
            source.remove();
        }
    }
}
