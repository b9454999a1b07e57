//! A single-threaded [`Reactor`] over `poll(2)`.
//!
//! Every [`turn`](PollReactor::turn) rebuilds the descriptor set from the
//! registered watches, waits until something is ready or the next timer is
//! due, then dispatches.  No borrow of the reactor is held while a callback
//! runs, so callbacks may freely register or remove watches and timers.

use crate::traits::{Interest, Reactor, Readiness, TimerCallback, TimerId, WatchCallback, WatchId};
use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

struct WatchEntry {
    fd: RawFd,
    interest: Interest,
    callback: Rc<RefCell<WatchCallback>>,
}

#[derive(Default)]
struct State {
    watches: BTreeMap<WatchId, WatchEntry>,
    timers: BTreeMap<(Instant, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Instant>,
}

/// Readiness reactor backed by `libc::poll`.
#[derive(Default)]
pub struct PollReactor {
    state: RefCell<State>,
    next_id: Cell<u64>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Whether nothing is registered, i.e. [`run`](Self::run) would return.
    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.watches.is_empty() && state.timers.is_empty()
    }

    pub fn watch_count(&self) -> usize {
        self.state.borrow().watches.len()
    }

    /// Wait for readiness or a due timer (at most `max_wait`, or
    /// indefinitely with `None`) and dispatch everything that is ready.
    ///
    /// Returns the number of callbacks invoked.  Returns immediately when
    /// there is nothing to wait for.
    pub fn turn(&self, max_wait: Option<Duration>) -> io::Result<usize> {
        let (mut fds, ids, wait) = {
            let state = self.state.borrow();
            let mut fds = Vec::with_capacity(state.watches.len());
            let mut ids = Vec::with_capacity(state.watches.len());
            for (id, w) in &state.watches {
                let events = match w.interest {
                    Interest::Readable => libc::POLLIN,
                    Interest::Writable => libc::POLLOUT,
                };
                fds.push(libc::pollfd {
                    fd: w.fd,
                    events,
                    revents: 0,
                });
                ids.push(*id);
            }
            let now = Instant::now();
            let next_timer = state
                .timers
                .keys()
                .next()
                .map(|(deadline, _)| deadline.saturating_duration_since(now));
            let wait = match (max_wait, next_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            (fds, ids, wait)
        };

        if fds.is_empty() && wait.is_none() {
            return Ok(0);
        }

        let timeout_ms = match wait {
            // Round up so a pending timer is never polled for in a busy loop.
            Some(d) => ((d.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;
        for (pfd, id) in fds.iter().zip(ids) {
            if pfd.revents == 0 {
                continue;
            }
            let readiness = Readiness {
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                hangup: pfd.revents & libc::POLLHUP != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            };
            // An earlier callback in this round may have removed the watch.
            let callback = match self.state.borrow().watches.get(&id) {
                Some(w) => w.callback.clone(),
                None => continue,
            };
            trace!("fd {} ready: {:?}", pfd.fd, readiness);
            let mut f = callback.borrow_mut();
            (*f)(readiness);
            dispatched += 1;
        }

        Ok(dispatched + self.fire_due_timers())
    }

    fn fire_due_timers(&self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                let key = match state.timers.keys().next() {
                    Some(key) if key.0 <= now => *key,
                    _ => break,
                };
                state.deadlines.remove(&key.1);
                state.timers.remove(&key)
            };
            if let Some(callback) = due {
                callback();
                fired += 1;
            }
        }
        fired
    }

    /// Turn until `done` returns `true` or `limit` elapses.
    ///
    /// Returns whether the condition was met.
    pub fn run_until(&self, limit: Duration, mut done: impl FnMut() -> bool) -> io::Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.turn(Some(deadline - now))?;
        }
    }

    /// Turn until nothing is registered.
    pub fn run(&self) -> io::Result<()> {
        while !self.is_idle() {
            self.turn(None)?;
        }
        Ok(())
    }
}

impl Reactor for PollReactor {
    fn watch(&self, fd: RawFd, interest: Interest, callback: WatchCallback) -> WatchId {
        let id = WatchId(self.allocate_id());
        self.state.borrow_mut().watches.insert(
            id,
            WatchEntry {
                fd,
                interest,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        id
    }

    fn unwatch(&self, id: WatchId) {
        self.state.borrow_mut().watches.remove(&id);
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.allocate_id());
        let deadline = Instant::now() + delay;
        let mut state = self.state.borrow_mut();
        state.timers.insert((deadline, id), callback);
        state.deadlines.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(deadline) = state.deadlines.remove(&id) {
            state.timers.remove(&(deadline, id));
        }
    }
}
