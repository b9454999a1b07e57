//! Order-based matching of replies to the requests that produced them.
//!
//! The peer answers pipelined requests strictly in order, so the correlator
//! is a plain FIFO: a reply always belongs to the oldest entry.  Entries are
//! never reordered and never matched by content.
//!
//! Completion handles are *returned* rather than invoked here, so the client
//! can run them after releasing its own state.  Handlers routinely issue new
//! requests.

use crate::error::ClientError;
use std::collections::VecDeque;
use std::time::Instant;

/// The one-shot handle a request's result is delivered to.
pub type Completion<R> = Box<dyn FnOnce(Result<R, ClientError>)>;

struct Pending<T, R> {
    tag: Option<T>,
    /// `None` once the entry timed out.  The slot stays queued so the late
    /// reply is still consumed in its position.
    handle: Option<Completion<R>>,
    deadline: Option<Instant>,
}

/// FIFO of requests that are on the wire and awaiting a reply.
pub struct Correlator<T, R> {
    queue: VecDeque<Pending<T, R>>,
}

impl<T, R> Default for Correlator<T, R> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T: std::fmt::Debug + PartialEq, R> Correlator<T, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued entries, including timed-out placeholders.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a request whose bytes were just handed to the output buffer.
    pub fn push(&mut self, tag: Option<T>, deadline: Option<Instant>, handle: Completion<R>) {
        self.queue.push_back(Pending {
            tag,
            handle: Some(handle),
            deadline,
        });
    }

    /// Pop the oldest entry for a reply that echoed `tag`.
    ///
    /// Returns the handle to invoke, or `None` if that request already timed
    /// out and the reply should be discarded.  A reply with nothing pending,
    /// or one whose tag differs from the head's, means the stream is out of
    /// sync; the queue is left untouched so the entries can be failed along
    /// with the connection.
    pub fn resolve_next(&mut self, tag: Option<&T>) -> Result<Option<Completion<R>>, ClientError> {
        let Some(head) = self.queue.front() else {
            return Err(ClientError::CorrelationViolation {
                expected: "no reply".into(),
                received: format!("{:?}", tag),
            });
        };
        if let (Some(expected), Some(received)) = (head.tag.as_ref(), tag) {
            if expected != received {
                return Err(ClientError::CorrelationViolation {
                    expected: format!("{:?}", expected),
                    received: format!("{:?}", received),
                });
            }
        }
        Ok(self.queue.pop_front().and_then(|p| p.handle))
    }

    /// Empty the queue, returning every live handle in original order.
    pub fn fail_all(&mut self) -> Vec<Completion<R>> {
        self.queue.drain(..).filter_map(|p| p.handle).collect()
    }

    /// Take the handles of every entry whose deadline is at or before `now`.
    ///
    /// Expired entries remain queued as placeholders: their replies may
    /// still arrive and must not be matched to a later request.
    pub fn expire(&mut self, now: Instant) -> Vec<Completion<R>> {
        self.queue
            .iter_mut()
            .filter(|p| p.deadline.is_some_and(|d| d <= now))
            .filter_map(|p| p.handle.take())
            .collect()
    }
}
