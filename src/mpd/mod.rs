//! MPD (Music Player Daemon) protocol plugin.
//!
//! Replies are flat lists of `key: value` pairs in server order; grouping
//! them into songs or outputs is left to the caller.  MPD has no push
//! messages: changes are observed by issuing `idle`, whose reply arrives
//! only once something changes.  With `interrupt_idle` enabled the codec
//! sends `noidle` ahead of every other command, so a pending `idle` never
//! holds up the pipeline.

pub mod codec;

pub use codec::{parse_command, MpdCodec};

use crate::client::Client;

/// A client speaking the MPD protocol.
pub type MpdClient = Client<MpdCodec>;

/// One command and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpdRequest {
    pub command: String,
    pub args: Vec<String>,
}

impl MpdRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// The `key: value` lines of a successful reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MpdResponse {
    pub pairs: Vec<(String, String)>,
}

impl MpdResponse {
    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, e.g. all `changed` subsystems of an `idle`.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
