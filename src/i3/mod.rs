//! i3 / sway IPC protocol plugin.
//!
//! Requests are typed by [`MessageType`]; the reply to each request echoes
//! its type, which the client checks while correlating.  Payloads are JSON
//! documents and are handed to callers as [`serde_json::Value`]: what a
//! workspace or an output looks like is the caller's business.
//!
//! ```ignore
//! let i3 = I3Client::new(reactor, endpoint, config, I3Codec::default());
//! i3.command(I3Request::query(MessageType::GetWorkspaces), |reply| {
//!     if let Ok(reply) = reply {
//!         println!("{}", reply.payload);
//!     }
//! });
//! ```

pub mod codec;

pub use codec::I3Codec;

use crate::client::Client;
use serde_json::Value;

/// A client speaking the i3 IPC protocol.
pub type I3Client = Client<I3Codec>;

/// Request message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    RunCommand,
    GetWorkspaces,
    Subscribe,
    GetOutputs,
    GetTree,
    GetMarks,
    GetBarConfig,
    GetVersion,
    GetBindingModes,
    GetConfig,
    SendTick,
    Sync,
    GetBindingState,
    /// A type this crate has no name for.
    Other(u32),
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::RunCommand,
            1 => Self::GetWorkspaces,
            2 => Self::Subscribe,
            3 => Self::GetOutputs,
            4 => Self::GetTree,
            5 => Self::GetMarks,
            6 => Self::GetBarConfig,
            7 => Self::GetVersion,
            8 => Self::GetBindingModes,
            9 => Self::GetConfig,
            10 => Self::SendTick,
            11 => Self::Sync,
            12 => Self::GetBindingState,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::RunCommand => 0,
            Self::GetWorkspaces => 1,
            Self::Subscribe => 2,
            Self::GetOutputs => 3,
            Self::GetTree => 4,
            Self::GetMarks => 5,
            Self::GetBarConfig => 6,
            Self::GetVersion => 7,
            Self::GetBindingModes => 8,
            Self::GetConfig => 9,
            Self::SendTick => 10,
            Self::Sync => 11,
            Self::GetBindingState => 12,
            Self::Other(raw) => raw,
        }
    }
}

/// Event kinds, i.e. the low 31 bits of an event's message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Workspace,
    Output,
    Mode,
    Window,
    BarconfigUpdate,
    Binding,
    Shutdown,
    Tick,
    Other(u32),
}

impl EventKind {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Workspace,
            1 => Self::Output,
            2 => Self::Mode,
            3 => Self::Window,
            4 => Self::BarconfigUpdate,
            5 => Self::Binding,
            6 => Self::Shutdown,
            7 => Self::Tick,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Workspace => 0,
            Self::Output => 1,
            Self::Mode => 2,
            Self::Window => 3,
            Self::BarconfigUpdate => 4,
            Self::Binding => 5,
            Self::Shutdown => 6,
            Self::Tick => 7,
            Self::Other(raw) => raw,
        }
    }

    /// The name used in `SUBSCRIBE` payloads.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::Workspace => "workspace",
            Self::Output => "output",
            Self::Mode => "mode",
            Self::Window => "window",
            Self::BarconfigUpdate => "barconfig_update",
            Self::Binding => "binding",
            Self::Shutdown => "shutdown",
            Self::Tick => "tick",
            Self::Other(_) => return None,
        })
    }
}

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I3Request {
    pub kind: MessageType,
    pub payload: String,
}

impl I3Request {
    pub fn new(kind: MessageType, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Run one or more i3 commands, e.g. `workspace 3`.
    pub fn run_command(command: impl Into<String>) -> Self {
        Self::new(MessageType::RunCommand, command)
    }

    /// Subscribe this connection to the named events.
    pub fn subscribe(events: &[&str]) -> Self {
        let payload = Value::from(events.iter().map(|e| Value::from(*e)).collect::<Vec<_>>());
        Self::new(MessageType::Subscribe, payload.to_string())
    }

    /// A request with an empty payload, such as `GET_WORKSPACES`.
    pub fn query(kind: MessageType) -> Self {
        Self::new(kind, String::new())
    }
}

/// A decoded reply.  An empty payload decodes as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct I3Message {
    pub kind: MessageType,
    pub payload: Value,
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq)]
pub struct I3Event {
    pub kind: EventKind,
    pub payload: Value,
}
