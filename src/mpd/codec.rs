//! Wire layer of the MPD protocol.
//!
//! The server opens with one banner line (`OK MPD <version>`).  Each
//! command is one line; its reply is any number of `key: value` lines
//! closed by `OK`, or a single `ACK [code@index] {command} message` line.

use super::{MpdRequest, MpdResponse};
use crate::error::{FrameError, ProtocolError};
use crate::traits::{Codec, Decoded, Frame, FrameOf};
use log::{debug, info, trace};
use std::convert::Infallible;

/// Banner prefix every MPD server sends.
pub const DEFAULT_GREETING: &str = "OK MPD ";

/// Default cap on a single line: 1 MiB.
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

/// Quote one argument: wrap it in `"` and escape `\` and `"`.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// The wire line for `request`, without its trailing newline.
pub fn encode_line(request: &MpdRequest) -> Result<String, FrameError> {
    if request.command.is_empty() || request.command.contains(char::is_whitespace) {
        return Err(FrameError::InvalidRequest(format!(
            "invalid command name {:?}",
            request.command
        )));
    }
    let mut line = request.command.clone();
    for arg in &request.args {
        if arg.contains('\n') {
            return Err(FrameError::InvalidRequest(format!(
                "argument to {} contains a newline",
                request.command
            )));
        }
        line.push(' ');
        line.push_str(&quote(arg));
    }
    Ok(line)
}

/// Decode one command line: a bare command name followed by quoted or bare
/// arguments.
pub fn parse_command(line: &str) -> Result<MpdRequest, FrameError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut chars = line.chars().peekable();
    let mut words = Vec::new();
    loop {
        while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut word = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => word.push(c),
                        None => return Err(malformed("dangling escape in", line)),
                    },
                    Some(c) => word.push(c),
                    None => return Err(malformed("unterminated quote in", line)),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_ascii_whitespace()) {
                word.push(c);
            }
        }
        words.push(word);
    }
    let mut words = words.into_iter();
    let command = words
        .next()
        .ok_or_else(|| FrameError::Malformed("empty command line".into()))?;
    Ok(MpdRequest {
        command,
        args: words.collect(),
    })
}

fn malformed(what: &str, line: &str) -> FrameError {
    FrameError::Malformed(format!("{} {:?}", what, line))
}

/// Parse the text after `ACK `.  Anything not in the usual
/// `[code@index] {command} message` shape becomes a bare message.
pub fn parse_ack(text: &str) -> ProtocolError {
    fn structured(text: &str) -> Option<ProtocolError> {
        let rest = text.strip_prefix('[')?;
        let (position, rest) = rest.split_once(']')?;
        let (code, index) = position.split_once('@')?;
        let rest = rest.trim_start().strip_prefix('{')?;
        let (command, message) = rest.split_once('}')?;
        Some(ProtocolError {
            code: code.parse().ok(),
            index: index.parse().ok(),
            command: Some(command.to_string()).filter(|c| !c.is_empty()),
            message: message.trim_start().to_string(),
        })
    }
    structured(text).unwrap_or_else(|| ProtocolError::new(text))
}

/// [`Codec`] for MPD connections.
#[derive(Debug, Clone)]
pub struct MpdCodec {
    greeting: String,
    interrupt_idle: bool,
    max_line: usize,
    greeted: bool,
    pairs: Vec<(String, String)>,
}

impl MpdCodec {
    pub fn new(greeting: impl Into<String>, interrupt_idle: bool, max_line: usize) -> Self {
        Self {
            greeting: greeting.into(),
            interrupt_idle,
            max_line,
            greeted: false,
            pairs: Vec::new(),
        }
    }

    fn accept_banner(&mut self, line: &str) -> Result<FrameOf<Self>, FrameError> {
        if !line.starts_with(&self.greeting) {
            return Err(FrameError::BadGreeting(line.to_string()));
        }
        // The protocol version is the banner's last word, whatever prefix
        // was configured.
        let version = line.split_whitespace().last().unwrap_or_default();
        info!("MPD server speaks protocol {}", version);
        self.greeted = true;
        Ok(Frame::Greeting(Some(version.to_string())))
    }
}

impl Default for MpdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_GREETING, true, DEFAULT_MAX_LINE)
    }
}

impl Codec for MpdCodec {
    type Request = MpdRequest;
    type Reply = MpdResponse;
    type Event = Infallible;
    type Tag = ();

    fn expects_greeting(&self) -> bool {
        true
    }

    fn encode(
        &mut self,
        request: &MpdRequest,
        dst: &mut Vec<u8>,
    ) -> Result<Option<()>, FrameError> {
        let line = encode_line(request)?;
        if self.interrupt_idle && request.command != "idle" && request.command != "noidle" {
            dst.extend_from_slice(b"noidle\n");
        }
        trace!("mpd > {}", line);
        dst.extend_from_slice(line.as_bytes());
        dst.push(b'\n');
        Ok(None)
    }

    fn decode(&mut self, src: &[u8]) -> Result<Decoded<FrameOf<Self>>, FrameError> {
        let Some(end) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_line {
                return Err(FrameError::LineTooLong {
                    len: src.len(),
                    max: self.max_line,
                });
            }
            return Ok(Decoded::need_more(0));
        };
        if end > self.max_line {
            return Err(FrameError::LineTooLong {
                len: end,
                max: self.max_line,
            });
        }
        let consumed = end + 1;
        let line = std::str::from_utf8(&src[..end])
            .map_err(|e| FrameError::Malformed(format!("line is not UTF-8: {}", e)))?;
        trace!("mpd < {}", line);

        if !self.greeted {
            return Ok(Decoded::frame(self.accept_banner(line)?, consumed));
        }
        if line == "OK" {
            let pairs = std::mem::take(&mut self.pairs);
            return Ok(Decoded::frame(
                Frame::Reply {
                    tag: None,
                    body: Ok(MpdResponse { pairs }),
                },
                consumed,
            ));
        }
        if let Some(text) = line.strip_prefix("ACK ") {
            self.pairs.clear();
            let error = parse_ack(text);
            debug!("mpd rejected a command: {}", error);
            return Ok(Decoded::frame(
                Frame::Reply {
                    tag: None,
                    body: Err(error),
                },
                consumed,
            ));
        }
        if line == "list_OK" {
            return Ok(Decoded::need_more(consumed));
        }
        match line.split_once(": ") {
            Some(("binary", _)) => {
                Err(FrameError::Malformed("binary responses are not supported".into()))
            }
            Some((key, value)) => {
                self.pairs.push((key.to_string(), value.to_string()));
                Ok(Decoded::need_more(consumed))
            }
            None => Err(FrameError::Malformed(format!("unexpected line {:?}", line))),
        }
    }
}
