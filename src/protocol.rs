//! Wire protocol between controller and companion
//!
//! A message is a raw UTF-8 literal written to the transport in a single
//! write, with no length prefix and no envelope. The receiver treats every
//! delivered chunk as one candidate message.
//!
//! The vocabulary is append-only. Literals a peer does not know are ignored,
//! never rejected, so older companions keep working when controllers learn
//! new commands.

use std::fmt;

/// Protocol identifier published in the service TXT record
pub const PROTOCOL_VERSION: &str = "ring/1";

/// Maximum size of a single message on the wire
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Commands understood by this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Produce a local alert on the receiving device
    Ring,
}

impl Command {
    /// Every command this build knows, in wire order of introduction
    pub const ALL: &'static [Self] = &[Self::Ring];

    /// Wire literal for the command
    #[must_use]
    pub const fn literal(self) -> &'static str {
        match self {
            Self::Ring => "RING",
        }
    }

    /// Look up a command by its wire literal
    ///
    /// Matching is exact after trimming surrounding whitespace, so a trailing
    /// newline from a line-oriented tool still counts.
    #[must_use]
    pub fn from_literal(literal: &str) -> Option<Self> {
        let literal = literal.trim();
        Self::ALL.iter().copied().find(|c| c.literal() == literal)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.literal())
    }
}

/// One self-delimited protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: String,
}

impl Message {
    /// Build the message for a known command
    #[must_use]
    pub fn command(command: Command) -> Self {
        Self {
            payload: command.literal().to_string(),
        }
    }

    /// Build a message carrying an arbitrary literal
    ///
    /// Used to speak newer vocabulary than this build knows about.
    #[must_use]
    pub fn literal(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Decode a delivered chunk
    ///
    /// Returns `None` when the chunk is not valid UTF-8.
    #[must_use]
    pub fn decode(chunk: &[u8]) -> Option<Self> {
        std::str::from_utf8(chunk).ok().map(Self::literal)
    }

    /// Raw text payload
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Bytes to hand to the transport
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Known command carried by this message, if any
    #[must_use]
    pub fn known_command(&self) -> Option<Command> {
        Command::from_literal(&self.payload)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::command(command)
    }
}
