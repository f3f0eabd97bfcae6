//! Roles, commands, and the wire tokens that carry them.
//!
//! Uses proper enums with `FromStr`/`TryFrom`; no panics on unknown values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ── Role ─────────────────────────────────────────────────────────

/// Which side of the pairing this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Discovers a follower, dials it, and forwards local key presses.
    #[default]
    Controller,
    /// Listens for one controller and executes the commands it sends.
    Follower,
}

impl Role {
    pub fn display_name(&self) -> &'static str {
        match self {
            Role::Controller => "Controller",
            Role::Follower => "Follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Role {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Role::Controller),
            "follower" => Ok(Role::Follower),
            other => Err(SyncError::InvalidConfig(format!("unknown role {other:?}"))),
        }
    }
}

// ── Command ──────────────────────────────────────────────────────

/// A slide-navigation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Next,
    Previous,
}

impl Command {
    pub const ALL: [Command; 2] = [Command::Next, Command::Previous];

    pub fn display_name(&self) -> &'static str {
        match self {
            Command::Next => "Next Slide",
            Command::Previous => "Previous Slide",
        }
    }

    /// The wire message that carries this command.
    pub fn message(&self) -> Message {
        match self {
            Command::Next => Message::Next,
            Command::Previous => Message::Previous,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ── Message ──────────────────────────────────────────────────────

/// Every token the line protocol knows about.
///
/// `Ping` and `Pong` are reserved: they parse, but carry no command and
/// nothing ever sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    Next,
    Previous,
    Ping,
    Pong,
}

impl Message {
    /// The ASCII token on the wire, without the newline.
    pub fn token(&self) -> &'static str {
        match self {
            Message::Next => "NEXT",
            Message::Previous => "PREV",
            Message::Ping => "PING",
            Message::Pong => "PONG",
        }
    }

    /// Look up a trimmed token. Unknown tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "NEXT" => Some(Message::Next),
            "PREV" => Some(Message::Previous),
            "PING" => Some(Message::Ping),
            "PONG" => Some(Message::Pong),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<Command> {
        match self {
            Message::Next => Some(Command::Next),
            Message::Previous => Some(Command::Previous),
            Message::Ping | Message::Pong => None,
        }
    }
}

impl TryFrom<Message> for Command {
    type Error = SyncError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        message
            .command()
            .ok_or_else(|| SyncError::Other(format!("{} carries no command", message.token())))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}
