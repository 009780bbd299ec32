//! Command Codec
//!
//! All frames on both links (host SPI and radio) are fixed length and share
//! one layout family:
//!
//! ```text
//! command: | token (7 ASCII bytes) | transaction id | parameter |
//! reply:   | b"ACK_"               | transaction id | battery   |
//! ```
//!
//! Tokens are matched exactly: case-sensitive, no trimming, no prefix
//! matching. Anything that doesn't match decodes to an explicit invalid
//! result and is never aliased to a known command.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Length of a command token
pub const COMMAND_LEN: usize = 7;
/// Length of the bytes trailing a token or marker (transaction id + one data byte)
pub const POSTFIX_LEN: usize = 2;
/// Length of the ACK marker
pub const REPLY_LEN: usize = 4;
/// Total length of a command frame
pub const COMMAND_FRAME_LEN: usize = COMMAND_LEN + POSTFIX_LEN;
/// Total length of a reply/ACK frame
pub const REPLY_FRAME_LEN: usize = REPLY_LEN + POSTFIX_LEN;

/// Transaction id reserved for status queries. No relayed command may use it.
pub const STATUS_TRANSACTION_ID: u8 = 0;
/// Parameter byte sent along with status queries
pub const STATUS_PARAMETER: u8 = b'0';

/// Marker that opens every reply frame
pub const ACK_MARKER: &[u8; REPLY_LEN] = b"ACK_";

/// A known command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// Drive the selected valve open
    TurnOn = 0,
    /// Drive the selected valve closed
    TurnOff = 1,
    /// Round trip only, no output effect. Useful as a link check.
    NoOp = 2,
    /// Read back the last applied transaction. Answered by the bridge
    /// itself, never sent over radio.
    GetStatus = 3,
}

/// The static token table, indexed by `Command as usize`.
const TOKEN_TABLE: [(Command, &[u8]); 4] = [
    (Command::TurnOn, b"TURNON_"),
    (Command::TurnOff, b"TURNOFF"),
    (Command::NoOp, b"NOOP___"),
    (Command::GetStatus, b"STATUS_"),
];

impl Command {
    /// Every command, in table order
    pub const ALL: [Command; 4] = [
        Command::TurnOn,
        Command::TurnOff,
        Command::NoOp,
        Command::GetStatus,
    ];

    /// The wire token for this command
    #[inline]
    pub fn token(self) -> &'static [u8] {
        TOKEN_TABLE[self as usize].1
    }

    /// Does this command travel over the radio link?
    #[inline]
    pub fn is_relayed(self) -> bool {
        match self {
            Command::TurnOn | Command::TurnOff | Command::NoOp => true,
            Command::GetStatus => false,
        }
    }
}

/// Map the leading token of `buf` to a [Command]
///
/// `buf` must hold at least a token and its postfix. Returns `None` for
/// short buffers and unknown tokens.
pub fn decode(buf: &[u8]) -> Option<Command> {
    if buf.len() < COMMAND_LEN + POSTFIX_LEN {
        return None;
    }
    let token = &buf[..COMMAND_LEN];
    TOKEN_TABLE
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(c, _)| *c)
}

/// The fixed-length token for `cmd`
#[inline]
pub fn encode(cmd: Command) -> &'static [u8] {
    cmd.token()
}

/// A token table entry has the wrong length
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct TableError {
    /// Position of the offending entry
    pub index: usize,
}

/// Check that every token in the table is exactly [COMMAND_LEN] bytes
///
/// Nodes run this once at boot and refuse to start on failure.
pub fn verify_table() -> Result<(), TableError> {
    check_table(&TOKEN_TABLE)
}

fn check_table(table: &[(Command, &[u8])]) -> Result<(), TableError> {
    match table.iter().position(|(_, t)| t.len() != COMMAND_LEN) {
        Some(index) => Err(TableError { index }),
        None => Ok(()),
    }
}

/// Why a command frame was rejected
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum FrameError {
    /// The frame wasn't exactly [COMMAND_FRAME_LEN] bytes
    Length(usize),
    /// The token didn't match any table entry
    UnknownToken,
}

/// One logical command instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Envelope {
    /// What to do
    pub command: Command,
    /// Host assigned id, echoed back in the ACK
    pub transaction_id: u8,
    /// Command argument, e.g. the valve channel selector `b'1'`/`b'2'`
    pub parameter: u8,
}

impl Envelope {
    /// Build a status query envelope
    pub const fn status() -> Self {
        Self {
            command: Command::GetStatus,
            transaction_id: STATUS_TRANSACTION_ID,
            parameter: STATUS_PARAMETER,
        }
    }

    /// Decode a complete command frame
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != COMMAND_FRAME_LEN {
            return Err(FrameError::Length(buf.len()));
        }
        let command = decode(buf).ok_or(FrameError::UnknownToken)?;
        Ok(Self {
            command,
            transaction_id: buf[COMMAND_LEN],
            parameter: buf[COMMAND_LEN + 1],
        })
    }

    /// Encode into a complete command frame
    pub fn encode(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut out = [0u8; COMMAND_FRAME_LEN];
        out[..COMMAND_LEN].copy_from_slice(self.command.token());
        out[COMMAND_LEN] = self.transaction_id;
        out[COMMAND_LEN + 1] = self.parameter;
        out
    }
}

/// An acknowledgement
///
/// The same layout is used for the remote's radio ACK and for the bridge's
/// status reply to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Ack {
    /// Id of the acknowledged command
    pub transaction_id: u8,
    /// Scaled battery reading of the remote node
    pub battery: u8,
}

impl Ack {
    /// Decode a reply frame. Wrong length or marker gives `None`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != REPLY_FRAME_LEN || &buf[..REPLY_LEN] != ACK_MARKER {
            return None;
        }
        Some(Self {
            transaction_id: buf[REPLY_LEN],
            battery: buf[REPLY_LEN + 1],
        })
    }

    /// Encode into a complete reply frame
    pub fn encode(&self) -> [u8; REPLY_FRAME_LEN] {
        let mut out = [0u8; REPLY_FRAME_LEN];
        out[..REPLY_LEN].copy_from_slice(ACK_MARKER);
        out[REPLY_LEN] = self.transaction_id;
        out[REPLY_LEN + 1] = self.battery;
        out
    }
}

/// Output channel selected by a command's parameter byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ValveChannel {
    /// Parameter `b'1'`
    One,
    /// Parameter `b'2'`
    Two,
}

impl ValveChannel {
    /// Parse a parameter byte. Anything but `b'1'` or `b'2'` selects nothing.
    pub const fn from_param(param: u8) -> Option<Self> {
        match param {
            b'1' => Some(ValveChannel::One),
            b'2' => Some(ValveChannel::Two),
            _ => None,
        }
    }

    /// The parameter byte selecting this channel
    pub const fn param(self) -> u8 {
        match self {
            ValveChannel::One => b'1',
            ValveChannel::Two => b'2',
        }
    }
}
