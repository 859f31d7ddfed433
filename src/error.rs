//! Error types for the watch sync client.
//!
//! Every failure carries the phase it happened in. OS errors are classified
//! once, where they are observed, so the session can tell a permission
//! problem from a timeout or a dropped link without looking at errno again.

use std::io;

use smol_str::SmolStr;
use thiserror::Error;

use crate::bluetooth::l2cap::LinkError;

/// Where in the session lifecycle an error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
   #[strum(to_string = "controller")]
   Controller,
   #[strum(to_string = "scan")]
   Scan,
   #[strum(to_string = "negotiation")]
   Negotiate,
   #[strum(to_string = "ATT transaction")]
   Att,
   #[strum(to_string = "operator input")]
   Operator,
   #[strum(to_string = "file storage")]
   Storage,
}

/// Main error type for the sync client.
#[derive(Error, Debug)]
pub enum Error {
   #[error("{phase}: permission denied: {source}")]
   PermissionDenied { phase: Phase, source: io::Error },

   #[error("{phase}: timed out")]
   Timeout { phase: Phase },

   #[error("{phase}: not connected")]
   NotConnected { phase: Phase },

   #[error("{phase}: {source}")]
   Os { phase: Phase, source: io::Error },

   #[error(transparent)]
   Link(#[from] LinkError),

   #[error("Protocol error: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Invalid configuration: {0}")]
   Configuration(String),

   #[error("Device incompatible: {0}")]
   DeviceIncompatible(SmolStr),

   #[error("Bluetooth interface hci{0} doesn't support LE and BR/EDR")]
   AdapterUnsupported(u16),

   #[error("Device didn't accept pairing code {0:06}")]
   AuthRejected(u32),

   #[error("Pairing code should be a 6-digit number, got {0:?}")]
   InvalidPairingCode(String),

   #[error("File transfer failed: {0}")]
   Transfer(String),

   #[error("Almanac download failed: {0}")]
   Http(#[from] reqwest::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("Cancelled by interrupt")]
   Cancelled,
}

impl Error {
   /// Classifies an OS-level failure observed during `phase`.
   pub fn os(phase: Phase, source: io::Error) -> Self {
      match source.raw_os_error() {
         Some(libc::EPERM | libc::EACCES) => Self::PermissionDenied { phase, source },
         Some(libc::ETIMEDOUT) => Self::Timeout { phase },
         Some(libc::ENOTCONN) => Self::NotConnected { phase },
         _ if source.kind() == io::ErrorKind::TimedOut => Self::Timeout { phase },
         _ => Self::Os { phase, source },
      }
   }

   /// Returns a closure classifying errors for `phase`, for use with `map_err`.
   pub fn during(phase: Phase) -> impl FnOnce(io::Error) -> Self {
      move |source| Self::os(phase, source)
   }

   pub const fn is_permission_denied(&self) -> bool {
      matches!(self, Self::PermissionDenied { .. })
   }

   /// True if the remote device could not be reached or refused the link.
   pub const fn is_connect_phase(&self) -> bool {
      matches!(self, Self::Link(LinkError::Connect { .. }))
   }
}

/// Error type for framing and payload decoding.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   #[error("Unknown ATT opcode 0x{opcode:02x}")]
   UnknownOpcode { opcode: u8 },

   #[error("Unexpected ATT response 0x{actual:02x}, expected 0x{expected:02x}")]
   UnexpectedResponse { expected: u8, actual: u8 },

   #[error("ATT error 0x{code:02x} for request 0x{request:02x} on handle 0x{handle:04x}")]
   ErrorResponse { request: u8, handle: u16, code: u8 },

   #[error("ATT error response names handle 0x{actual:04x}, request was for 0x{expected:04x}")]
   HandleMismatch { expected: u16, actual: u16 },

   #[error("Attribute value of {len} bytes exceeds the {max}-byte limit")]
   ValueTooLong { len: usize, max: usize },

   #[error("Unexpected notification on handle 0x{handle:04x}: {value}")]
   UnexpectedNotification { handle: u16, value: String },

   #[error("Block checksum mismatch (residue 0x{residue:04x})")]
   ChecksumMismatch { residue: u16 },

   #[error("Invalid packet format: {reason}")]
   InvalidFormat { reason: &'static str },
}

/// Convenience type alias for Results with the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
