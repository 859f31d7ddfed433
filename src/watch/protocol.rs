//! Watch protocol definitions.
//!
//! Attribute handles, file identifiers and fixed payloads for the
//! first-generation firmware handle layout.

use std::fmt;

/// Attribute handles.
pub mod handle {
   /// Peripheral preferred connection parameters
   pub const PPCP: u16 = 0x000b;
   pub const CMD_STATUS: u16 = 0x0025;
   pub const LENGTH: u16 = 0x0028;
   pub const TRANSFER: u16 = 0x002b;
   pub const CHECK: u16 = 0x002e;
   pub const PASSCODE: u16 = 0x0032;
   pub const MAGIC: u16 = 0x0035;

   /// Client characteristic configuration descriptors enabled before
   /// authorizing, in the order the watch expects them.
   pub const NOTIFY_CONFIG: [u16; 5] = [0x0033, 0x0026, 0x002f, 0x0029, 0x002c];
}

pub const NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];
pub const MAGIC_BYTES: [u8; 8] = [0x01, 0x19, 0x00, 0x00, 0x01, 0x17, 0x00, 0x00];

/// Data bytes per transfer block; each block is followed by a CRC-16.
pub const BLOCK_SIZE: usize = 256 * 20 - 2;
/// Bytes per transfer notification or write
pub const CHUNK_SIZE: usize = 20;

/// File operation codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FileOp {
   Write = 0,
   Read = 1,
   List = 3,
   Delete = 4,
}

/// 24-bit remote file identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
   pub const QUICKFIX_GPS: Self = Self(0x0001_0100);
   pub const GPS_STATUS: Self = Self(0x0002_0001);
   pub const HOSTNAME: Self = Self(0x0002_0002);
   pub const MANIFEST: Self = Self(0x0085_0000);
   pub const ACTIVITIES: Self = Self(0x0091_0000);

   /// The command frame for `op` on this file.
   ///
   /// The low two bytes go out swapped: `0x001234ab` is sent as `12 ab 34`.
   pub const fn command(self, op: FileOp) -> [u8; 4] {
      let [_, hi, mid, lo] = self.0.to_be_bytes();
      [op as u8, hi, lo, mid]
   }

   /// Directory part of the identifier, used as the base for sub-files.
   pub const fn directory(self) -> u32 {
      self.0 & 0x00ff_0000
   }
}

impl fmt::Display for FileId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:08x}", self.0)
   }
}

/// Fixed 4-byte payloads written to the command/status attribute after the
/// watch's data changed underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
   SettingsChanged,
   QuickFixUpdated,
}

impl StatusSignal {
   pub const fn payload(self) -> [u8; 4] {
      match self {
         Self::SettingsChanged => [0x05, 0x85, 0x00, 0x00],
         Self::QuickFixUpdated => [0x05, 0x01, 0x00, 0x01],
      }
   }
}

/// Device-identity attributes read by the version check.
pub const DEVICE_INFO: &[(u16, &str)] = &[
   (0x001e, "maker"),
   (0x0016, "serial"),
   (0x0003, "user_name"),
   (0x0014, "model_name"),
   (0x001a, "model_num"),
   (0x001c, "firmware"),
   (0x0020, "software"),
];

/// Firmware major version this handle layout belongs to
pub const SUPPORTED_FIRMWARE_MAJOR: u32 = 1;

/// Settings manifest entry holding the time zone offset in seconds
pub const MANIFEST_TIMEZONE: u16 = 169;
