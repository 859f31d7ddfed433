//! Device addresses as discovered by the scanner or supplied by configuration.

use std::{fmt, str::FromStr};

use bluer::{Address, AddressType};

use crate::error::Error;

/// Assigned address-block prefix of the watch vendor.
pub const VENDOR_PREFIX: [u8; 3] = [0xE4, 0x04, 0x39];

/// LE address type as carried in advertisement reports and connect requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum AddressKind {
   Public,
   #[default]
   Random,
}

impl AddressKind {
   /// Decodes the HCI address-type octet.
   pub const fn from_hci(value: u8) -> Self {
      if value == 0x00 { Self::Public } else { Self::Random }
   }

   pub const fn to_bluer(self) -> AddressType {
      match self {
         Self::Public => AddressType::LePublic,
         Self::Random => AddressType::LeRandom,
      }
   }
}

/// A 6-octet link-layer address with its address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
   pub addr: Address,
   pub kind: AddressKind,
}

impl DeviceAddress {
   pub const fn new(addr: Address, kind: AddressKind) -> Self {
      Self { addr, kind }
   }

   /// Builds an address from the little-endian octet order used on the HCI wire.
   pub fn from_le_bytes(bytes: [u8; 6], kind: AddressKind) -> Self {
      let [b0, b1, b2, b3, b4, b5] = bytes;
      Self::new(Address::new([b5, b4, b3, b2, b1, b0]), kind)
   }

   /// True if the first three octets (as displayed) match the vendor block.
   pub fn has_vendor_prefix(&self) -> bool {
      self.addr.0[..3] == VENDOR_PREFIX
   }
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.addr, self.kind)
   }
}

impl FromStr for DeviceAddress {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let addr = Address::from_str(s.trim()).map_err(|_| {
         Error::Configuration(format!(
            "could not understand Bluetooth device address {s:?}; it should look like E4:04:39:__:__:__"
         ))
      })?;
      Ok(Self::new(addr, AddressKind::default()))
   }
}
