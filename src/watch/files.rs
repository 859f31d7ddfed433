//! File transfer over the watch's vendor characteristics.
//!
//! Every operation starts with a command on the command/status attribute and
//! ends with a command/status notification carrying 0. Data flows through the
//! transfer attribute in blocks of [`BLOCK_SIZE`] bytes, each followed by a
//! CRC-16/MODBUS that the receiving side acknowledges on the check attribute.

use std::{fmt, time::Duration};

use crc::{CRC_16_MODBUS, Crc};
use log::{debug, info, trace, warn};
use tokio::time;

use crate::{
   bluetooth::att::{AttChannel, AttTransport, Notification},
   error::{Error, ProtoError, Result},
   watch::{
      parser::{attribute_text, firmware_supported, parse_subfile_list},
      protocol::{
         BLOCK_SIZE, CHUNK_SIZE, DEVICE_INFO, FileId, FileOp, MAGIC_BYTES, NOTIFY_ENABLE, StatusSignal, handle,
      },
   },
};

static MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const COMMAND_TRIES: u32 = 10;
const COMMAND_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on the buffer reserved up front for a file read.
const PREALLOC_LIMIT: usize = 1 << 20;

/// One device-identity attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoRecord {
   pub label: &'static str,
   pub value: String,
}

/// Device-identity attributes, in read order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo(pub Vec<DeviceInfoRecord>);

impl DeviceInfo {
   pub fn get(&self, label: &str) -> Option<&str> {
      self
         .0
         .iter()
         .find(|r| r.label == label)
         .map(|r| r.value.as_str())
   }

   pub fn records(&self) -> &[DeviceInfoRecord] {
      &self.0
   }
}

impl fmt::Display for DeviceInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      for record in self.records() {
         writeln!(f, "  {:<10}: {}", record.label, record.value)?;
      }
      Ok(())
   }
}

/// Operations the session and the sync tasks need from the device.
///
/// Implementations must keep to one outstanding ATT request at a time.
pub trait DeviceProtocol {
   /// Reads the identity attributes and rejects devices of another family
   /// or firmware generation.
   async fn check_device_version<C: AttChannel>(&self, att: &mut AttTransport<C>, verbose: bool) -> Result<DeviceInfo>;

   async fn authorize<C: AttChannel>(&self, att: &mut AttTransport<C>, code: u32, first_pairing: bool) -> Result<()>;

   async fn list_subfiles<C: AttChannel>(&self, att: &mut AttTransport<C>, dir: FileId) -> Result<Vec<FileId>>;

   async fn read_file<C: AttChannel>(&self, att: &mut AttTransport<C>, file: FileId, verbosity: u8) -> Result<Vec<u8>>;

   async fn write_file<C: AttChannel>(
      &self,
      att: &mut AttTransport<C>,
      file: FileId,
      verbosity: u8,
      data: &[u8],
      pacing: Duration,
   ) -> Result<()>;

   async fn delete_file<C: AttChannel>(&self, att: &mut AttTransport<C>, file: FileId) -> Result<()>;

   /// Fire-and-forget status write telling the watch its data changed.
   async fn signal<C: AttChannel>(&self, att: &mut AttTransport<C>, signal: StatusSignal) -> Result<()>;
}

/// The watch's own file protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchProtocol;

impl WatchProtocol {
   async fn send_command<C: AttChannel>(att: &mut AttTransport<C>, file: FileId, op: FileOp) -> Result<()> {
      let cmd = file.command(op);
      for attempt in 1..=COMMAND_TRIES {
         att.write_request(handle::CMD_STATUS, &cmd).await?;
         match att.read_notification().await {
            Ok(ntf) if ntf.handle == handle::CMD_STATUS && ntf.as_uint() == Some(1) => {
               trace!("{op} {file} accepted after {attempt} attempt(s)");
               return Ok(());
            },
            Ok(ntf) => {
               warn!(
                  "Command {} failed {attempt} time(s) with 0x{:04x}: {}, will retry",
                  hex::encode(cmd),
                  ntf.handle,
                  hex::encode(&ntf.value)
               );
            },
            Err(Error::Timeout { .. }) => {
               warn!("Command {} failed {attempt} time(s) with no answer, will retry", hex::encode(cmd));
            },
            Err(e) => return Err(e),
         }
         time::sleep(COMMAND_RETRY_DELAY).await;
      }
      Err(Error::Transfer(format!("{op} of {file} refused {COMMAND_TRIES} times")))
   }

   async fn expect<C: AttChannel>(att: &mut AttTransport<C>, handle: u16, value: Option<u64>) -> Result<Notification> {
      let ntf = att.read_notification().await?;
      if ntf.handle != handle || value.is_some_and(|v| ntf.as_uint() != Some(v)) {
         return Err(ProtoError::UnexpectedNotification {
            handle: ntf.handle,
            value: hex::encode(&ntf.value),
         }
         .into());
      }
      Ok(ntf)
   }

   /// Collects transfer notifications until the operation completes.
   async fn collect<C: AttChannel>(att: &mut AttTransport<C>) -> Result<Vec<u8>> {
      let mut buf = Vec::new();
      loop {
         let ntf = att.read_notification().await?;
         match ntf.handle {
            handle::TRANSFER => buf.extend_from_slice(&ntf.value),
            handle::CMD_STATUS if ntf.as_uint() == Some(0) => return Ok(buf),
            other => {
               return Err(ProtoError::UnexpectedNotification {
                  handle: other,
                  value: hex::encode(&ntf.value),
               }
               .into());
            },
         }
      }
   }
}

impl DeviceProtocol for WatchProtocol {
   async fn check_device_version<C: AttChannel>(&self, att: &mut AttTransport<C>, verbose: bool) -> Result<DeviceInfo> {
      let mut info = DeviceInfo::default();
      for &(handle, label) in DEVICE_INFO {
         let value = attribute_text(&att.read(handle).await?);
         if verbose {
            debug!("{label:>10} (0x{handle:04x}): {value}");
         }
         info.0.push(DeviceInfoRecord { label, value });
      }

      let maker = info.get("maker").unwrap_or_default();
      if !maker.starts_with("TomTom") {
         return Err(Error::DeviceIncompatible(format!("not a TomTom device (maker {maker:?})").into()));
      }
      let firmware = info.get("firmware").unwrap_or_default();
      if !firmware_supported(firmware) {
         return Err(Error::DeviceIncompatible(format!("unsupported firmware version {firmware:?}").into()));
      }
      Ok(info)
   }

   async fn authorize<C: AttChannel>(&self, att: &mut AttTransport<C>, code: u32, first_pairing: bool) -> Result<()> {
      if first_pairing {
         info!("Pairing with code {code:06}");
      } else {
         debug!("Authorizing with stored code");
      }
      for cccd in handle::NOTIFY_CONFIG {
         att.write_command(cccd, &NOTIFY_ENABLE).await?;
      }
      att.write_command(handle::MAGIC, &MAGIC_BYTES).await?;
      att.write_command(handle::PASSCODE, &code.to_le_bytes()).await?;

      let ntf = Self::expect(att, handle::PASSCODE, None).await?;
      if ntf.as_uint() == Some(1) {
         Ok(())
      } else {
         Err(Error::AuthRejected(code))
      }
   }

   async fn list_subfiles<C: AttChannel>(&self, att: &mut AttTransport<C>, dir: FileId) -> Result<Vec<FileId>> {
      Self::send_command(att, dir, FileOp::List).await?;
      let buf = Self::collect(att).await?;
      Ok(parse_subfile_list(dir, &buf)?)
   }

   async fn read_file<C: AttChannel>(&self, att: &mut AttTransport<C>, file: FileId, verbosity: u8) -> Result<Vec<u8>> {
      Self::send_command(att, file, FileOp::Read).await?;
      let ntf = Self::expect(att, handle::LENGTH, None).await?;
      let length: [u8; 4] = ntf.value.as_slice().try_into().map_err(|_| ProtoError::InvalidFormat {
         reason: "file length is not a 32-bit integer",
      })?;
      let length = u32::from_le_bytes(length) as usize;

      let mut out = Vec::with_capacity(length.min(PREALLOC_LIMIT));
      let mut counter = 0u32;
      let mut start = 0;
      while start < length {
         let end = length.min(start + BLOCK_SIZE);
         let mut digest = MODBUS.digest();
         let mut pos = start;
         while pos < end {
            let mut chunk = Self::expect(att, handle::TRANSFER, None).await?.value;
            // The block CRC may spill into one more notification.
            let rest = end as isize - pos as isize - chunk.len() as isize;
            if rest == 0 || rest == -1 {
               chunk.extend_from_slice(&Self::expect(att, handle::TRANSFER, None).await?.value);
            }
            let take = (end - pos).min(CHUNK_SIZE).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            digest.update(&chunk);
            pos += CHUNK_SIZE;
         }

         let residue = digest.finalize();
         if residue != 0 {
            return Err(ProtoError::ChecksumMismatch { residue }.into());
         }
         counter += 1;
         att.write_command(handle::CHECK, &counter.to_le_bytes()).await?;
         if verbosity > 1 {
            debug!("{file}: block {counter}, {end}/{length} bytes");
         }
         start = end;
      }

      Self::expect(att, handle::CMD_STATUS, Some(0)).await?;
      Ok(out)
   }

   async fn write_file<C: AttChannel>(
      &self,
      att: &mut AttTransport<C>,
      file: FileId,
      verbosity: u8,
      data: &[u8],
      pacing: Duration,
   ) -> Result<()> {
      Self::send_command(att, file, FileOp::Write).await?;
      att.write_command(handle::LENGTH, &(data.len() as u32).to_le_bytes()).await?;

      let mut counter = 0u64;
      for (index, block) in data.chunks(BLOCK_SIZE).enumerate() {
         let crc = MODBUS.checksum(block).to_le_bytes();
         let mut chunks = block.chunks(CHUNK_SIZE).peekable();
         while let Some(chunk) = chunks.next() {
            let mut out = chunk.to_vec();
            if chunks.peek().is_none() {
               out.extend_from_slice(&crc);
            }
            for part in out.chunks(CHUNK_SIZE) {
               att.write_command(handle::TRANSFER, part).await?;
               time::sleep(pacing).await;
            }
         }

         counter += 1;
         Self::expect(att, handle::CHECK, Some(counter)).await?;
         if verbosity > 1 {
            let written = (index * BLOCK_SIZE + block.len()).min(data.len());
            debug!("{file}: block {counter}, {written}/{} bytes", data.len());
         }
      }

      Self::expect(att, handle::CMD_STATUS, Some(0)).await?;
      Ok(())
   }

   async fn delete_file<C: AttChannel>(&self, att: &mut AttTransport<C>, file: FileId) -> Result<()> {
      Self::send_command(att, file, FileOp::Delete).await?;
      let leftover = Self::collect(att).await?;
      if !leftover.is_empty() {
         trace!("{file}: delete returned {}", hex::encode(&leftover));
      }
      Ok(())
   }

   async fn signal<C: AttChannel>(&self, att: &mut AttTransport<C>, signal: StatusSignal) -> Result<()> {
      debug!("Signalling {signal:?}");
      att.write_command(handle::CMD_STATUS, &signal.payload()).await
   }
}
