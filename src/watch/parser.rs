//! Decoders for the small files and attributes the sync tasks look at.

use chrono::{DateTime, NaiveDate, TimeZone};

use crate::{
   error::ProtoError,
   watch::protocol::{FileId, SUPPORTED_FIRMWARE_MAJOR},
};

const MANIFEST_HEADER: usize = 4;
const MANIFEST_ENTRY: usize = 6;

/// Decodes a sub-file listing: a u16 count followed by that many u16
/// offsets from the directory base.
pub fn parse_subfile_list(dir: FileId, data: &[u8]) -> Result<Vec<FileId>, ProtoError> {
   if data.len() < 2 || data.len() % 2 != 0 {
      return Err(ProtoError::InvalidFormat {
         reason: "listing is not a sequence of u16 values",
      });
   }
   let mut values = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
   let count = values.next().map_or(0, usize::from);
   let files: Vec<FileId> = values
      .map(|offset| FileId(dir.directory() + u32::from(offset)))
      .collect();
   if files.len() != count {
      return Err(ProtoError::InvalidFormat {
         reason: "listing count does not match its length",
      });
   }
   Ok(files)
}

/// Finds a setting in the settings manifest, returning its byte offset and
/// current value.
pub fn find_manifest_setting(manifest: &[u8], id: u16) -> Option<(usize, i32)> {
   let body = manifest.get(MANIFEST_HEADER..)?;
   body
      .chunks_exact(MANIFEST_ENTRY)
      .enumerate()
      .find(|(_, entry)| u16::from_le_bytes([entry[0], entry[1]]) == id)
      .map(|(i, entry)| {
         let value = i32::from_le_bytes([entry[2], entry[3], entry[4], entry[5]]);
         (MANIFEST_HEADER + i * MANIFEST_ENTRY + 2, value)
      })
}

/// Overwrites the value of a setting in place. Returns the previous value.
pub fn update_manifest_setting(manifest: &mut [u8], id: u16, value: i32) -> Option<i32> {
   let (offset, old) = find_manifest_setting(manifest, id)?;
   manifest[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
   Some(old)
}

/// Date of the last QuickFix update from the GPS status file.
pub fn parse_gps_status(data: &[u8]) -> Option<NaiveDate> {
   let &[_, _, year_hi, year_lo, month, day, ..] = data else {
      return None;
   };
   NaiveDate::from_ymd_opt(
      i32::from(u16::from_be_bytes([year_hi, year_lo])),
      u32::from(month),
      u32::from(day),
   )
}

/// Name under which a downloaded file is stored:
/// `<8-hex-file-id>_<YYYYMMDD_HHMMSS>.<ext>`.
pub fn stored_file_name<Tz: TimeZone>(file: FileId, when: &DateTime<Tz>, ext: &str) -> String
where
   Tz::Offset: std::fmt::Display,
{
   format!("{file}_{}.{ext}", when.format("%Y%m%d_%H%M%S"))
}

/// Turns a raw attribute value into display text.
pub fn attribute_text(value: &[u8]) -> String {
   let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
   String::from_utf8_lossy(&value[..end]).trim().to_owned()
}

/// Whether a firmware version string belongs to the supported generation.
pub fn firmware_supported(firmware: &str) -> bool {
   firmware
      .split('.')
      .next()
      .and_then(|major| major.trim().parse::<u32>().ok())
      .is_some_and(|major| major == SUPPORTED_FIRMWARE_MAJOR)
}
