//! Work done once the watch is ready: announce this host, fix the time
//! zone, pull activities and push a fresh QuickFix almanac.

use std::{
   io,
   path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDate, TimeDelta, Utc};
use log::{debug, info, warn};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, process::Command};

use crate::{
   bluetooth::{att::AttChannel, hci},
   config::Config,
   error::{Error, Phase, Result},
   session::ReadyLink,
   watch::{
      almanac::AlmanacSource,
      files::DeviceProtocol,
      parser::{attribute_text, find_manifest_setting, parse_gps_status, stored_file_name, update_manifest_setting},
      protocol::{FileId, MANIFEST_TIMEZONE, StatusSignal},
   },
};

const HOSTNAME_LEN: usize = 32;

/// Minimum age of the watch's almanac before it is replaced unasked.
pub const QUICKFIX_MAX_AGE: TimeDelta = TimeDelta::hours(24);

/// Sync tasks for one ready session.
pub struct SyncTasks<'a, P, A> {
   config: &'a Config,
   protocol: &'a P,
   almanac: &'a A,
}

impl<'a, P: DeviceProtocol, A: AlmanacSource> SyncTasks<'a, P, A> {
   pub const fn new(config: &'a Config, protocol: &'a P, almanac: &'a A) -> Self {
      Self {
         config,
         protocol,
         almanac,
      }
   }

   /// Runs every enabled task in order.
   ///
   /// Host announcement, time zone and almanac download problems are only
   /// logged. Failing to fetch or store an activity, or to send the almanac,
   /// fails the session.
   pub async fn run<C: AttChannel>(&self, mut link: ReadyLink<'_, C>) -> Result<()> {
      if let Err(e) = self.announce_host(&mut link).await {
         warn!("Could not set the watch's PHONE menu: {e}");
      }

      let tasks = &self.config.tasks;
      if tasks.set_time
         && let Err(e) = self.set_time(&mut link).await
      {
         warn!("Could not update the time zone: {e}");
      }
      if tasks.get_activities {
         self.get_activities(&mut link).await?;
      }
      if tasks.update_gps > 0 {
         self.update_gps(&mut link).await?;
      }
      Ok(())
   }

   /// Writes this host's name to the file shown in the watch's PHONE menu.
   async fn announce_host<C: AttChannel>(&self, link: &mut ReadyLink<'_, C>) -> Result<()> {
      let name = host_name().map_err(Error::during(Phase::Storage))?;
      info!("Setting PHONE menu to '{name}'");
      if let Err(e) = self.protocol.delete_file(link.att, FileId::HOSTNAME).await {
         debug!("Could not delete {}: {e}", FileId::HOSTNAME);
      }
      self
         .protocol
         .write_file(link.att, FileId::HOSTNAME, 0, name.as_bytes(), link.write_pacing)
         .await
   }

   /// Makes the watch's UTC offset match this computer's.
   async fn set_time<C: AttChannel>(&self, link: &mut ReadyLink<'_, C>) -> Result<()> {
      let mut manifest = self.protocol.read_file(link.att, FileId::MANIFEST, 0).await?;
      let Some((_, watch_offset)) = find_manifest_setting(&manifest, MANIFEST_TIMEZONE) else {
         warn!("Could not find the watch's time zone setting");
         return Ok(());
      };

      let local_offset = local_utc_offset();
      if watch_offset == local_offset {
         debug!("Time zone already UTC{watch_offset:+} s");
         return Ok(());
      }
      info!("Changing time zone from UTC{watch_offset:+} s to UTC{local_offset:+} s");
      update_manifest_setting(&mut manifest, MANIFEST_TIMEZONE, local_offset);

      if let Err(e) = self.protocol.delete_file(link.att, FileId::MANIFEST).await {
         debug!("Could not delete {}: {e}", FileId::MANIFEST);
      }
      self
         .protocol
         .write_file(link.att, FileId::MANIFEST, 0, &manifest, link.write_pacing)
         .await?;
      self.protocol.signal(link.att, StatusSignal::SettingsChanged).await
   }

   /// Moves every activity file from the watch to the activity store.
   async fn get_activities<C: AttChannel>(&self, link: &mut ReadyLink<'_, C>) -> Result<()> {
      let files = self.protocol.list_subfiles(link.att, FileId::ACTIVITIES).await?;
      info!("Found {} activity files on watch", files.len());

      for (i, &file) in files.iter().enumerate() {
         info!("Reading activity file {file} ({}/{})", i + 1, files.len());
         let data = self.protocol.read_file(link.att, file, link.verbosity).await?;

         let path = activity_path(&self.config.activity_store, file);
         save_new_file(&path, &data).await?;
         info!("Saved {} bytes to {}", data.len(), path.display());

         debug!("Deleting activity file {file}");
         if let Err(e) = self.protocol.delete_file(link.att, file).await {
            warn!("Could not delete activity file {file}: {e}");
         }

         if let Some(command) = &self.config.post_command {
            post_process(command, &path).await;
         }
      }
      Ok(())
   }

   /// Replaces the watch's QuickFix almanac if it is stale or forced.
   async fn update_gps<C: AttChannel>(&self, link: &mut ReadyLink<'_, C>) -> Result<()> {
      info!("Updating QuickFix GPS");
      let last_update = if self.config.tasks.update_gps > 1 {
         None
      } else {
         match self.protocol.read_file(link.att, FileId::GPS_STATUS, 0).await {
            Ok(status) => {
               let last = parse_gps_status(&status);
               if last.is_none() {
                  warn!("Could not decode GPS status file {}", FileId::GPS_STATUS);
               }
               last
            },
            Err(e) => {
               warn!("Could not read GPS status file {}: {e}", FileId::GPS_STATUS);
               None
            },
         }
      };

      let now = Utc::now();
      if let Some(last) = last_update {
         if !quickfix_due(last, now) {
            info!("No update needed, last was on {last}");
            return Ok(());
         }
         info!("Last update was on {last}");
      }

      let format = self.config.tasks.almanac;
      let almanac = match self.almanac.fetch(now.timestamp(), format).await {
         Ok(almanac) => almanac,
         Err(e) => {
            warn!("{format} almanac download failed: {e}");
            return Ok(());
         },
      };
      info!("Sending update to watch ({} bytes)", almanac.len());

      if let Err(e) = self.protocol.delete_file(link.att, FileId::QUICKFIX_GPS).await {
         debug!("Could not delete {}: {e}", FileId::QUICKFIX_GPS);
      }
      self
         .protocol
         .write_file(link.att, FileId::QUICKFIX_GPS, link.verbosity, &almanac, link.write_pacing)
         .await?;
      self.protocol.signal(link.att, StatusSignal::QuickFixUpdated).await
   }
}

/// Whether an almanac last written on `last` (UTC midnight) should be replaced.
pub fn quickfix_due(last: NaiveDate, now: DateTime<Utc>) -> bool {
   let written = last.and_time(chrono::NaiveTime::MIN).and_utc();
   now.signed_duration_since(written) >= QUICKFIX_MAX_AGE
}

/// This computer's current offset from UTC, in seconds.
pub fn local_utc_offset() -> i32 {
   Local::now().offset().local_minus_utc()
}

fn host_name() -> io::Result<String> {
   hci::host_name::<HOSTNAME_LEN>().map(|buf| attribute_text(&buf))
}

/// Writes `data` to a file that must not exist yet.
async fn save_new_file(path: &Path, data: &[u8]) -> Result<()> {
   let storage = |e: io::Error| {
      Error::os(
         Phase::Storage,
         io::Error::new(e.kind(), format!("{}: {e}", path.display())),
      )
   };
   let mut file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(path)
      .await
      .map_err(storage)?;
   file.write_all(data).await.map_err(storage)?;
   file.flush().await.map_err(storage)
}

/// Runs the post-processing command on a saved activity, with its standard
/// output sent to our standard error.
async fn post_process(command: &str, path: &Path) {
   info!("Postprocessing {} with {command}", path.display());
   let status = Command::new(command)
      .arg(path)
      .stdout(std::io::stderr())
      .status()
      .await;
   match status {
      Ok(status) if status.success() => debug!("{command} finished"),
      Ok(status) => warn!("Postprocessing with {command} FAILED ({status})"),
      Err(e) => warn!("Could not run {command}: {e}"),
   }
}

/// Path an activity downloaded now would be stored under.
pub fn activity_path(store: &Path, file: FileId) -> PathBuf {
   store.join(stored_file_name(file, &Local::now(), "ttbin"))
}
