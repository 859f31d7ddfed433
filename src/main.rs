//! Bluetooth LE sync client for TomTom GPS sport watches
//!
//! Finds or connects to the watch, negotiates a fast link, authorizes with
//! the pairing code and runs the configured sync tasks, once or forever as
//! a daemon.

use std::process::ExitCode;

use clap::Parser;
use log::{debug, info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod bluetooth;
mod cli;
mod config;
mod error;
mod operator;
mod session;
mod supervisor;
mod watch;

#[cfg(test)]
mod testing;

use crate::{
   bluetooth::hci,
   cli::Args,
   config::{Config, FileConfig},
   operator::{Console, Operator},
   session::{Bluez, Session},
   supervisor::{ExitStatus, Supervisor},
   watch::{almanac::HttpAlmanac, files::WatchProtocol},
};

/// Exit status after a second interrupt.
const INTERRUPTED: i32 = 130;

fn load_config(args: &Args) -> error::Result<Config> {
   let file = FileConfig::load(args.config.as_deref())?;
   Config::resolve(args, file)
}

/// Resolves the settings before any controller is touched. Every problem
/// maps to [`ExitStatus::InvalidConfiguration`].
fn configure(args: &Args) -> Result<Config, ExitStatus> {
   load_config(args).map_err(|e| {
      eprintln!("{e}");
      ExitStatus::InvalidConfiguration
   })
}

/// The first interrupt cancels gracefully, the second one exits at once.
fn watch_interrupts(cancel: CancellationToken) {
   tokio::spawn(async move {
      if signal::ctrl_c().await.is_err() {
         return;
      }
      warn!("Interrupted, finishing up (press Ctrl-C again to quit now)");
      cancel.cancel();
      if signal::ctrl_c().await.is_ok() {
         std::process::exit(INTERRUPTED);
      }
   });
}

#[tokio::main]
async fn main() -> ExitCode {
   let args = Args::parse();
   let config = match configure(&args) {
      Ok(config) => config,
      Err(status) => return status.into(),
   };

   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level().as_str()))
      .init();

   let dev_id = match config.interface {
      Some(dev_id) => dev_id,
      None => match hci::default_device() {
         Ok(Some(dev_id)) => dev_id,
         Ok(None) => 0,
         Err(e) => {
            debug!("Could not list Bluetooth controllers: {e}");
            0
         },
      },
   };
   info!("Using Bluetooth interface hci{dev_id}");

   let cancel = CancellationToken::new();
   watch_interrupts(cancel.clone());

   let mut console = Console::new();
   if config.first_pairing()
      && let Err(e) = console.await_pairing_mode().await
   {
      log::error!("{e}");
      return ExitStatus::AttemptFailed.into();
   }

   let almanac = match HttpAlmanac::new() {
      Ok(almanac) => almanac,
      Err(e) => {
         log::error!("{e}");
         return ExitStatus::AttemptFailed.into();
      },
   };

   let mut session = Session::new(&config, dev_id, Bluez, WatchProtocol, console, almanac, cancel.clone());
   let status = Supervisor::new(&config, cancel).run(&mut session).await;
   debug!("Exiting with {status:?}");
   status.into()
}
