//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Sync activities, time zone and GPS almanac with a TomTom GPS watch over
/// Bluetooth LE.
#[derive(Parser, Debug, Default)]
#[command(name = "ttblue", disable_version_flag = true)]
pub struct Args {
   /// Same as --get-activities --update-gps --set-time --version
   #[arg(short, long)]
   pub auto: bool,

   /// Downloads and deletes .ttbin activity files from the watch
   #[arg(long)]
   pub get_activities: bool,

   /// Set time zone on the watch to match this computer
   #[arg(long)]
   pub set_time: bool,

   /// Location to store .ttbin activity files [default: .]
   #[arg(short = 's', long, value_name = "PATH")]
   pub activity_store: Option<PathBuf>,

   /// Command to run (with .ttbin file as argument) for every activity file
   #[arg(short, long, value_name = "CMD")]
   pub post: Option<String>,

   /// Download QuickFix update file and send it to the watch (if repeated,
   /// forces update even if not needed)
   #[arg(long, action = ArgAction::Count)]
   pub update_gps: u8,

   /// Use GLONASS version of QuickFix update file
   #[arg(long)]
   pub glonass: bool,

   /// Bluetooth MAC address of the watch (E4:04:39:__:__:__); will scan if
   /// unspecified
   #[arg(short, long, value_name = "MACADDR")]
   pub device: Option<String>,

   /// Bluetooth HCI interface to use
   #[arg(short, long, value_name = "hciX")]
   pub interface: Option<String>,

   /// 6-digit pairing code for the watch (if already paired)
   #[arg(short, long, value_name = "NUMBER")]
   pub code: Option<u32>,

   /// Show watch firmware version and identifiers
   #[arg(short, long)]
   pub version: bool,

   /// Increase level of debugging output
   #[arg(short = 'D', long, action = ArgAction::Count)]
   pub debug: u8,

   /// Suppress debugging output
   #[arg(short, long, conflicts_with = "debug")]
   pub quiet: bool,

   /// Run as a daemon which will try to connect repeatedly
   #[arg(long)]
   pub daemon: bool,

   /// Wait time after successful connection to watch [default: 3600]
   #[arg(short = 'w', long, value_name = "SECONDS")]
   pub wait_success: Option<u64>,

   /// Wait time after failed connection to watch [default: 10]
   #[arg(short = 'W', long, value_name = "SECONDS")]
   pub wait_fail: Option<u64>,

   /// Configuration file to read instead of the default location
   #[arg(long, value_name = "FILE")]
   pub config: Option<PathBuf>,
}

impl Args {
   /// Verbosity level: 0 when quiet, else 1 plus one per --debug.
   pub fn verbosity(&self) -> u8 {
      if self.quiet { 0 } else { self.debug.saturating_add(1) }
   }
}
