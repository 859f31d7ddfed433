//! Configuration for the sync client.
//!
//! Settings come from an optional TOML file and the command line, with the
//! command line taking precedence. Both are merged and validated once at
//! startup into an immutable [`Config`] that is passed to every component.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use log::{LevelFilter, debug};
use serde::Deserialize;

use crate::{
   bluetooth::address::DeviceAddress,
   cli::Args,
   error::{Error, Result},
   watch::almanac::AlmanacFormat,
};

const MAX_PAIRING_CODE: u32 = 999_999;

/// Settings file contents. Every field is optional.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
   pub device: Option<String>,
   pub interface: Option<String>,
   pub code: Option<u32>,
   pub activity_store: Option<PathBuf>,
   pub post: Option<String>,

   #[serde(default = "default_wait_success")]
   pub wait_success: u64,

   #[serde(default = "default_wait_fail")]
   pub wait_fail: u64,

   pub glonass: bool,
}

const fn default_wait_success() -> u64 {
   3600
}

const fn default_wait_fail() -> u64 {
   10
}

impl Default for FileConfig {
   fn default() -> Self {
      Self {
         device: None,
         interface: None,
         code: None,
         activity_store: None,
         post: None,
         wait_success: default_wait_success(),
         wait_fail: default_wait_fail(),
         glonass: false,
      }
   }
}

impl FileConfig {
   /// Loads the settings file, or the defaults if there is none.
   pub fn load(path: Option<&Path>) -> Result<Self> {
      let config_path = match path {
         Some(path) => path.to_path_buf(),
         None => Self::config_path()?,
      };

      if config_path.exists() {
         debug!("Reading settings from {}", config_path.display());
         let contents = fs::read_to_string(&config_path).map_err(|e| {
            Error::Configuration(format!("could not read {}: {e}", config_path.display()))
         })?;
         Ok(toml::from_str(&contents)?)
      } else if path.is_some() {
         Err(Error::Configuration(format!("{} does not exist", config_path.display())))
      } else {
         Ok(Self::default())
      }
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("TTBLUE_HOME") {
         PathBuf::from(home)
      } else if let Some(config_home) = dirs::config_dir() {
         config_home.join("ttblue")
      } else {
         return Err(Error::Configuration("no configuration directory found".into()));
      };

      Ok(config_dir.join("config.toml"))
   }
}

/// Which sync tasks to run once the watch is ready.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tasks {
   pub get_activities: bool,
   pub set_time: bool,
   /// 0 = off, 1 = update when stale, 2+ = force
   pub update_gps: u8,
   pub almanac: AlmanacFormat,
   pub show_version: bool,
}

/// Immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
   /// Fixed watch address; the scanner runs when absent
   pub device: Option<DeviceAddress>,
   /// HCI controller index; the default route is used when absent
   pub interface: Option<u16>,
   /// Previously established pairing code; absent means first pairing
   pub pairing_code: Option<u32>,
   pub daemon: bool,
   pub wait_success: Duration,
   pub wait_fail: Duration,
   pub verbosity: u8,
   pub tasks: Tasks,
   pub activity_store: PathBuf,
   pub post_command: Option<String>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device: None,
         interface: None,
         pairing_code: None,
         daemon: false,
         wait_success: Duration::from_secs(default_wait_success()),
         wait_fail: Duration::from_secs(default_wait_fail()),
         verbosity: 1,
         tasks: Tasks::default(),
         activity_store: PathBuf::from("."),
         post_command: None,
      }
   }
}

impl Config {
   /// Merges command line and settings file, then validates the result.
   pub fn resolve(args: &Args, file: FileConfig) -> Result<Self> {
      let device = args
         .device
         .as_deref()
         .or(file.device.as_deref())
         .map(str::parse::<DeviceAddress>)
         .transpose()?;
      let interface = args
         .interface
         .as_deref()
         .or(file.interface.as_deref())
         .map(parse_interface)
         .transpose()?;
      let pairing_code = args.code.or(file.code);
      if let Some(code) = pairing_code
         && code > MAX_PAIRING_CODE
      {
         return Err(Error::Configuration(format!(
            "pairing code should be a 6-digit number, got {code}"
         )));
      }

      let config = Self {
         device,
         interface,
         pairing_code,
         daemon: args.daemon,
         wait_success: Duration::from_secs(args.wait_success.unwrap_or(file.wait_success)),
         wait_fail: Duration::from_secs(args.wait_fail.unwrap_or(file.wait_fail)),
         verbosity: args.verbosity(),
         tasks: Tasks {
            get_activities: args.auto || args.get_activities,
            set_time: args.auto || args.set_time,
            update_gps: if args.auto { args.update_gps.max(1) } else { args.update_gps },
            almanac: if args.glonass || file.glonass {
               AlmanacFormat::Glonass
            } else {
               AlmanacFormat::Gps
            },
            show_version: args.auto || args.version,
         },
         activity_store: args
            .activity_store
            .clone()
            .or(file.activity_store)
            .unwrap_or_else(|| PathBuf::from(".")),
         post_command: args.post.clone().or(file.post),
      };
      config.validate()?;
      Ok(config)
   }

   /// Rejects combinations that cannot work before any socket is opened.
   pub fn validate(&self) -> Result<()> {
      if self.daemon && (self.first_pairing() || self.device.is_none()) {
         return Err(Error::Configuration(
            "daemon mode cannot be used together with initial pairing, and the Bluetooth device \
             address must be specified; please specify pairing code (-c) and device address (-d)"
               .into(),
         ));
      }
      Ok(())
   }

   /// True when no pairing code was supplied and the operator must pair.
   pub const fn first_pairing(&self) -> bool {
      self.pairing_code.is_none()
   }

   pub const fn log_level(&self) -> LevelFilter {
      match self.verbosity {
         0 => LevelFilter::Warn,
         1 => LevelFilter::Info,
         2 => LevelFilter::Debug,
         _ => LevelFilter::Trace,
      }
   }
}

/// Parses `hciN` or a bare controller index.
pub fn parse_interface(name: &str) -> Result<u16> {
   let name = name.trim();
   name
      .strip_prefix("hci")
      .unwrap_or(name)
      .parse()
      .map_err(|_| Error::Configuration(format!("invalid Bluetooth interface {name:?}")))
}
