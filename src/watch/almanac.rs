//! QuickFix satellite almanac download.

use std::time::Duration;

use log::debug;

use crate::error::Result;

const GPS_URL: &str = "http://gpsquickfix.services.tomtom.com/fitness/sifgps.f2p3enc.ee";
const GLONASS_URL: &str = "http://gpsquickfix.services.tomtom.com/fitness/sifglo.f2p3enc.ee";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Which constellation the almanac covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AlmanacFormat {
   #[default]
   Gps,
   Glonass,
}

impl AlmanacFormat {
   pub fn url(self, timestamp: i64) -> String {
      let base = match self {
         Self::Gps => GPS_URL,
         Self::Glonass => GLONASS_URL,
      };
      format!("{base}?timestamp={timestamp}")
   }
}

/// Source of almanac files; the bytes are opaque to the client.
pub trait AlmanacSource {
   async fn fetch(&self, timestamp: i64, format: AlmanacFormat) -> Result<Vec<u8>>;
}

/// Downloads the almanac from the vendor's QuickFix service.
#[derive(Debug, Clone)]
pub struct HttpAlmanac {
   client: reqwest::Client,
}

impl HttpAlmanac {
   pub fn new() -> Result<Self> {
      let client = reqwest::Client::builder()
         .timeout(DOWNLOAD_TIMEOUT)
         .build()?;
      Ok(Self { client })
   }
}

impl AlmanacSource for HttpAlmanac {
   async fn fetch(&self, timestamp: i64, format: AlmanacFormat) -> Result<Vec<u8>> {
      let url = format.url(timestamp);
      debug!("Downloading {url}");
      let response = self.client.get(&url).send().await?.error_for_status()?;
      Ok(response.bytes().await?.to_vec())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_almanac_urls() {
      assert_eq!(
         AlmanacFormat::Gps.url(1_700_000_000),
         "http://gpsquickfix.services.tomtom.com/fitness/sifgps.f2p3enc.ee?timestamp=1700000000"
      );
      assert!(AlmanacFormat::Glonass.url(0).contains("/sifglo.f2p3enc.ee?timestamp=0"));
      assert_eq!(AlmanacFormat::Glonass.to_string(), "GLONASS");
   }
}
