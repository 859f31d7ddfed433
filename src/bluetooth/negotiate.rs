//! Connection-parameter negotiation.

use std::time::Duration;

use log::{debug, info};

use crate::{
   bluetooth::hci::Controller,
   error::{Error, Phase, ProtoError, Result},
};

/// Per-attempt budget for a connection update.
pub const UPDATE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Link timing, in controller units.
///
/// Intervals are in 1.25 ms units, the supervision timeout in 10 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
   pub min_interval: u16,
   pub max_interval: u16,
   pub slave_latency: u16,
   pub supervision_timeout: u16,
}

impl ConnectionParameters {
   /// What the client asks for once the link is up: 7.5 ms, no latency, 2 s.
   pub const REQUESTED: Self = Self {
      min_interval: 6,
      max_interval: 6,
      slave_latency: 0,
      supervision_timeout: 200,
   };

   /// Decodes a peripheral preferred connection parameters value.
   pub fn decode(value: &[u8]) -> std::result::Result<Self, ProtoError> {
      let &[a0, a1, b0, b1, c0, c1, d0, d1, ..] = value else {
         return Err(ProtoError::PacketTooShort {
            expected: 8,
            actual: value.len(),
         });
      };
      Ok(Self {
         min_interval: u16::from_le_bytes([a0, a1]),
         max_interval: u16::from_le_bytes([b0, b1]),
         slave_latency: u16::from_le_bytes([c0, c1]),
         supervision_timeout: u16::from_le_bytes([d0, d1]),
      })
   }

   /// Delay to keep between consecutive writes at this interval.
   pub fn write_pacing(&self) -> Duration {
      Duration::from_micros(1250 * u64::from(self.min_interval))
   }
}

/// Requests `params` for the link, retrying for as long as the controller
/// reports a timeout. Returns the number of attempts it took.
pub async fn negotiate<C: Controller>(
   ctrl: &mut C,
   handle: u16,
   params: &ConnectionParameters,
   budget: Duration,
) -> Result<u32> {
   let mut attempts = 0u32;
   loop {
      attempts += 1;
      match ctrl.update_connection(handle, params, budget).await {
         Ok(()) => {
            info!(
               "Connection parameters updated after {attempts} attempt(s): interval {}..{}, latency {}, timeout {}",
               params.min_interval, params.max_interval, params.slave_latency, params.supervision_timeout,
            );
            return Ok(attempts);
         },
         Err(e) => match Error::os(Phase::Negotiate, e) {
            Error::Timeout { .. } => {
               debug!("Connection update timed out (attempt {attempts}), retrying");
            },
            other => return Err(other),
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::MockController;

   #[test]
   fn test_decode_preferred_parameters() {
      let params = ConnectionParameters::decode(&[0x06, 0x00, 0x06, 0x00, 0x00, 0x00, 0xC8, 0x00]).unwrap();
      assert_eq!(params, ConnectionParameters::REQUESTED);
      assert_eq!(params.write_pacing(), Duration::from_micros(7500));
   }

   #[test]
   fn test_decode_short_value() {
      assert_eq!(
         ConnectionParameters::decode(&[0x06, 0x00, 0x06]),
         Err(ProtoError::PacketTooShort { expected: 8, actual: 3 })
      );
   }

   #[tokio::test]
   async fn test_retries_until_accepted() {
      let mut ctrl = MockController::default();
      ctrl.update_timeouts = 3;
      let attempts = negotiate(&mut ctrl, 0x40, &ConnectionParameters::REQUESTED, UPDATE_TIMEOUT)
         .await
         .unwrap();
      assert_eq!(attempts, 4);
      assert_eq!(ctrl.updates, vec![(0x40, ConnectionParameters::REQUESTED); 4]);
   }

   #[tokio::test]
   async fn test_permission_failure_is_not_retried() {
      let mut ctrl = MockController::default();
      ctrl.update_error = Some(libc::EPERM);
      let err = negotiate(&mut ctrl, 0x40, &ConnectionParameters::REQUESTED, UPDATE_TIMEOUT)
         .await
         .unwrap_err();
      assert!(err.is_permission_denied());
      assert_eq!(ctrl.updates.len(), 1);
   }
}
