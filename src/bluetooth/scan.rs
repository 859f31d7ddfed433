//! Discovery of the watch by advertisement address.

use std::io;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{
      address::DeviceAddress,
      hci::{Controller, HCI_MAX_EVENT_SIZE, HciFilter, ScanParameters, parse_advertising_reports},
   },
   error::{Error, Phase, Result},
};

/// Listens for advertisements until a device from the vendor address block
/// shows up.
///
/// Returns `Ok(None)` if `cancel` fires first. The controller's capture
/// filter is restored and discovery disabled on every exit path.
pub async fn scan<C: Controller>(ctrl: &mut C, cancel: &CancellationToken) -> Result<Option<DeviceAddress>> {
   let saved = ctrl.filter().map_err(Error::during(Phase::Scan))?;

   let result = discover(ctrl, cancel).await;

   let restored = ctrl.set_filter(&saved);
   let disabled = ctrl.set_scan_enable(false).await;
   let found = result?;
   restored.map_err(Error::during(Phase::Scan))?;
   disabled.map_err(Error::during(Phase::Scan))?;
   Ok(found)
}

async fn discover<C: Controller>(ctrl: &mut C, cancel: &CancellationToken) -> Result<Option<DeviceAddress>> {
   // A controller left scanning by someone else rejects new parameters.
   if let Err(e) = ctrl.set_scan_enable(false).await {
      debug!("Disabling discovery before scanning failed: {e}");
   }
   ctrl
      .set_scan_parameters(&ScanParameters::ACTIVE)
      .await
      .map_err(Error::during(Phase::Scan))?;
   ctrl.set_scan_enable(true).await.map_err(Error::during(Phase::Scan))?;
   ctrl
      .set_filter(&HciFilter::le_meta_events())
      .map_err(Error::during(Phase::Scan))?;
   info!("Scanning for devices on hci{}...", ctrl.dev_id());

   let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
   loop {
      let n = tokio::select! {
         biased;
         () = cancel.cancelled() => {
            info!("Scan interrupted");
            return Ok(None);
         },
         read = ctrl.read_event(&mut buf) => match read {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
            Err(e) => return Err(Error::os(Phase::Scan, e)),
         },
      };

      let reports = match parse_advertising_reports(&buf[..n]) {
         Ok(reports) => reports,
         Err(e) => {
            debug!("Ignoring malformed event: {e}");
            continue;
         },
      };
      for report in reports {
         if report.address.has_vendor_prefix() {
            info!("Found device {} (rssi {:?})", report.address, report.rssi);
            return Ok(Some(report.address));
         }
         debug!("Skipping {} (event type {}, not a watch)", report.address, report.event_type);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::{MockController, advertising_event};

   #[tokio::test]
   async fn test_first_vendor_address_wins() {
      let mut ctrl = MockController::default();
      ctrl.events.push_back(advertising_event([0x01, 0x02, 0x03, 0x1A, 0x00, 0x00], 0x00));
      ctrl.events.push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));
      ctrl.events.push_back(advertising_event([0x11, 0x22, 0x33, 0x39, 0x04, 0xE4], 0x01));

      let found = scan(&mut ctrl, &CancellationToken::new()).await.unwrap().unwrap();
      assert_eq!(found.to_string(), "E4:04:39:AA:BB:CC (random)");
      assert_eq!(ctrl.events.len(), 1);
      assert_eq!(ctrl.reads, 2);
   }

   #[tokio::test]
   async fn test_single_advertisement_matches_immediately() {
      let mut ctrl = MockController::default();
      ctrl.events.push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));

      let found = scan(&mut ctrl, &CancellationToken::new()).await.unwrap();
      assert_eq!(found.map(|a| a.addr.to_string()).as_deref(), Some("E4:04:39:AA:BB:CC"));
      assert_eq!(ctrl.reads, 1);
      assert_eq!(ctrl.scan_params, Some(ScanParameters::ACTIVE));
   }

   #[tokio::test]
   async fn test_filter_restored_on_match() {
      let mut ctrl = MockController::default();
      let original = ctrl.current_filter;
      ctrl.events.push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));

      scan(&mut ctrl, &CancellationToken::new()).await.unwrap();
      assert_eq!(ctrl.current_filter, original);
      assert!(!ctrl.scan_enabled);
      assert!(ctrl.filter_history.contains(&HciFilter::le_meta_events()));
   }

   #[tokio::test]
   async fn test_filter_restored_on_cancel() {
      let mut ctrl = MockController::default();
      let original = ctrl.current_filter;
      let cancel = CancellationToken::new();
      cancel.cancel();

      let found = scan(&mut ctrl, &cancel).await.unwrap();
      assert!(found.is_none());
      assert_eq!(ctrl.current_filter, original);
      assert!(!ctrl.scan_enabled);
   }

   #[tokio::test]
   async fn test_filter_restored_on_read_error() {
      let mut ctrl = MockController::default();
      let original = ctrl.current_filter;
      ctrl.events.push_back(advertising_event([0x01, 0x02, 0x03, 0x04, 0x05, 0x06], 0x00));
      ctrl.read_error = Some(libc::ENETDOWN);

      let err = scan(&mut ctrl, &CancellationToken::new()).await.unwrap_err();
      assert!(matches!(err, Error::Os { phase: Phase::Scan, .. }));
      assert_eq!(ctrl.current_filter, original);
      assert!(!ctrl.scan_enabled);
   }

   #[tokio::test]
   async fn test_idle_controller_rejecting_disable_still_scans() {
      let mut ctrl = MockController::default();
      ctrl.strict_disable = true;
      ctrl.events.push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));

      assert!(scan(&mut ctrl, &CancellationToken::new()).await.unwrap().is_some());
      assert!(!ctrl.scan_enabled);
   }

   #[tokio::test]
   async fn test_would_block_is_retried() {
      let mut ctrl = MockController::default();
      ctrl.would_block = 2;
      ctrl.events.push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));

      assert!(scan(&mut ctrl, &CancellationToken::new()).await.unwrap().is_some());
   }

   #[tokio::test]
   async fn test_scan_permission_denied() {
      let mut ctrl = MockController::default();
      ctrl.scan_error = Some(libc::EPERM);

      let err = scan(&mut ctrl, &CancellationToken::new()).await.unwrap_err();
      assert!(err.is_permission_denied());
      assert!(!ctrl.scan_enabled);
   }
}
