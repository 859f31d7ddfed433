//! Instrumented doubles for the radio, the link and the device protocol.

use std::{
   cell::RefCell,
   collections::{BTreeMap, VecDeque},
   future, io,
   sync::{Arc, Mutex},
   time::Duration,
};

use bluer::{Address, l2cap::SecurityLevel};

use crate::{
   bluetooth::{
      address::DeviceAddress,
      att::{
         AttChannel, AttTransport, Link, OP_ERROR_RSP, OP_READ_REQ, OP_READ_RSP, OP_WRITE_REQ, OP_WRITE_RSP,
      },
      hci::{Controller, EVT_LE_ADVERTISING_REPORT, EVT_LE_META_EVENT, HCI_EVENT_PKT, HciFilter, ScanParameters},
      l2cap::LinkError,
      negotiate::ConnectionParameters,
   },
   error::{Error, Result},
   operator::Operator,
   watch::{
      almanac::{AlmanacFormat, AlmanacSource},
      files::{DeviceInfo, DeviceInfoRecord, DeviceProtocol},
      protocol::{FileId, StatusSignal},
   },
};

/// Builds an LE advertising report event with one report for `addr_le`
/// (wire byte order), carrying a flags AD structure and an RSSI of -60.
pub fn advertising_event(addr_le: [u8; 6], addr_type: u8) -> Vec<u8> {
   let mut params = vec![EVT_LE_ADVERTISING_REPORT, 0x01, 0x00, addr_type];
   params.extend_from_slice(&addr_le);
   params.extend_from_slice(&[0x03, 0x02, 0x01, 0x06, 0xC4]);

   let mut packet = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
   packet.extend_from_slice(&params);
   packet
}

fn os_error(errno: i32) -> io::Error {
   io::Error::from_raw_os_error(errno)
}

/// Where a scripted session should go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
   OpenRadio,
   Features,
   Connect,
   ConnectionHandle,
   Negotiate(i32),
   Ppcp,
   VersionCheck,
   Authorize,
   Tasks,
   Scan(i32),
   Write,
}

/// Resource released at the end of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
   Link,
   Radio,
}

pub type ReleaseLog = Arc<Mutex<Vec<Release>>>;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

#[derive(Default)]
struct ChannelState {
   inbound: VecDeque<Vec<u8>>,
   sent: Vec<Vec<u8>>,
   awaiting: bool,
   max_outstanding: usize,
}

/// Scripted ATT channel.
///
/// Every sent frame is recorded and handed to the responder, whose frames
/// are queued for `recv`. Sending a request while another one is still
/// unanswered panics. `recv` on an empty queue never completes.
pub struct MockChannel {
   state: RefCell<ChannelState>,
   responder: RefCell<Option<Responder>>,
}

impl MockChannel {
   pub fn responding(responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + 'static) -> Self {
      Self {
         state: RefCell::default(),
         responder: RefCell::new(Some(Box::new(responder))),
      }
   }

   pub fn silent() -> Self {
      Self {
         state: RefCell::default(),
         responder: RefCell::new(None),
      }
   }

   pub fn push_inbound(&self, frame: Vec<u8>) {
      self.state.borrow_mut().inbound.push_back(frame);
   }

   pub fn sent(&self) -> Vec<Vec<u8>> {
      self.state.borrow().sent.clone()
   }

   pub fn max_outstanding(&self) -> usize {
      self.state.borrow().max_outstanding
   }
}

impl AttChannel for MockChannel {
   async fn send(&self, frame: &[u8]) -> io::Result<()> {
      {
         let mut state = self.state.borrow_mut();
         if matches!(frame.first(), Some(&(OP_READ_REQ | OP_WRITE_REQ))) {
            assert!(!state.awaiting, "request {frame:02x?} sent while another is outstanding");
            state.awaiting = true;
            state.max_outstanding = state.max_outstanding.max(1);
         }
         state.sent.push(frame.to_vec());
      }
      let replies = match self.responder.borrow_mut().as_mut() {
         Some(respond) => respond(frame),
         None => Vec::new(),
      };
      self.state.borrow_mut().inbound.extend(replies);
      Ok(())
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      let next = self.state.borrow_mut().inbound.pop_front();
      let Some(frame) = next else {
         return future::pending().await;
      };
      if matches!(frame.first(), Some(&(OP_ERROR_RSP | OP_READ_RSP | OP_WRITE_RSP))) {
         self.state.borrow_mut().awaiting = false;
      }
      let n = frame.len().min(buf.len());
      buf[..n].copy_from_slice(&frame[..n]);
      Ok(n)
   }
}

/// Controller double tracking discovery and filter state.
pub struct MockController {
   pub events: VecDeque<Vec<u8>>,
   pub reads: usize,
   pub read_error: Option<i32>,
   pub would_block: u32,
   pub scan_params: Option<ScanParameters>,
   pub scan_error: Option<i32>,
   pub scan_enabled: bool,
   /// Reject disabling discovery that is not running, as real controllers do.
   pub strict_disable: bool,
   pub current_filter: HciFilter,
   pub filter_history: Vec<HciFilter>,
   pub update_timeouts: u32,
   pub update_error: Option<i32>,
   pub updates: Vec<(u16, ConnectionParameters)>,
   pub le_supported: bool,
   pub rssi: i8,
   release_log: Option<ReleaseLog>,
}

impl Default for MockController {
   fn default() -> Self {
      let mut current_filter = HciFilter::default();
      current_filter.set_ptype(HCI_EVENT_PKT);
      Self {
         events: VecDeque::new(),
         reads: 0,
         read_error: None,
         would_block: 0,
         scan_params: None,
         scan_error: None,
         scan_enabled: false,
         strict_disable: false,
         current_filter,
         filter_history: Vec::new(),
         update_timeouts: 0,
         update_error: None,
         updates: Vec::new(),
         le_supported: true,
         rssi: -42,
         release_log: None,
      }
   }
}

impl Drop for MockController {
   fn drop(&mut self) {
      if let Some(log) = &self.release_log {
         log.lock().unwrap().push(Release::Radio);
      }
   }
}

impl Controller for MockController {
   fn dev_id(&self) -> u16 {
      0
   }

   async fn local_address(&mut self) -> io::Result<Address> {
      Ok(Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]))
   }

   async fn supports_le(&mut self) -> io::Result<bool> {
      Ok(self.le_supported)
   }

   async fn set_scan_parameters(&mut self, params: &ScanParameters) -> io::Result<()> {
      if let Some(errno) = self.scan_error {
         return Err(os_error(errno));
      }
      self.scan_params = Some(*params);
      Ok(())
   }

   async fn set_scan_enable(&mut self, enable: bool) -> io::Result<()> {
      if self.strict_disable && !enable && !self.scan_enabled {
         return Err(os_error(libc::EIO));
      }
      self.scan_enabled = enable;
      Ok(())
   }

   fn filter(&self) -> io::Result<HciFilter> {
      Ok(self.current_filter)
   }

   fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()> {
      self.current_filter = *filter;
      self.filter_history.push(*filter);
      Ok(())
   }

   async fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      if self.would_block > 0 {
         self.would_block -= 1;
         return Err(io::ErrorKind::WouldBlock.into());
      }
      if let Some(event) = self.events.pop_front() {
         self.reads += 1;
         let n = event.len().min(buf.len());
         buf[..n].copy_from_slice(&event[..n]);
         return Ok(n);
      }
      if let Some(errno) = self.read_error {
         return Err(os_error(errno));
      }
      future::pending().await
   }

   async fn update_connection(
      &mut self,
      handle: u16,
      params: &ConnectionParameters,
      _budget: Duration,
   ) -> io::Result<()> {
      self.updates.push((handle, *params));
      if let Some(errno) = self.update_error {
         return Err(os_error(errno));
      }
      if self.update_timeouts > 0 {
         self.update_timeouts -= 1;
         return Err(os_error(libc::ETIMEDOUT));
      }
      Ok(())
   }

   async fn read_rssi(&mut self, _handle: u16) -> io::Result<i8> {
      Ok(self.rssi)
   }
}

/// Link double: a scripted channel that logs its release.
pub struct MockLink {
   chan: MockChannel,
   handle_error: bool,
   release_log: ReleaseLog,
}

impl Drop for MockLink {
   fn drop(&mut self) {
      self.release_log.lock().unwrap().push(Release::Link);
   }
}

impl AttChannel for MockLink {
   async fn send(&self, frame: &[u8]) -> io::Result<()> {
      self.chan.send(frame).await
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      self.chan.recv(buf).await
   }
}

impl Link for MockLink {
   fn connection_handle(&self) -> io::Result<u16> {
      if self.handle_error {
         Err(os_error(libc::ENOTCONN))
      } else {
         Ok(0x0040)
      }
   }
}

/// Backend handing out doubles, with one injectable fault.
#[derive(Default)]
pub struct MockBackend {
   fault: Option<Fault>,
   failing_connects: Vec<usize>,
   connects: usize,
   connected: Option<DeviceAddress>,
   release_log: ReleaseLog,
}

impl MockBackend {
   pub fn failing(fault: Fault) -> Self {
      Self {
         fault: Some(fault),
         ..Self::default()
      }
   }

   /// Makes the `n`th connect (counting from 1) fail.
   pub fn with_connect_failure(mut self, n: usize) -> Self {
      self.failing_connects.push(n);
      self
   }

   pub fn release_log(&self) -> ReleaseLog {
      self.release_log.clone()
   }

   pub const fn connected_to(&self) -> Option<DeviceAddress> {
      self.connected
   }

   pub const fn connects(&self) -> usize {
      self.connects
   }
}

impl crate::session::Backend for MockBackend {
   type Radio = MockController;
   type Link = MockLink;

   fn open_radio(&mut self, _dev_id: u16) -> io::Result<MockController> {
      if self.fault == Some(Fault::OpenRadio) {
         return Err(os_error(libc::ENODEV));
      }
      let mut radio = MockController::default();
      radio.release_log = Some(self.release_log.clone());
      radio
         .events
         .push_back(advertising_event([0xCC, 0xBB, 0xAA, 0x39, 0x04, 0xE4], 0x01));
      match self.fault {
         Some(Fault::Features) => radio.le_supported = false,
         Some(Fault::Negotiate(errno)) => radio.update_error = Some(errno),
         Some(Fault::Scan(errno)) => radio.scan_error = Some(errno),
         _ => {},
      }
      Ok(radio)
   }

   async fn connect(
      &mut self,
      _local: Address,
      remote: &DeviceAddress,
      _security: SecurityLevel,
   ) -> std::result::Result<MockLink, LinkError> {
      self.connects += 1;
      if self.fault == Some(Fault::Connect) || self.failing_connects.contains(&self.connects) {
         return Err(LinkError::Connect {
            source: os_error(libc::EHOSTUNREACH),
         });
      }
      self.connected = Some(*remote);

      let ppcp_fails = self.fault == Some(Fault::Ppcp);
      let chan = MockChannel::responding(move |frame| match frame {
         [OP_READ_REQ, 0x0b, 0x00] if ppcp_fails => vec![vec![OP_ERROR_RSP, OP_READ_REQ, 0x0b, 0x00, 0x0A]],
         [OP_READ_REQ, 0x0b, 0x00] => vec![vec![OP_READ_RSP, 0x06, 0x00, 0x06, 0x00, 0x00, 0x00, 0xC8, 0x00]],
         _ => Vec::new(),
      });
      Ok(MockLink {
         chan,
         handle_error: self.fault == Some(Fault::ConnectionHandle),
         release_log: self.release_log.clone(),
      })
   }
}

#[derive(Default)]
struct ProtocolState {
   files: BTreeMap<FileId, Vec<u8>>,
   authorized: Vec<(u32, bool)>,
   pacing: Option<Duration>,
   signals: Vec<StatusSignal>,
   deleted: Vec<FileId>,
}

/// In-memory device file system behind the protocol trait.
#[derive(Default)]
pub struct MockProtocol {
   fault: Option<Fault>,
   state: Mutex<ProtocolState>,
}

impl MockProtocol {
   pub fn failing(fault: Fault) -> Self {
      Self {
         fault: Some(fault),
         ..Self::default()
      }
   }

   pub fn with_file(self, file: FileId, data: &[u8]) -> Self {
      self.state.lock().unwrap().files.insert(file, data.to_vec());
      self
   }

   pub fn file(&self, file: FileId) -> Option<Vec<u8>> {
      self.state.lock().unwrap().files.get(&file).cloned()
   }

   pub fn authorized(&self) -> Vec<(u32, bool)> {
      self.state.lock().unwrap().authorized.clone()
   }

   pub fn pacing(&self) -> Option<Duration> {
      self.state.lock().unwrap().pacing
   }

   pub fn signals(&self) -> Vec<StatusSignal> {
      self.state.lock().unwrap().signals.clone()
   }

   pub fn deleted(&self) -> Vec<FileId> {
      self.state.lock().unwrap().deleted.clone()
   }
}

impl DeviceProtocol for MockProtocol {
   async fn check_device_version<C: AttChannel>(
      &self,
      _att: &mut AttTransport<C>,
      _verbose: bool,
   ) -> Result<DeviceInfo> {
      if self.fault == Some(Fault::VersionCheck) {
         return Err(Error::DeviceIncompatible("unsupported firmware version \"2.0.1\"".into()));
      }
      let record = |label, value: &str| DeviceInfoRecord {
         label,
         value: value.to_owned(),
      };
      Ok(DeviceInfo(vec![
         record("maker", "TomTom Fitness"),
         record("serial", "HD1234A05678"),
         record("model_name", "Runner"),
         record("firmware", "1.8.42"),
      ]))
   }

   async fn authorize<C: AttChannel>(&self, _att: &mut AttTransport<C>, code: u32, first_pairing: bool) -> Result<()> {
      if self.fault == Some(Fault::Authorize) {
         return Err(Error::AuthRejected(code));
      }
      self.state.lock().unwrap().authorized.push((code, first_pairing));
      Ok(())
   }

   async fn list_subfiles<C: AttChannel>(&self, _att: &mut AttTransport<C>, dir: FileId) -> Result<Vec<FileId>> {
      if self.fault == Some(Fault::Tasks) {
         return Err(Error::Transfer(format!("List of {dir} refused 10 times")));
      }
      let state = self.state.lock().unwrap();
      Ok(state
         .files
         .keys()
         .filter(|file| file.directory() == dir.0 && **file != dir)
         .copied()
         .collect())
   }

   async fn read_file<C: AttChannel>(&self, _att: &mut AttTransport<C>, file: FileId, _verbosity: u8) -> Result<Vec<u8>> {
      self
         .file(file)
         .ok_or_else(|| Error::Transfer(format!("Read of {file} refused 10 times")))
   }

   async fn write_file<C: AttChannel>(
      &self,
      _att: &mut AttTransport<C>,
      file: FileId,
      _verbosity: u8,
      data: &[u8],
      pacing: Duration,
   ) -> Result<()> {
      let mut state = self.state.lock().unwrap();
      state.pacing = Some(pacing);
      if self.fault == Some(Fault::Write) {
         return Err(Error::Transfer(format!("Write of {file} refused 10 times")));
      }
      state.files.insert(file, data.to_vec());
      Ok(())
   }

   async fn delete_file<C: AttChannel>(&self, _att: &mut AttTransport<C>, file: FileId) -> Result<()> {
      let mut state = self.state.lock().unwrap();
      state.files.remove(&file);
      state.deleted.push(file);
      Ok(())
   }

   async fn signal<C: AttChannel>(&self, _att: &mut AttTransport<C>, signal: StatusSignal) -> Result<()> {
      self.state.lock().unwrap().signals.push(signal);
      Ok(())
   }
}

/// Operator double answering from a preset code.
#[derive(Debug, Default)]
pub struct MockOperator {
   pub code: Option<u32>,
   notices: Vec<String>,
}

impl MockOperator {
   pub fn notices(&self) -> Vec<String> {
      self.notices.clone()
   }
}

impl Operator for MockOperator {
   async fn await_pairing_mode(&mut self) -> Result<()> {
      Ok(())
   }

   async fn pairing_code(&mut self) -> Result<u32> {
      self.code.ok_or_else(|| Error::InvalidPairingCode(String::new()))
   }

   fn notice(&mut self, text: &str) {
      self.notices.push(text.to_owned());
   }
}

/// Almanac source serving fixed bytes.
#[derive(Debug, Default)]
pub struct MockAlmanac {
   data: Vec<u8>,
   unavailable: bool,
   requests: Mutex<Vec<(i64, AlmanacFormat)>>,
}

impl MockAlmanac {
   pub fn serving(data: &[u8]) -> Self {
      Self {
         data: data.to_vec(),
         ..Self::default()
      }
   }

   pub fn unavailable() -> Self {
      Self {
         unavailable: true,
         ..Self::default()
      }
   }

   pub fn requests(&self) -> Vec<(i64, AlmanacFormat)> {
      self.requests.lock().unwrap().clone()
   }
}

impl AlmanacSource for MockAlmanac {
   async fn fetch(&self, timestamp: i64, format: AlmanacFormat) -> Result<Vec<u8>> {
      self.requests.lock().unwrap().push((timestamp, format));
      if self.unavailable {
         return Err(Error::Transfer("almanac server unreachable".into()));
      }
      Ok(self.data.clone())
   }
}
