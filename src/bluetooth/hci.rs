//! Raw HCI controller socket.
//!
//! This module talks to the local Bluetooth controller over an
//! `AF_BLUETOOTH`/`BTPROTO_HCI` socket: discovery control, event capture
//! filters, connection-parameter updates and a handful of informational
//! commands. Commands are executed the way BlueZ does it, by temporarily
//! narrowing the socket filter to the command's completion events.

use std::{
   io::{self, Read},
   mem,
   os::fd::AsRawFd,
   time::Duration,
};

use bluer::Address;
use log::{debug, trace};
use smallvec::SmallVec;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{io::unix::AsyncFd, time};

use crate::{
   bluetooth::{
      address::{AddressKind, DeviceAddress},
      negotiate::ConnectionParameters,
   },
   error::ProtoError,
};

const BTPROTO_HCI: i32 = 1;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;
const HCI_CHANNEL_RAW: u16 = 0;

/// `_IOR('H', 210, int)`
const HCIGETDEVLIST: u64 = 0x8004_48d2;
const HCI_MAX_DEV: usize = 16;
const HCI_UP: u32 = 0;

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_MAX_EVENT_SIZE: usize = 260;

pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_LE_META_EVENT: u8 = 0x3E;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;

const OP_READ_LOCAL_FEATURES: u16 = 0x1003;
const OP_READ_BD_ADDR: u16 = 0x1009;
const OP_READ_RSSI: u16 = 0x1405;
const OP_LE_SET_SCAN_PARAMETERS: u16 = 0x200B;
const OP_LE_SET_SCAN_ENABLE: u16 = 0x200C;
const OP_LE_CONN_UPDATE: u16 = 0x2013;

/// LMP feature bits checked on the first attempt.
const LMP_LE: u8 = 0x40;
const LMP_LE_BREDR: u8 = 0x02;

/// Deadline for discovery-control commands
const SCAN_CMD_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for informational commands
const INFO_CMD_TIMEOUT: Duration = Duration::from_secs(2);

pub type EventBuf = SmallVec<[u8; HCI_MAX_EVENT_SIZE]>;

/// Socket-level event capture filter (`struct hci_ufilter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HciFilter {
   pub type_mask: u32,
   pub event_mask: [u32; 2],
   pub opcode: u16,
}

impl HciFilter {
   pub fn set_ptype(&mut self, ptype: u8) {
      self.type_mask |= 1 << (ptype & 31);
   }

   pub fn set_event(&mut self, event: u8) {
      self.event_mask[usize::from(event >> 5)] |= 1 << (event & 31);
   }

   pub const fn set_opcode(&mut self, opcode: u16) {
      self.opcode = opcode.to_le();
   }

   /// Filter that passes only LE meta events (advertisement reports).
   pub fn le_meta_events() -> Self {
      let mut filter = Self::default();
      filter.set_ptype(HCI_EVENT_PKT);
      filter.set_event(EVT_LE_META_EVENT);
      filter
   }

   fn command_reply(opcode: u16, completion: Completion) -> Self {
      let mut filter = Self::default();
      filter.set_ptype(HCI_EVENT_PKT);
      filter.set_event(EVT_CMD_STATUS);
      filter.set_event(EVT_CMD_COMPLETE);
      if let Completion::LeEvent { .. } = completion {
         filter.set_event(EVT_LE_META_EVENT);
      }
      filter.set_opcode(opcode);
      filter
   }
}

/// Discovery configuration handed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
   pub active: bool,
   pub interval: u16,
   pub window: u16,
}

impl ScanParameters {
   /// Active discovery, 10 ms window every 10 ms.
   pub const ACTIVE: Self = Self {
      active: true,
      interval: 0x0010,
      window: 0x0010,
   };

   fn encode(&self) -> [u8; 7] {
      let [i0, i1] = self.interval.to_le_bytes();
      let [w0, w1] = self.window.to_le_bytes();
      [u8::from(self.active), i0, i1, w0, w1, 0x00, 0x00]
   }
}

/// The local radio controller, as used by the scanner, the negotiator and
/// the session.
pub trait Controller {
   /// Controller index (`hciN`).
   fn dev_id(&self) -> u16;

   async fn local_address(&mut self) -> io::Result<Address>;

   /// Checks the LMP feature page for LE and simultaneous LE/BR-EDR support.
   async fn supports_le(&mut self) -> io::Result<bool>;

   async fn set_scan_parameters(&mut self, params: &ScanParameters) -> io::Result<()>;

   async fn set_scan_enable(&mut self, enable: bool) -> io::Result<()>;

   fn filter(&self) -> io::Result<HciFilter>;

   fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()>;

   /// Reads one raw HCI packet.
   async fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize>;

   /// Requests new connection parameters for the link with `handle`.
   async fn update_connection(
      &mut self,
      handle: u16,
      params: &ConnectionParameters,
      budget: Duration,
   ) -> io::Result<()>;

   async fn read_rssi(&mut self, handle: u16) -> io::Result<i8>;
}

/// One decoded advertisement report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingReport {
   pub event_type: u8,
   pub address: DeviceAddress,
   pub rssi: Option<i8>,
}

/// Decodes an HCI event packet into its advertisement reports.
///
/// Packets that are not LE advertising report events decode to an empty list.
pub fn parse_advertising_reports(packet: &[u8]) -> Result<Vec<AdvertisingReport>, ProtoError> {
   if packet.len() < 4 {
      return Err(ProtoError::PacketTooShort {
         expected: 4,
         actual: packet.len(),
      });
   }
   if packet[0] != HCI_EVENT_PKT || packet[1] != EVT_LE_META_EVENT || packet[3] != EVT_LE_ADVERTISING_REPORT {
      return Ok(Vec::new());
   }
   let plen = usize::from(packet[2]);
   let params = packet.get(3..3 + plen).ok_or(ProtoError::PacketTooShort {
      expected: 3 + plen,
      actual: packet.len(),
   })?;

   // subevent, num_reports, then per report:
   // event_type(1) addr_type(1) addr(6) data_len(1) data(data_len) rssi(1)
   let count = *params.get(1).ok_or(ProtoError::InvalidFormat {
      reason: "missing report count",
   })?;
   let mut reports = Vec::with_capacity(usize::from(count));
   let mut rest = &params[2..];
   for _ in 0..count {
      if rest.len() < 9 {
         return Err(ProtoError::PacketTooShort {
            expected: 9,
            actual: rest.len(),
         });
      }
      let event_type = rest[0];
      let kind = AddressKind::from_hci(rest[1]);
      let mut addr = [0u8; 6];
      addr.copy_from_slice(&rest[2..8]);
      let data_len = usize::from(rest[8]);
      let end = 9 + data_len;
      if rest.len() < end {
         return Err(ProtoError::PacketTooShort {
            expected: end,
            actual: rest.len(),
         });
      }
      let rssi = rest.get(end).map(|&b| b as i8);
      reports.push(AdvertisingReport {
         event_type,
         address: DeviceAddress::from_le_bytes(addr, kind),
         rssi,
      });
      rest = rest.get(end + 1..).unwrap_or_default();
   }
   Ok(reports)
}

#[repr(C)]
struct SockaddrHci {
   hci_family: libc::sa_family_t,
   hci_dev: u16,
   hci_channel: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
   dev_id: u16,
   dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
   dev_num: u16,
   dev_req: [HciDevReq; HCI_MAX_DEV],
}

fn raw_hci_socket() -> io::Result<Socket> {
   Socket::new(
      Domain::from(libc::AF_BLUETOOTH),
      Type::from(libc::SOCK_RAW),
      Some(Protocol::from(BTPROTO_HCI)),
   )
}

fn check(ret: libc::c_int) -> io::Result<()> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(())
   }
}

/// Finds the first controller that is up, like BlueZ's `hci_get_route(NULL)`.
pub fn default_device() -> io::Result<Option<u16>> {
   let socket = raw_hci_socket()?;
   let mut list = HciDevListReq {
      dev_num: HCI_MAX_DEV as u16,
      dev_req: [HciDevReq::default(); HCI_MAX_DEV],
   };
   // SAFETY: HCIGETDEVLIST fills at most `dev_num` entries of the request we own.
   check(unsafe {
      libc::ioctl(
         socket.as_raw_fd(),
         HCIGETDEVLIST as _,
         &mut list as *mut HciDevListReq,
      )
   })?;
   let count = usize::from(list.dev_num).min(HCI_MAX_DEV);
   Ok(list.dev_req[..count]
      .iter()
      .find(|req| req.dev_opt & (1 << HCI_UP) != 0)
      .map(|req| req.dev_id))
}

/// This machine's host name, cut to `N` bytes and NUL padded.
pub fn host_name<const N: usize>() -> io::Result<[u8; N]> {
   let mut buf = [0u8; N];
   // SAFETY: gethostname writes at most `buf.len()` bytes into the buffer we own.
   let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
   if let Err(e) = check(ret)
      && e.raw_os_error() != Some(libc::ENAMETOOLONG)
   {
      return Err(e);
   }
   // glibc still fills the buffer when it reports truncation.
   Ok(buf)
}

/// How an HCI command reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
   Complete,
   /// Command Status, then an LE meta event for the connection `handle`.
   LeEvent { subevent: u8, handle: u16 },
}

/// Raw HCI socket bound to one controller.
///
/// Closed when dropped.
pub struct HciSocket {
   dev_id: u16,
   fd: AsyncFd<Socket>,
}

impl HciSocket {
   /// Opens `hci<dev_id>` on the raw channel.
   pub fn open(dev_id: u16) -> io::Result<Self> {
      let socket = raw_hci_socket()?;
      let addr = SockaddrHci {
         hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
         hci_dev: dev_id,
         hci_channel: HCI_CHANNEL_RAW,
      };
      // SAFETY: bind() with a valid fd and a properly sized sockaddr_hci.
      check(unsafe {
         libc::bind(
            socket.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            mem::size_of::<SockaddrHci>() as libc::socklen_t,
         )
      })?;
      socket.set_nonblocking(true)?;
      debug!("Opened hci{dev_id}");
      Ok(Self {
         dev_id,
         fd: AsyncFd::new(socket)?,
      })
   }

   async fn send_command(&self, opcode: u16, params: &[u8]) -> io::Result<()> {
      let mut packet = EventBuf::new();
      packet.push(HCI_COMMAND_PKT);
      packet.extend_from_slice(&opcode.to_le_bytes());
      packet.push(params.len() as u8);
      packet.extend_from_slice(params);
      trace!("hci{} → {}", self.dev_id, hex::encode(&packet));
      loop {
         let mut guard = self.fd.writable().await?;
         match guard.try_io(|inner| inner.get_ref().send(&packet)) {
            Ok(result) => return result.map(|_| ()),
            Err(_would_block) => continue,
         }
      }
   }

   async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
      loop {
         let mut guard = self.fd.readable().await?;
         match guard.try_io(|inner| {
            let mut socket: &Socket = inner.get_ref();
            socket.read(buf)
         }) {
            Ok(result) => {
               if let Ok(n) = result {
                  trace!("hci{} ← {}", self.dev_id, hex::encode(&buf[..n]));
               }
               return result;
            },
            Err(_would_block) => continue,
         }
      }
   }

   async fn await_reply(&self, opcode: u16, completion: Completion) -> io::Result<EventBuf> {
      let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
      loop {
         let n = match self.recv_packet(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
         };
         let packet = &buf[..n];
         if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
            continue;
         }
         let params = &packet[3..];
         match packet[1] {
            EVT_CMD_STATUS if params.len() >= 4 => {
               let status = params[0];
               if u16::from_le_bytes([params[2], params[3]]) != opcode {
                  continue;
               }
               if status != 0 {
                  debug!("hci{}: command 0x{opcode:04x} failed with status 0x{status:02x}", self.dev_id);
                  return Err(io::Error::from_raw_os_error(libc::EIO));
               }
            },
            EVT_CMD_COMPLETE if params.len() >= 3 => {
               if u16::from_le_bytes([params[1], params[2]]) != opcode {
                  continue;
               }
               let ret = &params[3..];
               return match ret.first() {
                  Some(0) => Ok(EventBuf::from_slice(ret)),
                  Some(&status) => {
                     debug!("hci{}: command 0x{opcode:04x} completed with status 0x{status:02x}", self.dev_id);
                     Err(io::Error::from_raw_os_error(libc::EIO))
                  },
                  None => Ok(EventBuf::new()),
               };
            },
            EVT_LE_META_EVENT if params.len() >= 4 => {
               let Completion::LeEvent { subevent, handle } = completion else {
                  continue;
               };
               if params[0] != subevent || u16::from_le_bytes([params[2], params[3]]) & 0x0FFF != handle {
                  continue;
               }
               return match params[1] {
                  0 => Ok(EventBuf::from_slice(&params[1..])),
                  status => {
                     debug!(
                        "hci{}: LE event 0x{subevent:02x} for handle 0x{handle:04x} failed with status 0x{status:02x}",
                        self.dev_id
                     );
                     Err(io::Error::from_raw_os_error(libc::EIO))
                  },
               };
            },
            _ => {},
         }
      }
   }

   /// Sends a command and waits up to `deadline` for its completion.
   async fn exchange(
      &self,
      opcode: u16,
      params: &[u8],
      completion: Completion,
      deadline: Duration,
   ) -> io::Result<EventBuf> {
      self.send_command(opcode, params).await?;
      time::timeout(deadline, self.await_reply(opcode, completion))
         .await
         .map_err(|_| io::Error::from_raw_os_error(libc::ETIMEDOUT))?
   }

   /// Sends a command and waits for its completion, restoring the caller's
   /// socket filter afterwards.
   async fn request(
      &mut self,
      opcode: u16,
      params: &[u8],
      completion: Completion,
      deadline: Duration,
   ) -> io::Result<EventBuf> {
      let saved = self.filter()?;
      self.set_filter(&HciFilter::command_reply(opcode, completion))?;

      let result = self.exchange(opcode, params, completion, deadline).await;

      let restored = self.set_filter(&saved);
      let reply = result?;
      restored?;
      Ok(reply)
   }
}

impl Controller for HciSocket {
   fn dev_id(&self) -> u16 {
      self.dev_id
   }

   async fn local_address(&mut self) -> io::Result<Address> {
      let reply = self
         .request(OP_READ_BD_ADDR, &[], Completion::Complete, INFO_CMD_TIMEOUT)
         .await?;
      let bytes: [u8; 6] = reply
         .get(1..7)
         .and_then(|b| b.try_into().ok())
         .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
      Ok(DeviceAddress::from_le_bytes(bytes, AddressKind::Public).addr)
   }

   async fn supports_le(&mut self) -> io::Result<bool> {
      let reply = self
         .request(OP_READ_LOCAL_FEATURES, &[], Completion::Complete, INFO_CMD_TIMEOUT)
         .await?;
      let features = reply
         .get(1..9)
         .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
      Ok(features[4] & LMP_LE != 0 && features[6] & LMP_LE_BREDR != 0)
   }

   async fn set_scan_parameters(&mut self, params: &ScanParameters) -> io::Result<()> {
      self
         .request(
            OP_LE_SET_SCAN_PARAMETERS,
            &params.encode(),
            Completion::Complete,
            SCAN_CMD_TIMEOUT,
         )
         .await
         .map(|_| ())
   }

   async fn set_scan_enable(&mut self, enable: bool) -> io::Result<()> {
      self
         .request(
            OP_LE_SET_SCAN_ENABLE,
            &[u8::from(enable), 0x00],
            Completion::Complete,
            SCAN_CMD_TIMEOUT,
         )
         .await
         .map(|_| ())
   }

   fn filter(&self) -> io::Result<HciFilter> {
      let mut filter = HciFilter::default();
      let mut len = mem::size_of::<HciFilter>() as libc::socklen_t;
      // SAFETY: getsockopt writes at most `len` bytes into the filter we own.
      check(unsafe {
         libc::getsockopt(
            self.fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            &mut filter as *mut HciFilter as *mut libc::c_void,
            &mut len,
         )
      })?;
      Ok(filter)
   }

   fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()> {
      // SAFETY: setsockopt reads a properly sized hci_ufilter.
      check(unsafe {
         libc::setsockopt(
            self.fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const libc::c_void,
            mem::size_of::<HciFilter>() as libc::socklen_t,
         )
      })
   }

   async fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      self.recv_packet(buf).await
   }

   async fn update_connection(
      &mut self,
      handle: u16,
      params: &ConnectionParameters,
      budget: Duration,
   ) -> io::Result<()> {
      let mut cmd = SmallVec::<[u8; 14]>::new();
      for field in [
         handle,
         params.min_interval,
         params.max_interval,
         params.slave_latency,
         params.supervision_timeout,
         0x0001,
         0x0001,
      ] {
         cmd.extend_from_slice(&field.to_le_bytes());
      }
      self
         .request(
            OP_LE_CONN_UPDATE,
            &cmd,
            Completion::LeEvent {
               subevent: EVT_LE_CONN_UPDATE_COMPLETE,
               handle,
            },
            budget,
         )
         .await
         .map(|_| ())
   }

   async fn read_rssi(&mut self, handle: u16) -> io::Result<i8> {
      let reply = self
         .request(OP_READ_RSSI, &handle.to_le_bytes(), Completion::Complete, INFO_CMD_TIMEOUT)
         .await?;
      reply
         .get(3)
         .map(|&b| b as i8)
         .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))
   }
}
