//! Attribute protocol transport.
//!
//! A thin wrapper around one duplex channel that enforces the ATT exchange
//! discipline: at most one request awaiting its response, with unsolicited
//! notifications interleaved on the same channel. Notifications that arrive
//! while a request is pending are queued and handed out by
//! [`AttTransport::read_notification`], never mistaken for the response.

use std::{collections::VecDeque, io, time::Duration};

use log::{debug, trace};
use smallvec::SmallVec;
use tokio::time;

use crate::error::{Error, Phase, ProtoError, Result};

pub const OP_ERROR_RSP: u8 = 0x01;
pub const OP_READ_REQ: u8 = 0x0A;
pub const OP_READ_RSP: u8 = 0x0B;
pub const OP_WRITE_REQ: u8 = 0x12;
pub const OP_WRITE_RSP: u8 = 0x13;
pub const OP_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const OP_HANDLE_VALUE_IND: u8 = 0x1D;
pub const OP_HANDLE_VALUE_CFM: u8 = 0x1E;
pub const OP_WRITE_CMD: u8 = 0x52;

/// Default LE ATT MTU
pub const ATT_MTU: usize = 23;
/// Largest attribute value that fits in a write
pub const MAX_VALUE_LEN: usize = ATT_MTU - 3;
/// Receive buffer, sized for the L2CAP MTU
const RECV_BUF_LEN: usize = 672;

pub type Frame = SmallVec<[u8; 32]>;

/// Raw duplex channel carrying ATT PDUs, one per datagram.
pub trait AttChannel {
   async fn send(&self, frame: &[u8]) -> io::Result<()>;

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// An established link: an ATT channel plus its controller-side identity.
pub trait Link: AttChannel {
   /// Controller-assigned connection handle.
   fn connection_handle(&self) -> io::Result<u16>;
}

/// Unsolicited value pushed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
   pub handle: u16,
   pub value: Frame,
}

impl Notification {
   /// Interprets the value as a little-endian unsigned integer.
   pub fn as_uint(&self) -> Option<u64> {
      match self.value.len() {
         1 => Some(u64::from(self.value[0])),
         2 => Some(u64::from(u16::from_le_bytes([self.value[0], self.value[1]]))),
         4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&self.value);
            Some(u64::from(u32::from_le_bytes(b)))
         },
         8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&self.value);
            Some(u64::from_le_bytes(b))
         },
         _ => None,
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
   request: u8,
   response: u8,
   handle: u16,
}

/// ATT client over a channel `C`.
pub struct AttTransport<C> {
   chan: C,
   timeout: Duration,
   pending: Option<PendingRequest>,
   notifications: VecDeque<Notification>,
}

impl<C: AttChannel> AttTransport<C> {
   pub const fn new(chan: C, timeout: Duration) -> Self {
      Self {
         chan,
         timeout,
         pending: None,
         notifications: VecDeque::new(),
      }
   }

   /// Receive timeout for responses and notifications.
   pub const fn set_timeout(&mut self, timeout: Duration) {
      self.timeout = timeout;
   }

   pub const fn channel(&self) -> &C {
      &self.chan
   }

   /// True when no request is awaiting its response.
   pub const fn is_idle(&self) -> bool {
      self.pending.is_none()
   }

   /// Reads the value of `handle`.
   pub async fn read(&mut self, handle: u16) -> Result<Frame> {
      let [lo, hi] = handle.to_le_bytes();
      self
         .transact(&[OP_READ_REQ, lo, hi], PendingRequest {
            request: OP_READ_REQ,
            response: OP_READ_RSP,
            handle,
         })
         .await
   }

   /// Writes `value` to `handle` and waits for the acknowledgement.
   pub async fn write_request(&mut self, handle: u16, value: &[u8]) -> Result<()> {
      let frame = encode_write(OP_WRITE_REQ, handle, value)?;
      self
         .transact(&frame, PendingRequest {
            request: OP_WRITE_REQ,
            response: OP_WRITE_RSP,
            handle,
         })
         .await
         .map(|_| ())
   }

   /// Writes `value` to `handle` without waiting for anything.
   pub async fn write_command(&mut self, handle: u16, value: &[u8]) -> Result<()> {
      let frame = encode_write(OP_WRITE_CMD, handle, value)?;
      self.chan.send(&frame).await.map_err(Error::during(Phase::Att))
   }

   /// Waits for the next notification or indication.
   pub async fn read_notification(&mut self) -> Result<Notification> {
      if let Some(ntf) = self.notifications.pop_front() {
         return Ok(ntf);
      }
      let deadline = self.timeout;
      time::timeout(deadline, self.next_notification())
         .await
         .map_err(|_| Error::Timeout { phase: Phase::Att })?
   }

   async fn next_notification(&mut self) -> Result<Notification> {
      let mut buf = [0u8; RECV_BUF_LEN];
      loop {
         let n = self.chan.recv(&mut buf).await.map_err(Error::during(Phase::Att))?;
         let frame = &buf[..n];
         match opcode_of(frame)? {
            OP_HANDLE_VALUE_NTF | OP_HANDLE_VALUE_IND => return self.accept_notification(frame).await,
            op @ (OP_ERROR_RSP | OP_READ_RSP | OP_WRITE_RSP) => {
               debug!("Dropping stray ATT response 0x{op:02x}");
            },
            opcode => return Err(ProtoError::UnknownOpcode { opcode }.into()),
         }
      }
   }

   async fn transact(&mut self, frame: &[u8], request: PendingRequest) -> Result<Frame> {
      debug_assert!(
         self.is_idle(),
         "ATT request 0x{:02x} issued while 0x{:02x} is outstanding",
         request.request,
         self.pending.map_or(0, |p| p.request),
      );
      self.chan.send(frame).await.map_err(Error::during(Phase::Att))?;
      self.pending = Some(request);

      let deadline = self.timeout;
      let result = time::timeout(deadline, self.await_response(request)).await;
      self.pending = None;
      match result {
         Ok(response) => response,
         Err(_) => {
            debug!("ATT request 0x{:02x} on 0x{:04x} timed out", request.request, request.handle);
            Err(Error::Timeout { phase: Phase::Att })
         },
      }
   }

   async fn await_response(&mut self, request: PendingRequest) -> Result<Frame> {
      let mut buf = [0u8; RECV_BUF_LEN];
      loop {
         let n = self.chan.recv(&mut buf).await.map_err(Error::during(Phase::Att))?;
         let frame = &buf[..n];
         match opcode_of(frame)? {
            OP_HANDLE_VALUE_NTF | OP_HANDLE_VALUE_IND => {
               let ntf = self.accept_notification(frame).await?;
               trace!("Queued notification on 0x{:04x} during request", ntf.handle);
               self.notifications.push_back(ntf);
            },
            OP_ERROR_RSP => return Err(decode_error_response(frame, &request).into()),
            op if op == request.response => return Ok(Frame::from_slice(&frame[1..])),
            op @ (OP_READ_RSP | OP_WRITE_RSP) => {
               return Err(ProtoError::UnexpectedResponse {
                  expected: request.response,
                  actual: op,
               }
               .into());
            },
            opcode => return Err(ProtoError::UnknownOpcode { opcode }.into()),
         }
      }
   }

   async fn accept_notification(&self, frame: &[u8]) -> Result<Notification> {
      if frame.len() < 3 {
         return Err(ProtoError::PacketTooShort {
            expected: 3,
            actual: frame.len(),
         }
         .into());
      }
      if frame[0] == OP_HANDLE_VALUE_IND {
         self
            .chan
            .send(&[OP_HANDLE_VALUE_CFM])
            .await
            .map_err(Error::during(Phase::Att))?;
      }
      Ok(Notification {
         handle: u16::from_le_bytes([frame[1], frame[2]]),
         value: Frame::from_slice(&frame[3..]),
      })
   }
}

fn opcode_of(frame: &[u8]) -> std::result::Result<u8, ProtoError> {
   frame.first().copied().ok_or(ProtoError::PacketTooShort {
      expected: 1,
      actual: 0,
   })
}

fn encode_write(opcode: u8, handle: u16, value: &[u8]) -> std::result::Result<Frame, ProtoError> {
   if value.len() > MAX_VALUE_LEN {
      return Err(ProtoError::ValueTooLong {
         len: value.len(),
         max: MAX_VALUE_LEN,
      });
   }
   let mut frame = Frame::new();
   frame.push(opcode);
   frame.extend_from_slice(&handle.to_le_bytes());
   frame.extend_from_slice(value);
   Ok(frame)
}

fn decode_error_response(frame: &[u8], request: &PendingRequest) -> ProtoError {
   let &[_, req, lo, hi, code, ..] = frame else {
      return ProtoError::PacketTooShort {
         expected: 5,
         actual: frame.len(),
      };
   };
   let handle = u16::from_le_bytes([lo, hi]);
   if req != request.request {
      ProtoError::UnexpectedResponse {
         expected: request.request,
         actual: req,
      }
   } else if handle != request.handle {
      ProtoError::HandleMismatch {
         expected: request.handle,
         actual: handle,
      }
   } else {
      ProtoError::ErrorResponse {
         request: req,
         handle,
         code,
      }
   }
}
