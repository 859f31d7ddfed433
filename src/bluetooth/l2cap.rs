//! L2CAP link to the watch.
//!
//! ATT runs on the fixed LE attribute channel, so the socket is connected by
//! channel identifier rather than by PSM.

use std::{io, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Security, SecurityLevel, Socket, SocketAddr},
};
use log::{debug, trace};
use thiserror::Error;
use tokio::time;

use crate::bluetooth::{
   address::DeviceAddress,
   att::{AttChannel, Link},
};

/// Fixed L2CAP channel identifier for attribute protocol traffic
pub const ATT_CID: u16 = 0x0004;
/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Failure to bring up the link.
///
/// Setup failures are local (socket, bind, security option); connect
/// failures mean the remote device was unreachable or refused.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("L2CAP {step} failed: {source}")]
   Setup {
      step: &'static str,
      #[source]
      source: io::Error,
   },

   #[error("Could not connect to watch: {source}")]
   Connect {
      #[source]
      source: io::Error,
   },
}

/// Open ATT channel to one device.
///
/// The socket is closed when this is dropped.
pub struct AttLink {
   peer: Address,
   sp: SeqPacket,
}

impl AttChannel for AttLink {
   async fn send(&self, frame: &[u8]) -> io::Result<()> {
      trace!("→ {}: {}", self.peer, hex::encode(frame));
      self.sp.send(frame).await.map(|_| ())
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      let n = self.sp.recv(buf).await?;
      if n == 0 {
         return Err(io::Error::from_raw_os_error(libc::ENOTCONN));
      }
      trace!("← {}: {}", self.peer, hex::encode(&buf[..n]));
      Ok(n)
   }
}

impl Link for AttLink {
   fn connection_handle(&self) -> io::Result<u16> {
      Ok(self.sp.as_ref().conn_info()?.hci_handle)
   }
}

/// Opens an LE ATT channel from `local` to `remote` at `security`.
///
/// No retries happen here.
pub async fn connect(local: Address, remote: &DeviceAddress, security: SecurityLevel) -> Result<AttLink, LinkError> {
   let setup = |step: &'static str| move |source: io::Error| LinkError::Setup { step, source };

   let socket = Socket::new_seq_packet().map_err(setup("socket"))?;
   socket
      .bind(SocketAddr {
         addr: local,
         addr_type: AddressType::LePublic,
         psm: 0,
         cid: ATT_CID,
      })
      .map_err(setup("bind"))?;
   socket
      .set_security(Security {
         level: security,
         key_size: 0,
      })
      .map_err(setup("security"))?;

   debug!("Connecting to {remote} from {local}");
   let target = SocketAddr {
      addr: remote.addr,
      addr_type: remote.kind.to_bluer(),
      psm: 0,
      cid: ATT_CID,
   };
   let sp = time::timeout(CONNECT_TIMEOUT, socket.connect(target))
      .await
      .map_err(|_| LinkError::Connect {
         source: io::Error::from_raw_os_error(libc::ETIMEDOUT),
      })?
      .map_err(|source| LinkError::Connect { source })?;
   debug!("Connected to {remote}");

   Ok(AttLink {
      peer: remote.addr,
      sp,
   })
}
