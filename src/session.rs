//! Session state machine.
//!
//! One attempt walks `Disconnected → Scanning → Connecting →
//! NegotiatingParameters → CheckingCapabilities → Authenticating → Ready`
//! and then always goes through `Closing` back to `Disconnected`. The radio
//! handle and the link are owned by the attempt and released in `Closing`,
//! link first, whichever state failed.

use std::{io, time::Duration};

use bluer::{Address, l2cap::SecurityLevel};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
   bluetooth::{
      address::DeviceAddress,
      att::{AttTransport, Link},
      hci::{Controller, HciSocket},
      l2cap::{self, AttLink, LinkError},
      negotiate::{ConnectionParameters, UPDATE_TIMEOUT, negotiate},
      scan::scan,
   },
   config::Config,
   error::{Error, Phase, Result},
   operator::{Operator, PERMISSION_HINT},
   supervisor::Attempt,
   watch::{
      almanac::AlmanacSource,
      files::DeviceProtocol,
      protocol::handle,
      tasks::SyncTasks,
   },
};

/// ATT receive timeout before the watch is ready
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// ATT receive timeout once ready; deletes and writes can be slow
pub const READY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
   Disconnected,
   Scanning,
   Connecting,
   NegotiatingParameters,
   CheckingCapabilities,
   Authenticating,
   Ready,
   Closing,
}

/// Result of one attempt, as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
   Success,
   RecoverableFailure,
   /// Only on the first attempt; ends the process.
   FatalFailure,
}

/// Source of radio handles and links.
pub trait Backend {
   type Radio: Controller;
   type Link: Link;

   fn open_radio(&mut self, dev_id: u16) -> io::Result<Self::Radio>;

   async fn connect(
      &mut self,
      local: Address,
      remote: &DeviceAddress,
      security: SecurityLevel,
   ) -> std::result::Result<Self::Link, LinkError>;
}

/// The kernel Bluetooth stack.
#[derive(Debug, Default)]
pub struct Bluez;

impl Backend for Bluez {
   type Radio = HciSocket;
   type Link = AttLink;

   fn open_radio(&mut self, dev_id: u16) -> io::Result<HciSocket> {
      HciSocket::open(dev_id)
   }

   async fn connect(
      &mut self,
      local: Address,
      remote: &DeviceAddress,
      security: SecurityLevel,
   ) -> std::result::Result<AttLink, LinkError> {
      l2cap::connect(local, remote, security).await
   }
}

/// What the sync tasks get once the watch is ready.
pub struct ReadyLink<'a, C> {
   pub att: &'a mut AttTransport<C>,
   pub write_pacing: Duration,
   pub verbosity: u8,
}

/// Resources held by one attempt.
struct Resources<R, L> {
   radio: Option<R>,
   att: Option<AttTransport<L>>,
}

impl<R, L> Resources<R, L> {
   const fn new() -> Self {
      Self { radio: None, att: None }
   }

   /// Closes the link, then the radio. Safe to call more than once.
   fn release(&mut self) {
      if let Some(att) = self.att.take() {
         drop(att);
         debug!("Link closed");
      }
      if let Some(radio) = self.radio.take() {
         drop(radio);
         debug!("Radio closed");
      }
   }
}

impl<R, L> Drop for Resources<R, L> {
   fn drop(&mut self) {
      self.release();
   }
}

/// Drives attempts for one process.
pub struct Session<'a, B, P, O, A> {
   config: &'a Config,
   dev_id: u16,
   backend: B,
   protocol: P,
   operator: O,
   almanac: A,
   cancel: CancellationToken,
   state: SessionState,
   hint_shown: bool,
}

impl<'a, B, P, O, A> Session<'a, B, P, O, A>
where
   B: Backend,
   P: DeviceProtocol,
   O: Operator,
   A: AlmanacSource,
{
   pub fn new(
      config: &'a Config,
      dev_id: u16,
      backend: B,
      protocol: P,
      operator: O,
      almanac: A,
      cancel: CancellationToken,
   ) -> Self {
      Self {
         config,
         dev_id,
         backend,
         protocol,
         operator,
         almanac,
         cancel,
         state: SessionState::Disconnected,
         hint_shown: false,
      }
   }

   pub const fn state(&self) -> SessionState {
      self.state
   }

   pub const fn backend(&self) -> &B {
      &self.backend
   }

   pub const fn operator(&self) -> &O {
      &self.operator
   }

   fn enter(&mut self, state: SessionState) {
      debug!("{} → {state}", self.state);
      self.state = state;
   }

   fn show_permission_hint(&mut self) {
      if !self.hint_shown {
         self.hint_shown = true;
         self.operator.notice(PERMISSION_HINT);
      }
   }

   /// Runs one attempt and releases everything it acquired.
   ///
   /// `first` is true until an attempt has succeeded.
   pub async fn run_attempt(&mut self, first: bool) -> SessionOutcome {
      let mut resources = Resources::new();
      let result = self.drive(&mut resources, first).await;

      self.enter(SessionState::Closing);
      resources.release();
      self.enter(SessionState::Disconnected);

      match result {
         Ok(()) => {
            info!("Session complete");
            SessionOutcome::Success
         },
         Err(e) => self.classify(e, first),
      }
   }

   fn classify(&mut self, err: Error, first: bool) -> SessionOutcome {
      if err.is_permission_denied() {
         self.show_permission_hint();
      }
      match err {
         Error::Cancelled => {
            info!("Session cancelled");
            SessionOutcome::RecoverableFailure
         },
         _ if !first => {
            warn!("Session failed: {err}");
            SessionOutcome::RecoverableFailure
         },
         _ if self.config.daemon && err.is_connect_phase() => {
            warn!("{err}");
            SessionOutcome::RecoverableFailure
         },
         _ => {
            error!("{err}");
            SessionOutcome::FatalFailure
         },
      }
   }

   async fn drive(&mut self, res: &mut Resources<B::Radio, B::Link>, first: bool) -> Result<()> {
      let radio = self
         .backend
         .open_radio(self.dev_id)
         .map_err(Error::during(Phase::Controller))?;
      let radio = res.radio.insert(radio);

      if first && !radio.supports_le().await.map_err(Error::during(Phase::Controller))? {
         return Err(Error::AdapterUnsupported(self.dev_id));
      }
      let local = radio
         .local_address()
         .await
         .map_err(Error::during(Phase::Controller))?;

      let remote = match self.config.device {
         Some(addr) => addr,
         None => {
            self.enter(SessionState::Scanning);
            scan(radio, &self.cancel).await?.ok_or(Error::Cancelled)?
         },
      };

      self.enter(SessionState::Connecting);
      let link = self
         .backend
         .connect(local, &remote, SecurityLevel::Medium)
         .await?;
      let att = res.att.insert(AttTransport::new(link, CONTROL_TIMEOUT));
      let conn = att
         .channel()
         .connection_handle()
         .map_err(Error::during(Phase::Negotiate))?;
      info!("Connected to {remote}, connection handle 0x{conn:04x}");

      self.enter(SessionState::NegotiatingParameters);
      match negotiate(radio, conn, &ConnectionParameters::REQUESTED, UPDATE_TIMEOUT).await {
         Ok(_) => {},
         Err(e) if first && e.is_permission_denied() => {
            warn!("Could not raise the connection interval: {e}");
            self.show_permission_hint();
         },
         Err(e) => return Err(e),
      }
      let ppcp = ConnectionParameters::decode(&att.read(handle::PPCP).await?)?;
      let write_pacing = ppcp.write_pacing();
      debug!(
         "Throttling writes to 1 packet every {} µs ({ppcp:?})",
         write_pacing.as_micros()
      );

      self.enter(SessionState::CheckingCapabilities);
      let info = self.protocol.check_device_version(att, first).await?;
      info!(
         "Watch is a {} (serial {})",
         info.get("model_name").unwrap_or("?"),
         info.get("serial").unwrap_or("?")
      );
      if first && self.config.tasks.show_version {
         let mut text = info.to_string();
         match radio.read_rssi(conn).await {
            Ok(rssi) => text.push_str(&format!("  {:<10}: {rssi} dB\n", "rssi")),
            Err(e) => debug!("Could not read RSSI: {e}"),
         }
         self.operator.notice(&text);
      }

      self.enter(SessionState::Authenticating);
      let code = match self.config.pairing_code {
         Some(code) => code,
         None => self.operator.pairing_code().await?,
      };
      self
         .protocol
         .authorize(att, code, self.config.first_pairing())
         .await?;
      info!("Authorized");

      self.enter(SessionState::Ready);
      att.set_timeout(READY_TIMEOUT);
      let tasks = SyncTasks::new(self.config, &self.protocol, &self.almanac);
      tasks
         .run(ReadyLink {
            att,
            write_pacing,
            verbosity: self.config.verbosity,
         })
         .await
   }
}

impl<B, P, O, A> Attempt for Session<'_, B, P, O, A>
where
   B: Backend,
   P: DeviceProtocol,
   O: Operator,
   A: AlmanacSource,
{
   async fn attempt(&mut self, first: bool) -> SessionOutcome {
      self.run_attempt(first).await
   }
}
