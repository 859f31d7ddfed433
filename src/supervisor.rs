//! Reconnect supervisor.
//!
//! Runs session attempts: once in interactive mode, forever in daemon mode
//! with a long sleep after a successful session and a short one after a
//! failed one. The sleep is cut short by the same cancellation token the
//! scanner watches.

use std::{process::ExitCode, time::Duration};

use log::{debug, info};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::{config::Config, session::SessionOutcome};

/// Something the supervisor can retry.
pub trait Attempt {
   /// Runs one attempt. `first` is true until an attempt has succeeded.
   async fn attempt(&mut self, first: bool) -> SessionOutcome;
}

/// Process exit status.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
   Normal = 0,
   AttemptFailed = 1,
   InvalidConfiguration = 2,
}

impl From<ExitStatus> for ExitCode {
   fn from(status: ExitStatus) -> Self {
      Self::from(status as u8)
   }
}

pub struct Supervisor {
   daemon: bool,
   wait_success: Duration,
   wait_fail: Duration,
   cancel: CancellationToken,
}

impl Supervisor {
   pub fn new(config: &Config, cancel: CancellationToken) -> Self {
      Self {
         daemon: config.daemon,
         wait_success: config.wait_success,
         wait_fail: config.wait_fail,
         cancel,
      }
   }

   /// How long to wait after an attempt ended with `outcome`.
   pub const fn backoff(&self, outcome: SessionOutcome) -> Duration {
      match outcome {
         SessionOutcome::Success => self.wait_success,
         SessionOutcome::RecoverableFailure | SessionOutcome::FatalFailure => self.wait_fail,
      }
   }

   pub async fn run<A: Attempt>(&self, session: &mut A) -> ExitStatus {
      let mut first = true;
      loop {
         let outcome = session.attempt(first).await;
         match outcome {
            SessionOutcome::FatalFailure => return ExitStatus::AttemptFailed,
            SessionOutcome::Success => first = false,
            SessionOutcome::RecoverableFailure => {},
         }

         if self.cancel.is_cancelled() {
            return ExitStatus::Normal;
         }
         if !self.daemon {
            return match outcome {
               SessionOutcome::Success => ExitStatus::Normal,
               _ => ExitStatus::AttemptFailed,
            };
         }

         let pause = self.backoff(outcome);
         if outcome == SessionOutcome::Success {
            info!("Sleeping for {} s", pause.as_secs());
         } else {
            debug!("Sleeping for {} s after failure", pause.as_secs());
         }
         tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
               info!("Interrupted while sleeping");
               return ExitStatus::Normal;
            },
            () = time::sleep(pause) => {},
         }
      }
   }
}
