//! Interaction with the person at the terminal.

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{Error, Phase, Result};

const PAIRING_MODE_PROMPT: &str = "\
****************************************************************
Please put device in pairing mode (MENU -> PHONE -> PAIR NEW)...
****************************************************************
Press Enter to continue: ";

const PAIRING_CODE_PROMPT: &str = "
**************************************************
Enter 6-digit pairing code shown on device: ";

/// Shown when the raw HCI socket is refused.
pub const PERMISSION_HINT: &str = "\
**********************************************************
NOTE: This program lacks the permissions necessary for
  manipulating the raw Bluetooth HCI socket, which
  is required for scanning and for setting the minimum
  connection interval to speed up data transfer.

  To fix this, run it as root or, better yet, set the
  following capabilities on the ttblue executable:

    # sudo setcap 'cap_net_raw,cap_net_admin+eip' ttblue
**********************************************************
";

/// Operator prompts and notices.
pub trait Operator {
   /// Asks the operator to put the watch into pairing mode and waits.
   async fn await_pairing_mode(&mut self) -> Result<()>;

   /// Asks for the code the watch shows while pairing.
   async fn pairing_code(&mut self) -> Result<u32>;

   /// Prints a notice the operator has to act on.
   fn notice(&mut self, text: &str);
}

/// Prompts on stderr, answers from stdin.
pub struct Console {
   stdin: BufReader<tokio::io::Stdin>,
}

impl Console {
   pub fn new() -> Self {
      Self {
         stdin: BufReader::new(tokio::io::stdin()),
      }
   }

   async fn read_line(&mut self) -> Result<String> {
      let mut line = String::new();
      self
         .stdin
         .read_line(&mut line)
         .await
         .map_err(Error::during(Phase::Operator))?;
      Ok(line)
   }
}

impl Default for Console {
   fn default() -> Self {
      Self::new()
   }
}

impl Operator for Console {
   async fn await_pairing_mode(&mut self) -> Result<()> {
      eprint!("{PAIRING_MODE_PROMPT}");
      self.read_line().await?;
      eprintln!();
      Ok(())
   }

   async fn pairing_code(&mut self) -> Result<u32> {
      eprint!("{PAIRING_CODE_PROMPT}");
      let line = self.read_line().await?;
      parse_pairing_code(&line)
   }

   fn notice(&mut self, text: &str) {
      eprint!("{text}");
   }
}

/// Accepts a number of at most six digits.
pub fn parse_pairing_code(input: &str) -> Result<u32> {
   let trimmed = input.trim();
   if trimmed.is_empty() || trimmed.len() > 6 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
      return Err(Error::InvalidPairingCode(trimmed.to_owned()));
   }
   trimmed
      .parse()
      .map_err(|_| Error::InvalidPairingCode(trimmed.to_owned()))
}
