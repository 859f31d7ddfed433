//! Bluetooth plumbing for the watch link.
//!
//! This module provides the raw HCI controller socket, device discovery,
//! the L2CAP ATT channel and the ATT request/response discipline on top of
//! it, plus connection-parameter negotiation.

pub mod address;
pub mod att;
pub mod hci;
pub mod l2cap;
pub mod negotiate;
pub mod scan;
