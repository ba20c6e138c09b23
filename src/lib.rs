//! USB/IP stub side
//!
//! Exports a local USB device over a TCP connection: URBs submitted by a
//! remote vhci client are handed to the local USB stack and their results are
//! streamed back in protocol order.
//!
//! A [Connection] runs two tasks: the RX side reads CMD_SUBMIT/CMD_UNLINK
//! and submits [Urb]s to a [LocalUsbStack], the TX side writes RET_SUBMIT and
//! RET_UNLINK replies. The local stack reports back through a [Completion],
//! which may be called from any thread.
use log::*;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod config;
mod connection;
mod consts;
mod device;
mod endpoint;
mod error;
pub mod host;
mod rx;
mod server;
pub mod sim;
mod setup;
mod table;
mod transfer;
mod tx;
mod unlink;
mod urb;
pub mod usbip_protocol;

pub use config::*;
pub use connection::*;
pub use consts::*;
pub use device::*;
pub use endpoint::*;
pub use error::*;
pub use server::*;
pub use setup::*;
pub use table::*;
pub use transfer::*;
pub use unlink::*;
pub use urb::*;
