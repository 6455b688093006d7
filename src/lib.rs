//! Asynchronous request engine and socket plumbing for an SMB/RPC client stack
//!
//! Every I/O operation is an [`async_req::Request`] driven by a single-threaded
//! [`async_req::Scheduler`]. On top of it sit connect-with-retry
//! ([`net::connect`]), NetBIOS frame reading with keepalive filtering
//! ([`netbios::frame`]) and the RPC socket transport ([`transport`]).

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod async_req;
pub mod config;
pub mod error;
pub mod net;
pub mod netbios;
pub mod transport;

pub use error::{Error, NtStatus, Result};
