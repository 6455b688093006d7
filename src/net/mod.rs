//! Socket plumbing built on the request engine
//!
//! - [`io`]: raw non-blocking reads and writes on a borrowed descriptor
//! - [`connect`]: outbound connect with exponential backoff
//! - [`addr`]: address helpers used while connecting

pub mod addr;
pub mod connect;
pub mod io;

pub use connect::{
    connect_any_recv, connect_any_send, connect_blocking, connect_defer_recv, connect_defer_send,
    connect_recv, connect_send, Backoff, ConnectState, Connector, SystemConnector,
};
pub use io::{
    read_packet_recv, read_packet_send, read_some_recv, read_some_send, write_all_recv,
    write_all_send, ReadPacketState, ReadSomeState, WriteAllState,
};
