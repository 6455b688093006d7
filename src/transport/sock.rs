//! RPC transport over a connected stream socket

use super::RpcTransport;
use crate::async_req::{Request, Scheduler};
use crate::error::{Error, Result};
use crate::net::io::{
    read_some_recv, read_some_send, write_all_recv, write_all_send, ReadSomeState, WriteAllState,
};
use bytes::Bytes;
use socket2::Socket;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// Socket transport. Owns the socket and closes it when dropped.
///
/// Outstanding read and write requests borrow the descriptor, so they must be
/// dropped or finished before the transport is.
pub struct SocketTransport {
    socket: Socket,
}

impl SocketTransport {
    /// Wrap a connected socket, switching it to non-blocking mode
    pub fn new(socket: Socket) -> Result<Self> {
        socket.set_nonblocking(true)?;
        trace!("socket transport on fd {}", socket.as_raw_fd());
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::InvalidState("socket has no inet address".to_string()))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.socket
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| Error::InvalidState("socket has no inet address".to_string()))
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl AsRawFd for SocketTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        debug!("closing transport socket fd {}", self.socket.as_raw_fd());
    }
}

impl RpcTransport for SocketTransport {
    type WriteState = WriteAllState;
    type ReadState = ReadSomeState;

    fn write_send(&self, sched: &Scheduler, data: Bytes) -> Result<Request<WriteAllState>> {
        write_all_send(sched, self.as_raw_fd(), data)
    }

    fn write_recv(&self, req: &Request<WriteAllState>) -> Result<usize> {
        write_all_recv(req)
    }

    fn read_send(&self, sched: &Scheduler, buf: Vec<u8>) -> Result<Request<ReadSomeState>> {
        read_some_send(sched, self.as_raw_fd(), buf)
    }

    fn read_recv(&self, req: &Request<ReadSomeState>) -> Result<(Vec<u8>, usize)> {
        let (buf, received) = read_some_recv(req)?;
        if received == 0 {
            return Err(Error::EndOfFile);
        }
        Ok((buf, received))
    }
}

#[cfg(test)]
mod tests;
