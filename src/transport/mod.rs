//! RPC transport layer
//!
//! An [`RpcTransport`] moves opaque byte strings for the RPC layer above it.
//! Every operation is a request pair in the usual `*_send`/`*_recv` shape;
//! [`RpcTransportExt`] wraps each pair into one `async fn` for code that is
//! already running inside [`Scheduler::block_on`].

use crate::async_req::{Request, Scheduler};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

pub mod sock;

pub use sock::SocketTransport;

/// Private state of a native request/response exchange
#[derive(Debug, Default)]
pub struct TransactState {
    pub response: Option<Bytes>,
}

/// Byte transport underneath the RPC client
pub trait RpcTransport {
    type WriteState: 'static;
    type ReadState: 'static;

    /// Send all of `data`
    fn write_send(&self, sched: &Scheduler, data: Bytes) -> Result<Request<Self::WriteState>>;

    /// Bytes sent
    fn write_recv(&self, req: &Request<Self::WriteState>) -> Result<usize>;

    /// Receive into `buf`, at most `buf.len()` bytes
    fn read_send(&self, sched: &Scheduler, buf: Vec<u8>) -> Result<Request<Self::ReadState>>;

    /// The buffer and the number of bytes received. An orderly shutdown by
    /// the peer is reported as end-of-file, never as 0 bytes.
    fn read_recv(&self, req: &Request<Self::ReadState>) -> Result<(Vec<u8>, usize)>;

    /// Send a request and read the response in one round trip.
    ///
    /// Transports without a native exchange leave this unimplemented and report
    /// [`Error::NotImplemented`]. A byte stream has no message boundaries, so
    /// callers then write the request and read the framed response themselves.
    fn transact_send(
        &self,
        _sched: &Scheduler,
        _data: Bytes,
        _max_response: usize,
    ) -> Result<Request<TransactState>> {
        Err(Error::NotImplemented(
            "transport has no combined exchange".to_string(),
        ))
    }

    fn transact_recv(&self, req: &Request<TransactState>) -> Result<Bytes> {
        req.status()?;
        req.data_mut()
            .response
            .take()
            .ok_or_else(|| Error::InvalidState("response already taken".to_string()))
    }
}

/// `async` wrappers over the request pairs of an [`RpcTransport`]
#[async_trait(?Send)]
pub trait RpcTransportExt: RpcTransport {
    async fn write(&self, sched: &Scheduler, data: Bytes) -> Result<usize>;

    async fn read(&self, sched: &Scheduler, buf: Vec<u8>) -> Result<(Vec<u8>, usize)>;

    /// Native exchange; [`Error::NotImplemented`] on transports without one
    async fn transact(&self, sched: &Scheduler, data: Bytes, max_response: usize) -> Result<Bytes>;
}

#[async_trait(?Send)]
impl<T: RpcTransport + ?Sized> RpcTransportExt for T {
    async fn write(&self, sched: &Scheduler, data: Bytes) -> Result<usize> {
        let req = self.write_send(sched, data)?;
        req.wait().await;
        self.write_recv(&req)
    }

    async fn read(&self, sched: &Scheduler, buf: Vec<u8>) -> Result<(Vec<u8>, usize)> {
        let req = self.read_send(sched, buf)?;
        req.wait().await;
        self.read_recv(&req)
    }

    async fn transact(&self, sched: &Scheduler, data: Bytes, max_response: usize) -> Result<Bytes> {
        let req = self.transact_send(sched, data, max_response)?;
        req.wait().await;
        self.transact_recv(&req)
    }
}
