//! Raw non-blocking socket I/O as requests
//!
//! Every primitive here borrows its descriptor: the caller keeps the socket open
//! until the request is finished or dropped. Each one waits for readiness on
//! the scheduler and never blocks the calling thread.

use crate::async_req::{FdInterest, Request, Scheduler, WatchHandle, WeakRequest};
use crate::error::{Error, NtStatus, Result};
use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use std::io;
use std::os::fd::RawFd;
use tracing::trace;

/// Given the bytes read so far, how many more are needed (0 = complete)
pub type MoreFn = Box<dyn FnMut(&[u8]) -> Result<usize>>;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

fn would_block() -> io::Result<()> {
    Err(io::ErrorKind::WouldBlock.into())
}

/// Private state of [`read_packet_send`]
pub struct ReadPacketState {
    fd: RawFd,
    buf: BytesMut,
    filled: usize,
    more: MoreFn,
    watch: Option<WatchHandle>,
}

impl ReadPacketState {
    /// Bytes received so far
    pub fn filled(&self) -> usize {
        self.filled
    }
}

/// Read `initial` bytes, then keep asking `more` how many further bytes are
/// needed until it answers 0.
///
/// End of stream before the packet is complete fails with end-of-file.
pub fn read_packet_send<F>(
    sched: &Scheduler,
    fd: RawFd,
    initial: usize,
    more: F,
) -> Result<Request<ReadPacketState>>
where
    F: FnMut(&[u8]) -> Result<usize> + 'static,
{
    if initial == 0 {
        return Err(Error::InvalidParameter(
            "packet read needs a non-empty initial size".to_string(),
        ));
    }
    let req = Request::new(
        sched,
        ReadPacketState {
            fd,
            buf: BytesMut::zeroed(initial),
            filled: 0,
            more: Box::new(more),
            watch: None,
        },
    );
    let weak = req.downgrade();
    let watch = sched.watch_fd(fd, FdInterest::READ, move |_| read_packet_handler(&weak))?;
    req.data_mut().watch = Some(watch);
    Ok(req)
}

fn read_packet_handler(weak: &WeakRequest<ReadPacketState>) -> io::Result<()> {
    let Some(req) = weak.upgrade() else {
        return Ok(());
    };
    if !req.is_in_progress() {
        return Ok(());
    }

    let received = {
        let mut guard = req.data_mut();
        let state = &mut *guard;
        let filled = state.filled;
        recv(state.fd, &mut state.buf[filled..], MsgFlags::empty())
    };

    let received = match received {
        Ok(0) => {
            trace!("fd {}: end of stream mid-packet", req.data().fd);
            release_watch(&req);
            req.fail(NtStatus::EndOfFile);
            return Ok(());
        }
        Ok(n) => n,
        Err(Errno::EAGAIN) => return would_block(),
        Err(Errno::EINTR) => return Ok(()),
        Err(errno) => {
            release_watch(&req);
            req.fail(NtStatus::from_errno(errno as i32));
            return Ok(());
        }
    };

    let more = {
        let mut guard = req.data_mut();
        let state = &mut *guard;
        state.filled += received;
        if state.filled < state.buf.len() {
            return Ok(());
        }
        (state.more)(&state.buf[..])
    };

    match more {
        Ok(0) => {
            release_watch(&req);
            req.done();
        }
        Ok(extra) => {
            let grown = {
                let mut state = req.data_mut();
                match state.buf.len().checked_add(extra) {
                    Some(len) => {
                        state.buf.resize(len, 0);
                        true
                    }
                    None => false,
                }
            };
            if !grown {
                release_watch(&req);
                req.fail(NtStatus::InvalidParameter);
            }
        }
        Err(err) => {
            release_watch(&req);
            req.forward(&err);
        }
    }
    Ok(())
}

fn release_watch<S: 'static>(req: &Request<S>)
where
    S: HasWatch,
{
    let watch = req.data_mut().watch_slot().take();
    drop(watch);
}

trait HasWatch {
    fn watch_slot(&mut self) -> &mut Option<WatchHandle>;
}

impl HasWatch for ReadPacketState {
    fn watch_slot(&mut self) -> &mut Option<WatchHandle> {
        &mut self.watch
    }
}

/// Take the completed packet out of the request
pub fn read_packet_recv(req: &Request<ReadPacketState>) -> Result<BytesMut> {
    req.status()?;
    let mut state = req.data_mut();
    if state.buf.is_empty() {
        return Err(Error::InvalidState("packet already taken".to_string()));
    }
    state.filled = 0;
    Ok(std::mem::take(&mut state.buf))
}

/// Private state of [`read_some_send`]
pub struct ReadSomeState {
    fd: RawFd,
    buf: Vec<u8>,
    received: Option<usize>,
    watch: Option<WatchHandle>,
}

impl HasWatch for ReadSomeState {
    fn watch_slot(&mut self) -> &mut Option<WatchHandle> {
        &mut self.watch
    }
}

/// One `recv` into the caller's buffer once the descriptor is readable.
///
/// A zero-byte read completes the request successfully with 0; callers that
/// treat it as end-of-file do so in their own `recv`.
pub fn read_some_send(sched: &Scheduler, fd: RawFd, buf: Vec<u8>) -> Result<Request<ReadSomeState>> {
    if buf.is_empty() {
        return Err(Error::InvalidParameter("read into an empty buffer".to_string()));
    }
    let req = Request::new(
        sched,
        ReadSomeState {
            fd,
            buf,
            received: None,
            watch: None,
        },
    );
    let weak = req.downgrade();
    let watch = sched.watch_fd(fd, FdInterest::READ, move |_| read_some_handler(&weak))?;
    req.data_mut().watch = Some(watch);
    Ok(req)
}

fn read_some_handler(weak: &WeakRequest<ReadSomeState>) -> io::Result<()> {
    let Some(req) = weak.upgrade() else {
        return Ok(());
    };
    if !req.is_in_progress() {
        return Ok(());
    }

    let received = {
        let mut guard = req.data_mut();
        let state = &mut *guard;
        recv(state.fd, &mut state.buf[..], MsgFlags::empty())
    };

    match received {
        Ok(n) => {
            req.data_mut().received = Some(n);
            release_watch(&req);
            req.done();
        }
        Err(Errno::EAGAIN) => return would_block(),
        Err(Errno::EINTR) => {}
        Err(errno) => {
            release_watch(&req);
            req.fail(NtStatus::from_errno(errno as i32));
        }
    }
    Ok(())
}

/// Hand the buffer back together with the number of bytes received
pub fn read_some_recv(req: &Request<ReadSomeState>) -> Result<(Vec<u8>, usize)> {
    req.status()?;
    let mut state = req.data_mut();
    let received = state
        .received
        .take()
        .ok_or_else(|| Error::InvalidState("read result already taken".to_string()))?;
    Ok((std::mem::take(&mut state.buf), received))
}

/// Private state of [`write_all_send`]
pub struct WriteAllState {
    fd: RawFd,
    data: Bytes,
    sent: usize,
    watch: Option<WatchHandle>,
}

impl HasWatch for WriteAllState {
    fn watch_slot(&mut self) -> &mut Option<WatchHandle> {
        &mut self.watch
    }
}

/// Send all of `data`, looping over partial writes
pub fn write_all_send(sched: &Scheduler, fd: RawFd, data: Bytes) -> Result<Request<WriteAllState>> {
    let empty = data.is_empty();
    let req = Request::new(
        sched,
        WriteAllState {
            fd,
            data,
            sent: 0,
            watch: None,
        },
    );
    if empty {
        req.done();
        return req.post();
    }
    let weak = req.downgrade();
    let watch = sched.watch_fd(fd, FdInterest::WRITE, move |_| write_all_handler(&weak))?;
    req.data_mut().watch = Some(watch);
    Ok(req)
}

fn write_all_handler(weak: &WeakRequest<WriteAllState>) -> io::Result<()> {
    let Some(req) = weak.upgrade() else {
        return Ok(());
    };
    if !req.is_in_progress() {
        return Ok(());
    }

    let sent = {
        let state = req.data();
        send(state.fd, &state.data[state.sent..], send_flags())
    };

    match sent {
        Ok(n) => {
            let complete = {
                let mut state = req.data_mut();
                state.sent += n;
                state.sent == state.data.len()
            };
            if complete {
                release_watch(&req);
                req.done();
            }
        }
        Err(Errno::EAGAIN) => return would_block(),
        Err(Errno::EINTR) => {}
        Err(errno) => {
            release_watch(&req);
            req.fail(NtStatus::from_errno(errno as i32));
        }
    }
    Ok(())
}

/// Number of bytes written; always the full length on success
pub fn write_all_recv(req: &Request<WriteAllState>) -> Result<usize> {
    req.status()?;
    Ok(req.data().sent)
}
