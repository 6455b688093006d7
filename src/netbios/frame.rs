//! Reading and writing whole NetBIOS frames on a non-blocking socket
//!
//! [`read_frame_send`] reads the 4-byte header, then exactly the announced
//! payload. Keepalive frames are consumed and counted but never returned.

use crate::async_req::{Request, Scheduler};
use crate::error::{Error, Result};
use crate::net::io::{
    read_packet_recv, read_packet_send, write_all_send, ReadPacketState, WriteAllState,
};
use crate::netbios::{NetBiosHeader, NetBiosMessage, NetBiosMessageType};
use bytes::{Bytes, BytesMut};
use std::convert::TryFrom;
use std::os::fd::{AsRawFd, RawFd};
use tracing::trace;

const KEEPALIVE_TAG: u8 = NetBiosMessageType::Keepalive as u8;

/// One frame as read off the wire, header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: BytesMut,
}

impl Frame {
    /// Raw type byte; direct-hosted SMB uses 0x00
    pub fn kind(&self) -> u8 {
        self.data[0]
    }

    pub fn message_type(&self) -> Result<NetBiosMessageType> {
        NetBiosMessageType::try_from(self.kind())
    }

    /// The 4 header bytes
    pub fn header(&self) -> &[u8] {
        &self.data[..NetBiosHeader::SIZE]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[NetBiosHeader::SIZE..]
    }

    /// Header plus payload
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

/// Private state of [`read_frame_send`]
pub struct ReadFrameState {
    fd: RawFd,
    packet: Option<Request<ReadPacketState>>,
    frame: Option<Frame>,
    keepalives: u32,
}

impl ReadFrameState {
    /// Keepalive frames skipped so far
    pub fn keepalives(&self) -> u32 {
        self.keepalives
    }
}

fn frame_more(buf: &[u8]) -> Result<usize> {
    if buf.len() > NetBiosHeader::SIZE {
        return Ok(0);
    }
    Ok(NetBiosHeader::peek_length(buf)? as usize)
}

/// Read the next non-keepalive frame from `socket`.
///
/// The descriptor is borrowed and must stay open while the request lives.
pub fn read_frame_send(sched: &Scheduler, socket: &impl AsRawFd) -> Result<Request<ReadFrameState>> {
    let fd = socket.as_raw_fd();
    let req = Request::new(
        sched,
        ReadFrameState {
            fd,
            packet: None,
            frame: None,
            keepalives: 0,
        },
    );
    let packet = read_packet_send(sched, fd, NetBiosHeader::SIZE, frame_more)?;
    watch_packet(&req, packet);
    Ok(req)
}

fn watch_packet(req: &Request<ReadFrameState>, packet: Request<ReadPacketState>) {
    let weak = req.downgrade();
    packet.set_continuation(move |sub| {
        let read = read_packet_recv(sub);
        if let Some(req) = weak.upgrade() {
            packet_read(&req, read);
        }
    });
    req.data_mut().packet = Some(packet);
}

fn packet_read(req: &Request<ReadFrameState>, read: Result<BytesMut>) {
    let finished = req.data_mut().packet.take();
    drop(finished);

    let data = match read {
        Ok(data) => data,
        Err(err) => {
            req.forward(&err);
            return;
        }
    };

    if data[0] == KEEPALIVE_TAG {
        let (fd, seen) = {
            let mut state = req.data_mut();
            state.keepalives += 1;
            (state.fd, state.keepalives)
        };
        trace!("fd {}: skipped keepalive #{}", fd, seen);
        let next = read_packet_send(req.scheduler(), fd, NetBiosHeader::SIZE, frame_more);
        if let Some(packet) = req.fail_if_none(next.ok()) {
            watch_packet(req, packet);
        }
        return;
    }

    trace!("fd {}: frame of {} bytes", req.data().fd, data.len());
    req.data_mut().frame = Some(Frame { data });
    req.done();
}

pub fn read_frame_recv(req: &Request<ReadFrameState>) -> Result<Frame> {
    req.status()?;
    req.data_mut()
        .frame
        .take()
        .ok_or_else(|| Error::InvalidState("frame already taken".to_string()))
}

/// Send one keepalive frame
pub fn write_keepalive_send(sched: &Scheduler, socket: &impl AsRawFd) -> Result<Request<WriteAllState>> {
    write_all_send(sched, socket.as_raw_fd(), NetBiosMessage::keepalive().to_bytes())
}

/// Send `message`, header first
pub fn write_frame_send(
    sched: &Scheduler,
    socket: &impl AsRawFd,
    message: &NetBiosMessage,
) -> Result<Request<WriteAllState>> {
    write_all_send(sched, socket.as_raw_fd(), message.to_bytes())
}
