use super::*;
use crate::config::ConnectConfig;
use crate::error::NtStatus;
use crate::net::connect_blocking;
use crate::netbios::{read_frame_recv, read_frame_send, NetBiosMessage};
use crate::transport::RpcTransportExt;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::time::Duration;

fn transport_pair() -> (SocketTransport, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    (SocketTransport::new(Socket::from(ours)).unwrap(), theirs)
}

#[test]
fn test_write() {
    let sched = Scheduler::new().unwrap();
    let (transport, mut peer) = transport_pair();

    let req = transport
        .write_send(&sched, Bytes::from_static(b"bind request"))
        .unwrap();
    sched.wait(&req);
    assert_eq!(transport.write_recv(&req).unwrap(), 12);

    let mut buf = [0u8; 12];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"bind request");
}

#[test]
fn test_read() {
    let sched = Scheduler::new().unwrap();
    let (transport, mut peer) = transport_pair();

    peer.write_all(b"bind ack").unwrap();
    let req = transport.read_send(&sched, vec![0; 64]).unwrap();
    sched.wait(&req);

    let (buf, received) = transport.read_recv(&req).unwrap();
    assert_eq!(received, 8);
    assert_eq!(&buf[..received], b"bind ack");
}

#[test]
fn test_read_end_of_file() {
    let sched = Scheduler::new().unwrap();
    let (transport, peer) = transport_pair();
    drop(peer);

    let req = transport.read_send(&sched, vec![0; 64]).unwrap();
    sched.wait(&req);
    assert!(transport.read_recv(&req).unwrap_err().is_end_of_file());
}

#[test]
fn test_write_to_closed_peer() {
    let sched = Scheduler::new().unwrap();
    let (transport, peer) = transport_pair();
    drop(peer);

    let req = transport
        .write_send(&sched, Bytes::from_static(b"lost"))
        .unwrap();
    sched.wait(&req);
    assert_eq!(
        transport.write_recv(&req).unwrap_err().status(),
        NtStatus::PipeBroken
    );
}

#[test]
fn test_transact_not_supported() {
    let sched = Scheduler::new().unwrap();
    let (transport, _peer) = transport_pair();

    let err = transport
        .transact_send(&sched, Bytes::from_static(b"request"), 64)
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
}

#[test]
fn test_drop_closes_socket() {
    let (transport, mut peer) = transport_pair();
    drop(transport);

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_async_write_and_read() {
    let sched = Scheduler::new().unwrap();
    let (transport, mut peer) = transport_pair();
    peer.write_all(b"response").unwrap();

    let (sent, (buf, received)) = sched
        .block_on(async {
            let sent = transport
                .write(&sched, Bytes::from_static(b"request"))
                .await?;
            let read = transport.read(&sched, vec![0; 32]).await?;
            Ok::<_, Error>((sent, read))
        })
        .unwrap();

    assert_eq!(sent, 7);
    assert_eq!(&buf[..received], b"response");

    let mut request = [0u8; 7];
    peer.read_exact(&mut request).unwrap();
    assert_eq!(&request, b"request");
}

#[test]
fn test_async_transact_is_not_supported() {
    let sched = Scheduler::new().unwrap();
    let (transport, mut peer) = transport_pair();

    let err = sched
        .block_on(transport.transact(&sched, Bytes::from_static(b"abcd"), 16))
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));

    // nothing reached the peer
    peer.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(
        peer.read(&mut buf).unwrap_err().kind(),
        std::io::ErrorKind::WouldBlock
    );
}

#[test]
fn test_split_response_is_read_as_one_frame() {
    let sched = Scheduler::new().unwrap();
    let (transport, mut peer) = transport_pair();

    let responder = std::thread::spawn(move || {
        let mut request = [0u8; 8];
        peer.read_exact(&mut request).unwrap();
        peer.write_all(&[0x00, 0x00, 0x00, 0x04, b'd', b'a']).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        peer.write_all(b"ta").unwrap();
        peer
    });

    let request = NetBiosMessage::session_message(&b"abcd"[..]).unwrap();
    let sent = sched
        .block_on(transport.write(&sched, request.to_bytes()))
        .unwrap();
    assert_eq!(sent, 8);

    let req = read_frame_send(&sched, &transport).unwrap();
    assert!(sched.wait(&req));
    assert_eq!(read_frame_recv(&req).unwrap().payload(), b"data");
    drop(responder.join().unwrap());
}

#[test]
fn test_addresses_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let socket = connect_blocking(addr, &ConnectConfig::default()).unwrap();
    let transport = SocketTransport::new(socket).unwrap();
    let (_accepted, from) = listener.accept().unwrap();

    assert_eq!(transport.peer_addr().unwrap(), addr);
    assert_eq!(transport.local_addr().unwrap(), from);
}

#[test]
fn test_unix_socket_has_no_inet_address() {
    let (transport, _peer) = transport_pair();
    assert!(matches!(transport.peer_addr(), Err(Error::InvalidState(_))));
}
