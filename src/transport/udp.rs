//! UDP transport: datagrams represented as a queue of length-prefixed
//! records in the socket's send buffer -- §4.5.

use std::io::{self};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use log::warn;
use mio::net;
use mio::{event, Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::socket::{Socket, SocketFlags};

/// Max UDP payload per application message (`udp_write` splits larger
/// messages into records no bigger than this).
pub const MAX_UDP_PAYLOAD: usize = 64 * 1024;

/// Bytes of record header preceding the payload: `u32` length + `u32` addr
/// + `u16` port.
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 2;

pub struct UdpTransport {
    pub socket: net::UdpSocket,
}

impl event::Source for UdpTransport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.socket.register(registry, token, interests)
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.socket.reregister(registry, token, interests)
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.socket.deregister(registry)
    }
}

/// Serializes one outbound record: `len(total) | peer_addr | peer_port | payload`.
pub fn encode_record(peer: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let total = RECORD_HEADER_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&u32::from(*peer.ip()).to_be_bytes());
    buf.extend_from_slice(&peer.port().to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parses the leading record off a buffer, if a whole one is present.
/// Returns `(peer, payload, consumed_bytes)`.
pub fn decode_record(buf: &[u8]) -> Option<(SocketAddrV4, &[u8], usize)> {
    if buf.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let total = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if total < RECORD_HEADER_SIZE || buf.len() < total {
        return None;
    }
    let addr = Ipv4Addr::from(u32::from_be_bytes(buf[4..8].try_into().unwrap()));
    let port = u16::from_be_bytes(buf[8..10].try_into().unwrap());
    let payload = &buf[RECORD_HEADER_SIZE..total];
    Some((SocketAddrV4::new(addr, port), payload, total))
}

/// Splits an application message into records no larger than
/// [`MAX_UDP_PAYLOAD`] and queues them onto the send buffer.
pub fn udp_write(sock: &mut Socket, peer: SocketAddrV4, message: &[u8]) -> Result<()> {
    for chunk in message.chunks(MAX_UDP_PAYLOAD) {
        let record = encode_record(peer, chunk);
        sock.write(&record)?;
    }
    Ok(())
}

/// Pops the leading record from the send buffer and sends it; for
/// `fixed-peer` sockets, uses `send` instead of `sendto`.
pub fn default_write(sock: &mut Socket) -> Result<()> {
    let transport = match &sock.transport {
        crate::transport::Transport::Udp(t) => t,
        _ => return Err(Error::internal("udp default_write on a non-udp transport")),
    };

    let Some((peer, payload, consumed)) = decode_record(sock.send.as_slice()) else {
        return Ok(());
    };
    let result = if sock.flags.contains(SocketFlags::FIXED_PEER) {
        transport.socket.send(payload)
    } else {
        transport.socket.send_to(payload, SocketAddr::V4(peer))
    };
    match result {
        Ok(_) => {
            sock.send.reduce(consumed);
            sock.send_seq = sock.send_seq.wrapping_add(1);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("udp: socket {:?} send error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Receives one datagram into the receive buffer, updating peer fields
/// unless the socket is `fixed-peer`.
pub fn default_read(sock: &mut Socket) -> Result<()> {
    let transport = match &sock.transport {
        crate::transport::Transport::Udp(t) => t,
        _ => return Err(Error::internal("udp default_read on a non-udp transport")),
    };

    let mut scratch = [0u8; MAX_UDP_PAYLOAD];
    match transport.socket.recv_from(&mut scratch) {
        Ok((n, from)) => {
            if !sock.flags.contains(SocketFlags::FIXED_PEER) {
                if let SocketAddr::V4(v4) = from {
                    sock.remote = v4;
                }
            }
            if sock.recv.would_overflow(n) {
                return Err(Error::resource_exhausted(sock.id, "receive buffer full"));
            }
            sock.recv.append(&scratch[..n]);
            sock.last_recv = std::time::Instant::now();
            sock.recv_seq = sock.recv_seq.wrapping_add(1);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("udp: socket {:?} recv error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}
