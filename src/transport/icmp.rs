//! ICMP transport: raw socket plus a 10-byte application header carrying
//! type/code/checksum/ident/sequence/port, reusing the same record framing
//! as UDP -- §4.5 and §6.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, warn};
use mio::{event, Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::socket::{Socket, SocketId};
use crate::transport::udp::{decode_record, encode_record, MAX_UDP_PAYLOAD};
use crate::transport::RawFdIo;

/// Serveez's own application-framed ICMP type (`ICMP_SERVEEZ`).
pub const ICMP_SERVEEZ: u8 = 42;

pub const ICMP_SERVEEZ_DATA: u8 = 0;
pub const ICMP_SERVEEZ_REQ: u8 = 1;
pub const ICMP_SERVEEZ_ACK: u8 = 2;
pub const ICMP_SERVEEZ_CLOSE: u8 = 3;
pub const ICMP_SERVEEZ_CONNECT: u8 = 4;

pub const ICMP_HEADER_SIZE: usize = 10;
/// `ICMP_MSG_SIZE`: maximum application payload per ICMP packet.
pub const ICMP_MSG_SIZE: usize = 64 * 1024;

/// Human-readable ICMP type names, for log messages only (supplemented
/// from the original `icmp_request[]` table; not used for protocol logic).
const ICMP_TYPE_NAMES: &[(u8, &str)] = &[
    (0, "echo reply"),
    (3, "destination unreachable"),
    (4, "source quench"),
    (5, "redirect (change route)"),
    (8, "echo request"),
    (11, "time exceeded"),
    (12, "parameter problem"),
    (13, "timestamp request"),
    (14, "timestamp reply"),
    (15, "information request"),
    (16, "information reply"),
    (17, "address mask request"),
    (18, "address mask reply"),
];

pub fn icmp_type_name(ty: u8) -> &'static str {
    ICMP_TYPE_NAMES
        .iter()
        .find(|(t, _)| *t == ty)
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

/// The 10-byte Serveez application header carried after the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub ty: u8,
    pub code: u8,
    pub checksum: u16,
    pub ident: u16,
    pub sequence: u16,
    /// Application-level demultiplex key. Distinct from the OS/local
    /// `ident` field (Open Question (b) in the spec): `ident` rejects
    /// packets the local process itself sent, `port` selects which
    /// virtual ICMP connection a packet belongs to.
    pub port: u16,
}

impl IcmpHeader {
    pub fn to_bytes(self) -> [u8; ICMP_HEADER_SIZE] {
        let mut buf = [0u8; ICMP_HEADER_SIZE];
        buf[0] = self.ty;
        buf[1] = self.code;
        buf[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        buf[4..6].copy_from_slice(&self.ident.to_be_bytes());
        buf[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..10].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < ICMP_HEADER_SIZE {
            return None;
        }
        Some(IcmpHeader {
            ty: b[0],
            code: b[1],
            checksum: u16::from_be_bytes([b[2], b[3]]),
            ident: u16::from_be_bytes([b[4], b[5]]),
            sequence: u16::from_be_bytes([b[6], b[7]]),
            port: u16::from_be_bytes([b[8], b[9]]),
        })
    }
}

/// The standard 16-bit one's-complement internet checksum, even-padded,
/// network-order finalized (`raw_ip_checksum` in the original).
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += *last as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// `(pid + sock.id) mod 2^16`, used to reject packets this process sent.
pub fn local_ident(pid: u32, id: SocketId) -> u16 {
    (pid.wrapping_add(id.0 as u32) & 0xffff) as u16
}

/// A parsed, validated IPv4 header prefix.
struct IpHeaderView {
    header_len: usize,
    total_len: usize,
}

const IPPROTO_ICMP: u8 = 1;

fn parse_ip_header(buf: &[u8]) -> Option<IpHeaderView> {
    if buf.len() < 20 {
        return None;
    }
    let version = buf[0] >> 4;
    let ihl = (buf[0] & 0x0f) as usize;
    let header_len = ihl * 4;
    if version != 4 || header_len < 20 || header_len > buf.len() {
        return None;
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_len > buf.len() {
        return None;
    }
    let protocol = buf[9];
    if protocol != IPPROTO_ICMP {
        return None;
    }
    let header_checksum = u16::from_be_bytes([buf[10], buf[11]]);
    let mut header_for_check = [0u8; 60];
    header_for_check[..header_len].copy_from_slice(&buf[..header_len]);
    header_for_check[10] = 0;
    header_for_check[11] = 0;
    if checksum(&header_for_check[..header_len]) != header_checksum {
        debug!("icmp: invalid ip header checksum");
        return None;
    }
    Some(IpHeaderView {
        header_len,
        total_len,
    })
}

pub struct IcmpSocket {
    io: RawFdIo,
    /// The demultiplex port of this virtual connection; listeners accept
    /// any `port` in an incoming `connect`.
    pub port: u16,
}

impl IcmpSocket {
    #[cfg(unix)]
    pub fn new(port: u16) -> io::Result<Self> {
        use std::os::fd::FromRawFd;
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_RAW, IPPROTO_ICMP as i32);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let owned = std::os::fd::OwnedFd::from_raw_fd(fd);
            Ok(IcmpSocket {
                io: RawFdIo::new(owned),
                port,
            })
        }
    }

    #[cfg(unix)]
    pub fn send_to(&self, dest: Ipv4Addr, packet: &[u8]) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        let sockaddr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(dest).to_be(),
            },
            sin_zero: [0; 8],
        };
        let ret = unsafe {
            libc::sendto(
                self.io.raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    #[cfg(unix)]
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        use std::os::fd::AsRawFd;
        let mut sockaddr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                self.io.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sockaddr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok((ret as usize, Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr))))
        }
    }
}

#[cfg(unix)]
impl event::Source for IcmpSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.io.register(registry, token, interests)
    }
    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.io.reregister(registry, token, interests)
    }
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.io.deregister(registry)
    }
}

/// The outcome of validating one received raw IP+ICMP datagram.
pub enum Validated<'a> {
    /// A `data`/`req`/`ack`/`connect` packet with its payload intact.
    Data { header: IcmpHeader, payload: &'a [u8] },
    /// A `close` packet: the peer is tearing down this virtual connection.
    Closed { header: IcmpHeader },
    /// Malformed, foreign, or otherwise not a packet this socket should
    /// act on (every raw ICMP socket sees all ICMP traffic delivered to
    /// the host, not just its own).
    Rejected,
}

/// Validates and unwraps one received raw IP+ICMP datagram, per the
/// validation order in §4.5: IP header sanity, then the app header
/// checksum/ident/port checks.
pub fn validate_and_strip<'a>(
    raw: &'a [u8],
    local_ident_value: u16,
    remote_port_if_connected: Option<u16>,
) -> Validated<'a> {
    let Some(ip) = parse_ip_header(raw) else {
        return Validated::Rejected;
    };
    let body = &raw[ip.header_len..ip.total_len.min(raw.len())];
    let Some(header) = IcmpHeader::from_bytes(body) else {
        return Validated::Rejected;
    };
    if header.ty != ICMP_SERVEEZ {
        debug!("icmp: rejecting raw icmp type {}", icmp_type_name(header.ty));
        return Validated::Rejected;
    }
    let payload = &body[ICMP_HEADER_SIZE..];
    if header.checksum != checksum(payload) {
        debug!("icmp: invalid data checksum");
        return Validated::Rejected;
    }
    if header.ident == local_ident_value {
        // Our own packet looped back; reject silently.
        return Validated::Rejected;
    }
    if let Some(remote_port) = remote_port_if_connected {
        if header.port != remote_port && header.code != ICMP_SERVEEZ_CONNECT {
            return Validated::Rejected;
        }
    }
    if header.code == ICMP_SERVEEZ_CLOSE {
        return Validated::Closed { header };
    }
    Validated::Data { header, payload }
}

/// Builds one full application-framed ICMP packet ready for `send_to`.
pub fn build_packet(ident: u16, sequence: u16, port: u16, code: u8, payload: &[u8]) -> Vec<u8> {
    let header = IcmpHeader {
        ty: ICMP_SERVEEZ,
        code,
        checksum: checksum(payload),
        ident,
        sequence,
        port,
    };
    let mut buf = Vec::with_capacity(ICMP_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Splits a message into records no larger than [`ICMP_MSG_SIZE`] and
/// queues them in the generic (len, addr, port, payload) record format
/// shared with UDP.
pub fn icmp_write(sock: &mut Socket, message: &[u8]) -> Result<()> {
    for chunk in message.chunks(ICMP_MSG_SIZE.min(MAX_UDP_PAYLOAD)) {
        let record = encode_record(sock.remote, chunk);
        sock.write(&record)?;
    }
    Ok(())
}

/// Pops the leading queued record and sends it as one application-framed
/// ICMP packet.
pub fn default_write(sock: &mut Socket, pid: u32) -> Result<()> {
    let icmp = match &sock.transport {
        crate::transport::Transport::Icmp(t) => t,
        _ => return Err(Error::internal("icmp default_write on a non-icmp transport")),
    };

    let Some((peer, payload, consumed)) = decode_record(sock.send.as_slice()) else {
        return Ok(());
    };
    let ident = local_ident(pid, sock.id);
    let packet = build_packet(ident, sock.send_seq, icmp.port, ICMP_SERVEEZ_DATA, payload);
    match icmp.send_to(*peer.ip(), &packet) {
        Ok(_) => {
            sock.send.reduce(consumed);
            sock.send_seq = sock.send_seq.wrapping_add(1);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("icmp: socket {:?} send error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Receives and validates one ICMP datagram on a non-listening (fixed
/// single-peer) ICMP socket, appending only the payload to the receive
/// buffer. Listening sockets go through `Runtime::icmp_route` instead,
/// which demultiplexes by peer into per-connection sockets (§4.5,
/// end-to-end scenario 5).
pub fn default_read(sock: &mut Socket, pid: u32) -> Result<()> {
    let icmp = match &sock.transport {
        crate::transport::Transport::Icmp(t) => t,
        _ => return Err(Error::internal("icmp default_read on a non-icmp transport")),
    };

    let mut scratch = [0u8; 65536];
    let (n, _from) = match icmp.recv_from(&mut scratch) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => {
            warn!("icmp: socket {:?} recv error: {}", sock.id, e);
            sock.schedule_shutdown();
            return Err(Error::fatal_io(sock.id, e));
        }
    };

    let local_ident_value = local_ident(pid, sock.id);
    let remote_port_filter = Some(icmp.port);

    match validate_and_strip(&scratch[..n], local_ident_value, remote_port_filter) {
        Validated::Data { header, payload } => {
            if sock.recv.would_overflow(payload.len()) {
                return Err(Error::resource_exhausted(sock.id, "receive buffer full"));
            }
            sock.recv.append(payload);
            sock.last_recv = std::time::Instant::now();
            sock.sequence = header.sequence;
            Ok(())
        }
        Validated::Closed { .. } => {
            sock.schedule_shutdown();
            Ok(())
        }
        // A raw ICMP socket sees every ICMP packet delivered to the host,
        // not just ours; silently drop anything that doesn't validate.
        Validated::Rejected => Ok(()),
    }
}
