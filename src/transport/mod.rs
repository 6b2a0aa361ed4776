//! Variant transports (TCP/UDP/ICMP/Pipe) sharing the buffer/callback
//! machinery in [`crate::socket`], per the Design Note "Variant sockets":
//! factor the transport as an interface, tagged by variant.

pub mod icmp;
pub mod pipe;
pub mod tcp;
pub mod udp;

use std::io;

use mio::{event, Interest, Registry, Token};

use crate::socket::SocketId;

pub use icmp::IcmpSocket;
pub use pipe::{PipeListener, PipePair};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// The concrete transport a [`crate::socket::Socket`] speaks.
pub enum Transport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
    Icmp(IcmpSocket),
    /// A virtual ICMP connection demultiplexed from a listener's shared
    /// raw socket (§4.5, end-to-end scenario 5). Has no OS handle of its
    /// own, so it never registers with `mio::Poll`; reads arrive via
    /// `Runtime::icmp_route` on the listener, writes go out through the
    /// listener's raw socket (`Runtime::icmp_peer_write`).
    IcmpPeer { parent: SocketId },
    #[cfg(unix)]
    Raw(RawIpSocket),
    PipeListener(PipeListener),
    Pipe(PipePair),
    /// A placeholder used only by unit tests that exercise socket-level
    /// bookkeeping without needing a live OS handle.
    #[cfg(test)]
    Null,
}

impl Transport {
    #[cfg(test)]
    pub fn test_null() -> Self {
        Transport::Null
    }

    pub fn is_raw_socket(&self) -> bool {
        match self {
            Transport::Icmp(_) => true,
            #[cfg(unix)]
            Transport::Raw(_) => true,
            _ => false,
        }
    }
}

impl event::Source for Transport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.register(registry, token, interests),
            Transport::Udp(t) => t.register(registry, token, interests),
            Transport::Icmp(t) => t.register(registry, token, interests),
            Transport::IcmpPeer { .. } => Ok(()),
            #[cfg(unix)]
            Transport::Raw(t) => t.register(registry, token, interests),
            Transport::PipeListener(t) => t.register(registry, token, interests),
            Transport::Pipe(t) => t.register(registry, token, interests),
            #[cfg(test)]
            Transport::Null => Ok(()),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.reregister(registry, token, interests),
            Transport::Udp(t) => t.reregister(registry, token, interests),
            Transport::Icmp(t) => t.reregister(registry, token, interests),
            Transport::IcmpPeer { .. } => Ok(()),
            #[cfg(unix)]
            Transport::Raw(t) => t.reregister(registry, token, interests),
            Transport::PipeListener(t) => t.reregister(registry, token, interests),
            Transport::Pipe(t) => t.reregister(registry, token, interests),
            #[cfg(test)]
            Transport::Null => Ok(()),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(t) => t.deregister(registry),
            Transport::Udp(t) => t.deregister(registry),
            Transport::Icmp(t) => t.deregister(registry),
            Transport::IcmpPeer { .. } => Ok(()),
            #[cfg(unix)]
            Transport::Raw(t) => t.deregister(registry),
            Transport::PipeListener(t) => t.deregister(registry),
            Transport::Pipe(t) => t.deregister(registry),
            #[cfg(test)]
            Transport::Null => Ok(()),
        }
    }
}

/// A raw `IPPROTO_RAW`/`IP_HDRINCL` socket: the application supplies the
/// complete IPv4 packet on send and receives complete packets on recv,
/// with no Serveez-level framing (§6 "RAW").
#[cfg(unix)]
pub struct RawIpSocket {
    io: RawFdIo,
}

#[cfg(unix)]
impl RawIpSocket {
    pub fn new(protocol: i32) -> io::Result<Self> {
        use std::os::unix::io::FromRawFd;
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_RAW, protocol);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let on: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let owned = std::os::unix::io::OwnedFd::from_raw_fd(fd);
            Ok(RawIpSocket { io: RawFdIo::new(owned) })
        }
    }

    pub fn send_to(&self, dest: std::net::Ipv4Addr, packet: &[u8]) -> io::Result<usize> {
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

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, std::net::Ipv4Addr)> {
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
            Ok((ret as usize, std::net::Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr))))
        }
    }
}

#[cfg(unix)]
impl event::Source for RawIpSocket {
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

/// Adapter bridging a raw, owned Unix fd into `mio::event::Source`,
/// matching `mio::unix::SourceFd`'s documented pattern for custom types.
#[cfg(unix)]
pub struct RawFdIo {
    fd: std::os::unix::io::OwnedFd,
}

#[cfg(unix)]
impl RawFdIo {
    pub fn new(fd: std::os::unix::io::OwnedFd) -> Self {
        RawFdIo { fd }
    }

    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.fd.as_raw_fd()
    }
}

#[cfg(unix)]
impl event::Source for RawFdIo {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        mio::unix::SourceFd(&self.raw_fd()).register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        mio::unix::SourceFd(&self.raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.raw_fd()).deregister(registry)
    }
}

/// Default RAW `write`: sends the entire pending send buffer as one
/// complete IPv4 packet (the application already built the IP header via
/// `IP_HDRINCL`), then clears it.
#[cfg(unix)]
pub fn raw_default_write(sock: &mut crate::socket::Socket) -> crate::error::Result<()> {
    use crate::error::Error;
    use log::warn;

    let raw = match &sock.transport {
        Transport::Raw(r) => r,
        _ => return Err(Error::internal("raw default_write on a non-raw transport")),
    };
    if sock.send.is_empty() {
        return Ok(());
    }
    let packet = sock.send.as_slice().to_vec();
    match raw.send_to(*sock.remote.ip(), &packet) {
        Ok(_) => {
            let len = packet.len();
            sock.send.reduce(len);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("raw: socket {:?} send error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Default RAW `read`: receives one complete IPv4 packet and appends it
/// whole (header included) to the receive buffer.
#[cfg(unix)]
pub fn raw_default_read(sock: &mut crate::socket::Socket) -> crate::error::Result<()> {
    use crate::error::Error;
    use log::warn;

    let raw = match &sock.transport {
        Transport::Raw(r) => r,
        _ => return Err(Error::internal("raw default_read on a non-raw transport")),
    };
    let mut scratch = [0u8; 65536];
    match raw.recv_from(&mut scratch) {
        Ok((n, from)) => {
            sock.remote = std::net::SocketAddrV4::new(from, sock.remote.port());
            if sock.recv.would_overflow(n) {
                return Err(Error::resource_exhausted(sock.id, "receive buffer full"));
            }
            sock.recv.append(&scratch[..n]);
            sock.last_recv = std::time::Instant::now();
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("raw: socket {:?} recv error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}
