//! TCP transport: non-blocking read/write, partial send, final-write
//! shutdown, accept -- §4.4.

use std::io::{self, Read, Write};
use std::net::SocketAddrV4;

use log::{debug, warn};
use mio::{event, Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::rate;
use crate::socket::{Socket, SocketFlags};

/// `SOCK_MAX_WRITE`: never write more than this many bytes in one call.
pub const MAX_WRITE: usize = 1024;

pub enum TcpTransport {
    Listener(mio::net::TcpListener),
    Stream(mio::net::TcpStream),
}

impl event::Source for TcpTransport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            TcpTransport::Listener(l) => l.register(registry, token, interests),
            TcpTransport::Stream(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            TcpTransport::Listener(l) => l.reregister(registry, token, interests),
            TcpTransport::Stream(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            TcpTransport::Listener(l) => l.deregister(registry),
            TcpTransport::Stream(s) => s.deregister(registry),
        }
    }
}

fn sockaddr_v4(addr: std::net::SocketAddr) -> SocketAddrV4 {
    match addr {
        std::net::SocketAddr::V4(v4) => v4,
        std::net::SocketAddr::V6(_) => SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
    }
}

/// Creates a listening, non-blocking TCP socket with `SO_REUSEADDR` set and
/// `listen(backlog)` called.
pub fn bind_listener(addr: SocketAddrV4, backlog: u32) -> io::Result<mio::net::TcpListener> {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let sockaddr: std::net::SocketAddr = addr.into();
    socket.bind(&sockaddr.into())?;
    socket.listen(backlog as i32)?;
    Ok(mio::net::TcpListener::from_std(socket.into()))
}

/// Default TCP `read`: drains up to `recv_size - fill` bytes; on EOF,
/// schedules shutdown; on `WouldBlock`, no-op. Updates `last_recv` and
/// runs flood protection. Does not itself invoke `check_request` -- the
/// event loop dispatches that separately once the read returns `Ok`.
pub fn default_read(sock: &mut Socket) -> Result<()> {
    let stream = match &mut sock.transport {
        crate::transport::Transport::Tcp(TcpTransport::Stream(s)) => s,
        _ => return Err(Error::internal("default_read on a non-stream transport")),
    };

    let room = sock.recv.remaining();
    if room == 0 {
        return Err(Error::resource_exhausted(sock.id, "receive buffer full"));
    }
    let mut scratch = vec![0u8; room];
    match stream.read(&mut scratch) {
        Ok(0) => {
            debug!("tcp: socket {:?} reached eof", sock.id);
            sock.schedule_shutdown();
            Ok(())
        }
        Ok(n) => {
            sock.recv.append(&scratch[..n]);
            sock.last_recv = std::time::Instant::now();
            rate::flood_protect(sock, n);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            warn!("tcp: socket {:?} read error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Default TCP `write`: sends at most [`MAX_WRITE`] bytes per call; on
/// partial send, compacts the buffer; on `WouldBlock`, backs off for 1s;
/// on success with `final_write` set and the buffer empty, schedules
/// shutdown.
pub fn default_write(sock: &mut Socket) -> Result<()> {
    if sock.flags.contains(SocketFlags::CONNECTING) {
        return advance_connect(sock);
    }

    let stream = match &mut sock.transport {
        crate::transport::Transport::Tcp(TcpTransport::Stream(s)) => s,
        _ => return Err(Error::internal("default_write on a non-stream transport")),
    };

    let n = sock.send.fill().min(MAX_WRITE);
    if n == 0 {
        return Ok(());
    }
    let chunk = sock.send.as_slice()[..n].to_vec();
    match stream.write(&chunk) {
        Ok(written) => {
            sock.send.reduce(written);
            sock.last_send = std::time::Instant::now();
            if sock.flags.contains(SocketFlags::FINAL_WRITE) && sock.send.is_empty() {
                sock.schedule_shutdown();
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            sock.unavailable_until = Some(std::time::Instant::now() + std::time::Duration::from_secs(1));
            Ok(())
        }
        Err(e) => {
            warn!("tcp: socket {:?} write error: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Checks `SO_ERROR` on a CONNECTING socket; on success flips to CONNECTED,
/// interns local/remote endpoint info, and invokes `connected`.
fn advance_connect(sock: &mut Socket) -> Result<()> {
    let stream = match &sock.transport {
        crate::transport::Transport::Tcp(TcpTransport::Stream(s)) => s,
        _ => return Err(Error::internal("advance_connect on a non-stream transport")),
    };

    match stream.take_error() {
        Ok(None) => {
            sock.flags.remove(SocketFlags::CONNECTING);
            sock.flags.insert(SocketFlags::CONNECTED);
            intern_connection_info(sock);
            if let Some(connected) = sock.callbacks.connected {
                return connected(sock);
            }
            Ok(())
        }
        Ok(Some(e)) => {
            warn!("tcp: socket {:?} failed to connect: {}", sock.id, e);
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
        Err(e) => {
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// `sock_intern_connection_info`: once CONNECTED, remember local/remote
/// address and port on the socket object (supplemented from the original
/// `socket.c`, dropped by the distillation).
pub fn intern_connection_info(sock: &mut Socket) {
    let stream = match &sock.transport {
        crate::transport::Transport::Tcp(TcpTransport::Stream(s)) => s,
        _ => return,
    };
    if let Ok(addr) = stream.peer_addr() {
        sock.remote = sockaddr_v4(addr);
    }
    if let Ok(addr) = stream.local_addr() {
        sock.local = sockaddr_v4(addr);
    }
}

/// `sock_error_info`: fetch-and-clear the pending socket error, logging it.
pub fn error_info(sock: &Socket) -> Option<io::Error> {
    match &sock.transport {
        crate::transport::Transport::Tcp(TcpTransport::Stream(s)) => s.take_error().ok().flatten(),
        crate::transport::Transport::Tcp(TcpTransport::Listener(l)) => l.take_error().ok().flatten(),
        _ => None,
    }
}
