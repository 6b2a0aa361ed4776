//! The event loop and periodic scheduler (§4.9): the single place that
//! owns `mio::Poll`, the socket registry, the binding manager and the
//! server registry, and drives them through one cooperative iteration at
//! a time.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::{Events, Interest, Poll, Token};

use crate::binding::{BindOutcome, BindingManager};
use crate::detect;
use crate::error::{Error, Result};
use crate::portcfg::{Address, PortConfig};
use crate::rate::{self, ConnectLimiter};
use crate::registry::SocketRegistry;
use crate::server::ServerRegistry;
use crate::signals::SignalPlane;
use crate::socket::{Socket, SocketData, SocketFlags, SocketId};
use crate::transport::{tcp, udp, IcmpSocket, PipeListener, RawIpSocket, TcpTransport, Transport, UdpTransport};

/// How often (in loop iterations) the socket list is rechained (§4.9 step 5).
const RECHAIN_EVERY: u64 = 16;

pub struct Runtime {
    poll: Poll,
    events: Events,
    registry: SocketRegistry,
    servers: ServerRegistry,
    bindings: BindingManager,
    signals: SignalPlane,
    connect_limiters: HashMap<SocketId, ConnectLimiter>,
    /// (listener, peer address, peer port) -> virtual connection socket,
    /// for demultiplexing a listening ICMP socket's shared raw fd (§4.5,
    /// end-to-end scenario 5).
    icmp_peers: HashMap<(SocketId, Ipv4Addr, u16), SocketId>,
    max_sockets: usize,
    pid: u32,
    iteration: u64,
    last_tick: Instant,
}

#[cfg(unix)]
fn local_ipv4_interfaces() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return out;
        }
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                out.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(ifap);
    }
    if out.is_empty() {
        out.push(Ipv4Addr::LOCALHOST);
    }
    out
}

fn sockaddr_from_common(common: &crate::portcfg::NetCommon) -> SocketAddrV4 {
    let addr = match common.address {
        Address::Any => Ipv4Addr::UNSPECIFIED,
        Address::Specific(a) => a,
    };
    SocketAddrV4::new(addr, common.port)
}

fn desired_interest(sock: &Socket) -> Interest {
    if sock.send.fill() > 0 {
        Interest::READABLE.add(Interest::WRITABLE)
    } else {
        Interest::READABLE
    }
}

impl Runtime {
    pub fn new(max_sockets: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::fatal_io(SocketId(0), e))?;
        let signals = SignalPlane::install().map_err(|e| Error::fatal_io(SocketId(0), e))?;
        Ok(Runtime {
            poll,
            events: Events::with_capacity(1024),
            registry: SocketRegistry::new(),
            servers: ServerRegistry::new(),
            bindings: BindingManager::new(),
            signals,
            connect_limiters: HashMap::new(),
            icmp_peers: HashMap::new(),
            max_sockets,
            pid: std::process::id(),
            iteration: 0,
            last_tick: Instant::now(),
        })
    }

    pub fn servers_mut(&mut self) -> &mut ServerRegistry {
        &mut self.servers
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    /// Binds `server` to `portcfg`, expanding INADDR_ANY over local
    /// interfaces, merging/shadowing existing listeners per §4.7, and
    /// creating whatever new listener sockets the resolution calls for.
    pub fn bind(&mut self, server: &str, portcfg: PortConfig) -> Result<()> {
        let interfaces = local_ipv4_interfaces();
        let outcomes = self.bindings.resolve(server, portcfg, &interfaces);
        for outcome in outcomes {
            match outcome {
                BindOutcome::Duplicate | BindOutcome::Attached { .. } => {}
                BindOutcome::NeedsListener {
                    config,
                    tear_down,
                    pending_bindings,
                } => {
                    for old_id in tear_down {
                        info!("binding: tearing down shadowed listener {:?}", old_id);
                        self.shutdown_socket(old_id);
                        self.bindings.forget_listener(old_id);
                    }
                    let socket_id = self.create_listener(&config)?;
                    self.bindings.complete_listener(socket_id, config, pending_bindings);
                }
            }
        }
        Ok(())
    }

    fn create_listener(&mut self, config: &PortConfig) -> Result<SocketId> {
        let transport = match config {
            PortConfig::Tcp(tcp_cfg) => {
                let addr = sockaddr_from_common(&tcp_cfg.common);
                let listener =
                    tcp::bind_listener(addr, tcp_cfg.backlog).map_err(|e| Error::fatal_io(SocketId(0), e))?;
                Transport::Tcp(TcpTransport::Listener(listener))
            }
            PortConfig::Udp(udp_cfg) => {
                let addr = sockaddr_from_common(&udp_cfg.common);
                let socket = mio::net::UdpSocket::bind(SocketAddr::V4(addr)).map_err(|e| Error::fatal_io(SocketId(0), e))?;
                Transport::Udp(UdpTransport { socket })
            }
            PortConfig::Icmp(icmp_cfg) => {
                let sock = IcmpSocket::new(icmp_cfg.common.port).map_err(|e| Error::fatal_io(SocketId(0), e))?;
                Transport::Icmp(sock)
            }
            #[cfg(unix)]
            PortConfig::Raw(_raw_cfg) => {
                let sock = RawIpSocket::new(libc::IPPROTO_RAW).map_err(|e| Error::fatal_io(SocketId(0), e))?;
                Transport::Raw(sock)
            }
            #[cfg(not(unix))]
            PortConfig::Raw(_) => return Err(Error::internal("raw sockets require unix")),
            PortConfig::Pipe(pipe_cfg) => {
                let listener =
                    PipeListener::bind(pipe_cfg.recv.path.clone(), pipe_cfg.send.path.clone(), pipe_cfg.recv.mode)
                        .map_err(|e| Error::fatal_io(SocketId(0), e))?;
                Transport::PipeListener(listener)
            }
        };

        // Every ICMP socket this runtime creates is server-side: there is
        // no separate "connect" API, so it always accepts virtual
        // connections from arbitrary peers (§4.5, end-to-end scenario 5).
        let is_listener = matches!(
            transport,
            Transport::Tcp(TcpTransport::Listener(_)) | Transport::PipeListener(_) | Transport::Icmp(_)
        );

        let mut socket = Socket::new(transport, Instant::now());
        if is_listener {
            socket.flags.insert(SocketFlags::LISTENING);
            // Listeners don't buffer payload.
            socket.resize_buffers(0, 0);
        }
        if let Some(common) = config.common() {
            socket.flood_limit = common.flood_limit;
            socket.local = sockaddr_from_common(common);
        }
        socket.cfg = Some(config.clone());

        let socket_id = self.registry.enqueue(socket)?;
        if let Some(sock) = self.registry.get_mut(socket_id) {
            self.poll
                .registry()
                .register(&mut sock.transport, Token(socket_id.index()), Interest::READABLE)
                .map_err(|e| Error::fatal_io(socket_id, e))?;
        }
        if is_listener {
            self.connect_limiters.insert(socket_id, ConnectLimiter::new());
        }
        Ok(socket_id)
    }

    fn update_interest(&mut self, id: SocketId) -> Result<()> {
        let Some(sock) = self.registry.get_mut(id) else { return Ok(()) };
        if sock.is_listening() {
            return Ok(());
        }
        let interest = desired_interest(sock);
        self.poll
            .registry()
            .reregister(&mut sock.transport, Token(id.index()), interest)
            .map_err(|e| Error::fatal_io(id, e))
    }

    fn shutdown_socket(&mut self, id: SocketId) {
        if let Some(sock) = self.registry.get_mut(id) {
            let _ = self.poll.registry().deregister(&mut sock.transport);
        }
        self.connect_limiters.remove(&id);
        self.icmp_peers.retain(|_, peer_id| *peer_id != id);
        if let Err(e) = self.registry.shutdown(id) {
            warn!("runtime: error shutting down socket {:?}: {}", id, e);
        }
    }

    fn now_secs() -> u64 {
        // A monotonic-ish wall clock tag for the connect-rate windows;
        // derived from process uptime rather than `SystemTime` so the
        // whole loop has exactly one clock source (`Instant`).
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(Instant::now);
        Instant::now().saturating_duration_since(start).as_secs()
    }

    fn accept_tcp(&mut self, listener_id: SocketId) -> Result<()> {
        loop {
            let accept_result = {
                let Some(listener_sock) = self.registry.get_mut(listener_id) else { return Ok(()) };
                match &mut listener_sock.transport {
                    Transport::Tcp(TcpTransport::Listener(l)) => l.accept(),
                    _ => return Err(Error::internal("accept_tcp on a non-listener")),
                }
            };
            let (stream, peer) = match accept_result {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("tcp: accept error on listener {:?}: {}", listener_id, e);
                    return Err(Error::fatal_io(listener_id, e));
                }
            };
            let peer_v4 = match peer {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };

            if self.registry.len() >= self.max_sockets {
                info!("tcp: max sockets reached, rejecting connection from {}", peer_v4);
                drop(stream);
                continue;
            }

            let now_secs = Self::now_secs();
            let connect_freq = self
                .registry
                .get(listener_id)
                .and_then(|s| s.cfg.as_ref())
                .and_then(|c| c.common())
                .map(|c| c.connect_freq)
                .unwrap_or(0);
            if connect_freq > 0 {
                let limiter = self.connect_limiters.entry(listener_id).or_default();
                if !limiter.check(*peer_v4.ip(), now_secs, connect_freq) {
                    drop(stream);
                    continue;
                }
            }

            let local_addr = stream.local_addr().map(tcp_sockaddr_v4).unwrap_or_else(|_| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            let bindings = self.bindings.accept_filter(listener_id, *local_addr.ip(), local_addr.port());

            let mut conn = Socket::new(Transport::Tcp(TcpTransport::Stream(stream)), Instant::now());
            conn.remote = peer_v4;
            conn.local = local_addr;
            conn.flags.insert(SocketFlags::CONNECTED);
            conn.data = SocketData::Candidates(bindings);
            conn.callbacks.read = Some(tcp_read_cb);
            conn.callbacks.write = Some(tcp_write_cb);

            let conn_id = self.registry.enqueue(conn)?;
            if let Some(sock) = self.registry.get_mut(conn_id) {
                self.poll
                    .registry()
                    .register(&mut sock.transport, Token(conn_id.index()), Interest::READABLE)
                    .map_err(|e| Error::fatal_io(conn_id, e))?;
            }
            debug!("tcp: accepted {:?} from {}", conn_id, peer_v4);
        }
    }

    fn accept_pipe(&mut self, listener_id: SocketId) -> Result<()> {
        let accepted = {
            let Some(listener_sock) = self.registry.get_mut(listener_id) else { return Ok(()) };
            match &mut listener_sock.transport {
                Transport::PipeListener(l) => l.try_accept(),
                _ => return Err(Error::internal("accept_pipe on a non-listener")),
            }
        };
        let pair = match accepted {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                warn!("pipe: accept error on listener {:?}: {}", listener_id, e);
                return Ok(());
            }
        };

        if self.registry.len() >= self.max_sockets {
            info!("pipe: max sockets reached, rejecting new connection");
            return Ok(());
        }

        let bindings = self.bindings.accept_filter(listener_id, Ipv4Addr::UNSPECIFIED, 0);
        let mut conn = Socket::new(Transport::Pipe(pair), Instant::now());
        conn.flags.insert(SocketFlags::CONNECTED | SocketFlags::RECV_PIPE | SocketFlags::SEND_PIPE);
        conn.data = SocketData::Candidates(bindings);
        conn.callbacks.read = Some(pipe_read_cb);
        conn.callbacks.write = Some(pipe_write_cb);

        let conn_id = self.registry.enqueue(conn)?;
        if let Some(sock) = self.registry.get_mut(conn_id) {
            self.poll
                .registry()
                .register(&mut sock.transport, Token(conn_id.index()), Interest::READABLE)
                .map_err(|e| Error::fatal_io(conn_id, e))?;
        }
        Ok(())
    }

    fn dispatch_read(&mut self, id: SocketId) {
        let is_listening = self.registry.get(id).map(|s| s.is_listening()).unwrap_or(false);
        if is_listening {
            let kind = self.registry.get(id).map(|s| transport_kind(&s.transport)).unwrap_or(TransportKind::Other);
            let result = match kind {
                TransportKind::Icmp => self.icmp_route(id),
                _ => {
                    let is_pipe = matches!(self.registry.get(id).map(|s| &s.transport), Some(Transport::PipeListener(_)));
                    if is_pipe { self.accept_pipe(id) } else { self.accept_tcp(id) }
                }
            };
            if let Err(e) = result {
                warn!("runtime: accept failed on {:?}: {}", id, e);
                self.shutdown_socket(id);
            }
            return;
        }

        let pid = self.pid;
        let kind = match self.registry.get(id) {
            Some(sock) => transport_kind(&sock.transport),
            None => return,
        };
        let result = match kind {
            TransportKind::Udp => {
                let Some(sock) = self.registry.get_mut(id) else { return };
                udp::default_read(sock)
            }
            TransportKind::Icmp => {
                let Some(sock) = self.registry.get_mut(id) else { return };
                crate::transport::icmp::default_read(sock, pid)
            }
            #[cfg(unix)]
            TransportKind::Raw => {
                let Some(sock) = self.registry.get_mut(id) else { return };
                crate::transport::raw_default_read(sock)
            }
            // Never registered with `mio::Poll`, so never read-driven
            // directly; their data arrives via `icmp_route` on the parent.
            TransportKind::IcmpPeer(_) => return,
            TransportKind::Other => {
                let Some(sock) = self.registry.get_mut(id) else { return };
                match sock.callbacks.read {
                    Some(cb) => cb(sock),
                    None => Ok(()),
                }
            }
        };
        if let Err(e) = result {
            if e.schedules_shutdown() {
                if let Some(sock) = self.registry.get_mut(id) {
                    sock.schedule_shutdown();
                }
            }
            return;
        }
        self.after_read(id);
    }

    /// The configured `(detection_wait_secs, detection_fill)` for a
    /// still-detecting socket, read off the first candidate binding it
    /// could still match; falls back to the defaults for anything else
    /// (not mid-detection, or no candidates left).
    fn detection_params(&self, id: SocketId) -> (u64, usize) {
        self.registry
            .get(id)
            .map(|s| match &s.data {
                SocketData::Candidates(ids) => ids
                    .first()
                    .and_then(|bid| self.bindings.binding(*bid))
                    .and_then(|b| b.config.common())
                    .map(|c| (c.detection_wait_secs, c.detection_fill))
                    .unwrap_or((crate::socket::DEFAULT_DETECTION_WAIT_SECS, crate::socket::DEFAULT_DETECTION_FILL)),
                _ => (crate::socket::DEFAULT_DETECTION_WAIT_SECS, crate::socket::DEFAULT_DETECTION_FILL),
            })
            .unwrap_or((crate::socket::DEFAULT_DETECTION_WAIT_SECS, crate::socket::DEFAULT_DETECTION_FILL))
    }

    /// The detect-or-check_request-then-update-interest tail shared by the
    /// normal read path and `icmp_dispatch_data`'s per-peer appends.
    fn after_read(&mut self, id: SocketId) {
        if self.registry.get(id).map(|s| s.is_killed()).unwrap_or(true) {
            return;
        }

        let needs_detect = self.registry.get(id).map(|s| s.cfg.is_none()).unwrap_or(false);
        let detect_result = if needs_detect {
            let (wait, fill) = self.detection_params(id);
            let Some(sock) = self.registry.get_mut(id) else { return };
            detect::on_readable(sock, &self.bindings, &self.servers, wait, fill)
        } else {
            let Some(sock) = self.registry.get_mut(id) else { return };
            match sock.callbacks.check_request {
                Some(check) => check(sock),
                None => Ok(()),
            }
        };
        if let Err(e) = detect_result {
            if e.schedules_shutdown() {
                if let Some(sock) = self.registry.get_mut(id) {
                    sock.schedule_shutdown();
                }
            }
        }
        let _ = self.update_interest(id);
    }

    fn dispatch_write(&mut self, id: SocketId) {
        let pid = self.pid;
        let kind = match self.registry.get(id) {
            Some(sock) if !sock.is_listening() => transport_kind(&sock.transport),
            _ => return,
        };
        let result = match kind {
            TransportKind::IcmpPeer(parent) => self.icmp_peer_write(id, parent, pid),
            _ => {
                let Some(sock) = self.registry.get_mut(id) else { return };
                match kind {
                    TransportKind::Udp => udp::default_write(sock),
                    TransportKind::Icmp => crate::transport::icmp::default_write(sock, pid),
                    #[cfg(unix)]
                    TransportKind::Raw => crate::transport::raw_default_write(sock),
                    TransportKind::IcmpPeer(_) => unreachable!(),
                    TransportKind::Other => match sock.callbacks.write {
                        Some(cb) => cb(sock),
                        None => Ok(()),
                    },
                }
            }
        };
        if let Err(e) = result {
            if e.schedules_shutdown() {
                if let Some(sock) = self.registry.get_mut(id) {
                    sock.schedule_shutdown();
                }
            }
        }
        let _ = self.update_interest(id);
    }

    /// Receives and demultiplexes traffic on a listening ICMP socket's
    /// shared raw fd: an unrecognized peer sending `connect` gets a fresh
    /// virtual-connection socket (never registered with `mio::Poll`,
    /// since it has no fd of its own); a recognized peer's `data` is
    /// routed into that connection's own buffer; `close` shuts down just
    /// that connection (§4.5, end-to-end scenario 5).
    fn icmp_route(&mut self, listener_id: SocketId) -> Result<()> {
        let pid = self.pid;
        loop {
            let mut scratch = [0u8; 65536];
            let recv_result = {
                let Some(sock) = self.registry.get(listener_id) else { return Ok(()) };
                let icmp = match &sock.transport {
                    Transport::Icmp(t) => t,
                    _ => return Err(Error::internal("icmp_route on a non-icmp transport")),
                };
                icmp.recv_from(&mut scratch)
            };
            let (n, from) = match recv_result {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("icmp: listener {:?} recv error: {}", listener_id, e);
                    return Err(Error::fatal_io(listener_id, e));
                }
            };

            let local_ident_value = crate::transport::icmp::local_ident(pid, listener_id);
            match crate::transport::icmp::validate_and_strip(&scratch[..n], local_ident_value, None) {
                crate::transport::icmp::Validated::Data { header, payload } => {
                    let payload = payload.to_vec();
                    self.icmp_dispatch_data(listener_id, from, header, &payload);
                }
                crate::transport::icmp::Validated::Closed { header } => {
                    let key = (listener_id, from, header.port);
                    if let Some(peer_id) = self.icmp_peers.remove(&key) {
                        debug!("icmp: peer {} closed virtual connection {:?}", from, peer_id);
                        if let Some(sock) = self.registry.get_mut(peer_id) {
                            sock.schedule_shutdown();
                        }
                    }
                }
                crate::transport::icmp::Validated::Rejected => {}
            }
        }
    }

    /// Routes one validated ICMP payload to its virtual connection,
    /// allocating a new one on an unrecognized peer's `connect`.
    fn icmp_dispatch_data(
        &mut self,
        listener_id: SocketId,
        from: Ipv4Addr,
        header: crate::transport::icmp::IcmpHeader,
        payload: &[u8],
    ) {
        let key = (listener_id, from, header.port);
        let peer_id = match self.icmp_peers.get(&key).copied() {
            Some(id) if self.registry.get(id).is_some() => id,
            _ => {
                if header.code != crate::transport::icmp::ICMP_SERVEEZ_CONNECT {
                    debug!("icmp: listener {:?} dropping data from unknown peer {}", listener_id, from);
                    return;
                }
                if self.registry.len() >= self.max_sockets {
                    info!("icmp: max sockets reached, rejecting connection from {}", from);
                    return;
                }
                let bindings = self.bindings.accept_filter(listener_id, from, header.port);
                let Some(binding) = bindings.first().and_then(|bid| self.bindings.binding(*bid)) else {
                    debug!("icmp: listener {:?} has no binding for connect from {}", listener_id, from);
                    return;
                };
                let config = binding.config.clone();
                let server_name = binding.server.clone();
                info!("icmp: listener {:?} accepting connection from {}", listener_id, from);

                let mut conn = Socket::new(Transport::IcmpPeer { parent: listener_id }, Instant::now());
                conn.remote = SocketAddrV4::new(from, header.port);
                conn.flags.insert(SocketFlags::CONNECTED);
                conn.parent = Some(listener_id);
                conn.cfg = Some(config.clone());
                let Ok(conn_id) = self.registry.enqueue(conn) else { return };
                self.icmp_peers.insert(key, conn_id);

                let connect_fn = self.servers.get(&server_name).map(|ty| ty.connect_socket);
                if let Some(connect) = connect_fn {
                    if let Some(sock) = self.registry.get_mut(conn_id) {
                        if let Err(e) = connect(&config, sock) {
                            warn!("icmp: connect_socket failed for {:?}: {}", conn_id, e);
                            sock.schedule_shutdown();
                        }
                    }
                }
                conn_id
            }
        };

        let Some(sock) = self.registry.get_mut(peer_id) else { return };
        if sock.is_killed() {
            return;
        }
        if sock.recv.would_overflow(payload.len()) {
            sock.schedule_shutdown();
            return;
        }
        sock.recv.append(payload);
        sock.last_recv = Instant::now();
        sock.sequence = header.sequence;
        self.after_read(peer_id);
    }

    /// Writes one queued record from a virtual ICMP connection's send
    /// buffer out through its listener's shared raw socket.
    fn icmp_peer_write(&mut self, id: SocketId, parent: SocketId, pid: u32) -> Result<()> {
        let popped = self
            .registry
            .get(id)
            .and_then(|s| udp::decode_record(s.send.as_slice()).map(|(peer, data, consumed)| (peer, data.to_vec(), consumed)));
        let Some((peer, payload, consumed)) = popped else { return Ok(()) };

        let send_seq = self.registry.get(id).map(|s| s.send_seq).unwrap_or(0);
        let ident = crate::transport::icmp::local_ident(pid, id);
        let packet = crate::transport::icmp::build_packet(
            ident,
            send_seq,
            peer.port(),
            crate::transport::icmp::ICMP_SERVEEZ_DATA,
            &payload,
        );

        let Some(parent_sock) = self.registry.get(parent) else {
            return Err(Error::internal("icmp peer write: parent listener gone"));
        };
        let icmp = match &parent_sock.transport {
            Transport::Icmp(t) => t,
            _ => return Err(Error::internal("icmp peer write: parent is not an icmp transport")),
        };

        match icmp.send_to(*peer.ip(), &packet) {
            Ok(_) => {
                if let Some(sock) = self.registry.get_mut(id) {
                    sock.send.reduce(consumed);
                    sock.send_seq = sock.send_seq.wrapping_add(1);
                    sock.last_send = Instant::now();
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                warn!("icmp: peer {:?} send error: {}", id, e);
                if let Some(sock) = self.registry.get_mut(id) {
                    sock.schedule_shutdown();
                }
                Err(Error::fatal_io(id, e))
            }
        }
    }

    /// Runs one loop iteration: signal observation, readiness wait,
    /// dispatch, rechain, drain, and (once a second) the periodic tick.
    /// Returns `false` once `nuke` has been observed and the caller
    /// should stop looping.
    pub fn run_one(&mut self, timeout: Duration) -> Result<bool> {
        self.observe_signals();
        if self.signals.is_nuked() {
            return Ok(false);
        }

        self.poll
            .poll(&mut self.events, Some(timeout))
            .map_err(|e| Error::fatal_io(SocketId(0), e))?;

        let ready: Vec<(SocketId, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (SocketId(ev.token().0 as u16), ev.is_readable(), ev.is_writable()))
            .collect();

        for (id, readable, writable) in ready {
            if self.registry.get(id).is_none() {
                continue;
            }
            if readable {
                self.dispatch_read(id);
            }
            if writable && self.registry.get(id).map(|s| !s.is_killed()).unwrap_or(false) {
                self.dispatch_write(id);
            }
        }

        self.drive_pipes();

        self.iteration += 1;
        if self.iteration % RECHAIN_EVERY == 0 {
            self.registry.rechain();
        }

        for killed_id in self.registry.killed_ids() {
            self.shutdown_socket(killed_id);
        }

        if self.last_tick.elapsed() >= Duration::from_secs(1) {
            self.run_periodic_tick();
            self.last_tick = Instant::now();
        }

        Ok(true)
    }

    /// Drives transports that never report through `mio::Poll`: pipes
    /// (`PipeListener`/`PipePair` register as a no-op on the send side,
    /// see `transport/pipe.rs`) and ICMP virtual connections (no fd of
    /// their own, see `Transport::IcmpPeer`). Every iteration polls them
    /// directly instead of waiting on readiness.
    fn drive_pipes(&mut self) {
        let ids = self.registry.ids_in_order();
        for id in ids {
            let kind = match self.registry.get(id) {
                Some(sock) => match &sock.transport {
                    Transport::PipeListener(_) => 1,
                    Transport::Pipe(_) if sock.send.fill() > 0 => 2,
                    Transport::IcmpPeer { .. } if sock.send.fill() > 0 => 2,
                    _ => 0,
                },
                None => 0,
            };
            match kind {
                1 => {
                    if let Err(e) = self.accept_pipe(id) {
                        warn!("pipe: accept failed on {:?}: {}", id, e);
                    }
                }
                2 => self.dispatch_write(id),
                _ => {}
            }
        }
    }

    fn observe_signals(&mut self) {
        if self.signals.take_reset() {
            info!("signals: SIGHUP observed, running reset");
            self.servers.reset_all();
        }
        if self.signals.take_pipe_broke() {
            warn!("signals: SIGPIPE observed");
        }
        if self.signals.take_child_died() {
            for (pid, status) in self.signals.reap_children() {
                debug!("signals: reaped child pid {} status {}", pid, status);
            }
        }
    }

    fn run_periodic_tick(&mut self) {
        let ids = self.registry.ids_in_order();
        let now = Instant::now();
        for id in ids {
            let (wait, _fill) = self.detection_params(id);
            let Some(sock) = self.registry.get_mut(id) else { continue };
            rate::decay_flood_points(sock);
            detect::check_idle_timeout(sock, now, wait);
            if sock.idle_counter > 0 {
                sock.idle_counter -= 1;
                if sock.idle_counter == 0 {
                    if let Some(idle) = sock.callbacks.idle {
                        let _ = idle(sock);
                    }
                }
            }
        }
        for (_, limiter) in self.connect_limiters.iter_mut() {
            limiter.sweep(Self::now_secs());
        }
        self.servers.notify_all();
        for killed_id in self.registry.killed_ids() {
            self.shutdown_socket(killed_id);
        }
    }

    /// Runs until `nuke` is observed, then shuts every socket down and
    /// restores default signal dispositions.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if !self.run_one(Duration::from_secs(1))? {
                break;
            }
        }
        info!("runtime: nuke observed, shutting down");
        self.registry.shutdown_all();
        self.signals.restore_defaults();
        Ok(())
    }
}

fn tcp_sockaddr_v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    }
}

fn tcp_read_cb(sock: &mut Socket) -> Result<()> {
    tcp::default_read(sock)
}

fn tcp_write_cb(sock: &mut Socket) -> Result<()> {
    tcp::default_write(sock)
}

fn pipe_read_cb(sock: &mut Socket) -> Result<()> {
    let room = sock.recv.remaining();
    if room == 0 {
        return Err(Error::resource_exhausted(sock.id, "receive buffer full"));
    }
    let mut scratch = vec![0u8; room];
    let pair = match &mut sock.transport {
        Transport::Pipe(p) => p,
        _ => return Err(Error::internal("pipe_read_cb on a non-pipe transport")),
    };
    match pair.read(&mut scratch) {
        Ok(0) => {
            sock.schedule_shutdown();
            Ok(())
        }
        Ok(n) => {
            sock.recv.append(&scratch[..n]);
            sock.last_recv = Instant::now();
            rate::flood_protect(sock, n);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

fn pipe_write_cb(sock: &mut Socket) -> Result<()> {
    let n = sock.send.fill().min(tcp::MAX_WRITE);
    if n == 0 {
        return Ok(());
    }
    let chunk = sock.send.as_slice()[..n].to_vec();
    let pair = match &mut sock.transport {
        Transport::Pipe(p) => p,
        _ => return Err(Error::internal("pipe_write_cb on a non-pipe transport")),
    };
    match pair.write(&chunk) {
        Ok(written) => {
            sock.send.reduce(written);
            sock.last_send = Instant::now();
            if sock.flags.contains(SocketFlags::FINAL_WRITE) && sock.send.is_empty() {
                sock.schedule_shutdown();
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => {
            sock.schedule_shutdown();
            Err(Error::fatal_io(sock.id, e))
        }
    }
}

/// Which of the transport-specific default read/write paths applies.
/// `Udp`/`Icmp`/`Raw` take extra arguments (the process pid) the generic
/// `Callbacks` vtable signatures don't carry, so the runtime dispatches
/// them directly by kind instead of through `sock.callbacks`, same as the
/// accept path above. Everything else (Tcp, Pipe) goes through the vtable.
/// `IcmpPeer` carries its parent listener's id, since it has to write
/// through that listener's raw socket rather than one of its own.
#[derive(Clone, Copy)]
enum TransportKind {
    Udp,
    Icmp,
    IcmpPeer(SocketId),
    #[cfg(unix)]
    Raw,
    Other,
}

fn transport_kind(t: &Transport) -> TransportKind {
    match t {
        Transport::Udp(_) => TransportKind::Udp,
        Transport::Icmp(_) => TransportKind::Icmp,
        Transport::IcmpPeer { parent } => TransportKind::IcmpPeer(*parent),
        #[cfg(unix)]
        Transport::Raw(_) => TransportKind::Raw,
        _ => TransportKind::Other,
    }
}
