//! The per-connection/per-listener socket object and its callback vtable,
//! per §3 and §4.1/§4.3.

use std::net::SocketAddrV4;
use std::time::Instant;

use bitflags::bitflags;

use crate::buffer::{ByteBuffer, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::portcfg::PortConfig;
use crate::transport::Transport;

/// `SOCKET_MAX_IDS` in the original: the id space is 13 bits, 0..=8191.
pub const MAX_SOCKET_IDS: usize = 8192;

pub const DEFAULT_FLOOD_LIMIT: i32 = 100;
pub const DEFAULT_DETECTION_WAIT_SECS: u64 = 30;
pub const DEFAULT_DETECTION_FILL: usize = 16;

/// A socket's unique id among currently-live sockets (13 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u16);

impl SocketId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Disambiguates a reused id across its lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub u16);

impl Generation {
    pub fn next(self) -> Generation {
        Generation(self.0.wrapping_add(1))
    }
}

bitflags! {
    /// Kind/state flags for a socket, mirroring `SOCK_FLAG_*` in the original.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u32 {
        const CONNECTED   = 0x0000_0004;
        const LISTENING   = 0x0000_0008;
        const KILLED      = 0x0000_0010;
        const NO_FLOOD    = 0x0000_0020;
        const INITIALIZED = 0x0000_0040;
        const ENQUEUED    = 0x0000_0080;
        const RECV_PIPE   = 0x0000_0100;
        const SEND_PIPE   = 0x0000_0200;
        const RAW_SOCKET  = 0x0000_0800;
        const CONNECTING  = 0x0000_2000;
        const PRIORITY    = 0x0000_4000;
        const FIXED_PEER  = 0x0000_8000;
        const FINAL_WRITE = 0x0001_0000;
    }
}

/// Why a socket was forcibly kicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickReason {
    Overflow,
    Flood,
}

type ReadCb = fn(&mut Socket) -> Result<()>;
type WriteCb = fn(&mut Socket) -> Result<()>;
type CheckRequestCb = fn(&mut Socket) -> Result<()>;
type HandleRequestCb = fn(&mut Socket, &[u8]) -> Result<()>;
type ConnectedCb = fn(&mut Socket) -> Result<()>;
type DisconnectedCb = fn(&mut Socket);
type KickedCb = fn(&mut Socket, KickReason);
type IdleCb = fn(&mut Socket) -> Result<()>;

/// The per-socket callback vtable (§4.3). Every slot is a plain function
/// value, dispatched by direct call -- no dynamic reflection, matching the
/// Design Note's "record of function values".
#[derive(Clone, Copy)]
pub struct Callbacks {
    pub read: Option<ReadCb>,
    pub write: Option<WriteCb>,
    pub check_request: Option<CheckRequestCb>,
    pub handle_request: Option<HandleRequestCb>,
    pub connected: Option<ConnectedCb>,
    pub disconnected: Option<DisconnectedCb>,
    pub kicked: Option<KickedCb>,
    pub idle: Option<IdleCb>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            read: None,
            write: None,
            check_request: None,
            handle_request: None,
            connected: None,
            disconnected: None,
            kicked: None,
            idle: None,
        }
    }
}

/// Eligible server instances (by name) attached to an accepted socket
/// during detection, or the ordered bindings owned by a listener. Cleared
/// once detection succeeds.
#[derive(Debug, Clone, Default)]
pub enum SocketData {
    #[default]
    None,
    /// A listener's owned, ordered bindings (server name, port config index
    /// into the binding manager's table).
    ListenerBindings(Vec<crate::binding::BindingId>),
    /// The filtered subset of bindings an accepted socket may still detect
    /// against.
    Candidates(Vec<crate::binding::BindingId>),
}

/// One connection, listener, or pipe endpoint.
pub struct Socket {
    pub id: SocketId,
    pub version: Generation,
    pub flags: SocketFlags,

    pub transport: Transport,

    pub remote: SocketAddrV4,
    pub local: SocketAddrV4,

    pub recv: ByteBuffer,
    pub send: ByteBuffer,

    /// Fixed byte sequence used by the default packetizer, if any.
    pub boundary: Option<Vec<u8>>,

    pub callbacks: Callbacks,

    pub idle_counter: u32,
    pub last_recv: Instant,
    pub last_send: Instant,

    pub flood_points: i32,
    pub flood_limit: i32,

    /// Defer writes until this instant (back-pressure after WOULDBLOCK).
    pub unavailable_until: Option<Instant>,

    pub send_seq: u16,
    pub recv_seq: u16,
    pub sequence: u16,

    pub referrer: Option<SocketId>,
    pub parent: Option<SocketId>,

    pub data: SocketData,
    pub cfg: Option<PortConfig>,
}

impl Socket {
    /// `sock_alloc`: a fresh socket with default 8 KiB buffers and no
    /// transport yet bound. `id`/`version` are filled in by the registry
    /// at enqueue time.
    pub fn new(transport: Transport, now: Instant) -> Self {
        Socket {
            id: SocketId(0),
            version: Generation(0),
            flags: SocketFlags::empty(),
            transport,
            remote: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            local: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            recv: ByteBuffer::with_size(DEFAULT_BUFFER_SIZE),
            send: ByteBuffer::with_size(DEFAULT_BUFFER_SIZE),
            boundary: None,
            callbacks: Callbacks::default(),
            idle_counter: 0,
            last_recv: now,
            last_send: now,
            flood_points: 0,
            flood_limit: DEFAULT_FLOOD_LIMIT,
            unavailable_until: None,
            send_seq: 0,
            recv_seq: 0,
            sequence: 0,
            referrer: None,
            parent: None,
            data: SocketData::None,
            cfg: None,
        }
    }

    pub fn is_enqueued(&self) -> bool {
        self.flags.contains(SocketFlags::ENQUEUED)
    }

    pub fn is_killed(&self) -> bool {
        self.flags.contains(SocketFlags::KILLED)
    }

    /// Sets the `killed` flag; idempotent. Actual shutdown happens at
    /// end-of-tick, never mid-callback.
    pub fn schedule_shutdown(&mut self) {
        self.flags.insert(SocketFlags::KILLED);
    }

    /// Appends `bytes` to the output buffer, invoking `kicked` on overflow.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.send.would_overflow(bytes.len()) {
            if let Some(kicked) = self.callbacks.kicked {
                kicked(self, KickReason::Overflow);
            }
            return Err(Error::resource_exhausted(self.id, "send buffer overflow"));
        }
        self.send.append(bytes);
        Ok(())
    }

    /// Bounded formatted write into a scratch buffer, truncated to
    /// `PRINTF_SCRATCH_SIZE` if longer, then queued via `write`.
    pub fn printf(&mut self, formatted: &str) -> Result<()> {
        let bytes = formatted.as_bytes();
        let n = bytes.len().min(crate::buffer::PRINTF_SCRATCH_SIZE);
        self.write(&bytes[..n])
    }

    /// Reallocates either buffer, preserving unconsumed bytes up to the
    /// new size and discarding any excess at the tail.
    pub fn resize_buffers(&mut self, send_size: usize, recv_size: usize) {
        self.send.resize(send_size);
        self.recv.resize(recv_size);
    }

    /// The only supported receive-buffer consumption primitive.
    pub fn reduce_recv(&mut self, n: usize) {
        self.recv.reduce(n);
    }

    pub fn is_listening(&self) -> bool {
        self.flags.contains(SocketFlags::LISTENING)
    }
}

/// The default packetizer (§4.3): while `sock.boundary` is set, repeatedly
/// slices a frame (through and including the boundary) off the front of
/// `recv` and dispatches it to `handle_request`, one call per occurrence.
/// A `connect_socket` callback opts into this by setting `sock.boundary`
/// and leaving `check_request` pointed at this function. Bytes after the
/// last complete occurrence are left in `recv` for the next read.
pub fn default_boundary_check_request(sock: &mut Socket) -> Result<()> {
    while let Some(boundary) = sock.boundary.clone() {
        let Some(at) = sock.recv.find(&boundary) else { break };
        let frame_len = at + boundary.len();
        let frame = sock.recv.as_slice()[..frame_len].to_vec();
        sock.reduce_recv(frame_len);
        if let Some(handle) = sock.callbacks.handle_request {
            handle(sock, &frame)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    fn blank_socket() -> Socket {
        Socket::new(Transport::test_null(), Instant::now())
    }

    #[test]
    fn schedule_shutdown_is_idempotent() {
        let mut s = blank_socket();
        assert!(!s.is_killed());
        s.schedule_shutdown();
        s.schedule_shutdown();
        assert!(s.is_killed());
    }

    #[test]
    fn write_overflow_invokes_kicked_and_errors() {
        fn on_kicked(_s: &mut Socket, reason: KickReason) {
            assert_eq!(reason, KickReason::Overflow);
        }
        let mut s = blank_socket();
        s.send = ByteBuffer::with_size(4);
        s.callbacks.kicked = Some(on_kicked);
        assert!(s.write(b"hello").is_err());
    }

    #[test]
    fn boundary_check_request_splits_every_occurrence_and_keeps_remainder() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FRAMES: AtomicUsize = AtomicUsize::new(0);
        fn on_handle(_s: &mut Socket, frame: &[u8]) -> Result<()> {
            assert!(frame == b"ab\r\n" || frame == b"cd\r\n");
            FRAMES.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        let mut s = blank_socket();
        s.boundary = Some(b"\r\n".to_vec());
        s.callbacks.handle_request = Some(on_handle);
        s.recv.append(b"ab\r\ncd\r\ne");
        default_boundary_check_request(&mut s).unwrap();
        assert_eq!(FRAMES.load(Ordering::SeqCst), 2);
        assert_eq!(s.recv.as_slice(), b"e");
    }

    #[test]
    fn fill_within_bounds_after_write_and_reduce() {
        let mut s = blank_socket();
        s.write(b"abc").unwrap();
        assert!(s.send.fill() <= s.send.size());
        s.reduce_recv(0);
        assert!(s.recv.fill() <= s.recv.size());
    }
}
