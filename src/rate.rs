//! Flood and connect-rate protection, per §4.8.
//!
//! Two independent mechanisms: per-socket flood points (decayed once per
//! second by the runtime tick) and per-listener, per-peer-IP connect
//! frequency (a 4-second sliding window of accept timestamps).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::info;

use crate::containers::RateWindow;
use crate::socket::{KickReason, Socket, SocketFlags};

/// Window width for the connect-frequency sliding window.
pub const RATE_WINDOW_SECS: u64 = 4;

/// Adds `1 + read_bytes/50` flood points for a successful read; kicks and
/// schedules shutdown if the running total exceeds `flood_limit`. A
/// `no-flood` socket is exempt (used for trusted/loopback listeners).
pub fn flood_protect(sock: &mut Socket, read_bytes: usize) {
    if sock.flags.contains(SocketFlags::NO_FLOOD) {
        return;
    }
    let points = 1 + (read_bytes / 50) as i32;
    sock.flood_points = sock.flood_points.saturating_add(points);
    if sock.flood_points > sock.flood_limit {
        if let Some(kicked) = sock.callbacks.kicked {
            kicked(sock, KickReason::Flood);
        }
        sock.schedule_shutdown();
    }
}

/// Decrements `flood_points` by 1, saturating at 0. Called once per second
/// by the runtime tick for every live socket.
pub fn decay_flood_points(sock: &mut Socket) {
    sock.flood_points = (sock.flood_points - 1).max(0);
}

/// Per-listener table of recent-accept timestamps, keyed by peer IP.
#[derive(Default)]
pub struct ConnectLimiter {
    per_ip: HashMap<Ipv4Addr, RateWindow>,
}

impl ConnectLimiter {
    pub fn new() -> Self {
        ConnectLimiter::default()
    }

    /// Records an accept attempt from `addr` at `now_secs` and reports
    /// whether it is within `connect_freq` accepts/sec, averaged over the
    /// trailing 4-second window. Purges timestamps older than the window
    /// as a side effect, so idle peers don't accumulate stale entries.
    pub fn check(&mut self, addr: Ipv4Addr, now_secs: u64, connect_freq: u32) -> bool {
        let window = self
            .per_ip
            .entry(addr)
            .or_insert_with(|| RateWindow::new(RATE_WINDOW_SECS));
        window.age(now_secs);
        window.record(now_secs);
        let rate = window.count() as u32 / RATE_WINDOW_SECS as u32;
        let allowed = rate <= connect_freq;
        if !allowed {
            info!("rate: connect frequency reached for {}", addr);
        }
        allowed
    }

    /// Drops any per-IP window that has gone quiet, to keep the table from
    /// growing unbounded over a long-running listener's lifetime.
    pub fn sweep(&mut self, now_secs: u64) {
        self.per_ip.retain(|_, window| {
            window.age(now_secs);
            !window.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::time::Instant;

    fn blank_socket() -> Socket {
        Socket::new(Transport::test_null(), Instant::now())
    }

    #[test]
    fn flood_points_accumulate_and_kick_past_limit() {
        static mut KICKED: bool = false;
        fn on_kicked(_s: &mut Socket, reason: KickReason) {
            assert_eq!(reason, KickReason::Flood);
            unsafe { KICKED = true };
        }
        let mut s = blank_socket();
        s.callbacks.kicked = Some(on_kicked);
        s.flood_limit = 100;
        // 60 KiB read in one shot: 1 + 61440/50 = 1229 points, well past 100.
        flood_protect(&mut s, 60 * 1024);
        assert!(s.is_killed());
        assert!(unsafe { KICKED });
    }

    #[test]
    fn no_flood_sockets_are_exempt() {
        let mut s = blank_socket();
        s.flags.insert(SocketFlags::NO_FLOOD);
        s.flood_limit = 1;
        flood_protect(&mut s, 1_000_000);
        assert!(!s.is_killed());
    }

    #[test]
    fn decay_saturates_at_zero() {
        let mut s = blank_socket();
        s.flood_points = 0;
        decay_flood_points(&mut s);
        assert_eq!(s.flood_points, 0);
    }

    #[test]
    fn connect_limiter_allows_up_to_frequency_then_rejects() {
        let mut limiter = ConnectLimiter::new();
        let addr = Ipv4Addr::new(127, 0, 0, 1);
        // connect_freq = 2 allows a rate of up to 2/sec averaged over 4s,
        // i.e. up to 8 accepts counted in the window before rate > 2.
        let mut accepted = 0;
        for _ in 0..20 {
            if limiter.check(addr, 0, 2) {
                accepted += 1;
            }
        }
        assert!(accepted >= 1);
        assert!(accepted < 20);
    }

    #[test]
    fn connect_limiter_recovers_after_window_elapses() {
        let mut limiter = ConnectLimiter::new();
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        for _ in 0..20 {
            limiter.check(addr, 0, 1);
        }
        assert!(limiter.check(addr, 10, 1));
    }
}
