//! Protocol detection (§4.6): the state machine that runs on a freshly
//! accepted stream before any server instance owns it.
//!
//! This is explicitly *not* routed through the generic `check_request`
//! callback slot in [`crate::socket::Callbacks`] -- picking a winner needs
//! to consult every server instance attached to the listener's bindings,
//! which is cross-socket/registry context a bare `fn(&mut Socket)` can't
//! reach. The runtime calls [`on_readable`] directly whenever `sock.cfg`
//! is still unset.

use std::time::Instant;

use log::{debug, warn};

use crate::binding::BindingManager;
use crate::error::Result;
use crate::server::ServerRegistry;
use crate::socket::{Socket, SocketData};

/// Runs one round of detection after a successful read grew the receive
/// buffer. Returns `Ok(())` whether or not a winner was found; shutdown on
/// overflow is signaled via `sock.schedule_shutdown()`, matching every
/// other default callback's convention.
pub fn on_readable(
    sock: &mut Socket,
    bindings: &BindingManager,
    servers: &ServerRegistry,
    detection_wait_secs: u64,
    detection_fill: usize,
) -> Result<()> {
    let SocketData::Candidates(candidate_ids) = &sock.data else {
        return Ok(());
    };
    let candidate_ids = candidate_ids.clone();

    for binding_id in &candidate_ids {
        let Some(binding) = bindings.binding(*binding_id) else { continue };
        let Some(server_ty) = servers.get(&binding.server) else { continue };
        let Some(detect) = server_ty.detect_proto else { continue };
        if detect(&binding.config, sock) {
            debug!("detect: socket {:?} matched server {}", sock.id, binding.server);
            sock.data = SocketData::None;
            sock.idle_counter = 0;
            sock.cfg = Some(binding.config.clone());
            (server_ty.connect_socket)(&binding.config, sock)?;
            if let Some(check_request) = sock.callbacks.check_request {
                return check_request(sock);
            }
            return Ok(());
        }
    }

    if sock.recv.fill() > detection_fill {
        warn!("detect: socket {:?} exceeded detection fill with no winner", sock.id);
        sock.schedule_shutdown();
    }
    let _ = detection_wait_secs;
    Ok(())
}

/// The idle-timeout half of detection: called once per tick for every
/// socket still mid-detection. Schedules shutdown once `detection_wait`
/// seconds have elapsed with no receive progress.
pub fn check_idle_timeout(sock: &mut Socket, now: Instant, detection_wait_secs: u64) {
    if !matches!(sock.data, SocketData::Candidates(_)) {
        return;
    }
    if now.saturating_duration_since(sock.last_recv).as_secs() > detection_wait_secs {
        debug!("detect: socket {:?} timed out waiting for a winner", sock.id);
        sock.schedule_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindOutcome, BindingManager};
    use crate::portcfg::{from_json, PortConfig};
    use crate::server::{ServerRegistry, ServerType};
    use crate::socket::SocketId;
    use crate::transport::Transport;
    use serde_json::json;

    fn always_wins(_cfg: &PortConfig, _sock: &mut Socket) -> bool {
        true
    }

    fn never_wins(_cfg: &PortConfig, _sock: &mut Socket) -> bool {
        false
    }

    fn install_handler(_cfg: &PortConfig, sock: &mut Socket) -> Result<()> {
        fn noop_handle(_sock: &mut Socket, _frame: &[u8]) -> Result<()> {
            Ok(())
        }
        sock.callbacks.handle_request = Some(noop_handle);
        Ok(())
    }

    fn make_manager_with_binding(server: &str, detect: Option<crate::server::DetectFn>) -> (BindingManager, ServerRegistry, crate::binding::BindingId) {
        let mut bindings = BindingManager::new();
        let cfg = from_json(&json!({"proto": "tcp", "port": 6000})).unwrap();
        let outcomes = bindings.resolve(server, cfg, &[]);
        let BindOutcome::NeedsListener { config, pending_bindings, .. } = &outcomes[0] else {
            panic!("expected NeedsListener")
        };
        let binding_id = pending_bindings[0];
        bindings.complete_listener(SocketId(1), config.clone(), pending_bindings.clone());

        let mut servers = ServerRegistry::new();
        servers.register(ServerType {
            name: server.to_owned(),
            detect_proto: detect,
            connect_socket: install_handler,
            reset: None,
            notify: None,
        });
        (bindings, servers, binding_id)
    }

    #[test]
    fn winner_installs_cfg_and_clears_candidates() {
        let (bindings, servers, binding_id) = make_manager_with_binding("http", Some(always_wins));
        let mut sock = Socket::new(Transport::test_null(), Instant::now());
        sock.data = SocketData::Candidates(vec![binding_id]);
        on_readable(&mut sock, &bindings, &servers, 30, 16).unwrap();
        assert!(matches!(sock.data, SocketData::None));
        assert!(sock.cfg.is_some());
        assert!(sock.callbacks.handle_request.is_some());
    }

    #[test]
    fn no_winner_under_fill_keeps_waiting() {
        let (bindings, servers, binding_id) = make_manager_with_binding("http", Some(never_wins));
        let mut sock = Socket::new(Transport::test_null(), Instant::now());
        sock.data = SocketData::Candidates(vec![binding_id]);
        sock.recv.append(b"GET");
        on_readable(&mut sock, &bindings, &servers, 30, 16).unwrap();
        assert!(!sock.is_killed());
        assert!(matches!(sock.data, SocketData::Candidates(_)));
    }

    #[test]
    fn no_winner_over_fill_schedules_shutdown() {
        let (bindings, servers, binding_id) = make_manager_with_binding("http", Some(never_wins));
        let mut sock = Socket::new(Transport::test_null(), Instant::now());
        sock.data = SocketData::Candidates(vec![binding_id]);
        sock.recv.append(&[0u8; 32]);
        on_readable(&mut sock, &bindings, &servers, 30, 16).unwrap();
        assert!(sock.is_killed());
    }

    #[test]
    fn idle_timeout_fires_after_detection_wait_elapses() {
        let mut sock = Socket::new(Transport::test_null(), Instant::now());
        sock.data = SocketData::Candidates(vec![]);
        sock.last_recv = Instant::now() - std::time::Duration::from_secs(60);
        check_idle_timeout(&mut sock, Instant::now(), 30);
        assert!(sock.is_killed());
    }
}
