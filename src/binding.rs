//! Binding manager: resolves `(server, port configuration)` pairs to
//! listener sockets, merging and shadowing INADDR_ANY listeners as needed
//! -- §4.7.
//!
//! The manager never creates sockets itself (that requires a `mio::Poll`
//! registration, which lives with the runtime); instead `resolve` returns
//! a [`BindOutcome`] describing what the caller must do, and the caller
//! reports back via [`BindingManager::complete_listener`] once the socket
//! exists.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::warn;

use crate::portcfg::{BindKey, InetAddrKey, PortConfig};
use crate::socket::SocketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u32);

#[derive(Debug, Clone)]
pub struct Binding {
    pub id: BindingId,
    pub server: String,
    pub config: PortConfig,
}

struct ListenerEntry {
    socket_id: Option<SocketId>,
    key: BindKey,
    /// A representative config, used for accept-filter address/port checks.
    config: PortConfig,
    bindings: Vec<BindingId>,
}

/// What the caller must do in response to a `resolve` call.
pub enum BindOutcome {
    /// An identical binding already existed; nothing to do.
    Duplicate,
    /// Attached to an already-live listener; no new socket needed.
    Attached { socket_id: SocketId },
    /// No matching listener exists yet (or existing ones must be torn
    /// down first); the caller must create a listener socket for `config`
    /// and report it back via `complete_listener`, after first shutting
    /// down every socket in `tear_down`.
    NeedsListener {
        config: PortConfig,
        tear_down: Vec<SocketId>,
        pending_bindings: Vec<BindingId>,
    },
}

#[derive(Default)]
pub struct BindingManager {
    bindings: HashMap<BindingId, Binding>,
    listeners: Vec<ListenerEntry>,
    next_id: u32,
}

fn less_specific_match(a: &BindKey, b: &BindKey) -> bool {
    match (a, b) {
        (
            BindKey::Inet { port: pa, address: aa },
            BindKey::Inet { port: pb, address: ab },
        ) => pa == pb && aa != ab && (*aa == InetAddrKey::Any || *ab == InetAddrKey::Any),
        _ => false,
    }
}

impl BindingManager {
    pub fn new() -> Self {
        BindingManager::default()
    }

    fn alloc_id(&mut self) -> BindingId {
        let id = BindingId(self.next_id);
        self.next_id += 1;
        id
    }

    fn find_listener_by_key(&self, key: &BindKey) -> Option<usize> {
        self.listeners.iter().position(|l| &l.key == key)
    }

    fn find_listener_by_socket(&self, socket_id: SocketId) -> Option<usize> {
        self.listeners.iter().position(|l| l.socket_id == Some(socket_id))
    }

    fn binding_is_duplicate(&self, listener_idx: usize, server: &str, config: &PortConfig) -> bool {
        self.listeners[listener_idx].bindings.iter().any(|id| {
            let b = &self.bindings[id];
            b.server == server && b.config.bind_key() == config.bind_key()
        })
    }

    /// Expands `portcfg` over `local_interfaces` and resolves each copy
    /// per the rules in §4.7, returning one outcome per expanded copy.
    pub fn resolve(&mut self, server: &str, portcfg: PortConfig, local_interfaces: &[Ipv4Addr]) -> Vec<BindOutcome> {
        portcfg
            .expand(local_interfaces)
            .into_iter()
            .map(|copy| self.resolve_one(server, copy))
            .collect()
    }

    fn resolve_one(&mut self, server: &str, config: PortConfig) -> BindOutcome {
        let key = config.bind_key();

        if let Some(idx) = self.find_listener_by_key(&key) {
            if self.binding_is_duplicate(idx, server, &config) {
                warn!("binding: duplicate binding for {} on an existing listener, skipping", server);
                return BindOutcome::Duplicate;
            }
            let id = self.alloc_id();
            self.bindings.insert(
                id,
                Binding {
                    id,
                    server: server.to_owned(),
                    config,
                },
            );
            self.listeners[idx].bindings.push(id);
            return match self.listeners[idx].socket_id {
                Some(socket_id) => BindOutcome::Attached { socket_id },
                None => BindOutcome::NeedsListener {
                    config: self.listeners[idx].config.clone(),
                    tear_down: Vec::new(),
                    pending_bindings: vec![id],
                },
            };
        }

        if let Some(idx) = self.listeners.iter().position(|l| less_specific_match(&l.key, &key)) {
            let conflicting = self.listeners.remove(idx);
            let tear_down = conflicting.socket_id.into_iter().collect();
            let mut pending_bindings = conflicting.bindings;
            let new_id = self.alloc_id();
            self.bindings.insert(
                new_id,
                Binding {
                    id: new_id,
                    server: server.to_owned(),
                    config: config.clone(),
                },
            );
            pending_bindings.push(new_id);
            return BindOutcome::NeedsListener {
                config,
                tear_down,
                pending_bindings,
            };
        }

        let id = self.alloc_id();
        self.bindings.insert(
            id,
            Binding {
                id,
                server: server.to_owned(),
                config: config.clone(),
            },
        );
        BindOutcome::NeedsListener {
            config,
            tear_down: Vec::new(),
            pending_bindings: vec![id],
        }
    }

    /// Records that `socket_id` is now the live listener backing `config`,
    /// owning `bindings`. Called once the runtime has actually created and
    /// registered the listener socket for a `NeedsListener` outcome.
    pub fn complete_listener(&mut self, socket_id: SocketId, config: PortConfig, bindings: Vec<BindingId>) {
        let key = config.bind_key();
        self.listeners.push(ListenerEntry {
            socket_id: Some(socket_id),
            key,
            config,
            bindings,
        });
    }

    /// Drops all bookkeeping for a listener that has been shut down
    /// (e.g. the shadowed specific listeners during a merge).
    pub fn forget_listener(&mut self, socket_id: SocketId) {
        if let Some(idx) = self.find_listener_by_socket(socket_id) {
            let entry = self.listeners.remove(idx);
            for id in entry.bindings {
                self.bindings.remove(&id);
            }
        }
    }

    /// The accept filter (§4.7): bindings on `socket_id`'s listener whose
    /// configured address/port matches the accepted connection's local
    /// endpoint.
    pub fn accept_filter(&self, socket_id: SocketId, local_addr: Ipv4Addr, local_port: u16) -> Vec<BindingId> {
        let Some(idx) = self.find_listener_by_socket(socket_id) else {
            return Vec::new();
        };
        self.listeners[idx]
            .bindings
            .iter()
            .filter(|id| {
                let Some(binding) = self.bindings.get(id) else { return false };
                match binding.config.common() {
                    None => true,
                    Some(common) => {
                        let addr_ok = match common.address {
                            crate::portcfg::Address::Any => true,
                            crate::portcfg::Address::Specific(a) => a == local_addr,
                        };
                        let port_ok = matches!(binding.config, PortConfig::Icmp(_) | PortConfig::Raw(_))
                            || common.port == local_port;
                        addr_ok && port_ok
                    }
                }
            })
            .copied()
            .collect()
    }

    pub fn binding(&self, id: BindingId) -> Option<&Binding> {
        self.bindings.get(&id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portcfg::{from_json, Address};
    use serde_json::json;

    fn tcp(port: u16, addr: &str) -> PortConfig {
        from_json(&json!({"proto": "tcp", "port": port, "ipaddr": addr})).unwrap()
    }

    #[test]
    fn first_bind_on_a_fresh_port_needs_a_listener() {
        let mut mgr = BindingManager::new();
        let outcomes = mgr.resolve("http", tcp(6000, "192.168.1.5"), &[]);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], BindOutcome::NeedsListener { .. }));
    }

    #[test]
    fn second_bind_on_same_address_attaches() {
        let mut mgr = BindingManager::new();
        let sid = SocketId(1);
        let outcomes = mgr.resolve("http", tcp(6000, "192.168.1.5"), &[]);
        let BindOutcome::NeedsListener { config, pending_bindings, .. } = &outcomes[0] else {
            panic!("expected NeedsListener")
        };
        mgr.complete_listener(sid, config.clone(), pending_bindings.clone());

        let outcomes2 = mgr.resolve("telnet", tcp(6000, "192.168.1.5"), &[]);
        assert!(matches!(outcomes2[0], BindOutcome::Attached { socket_id } if socket_id == sid));
    }

    #[test]
    fn identical_binding_is_silently_skipped() {
        let mut mgr = BindingManager::new();
        let sid = SocketId(1);
        let outcomes = mgr.resolve("http", tcp(6000, "192.168.1.5"), &[]);
        let BindOutcome::NeedsListener { config, pending_bindings, .. } = &outcomes[0] else {
            panic!("expected NeedsListener")
        };
        mgr.complete_listener(sid, config.clone(), pending_bindings.clone());

        let outcomes2 = mgr.resolve("http", tcp(6000, "192.168.1.5"), &[]);
        assert!(matches!(outcomes2[0], BindOutcome::Duplicate));
    }

    #[test]
    fn any_bind_over_specific_listener_tears_down_and_merges() {
        let mut mgr = BindingManager::new();
        let specific_sid = SocketId(1);
        let specific_outcomes = mgr.resolve("http", tcp(9000, "192.168.1.5"), &[]);
        let BindOutcome::NeedsListener { config, pending_bindings, .. } = &specific_outcomes[0] else {
            panic!("expected NeedsListener")
        };
        mgr.complete_listener(specific_sid, config.clone(), pending_bindings.clone());

        let any_outcomes = mgr.resolve("http2", tcp(9000, "*"), &[]);
        match &any_outcomes[0] {
            BindOutcome::NeedsListener { tear_down, pending_bindings, config } => {
                assert_eq!(tear_down, &vec![specific_sid]);
                assert_eq!(pending_bindings.len(), 2); // merged old + new
                assert!(matches!(config.common().unwrap().address, Address::Any));
            }
            _ => panic!("expected NeedsListener with merge"),
        }
    }

    #[test]
    fn accept_filter_matches_specific_address_and_port() {
        let mut mgr = BindingManager::new();
        let sid = SocketId(1);
        let outcomes = mgr.resolve("http", tcp(6000, "192.168.1.5"), &[]);
        let BindOutcome::NeedsListener { config, pending_bindings, .. } = &outcomes[0] else {
            panic!("expected NeedsListener")
        };
        let binding_id = pending_bindings[0];
        mgr.complete_listener(sid, config.clone(), pending_bindings.clone());

        let matched = mgr.accept_filter(sid, Ipv4Addr::new(192, 168, 1, 5), 6000);
        assert_eq!(matched, vec![binding_id]);
        assert!(mgr.accept_filter(sid, Ipv4Addr::new(192, 168, 1, 5), 7000).is_empty());
    }
}
