//! End-to-end scenario 6 (spec §8): a later wildcard bind on a port that
//! already has a specific listener must tear that listener down and
//! migrate its bindings onto a fresh ANY-listener, which then accepts on
//! every interface including the one the old listener covered.
//!
//! Exercised at the `BindingManager` level (rather than through
//! `Runtime::bind`, which always expands a wildcard over the sandbox's
//! actual local interfaces before resolving -- on a loopback-only host
//! that expansion never collides with anything, so the merge/teardown
//! decision this scenario is about is only reachable, deterministically,
//! through the manager's own resolution entry point).

use serveez_rs::binding::{BindOutcome, BindingManager};
use serveez_rs::portcfg::{from_json, Address};
use serveez_rs::socket::SocketId;
use serveez_rs::Error;

fn tcp(port: u16, addr: &str) -> serveez_rs::portcfg::PortConfig {
    from_json(&serde_json::json!({"proto": "tcp", "port": port, "ipaddr": addr})).unwrap()
}

#[test]
fn wildcard_bind_tears_down_and_migrates_a_specific_listener() -> Result<(), Error> {
    let mut mgr = BindingManager::new();

    let specific_id = SocketId(1);
    let specific_outcomes = mgr.resolve("http", tcp(9000, "192.168.1.5"), &[]);
    assert_eq!(specific_outcomes.len(), 1);
    let BindOutcome::NeedsListener { config, pending_bindings, .. } = &specific_outcomes[0] else {
        panic!("first bind on a fresh port must need a listener");
    };
    let old_binding_id = pending_bindings[0];
    mgr.complete_listener(specific_id, config.clone(), pending_bindings.clone());
    assert_eq!(mgr.listener_count(), 1);
    assert_eq!(
        mgr.accept_filter(specific_id, "192.168.1.5".parse().unwrap(), 9000),
        vec![old_binding_id]
    );

    let any_outcomes = mgr.resolve("telnet", tcp(9000, "*"), &[]);
    assert_eq!(any_outcomes.len(), 1, "an unexpanded wildcard resolves to a single decision");
    let (new_config, tear_down, pending_bindings) = match &any_outcomes[0] {
        BindOutcome::NeedsListener { config, tear_down, pending_bindings } => {
            (config.clone(), tear_down.clone(), pending_bindings.clone())
        }
        _ => panic!("a wildcard bind over an existing specific listener must need a fresh listener"),
    };
    assert_eq!(tear_down, vec![specific_id], "the old specific listener must be torn down");
    assert!(matches!(new_config.common().unwrap().address, Address::Any));
    assert_eq!(pending_bindings.len(), 2, "the old binding migrates alongside the new one");
    assert!(pending_bindings.contains(&old_binding_id));

    // The runtime would have called shutdown_socket(specific_id) for
    // every id in tear_down before creating the replacement; mirror that
    // by dropping the manager's own bookkeeping for it.
    mgr.forget_listener(specific_id);

    let any_id = SocketId(2);
    mgr.complete_listener(any_id, new_config, pending_bindings.clone());
    assert_eq!(mgr.listener_count(), 1, "the old listener entry is gone, replaced by exactly one new one");

    // The new ANY listener now answers for both the migrated specific
    // binding and the fresh wildcard one, on every address.
    let matched_old_addr = mgr.accept_filter(any_id, "192.168.1.5".parse().unwrap(), 9000);
    assert_eq!(matched_old_addr.len(), 2, "both bindings match any local address");
    assert!(matched_old_addr.contains(&old_binding_id));

    let matched_other_addr = mgr.accept_filter(any_id, "10.0.0.9".parse().unwrap(), 9000);
    assert_eq!(matched_other_addr.len(), 2, "the any-listener accepts on every interface, not just the old one");

    // No bindings remain registered against the torn-down socket id.
    assert!(mgr.accept_filter(specific_id, "192.168.1.5".parse().unwrap(), 9000).is_empty());

    Ok(())
}
