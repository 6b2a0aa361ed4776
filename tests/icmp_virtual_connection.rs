//! End-to-end scenario 5 (spec §8): a peer outside the runtime sends a
//! `connect`, then `data`, then `close` over real raw ICMP sockets on
//! loopback; the listener must demultiplex them into (and eventually tear
//! down) exactly one virtual connection, leaving the listener itself
//! alive throughout.
//!
//! Requires `CAP_NET_RAW` (root, in practice); skips itself if raw ICMP
//! sockets aren't available in the sandbox running the test.

use std::net::Ipv4Addr;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde_json::json;
use serveez_rs::portcfg::from_json;
use serveez_rs::socket::Socket;
use serveez_rs::transport::icmp::{
    build_packet, local_ident, ICMP_SERVEEZ_CLOSE, ICMP_SERVEEZ_CONNECT, ICMP_SERVEEZ_DATA,
};
use serveez_rs::transport::IcmpSocket;
use serveez_rs::{Error, Runtime, ServerType};

fn frames() -> &'static Mutex<Vec<Vec<u8>>> {
    static FRAMES: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();
    FRAMES.get_or_init(|| Mutex::new(Vec::new()))
}

fn install_echo(_cfg: &serveez_rs::portcfg::PortConfig, sock: &mut Socket) -> Result<(), Error> {
    sock.callbacks.check_request = Some(drain_one_frame);
    sock.callbacks.handle_request = Some(record_frame);
    Ok(())
}

fn drain_one_frame(sock: &mut Socket) -> Result<(), Error> {
    if sock.recv.is_empty() {
        return Ok(());
    }
    let frame = sock.recv.as_slice().to_vec();
    sock.reduce_recv(frame.len());
    if let Some(handle) = sock.callbacks.handle_request {
        handle(sock, &frame)?;
    }
    Ok(())
}

fn record_frame(_sock: &mut Socket, frame: &[u8]) -> Result<(), Error> {
    frames().lock().unwrap().push(frame.to_vec());
    Ok(())
}

#[test]
fn connect_data_close_demultiplex_into_one_virtual_connection() {
    let peer = match IcmpSocket::new(7777) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("skipping: raw ICMP sockets unavailable in this sandbox: {e}");
            return;
        }
    };

    let mut rt = Runtime::new(64).unwrap();
    rt.servers_mut().register(ServerType {
        name: "icmpecho".into(),
        detect_proto: None,
        connect_socket: install_echo,
        reset: None,
        notify: None,
    });
    if let Err(e) = rt.bind("icmpecho", from_json(&json!({"proto": "icmp", "port": 7777})).unwrap()) {
        eprintln!("skipping: could not create the icmp listener: {e}");
        return;
    }
    let listener_id = rt.registry().ids_in_order()[0];

    // Any ident that doesn't collide with the listener's own, so the
    // listener doesn't reject these as its own looped-back traffic.
    let peer_ident = local_ident(std::process::id(), listener_id).wrapping_add(1);

    let connect_pkt = build_packet(peer_ident, 0, 7777, ICMP_SERVEEZ_CONNECT, &[]);
    peer.send_to(Ipv4Addr::LOCALHOST, &connect_pkt).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while rt.registry().len() < 2 {
        rt.run_one(Duration::from_millis(50)).unwrap();
        assert!(Instant::now() < deadline, "listener never accepted the virtual connection");
    }
    assert_eq!(rt.registry().len(), 2); // listener + accepted virtual connection

    let data_pkt = build_packet(peer_ident, 1, 7777, ICMP_SERVEEZ_DATA, b"hello");
    peer.send_to(Ipv4Addr::LOCALHOST, &data_pkt).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while frames().lock().unwrap().is_empty() {
        rt.run_one(Duration::from_millis(50)).unwrap();
        assert!(Instant::now() < deadline, "data packet never reached handle_request");
    }
    assert_eq!(frames().lock().unwrap().clone(), vec![b"hello".to_vec()]);

    let close_pkt = build_packet(peer_ident, 2, 7777, ICMP_SERVEEZ_CLOSE, &[]);
    peer.send_to(Ipv4Addr::LOCALHOST, &close_pkt).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while rt.registry().len() > 1 {
        rt.run_one(Duration::from_millis(50)).unwrap();
        assert!(Instant::now() < deadline, "virtual connection was never torn down");
    }
    // The listener itself must have survived the peer's close.
    assert!(rt.registry().get(listener_id).is_some());
}
