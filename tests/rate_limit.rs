//! End-to-end scenario 4 (spec §8): the same peer opening many TCP
//! connections within one second against a low `connect_freq` sees only
//! the first several accepted; the rest are rejected before ever reaching
//! a server instance. Bounded by the quantified rate invariant: accepts
//! in any 4-second window are <= 4 * connect_freq + 3.

use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use serde_json::json;
use serveez_rs::portcfg::from_json;
use serveez_rs::socket::{Socket, SocketId};
use serveez_rs::transport::{TcpTransport, Transport};
use serveez_rs::{Error, Runtime, ServerType};

fn always_matches(_cfg: &serveez_rs::portcfg::PortConfig, _sock: &mut Socket) -> bool {
    true
}

fn noop_connect(_cfg: &serveez_rs::portcfg::PortConfig, _sock: &mut Socket) -> Result<(), Error> {
    Ok(())
}

fn listener_port(rt: &Runtime, id: SocketId) -> u16 {
    match &rt.registry().get(id).unwrap().transport {
        Transport::Tcp(TcpTransport::Listener(l)) => l.local_addr().unwrap().port(),
        _ => panic!("expected a tcp listener"),
    }
}

#[test]
fn twenty_rapid_connects_from_one_peer_are_mostly_rejected() {
    let mut rt = Runtime::new(64).unwrap();
    rt.servers_mut().register(ServerType {
        name: "limited".into(),
        detect_proto: Some(always_matches),
        connect_socket: noop_connect,
        reset: None,
        notify: None,
    });

    rt.bind(
        "limited",
        from_json(&json!({"proto": "tcp", "port": 0, "ipaddr": "127.0.0.1", "connect-frequency": 2})).unwrap(),
    )
    .unwrap();
    let listener_id = rt.registry().ids_in_order()[0];
    let port = listener_port(&rt, listener_id);

    let client = thread::spawn(move || {
        let mut streams = Vec::new();
        for _ in 0..20 {
            if let Ok(s) = TcpStream::connect(("127.0.0.1", port)) {
                streams.push(s);
            }
        }
        streams
    });

    for _ in 0..40 {
        rt.run_one(Duration::from_millis(20)).unwrap();
    }
    let _streams = client.join().unwrap();

    let accepted = rt.registry().len() - 1; // minus the listener itself
    assert!(accepted >= 1, "at least one connection should have been accepted");
    assert!(
        accepted <= 11,
        "accepted {accepted} connections, exceeding the 4*connect_freq+3 invariant"
    );
}
