//! End-to-end scenario 3 (spec §8): a handler that never consumes its
//! input must still get kicked and shut down once accumulated flood
//! points exceed the default limit.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use serveez_rs::portcfg::from_json;
use serveez_rs::socket::{KickReason, Socket, SocketId};
use serveez_rs::transport::{TcpTransport, Transport};
use serveez_rs::{Error, Runtime, ServerType};

static KICKS: AtomicUsize = AtomicUsize::new(0);

fn always_matches(_cfg: &serveez_rs::portcfg::PortConfig, _sock: &mut Socket) -> bool {
    true
}

fn install_sink(_cfg: &serveez_rs::portcfg::PortConfig, sock: &mut Socket) -> Result<(), Error> {
    // No boundary, no check_request/handle_request: bytes pile up in
    // `recv` untouched, matching "a handler that never consumes its
    // input" in the scenario.
    sock.callbacks.kicked = Some(on_kicked);
    Ok(())
}

fn on_kicked(_sock: &mut Socket, reason: KickReason) {
    assert_eq!(reason, KickReason::Flood);
    KICKS.fetch_add(1, Ordering::SeqCst);
}

fn listener_port(rt: &Runtime, id: SocketId) -> u16 {
    match &rt.registry().get(id).unwrap().transport {
        Transport::Tcp(TcpTransport::Listener(l)) => l.local_addr().unwrap().port(),
        _ => panic!("expected a tcp listener"),
    }
}

#[test]
fn sixty_kib_in_one_batch_trips_the_default_flood_limit() {
    let mut rt = Runtime::new(64).unwrap();
    rt.servers_mut().register(ServerType {
        name: "sink".into(),
        detect_proto: Some(always_matches),
        connect_socket: install_sink,
        reset: None,
        notify: None,
    });

    rt.bind("sink", from_json(&json!({"proto": "tcp", "port": 0, "ipaddr": "127.0.0.1"})).unwrap())
        .unwrap();
    let listener_id = rt.registry().ids_in_order()[0];
    let port = listener_port(&rt, listener_id);

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let chunk = vec![b'x'; 60 * 1024];
        let _ = stream.write_all(&chunk);
        thread::sleep(Duration::from_millis(200));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        rt.run_one(Duration::from_millis(50)).unwrap();
        if rt.registry().len() == 1 {
            break; // only the listener remains; the flooding connection got kicked
        }
        assert!(Instant::now() < deadline, "flood kick never happened");
    }
    client.join().unwrap();

    assert_eq!(KICKS.load(Ordering::SeqCst), 1);
}
