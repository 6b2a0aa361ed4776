//! End-to-end scenario 2 (spec §8): a connection that never sends bytes
//! matching any detector must be shut down once `detection_wait` elapses.

use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use serveez_rs::portcfg::from_json;
use serveez_rs::socket::{Socket, SocketId};
use serveez_rs::transport::{TcpTransport, Transport};
use serveez_rs::{Error, Runtime, ServerType};

fn never_matches(_cfg: &serveez_rs::portcfg::PortConfig, _sock: &mut Socket) -> bool {
    false
}

fn unreachable_connect(_cfg: &serveez_rs::portcfg::PortConfig, _sock: &mut Socket) -> Result<(), Error> {
    panic!("detect_proto never matches, connect_socket must not run");
}

fn listener_port(rt: &Runtime, id: SocketId) -> u16 {
    match &rt.registry().get(id).unwrap().transport {
        Transport::Tcp(TcpTransport::Listener(l)) => l.local_addr().unwrap().port(),
        _ => panic!("expected a tcp listener"),
    }
}

#[test]
fn undetected_connection_is_closed_after_detection_wait_elapses() {
    let mut rt = Runtime::new(64).unwrap();
    rt.servers_mut().register(ServerType {
        name: "quiet".into(),
        detect_proto: Some(never_matches),
        connect_socket: unreachable_connect,
        reset: None,
        notify: None,
    });

    rt.bind(
        "quiet",
        from_json(&json!({"proto": "tcp", "port": 0, "ipaddr": "127.0.0.1", "detection-wait": 3})).unwrap(),
    )
    .unwrap();
    let listener_id = rt.registry().ids_in_order()[0];
    let port = listener_port(&rt, listener_id);

    let client = thread::spawn(move || {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Block on a read; it must return Ok(0) (EOF) once the server
        // side shuts the connection down, never an error.
        use std::io::Read;
        let mut buf = [0u8; 1];
        let mut s = stream;
        let n = s.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        rt.run_one(Duration::from_millis(200)).unwrap();
        if rt.registry().len() == 1 {
            break; // only the listener remains
        }
        assert!(Instant::now() < deadline, "timed out waiting for the idle connection to be shut down");
    }

    client.join().unwrap();
}
