//! End-to-end tests: real sockets on loopback, one engine per test.

// @@ begin test lint list @@
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::clone_on_copy)]
#![allow(clippy::dbg_macro)]
#![allow(clippy::mixed_attributes_style)]
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
#![allow(clippy::single_char_pattern)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::unchecked_time_subtraction)]
#![allow(clippy::useless_vec)]
#![allow(clippy::needless_pass_by_value)]
//! <!-- @@ end test lint list @@ -->

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use shroud_engine::{Engine, ListenerMode, ListenerParams};
use shroud_obfs::ProtocolSpec;

/// Upper bound for anything that should happen quickly.
const TICK: Duration = Duration::from_secs(5);

/// Listener parameters with the given shape.
fn params(mode: ListenerMode, target: Option<SocketAddr>, protocol: ProtocolSpec) -> ListenerParams {
    ListenerParams {
        mode,
        listen: "127.0.0.1:0".parse().unwrap(),
        target,
        protocol,
        idle_timeout: None,
    }
}

/// Start an echo server; every accepted stream is copied back to itself.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(a) => a,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// Start a server that accepts connections and then just sits on them.
async fn spawn_sink() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut keep = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, _)) => keep.push(stream),
                Err(_) => return,
            }
        }
    });
    addr
}

/// Poll `cond` until it holds, or give up loudly.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    timeout(TICK, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Run the SOCKS5 no-auth greeting on `stream`.
async fn socks_greet(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0_u8; 2];
    timeout(TICK, stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

/// Encode a SOCKS5 request for an IPv4 address.
fn socks_request(cmd: u8, target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("test targets are IPv4");
    };
    let mut req = vec![0x05, cmd, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    req
}

/// Read and check a SOCKS5 reply; returns (status, bound address).
async fn read_socks_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut head = [0_u8; 4];
    timeout(TICK, stream.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);
    assert_eq!(head[3], 0x01, "tests expect IPv4 bound addresses");
    let mut rest = [0_u8; 6];
    timeout(TICK, stream.read_exact(&mut rest))
        .await
        .unwrap()
        .unwrap();
    let ip = std::net::Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
    let port = u16::from_be_bytes([rest[4], rest[5]]);
    (head[1], SocketAddr::new(ip.into(), port))
}

#[tokio::test]
async fn simple_client_passthrough() {
    let echo = spawn_echo().await;
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(echo),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"hello\n").await.unwrap();
    let mut reply = [0_u8; 6];
    timeout(TICK, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"hello\n");
}

#[tokio::test]
async fn scramble_tunnel_round_trips() {
    let echo = spawn_echo().await;
    let engine = Engine::new();
    let server = engine
        .add_listener(params(
            ListenerMode::SimpleServer,
            Some(echo),
            ProtocolSpec::Scramble,
        ))
        .await
        .unwrap();
    let client_side = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(server),
            ProtocolSpec::Scramble,
        ))
        .await
        .unwrap();

    // An EOF anywhere tears the whole tunnel down once the last bytes have
    // flushed, so read the echo back in full before closing anything.
    let payload: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(client_side).await.unwrap();
    let (mut rd, mut wr) = client.split();
    let write_half = async {
        wr.write_all(&payload).await.unwrap();
    };
    let read_half = async {
        let mut echoed = vec![0_u8; payload.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        echoed
    };
    let (_, echoed) = timeout(Duration::from_secs(30), async {
        tokio::join!(write_half, read_half)
    })
    .await
    .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn socks_connect_success() {
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(ListenerMode::SocksClient, None, ProtocolSpec::Dummy))
        .await
        .unwrap();
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    socks_greet(&mut client).await;
    client
        .write_all(&socks_request(0x01, target))
        .await
        .unwrap();

    let (status, bound) = read_socks_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(bound, target);

    // The tunnel is transparent from here on.
    let (mut accepted, _) = timeout(TICK, target_listener.accept())
        .await
        .unwrap()
        .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0_u8; 4];
    timeout(TICK, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    accepted.write_all(b"pong").await.unwrap();
    timeout(TICK, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn socks_bind_gets_command_not_supported() {
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(ListenerMode::SocksClient, None, ProtocolSpec::Dummy))
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    socks_greet(&mut client).await;
    client
        .write_all(&socks_request(0x02, "127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();

    let (status, bound) = read_socks_reply(&mut client).await;
    assert_eq!(status, 0x07);
    assert_eq!(bound, "0.0.0.0:0".parse::<SocketAddr>().unwrap());

    // And then the proxy hangs up.
    let mut rest = Vec::new();
    let n = timeout(TICK, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn socks_bad_address_type_gets_reply() {
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(ListenerMode::SocksClient, None, ProtocolSpec::Dummy))
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    socks_greet(&mut client).await;

    // A CONNECT request with an address type nobody assigned.
    client
        .write_all(&[0x05, 0x01, 0x00, 0x02, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
        .await
        .unwrap();

    let (status, bound) = read_socks_reply(&mut client).await;
    assert_eq!(status, 0x08);
    assert_eq!(bound, "0.0.0.0:0".parse::<SocketAddr>().unwrap());

    let mut rest = Vec::new();
    let n = timeout(TICK, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn socks_connect_refused_maps_to_reply() {
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(ListenerMode::SocksClient, None, ProtocolSpec::Dummy))
        .await
        .unwrap();

    // Bind a port, learn it, and free it again so nobody is listening.
    let vacant = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let mut client = TcpStream::connect(proxy).await.unwrap();
    socks_greet(&mut client).await;
    client
        .write_all(&socks_request(0x01, vacant))
        .await
        .unwrap();

    let (status, _) = read_socks_reply(&mut client).await;
    assert_eq!(status, 0x05);
    let mut rest = Vec::new();
    let n = timeout(TICK, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn socks_pipelined_data_arrives_after_reply() {
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(ListenerMode::SocksClient, None, ProtocolSpec::Dummy))
        .await
        .unwrap();
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    socks_greet(&mut client).await;

    // CONNECT plus an eager request body, all in one write.
    let mut burst = socks_request(0x01, target);
    burst.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
    client.write_all(&burst).await.unwrap();

    let (status, _) = read_socks_reply(&mut client).await;
    assert_eq!(status, 0x00);

    let (mut accepted, _) = timeout(TICK, target_listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut buf = [0_u8; 18];
    timeout(TICK, accepted.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
}

#[tokio::test]
async fn half_close_still_delivers_buffered_bytes() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap();
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(target),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let (mut accepted, _) = timeout(TICK, target_listener.accept())
        .await
        .unwrap()
        .unwrap();

    // The target dumps 100 bytes and slams the door.
    accepted.write_all(&[0x42_u8; 100]).await.unwrap();
    drop(accepted);

    // Every byte arrives before the EOF does.
    let mut got = Vec::new();
    timeout(TICK, client.read_to_end(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![0x42_u8; 100]);

    wait_until("the connection set to empty", || engine.n_connections() == 0).await;
}

#[tokio::test]
async fn barbaric_shutdown_force_closes_everything() {
    let sink = spawn_sink().await;
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(sink),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(proxy).await.unwrap());
    }
    wait_until("three live connections", || engine.n_connections() == 3).await;

    engine.free_all_listeners();
    engine.start_shutdown(true);
    timeout(TICK, engine.wait_shutdown())
        .await
        .expect("shutdown never completed");
    assert_eq!(engine.n_connections(), 0);

    // Each client sees its socket die.
    for mut client in clients {
        let mut buf = Vec::new();
        let _ = timeout(TICK, client.read_to_end(&mut buf)).await.unwrap();
    }
}

#[tokio::test]
async fn graceful_shutdown_waits_for_live_connections() {
    let sink = spawn_sink().await;
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(sink),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    let client = TcpStream::connect(proxy).await.unwrap();
    wait_until("one live connection", || engine.n_connections() == 1).await;

    engine.free_all_listeners();
    engine.start_shutdown(false);

    // The live connection keeps the engine up.
    assert!(
        timeout(Duration::from_millis(200), engine.wait_shutdown())
            .await
            .is_err()
    );
    assert_eq!(engine.n_connections(), 1);

    // Once the client goes away, shutdown completes on its own.
    drop(client);
    timeout(TICK, engine.wait_shutdown())
        .await
        .expect("shutdown never completed");
    assert_eq!(engine.n_connections(), 0);
}

#[tokio::test]
async fn shutdown_and_listener_teardown_are_idempotent() {
    let echo = spawn_echo().await;
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(echo),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    engine.free_all_listeners();
    engine.free_all_listeners();
    engine.start_shutdown(false);
    engine.start_shutdown(false);
    timeout(TICK, engine.wait_shutdown()).await.unwrap();

    // The accept socket really is gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(proxy).await.is_err());
}

#[tokio::test]
async fn no_admissions_once_shutting_down() {
    let echo = spawn_echo().await;
    let engine = Engine::new();
    let proxy = engine
        .add_listener(params(
            ListenerMode::SimpleClient,
            Some(echo),
            ProtocolSpec::Dummy,
        ))
        .await
        .unwrap();

    // Shut down without freeing the listener: connections may still be
    // accepted by the kernel, but the engine must drop them unserved.
    engine.start_shutdown(false);

    if let Ok(mut client) = TcpStream::connect(proxy).await {
        let mut buf = Vec::new();
        let n = timeout(TICK, client.read_to_end(&mut buf)).await.unwrap();
        assert_eq!(n.unwrap_or(0), 0);
    }
    assert_eq!(engine.n_connections(), 0);

    // New listeners are refused outright.
    assert!(
        engine
            .add_listener(params(
                ListenerMode::SimpleClient,
                Some(echo),
                ProtocolSpec::Dummy,
            ))
            .await
            .is_err()
    );
}
