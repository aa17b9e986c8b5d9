//! Integration tests for data transfer and connection teardown.

use std::net::SocketAddr;
use std::time::Duration;

use reliable_udp::{
    ConnConfig, Connection, ConnectionState, Listener, Simulator, SimulatorConfig, Socket,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn config() -> ConnConfig {
    ConnConfig::default()
        .initial_rto(Duration::from_millis(200))
        .time_wait(Duration::from_millis(100))
        .close_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(20))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Connected `(client, server)` pair; the listener keeps feeding the server.
async fn pair(
    client_sock: Socket,
    listener: &Listener,
    cfg: ConnConfig,
) -> (Connection, Connection) {
    let server_addr = listener.local_addr();
    let client_task = tokio::spawn(async move { Connection::connect(client_sock, server_addr, cfg).await });
    let server = listener
        .accept(Some(Duration::from_secs(10)))
        .await
        .unwrap()
        .expect("accept timed out");
    let client = client_task.await.unwrap().expect("connect failed");
    (client, server)
}

/// Read until end-of-stream.
async fn read_to_end(conn: &Connection) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let chunk = conn.recv(4096, Some(Duration::from_secs(10))).await;
        if chunk.is_empty() {
            return out;
        }
        out.extend(chunk);
    }
}

#[tokio::test]
async fn transfer_is_byte_exact_before_eof() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    let data = payload(20_000);
    let sent = client.send(&data).await.unwrap();
    assert_eq!(sent, data.len());

    let client_side = async {
        let graceful = client.close().await;
        (graceful, client.state().await)
    };
    let server_side = async {
        let got = read_to_end(&server).await;
        assert_eq!(server.state().await, ConnectionState::CloseWait);
        let graceful = server.close().await;
        (got, graceful)
    };
    let ((client_ok, client_state), (got, server_ok)) = tokio::join!(client_side, server_side);

    assert_eq!(got.len(), data.len());
    assert_eq!(got, data);
    assert!(client_ok);
    assert!(server_ok);
    assert_eq!(client_state, ConnectionState::Closed);
    listener.close().await;
}

#[tokio::test]
async fn recv_honours_max_bytes() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    client.send(b"0123456789").await.unwrap();
    let mut got = Vec::new();
    while got.len() < 10 {
        let chunk = server.recv(3, Some(Duration::from_secs(5))).await;
        assert!(!chunk.is_empty(), "timed out");
        assert!(chunk.len() <= 3);
        got.extend(chunk);
    }
    assert_eq!(got, b"0123456789");

    // Nothing more is queued; a short wait returns empty.
    assert!(server.recv(3, Some(Duration::from_millis(50))).await.is_empty());
    assert_eq!(server.state().await, ConnectionState::Established);

    tokio::join!(client.close(), server.close());
    listener.close().await;
}

#[tokio::test]
async fn bidirectional_exchange() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    client.send(b"Ping!").await.unwrap();
    assert_eq!(server.recv(64, Some(Duration::from_secs(5))).await, b"Ping!");
    server.send(b"Pong!").await.unwrap();
    assert_eq!(client.recv(64, Some(Duration::from_secs(5))).await, b"Pong!");

    tokio::join!(client.close(), server.close());
    listener.close().await;
}

#[tokio::test]
async fn four_way_close_walks_the_states() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    let active = async { client.close().await };
    let passive = async {
        // FIN arrives: end-of-stream, then CLOSE_WAIT.
        assert!(server.recv(16, Some(Duration::from_secs(5))).await.is_empty());
        assert_eq!(server.state().await, ConnectionState::CloseWait);
        // The active side is parked in FIN_WAIT_2 until we close.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state().await, ConnectionState::FinWait2);
        server.close().await
    };
    let (active_ok, passive_ok) = tokio::join!(active, passive);

    assert!(active_ok);
    assert!(passive_ok);
    assert_eq!(client.state().await, ConnectionState::Closed);
    assert_eq!(server.state().await, ConnectionState::Closed);
    listener.close().await;
}

#[tokio::test]
async fn simultaneous_close_completes() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    let (a, b) = tokio::join!(client.close(), server.close());
    assert!(a && b);
    assert_eq!(client.state().await, ConnectionState::Closed);
    assert_eq!(server.state().await, ConnectionState::Closed);
    listener.close().await;
}

/// After the client closes its direction, the server can still send.
#[tokio::test]
async fn half_close_keeps_reverse_direction_open() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    let client_side = async {
        let (graceful, got) = tokio::join!(client.close(), read_to_end(&client));
        assert!(graceful);
        got
    };
    let server_side = async {
        assert!(read_to_end(&server).await.is_empty());
        server.send(b"still talking").await.unwrap();
        server.close().await
    };
    let (got, server_ok) = tokio::join!(client_side, server_side);

    assert_eq!(got, b"still talking");
    assert!(server_ok);
    listener.close().await;
}

#[tokio::test]
async fn send_after_close_is_rejected() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;

    tokio::join!(client.close(), server.close());
    assert!(client.send(b"late").await.is_err());
    listener.close().await;
}

/// An accepted connection dropped without `close()` is closed by the
/// listener: the peer sees end-of-stream and the table entry goes away.
#[tokio::test]
async fn dropped_child_is_closed_and_pruned() {
    init_logging();
    let listener = Listener::bind(local(), config()).await.unwrap();
    let (client, server) = pair(Socket::bind(local()).await.unwrap(), &listener, config()).await;
    assert_eq!(listener.connections().await, 1);

    drop(server);
    assert!(client.recv(16, Some(Duration::from_secs(5))).await.is_empty());
    assert_eq!(client.state().await, ConnectionState::CloseWait);
    assert!(client.close().await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while listener.connections().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "child never pruned");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    listener.close().await;
}

/// Loss, corruption and jitter on both paths; the byte stream still arrives
/// intact and in order.
#[tokio::test]
async fn transfer_survives_lossy_reordering_channel() {
    init_logging();
    let channel = |seed| {
        Simulator::shared(
            SimulatorConfig::default()
                .loss_rate(0.1)
                .corrupt_rate(0.05)
                .delay_range(Duration::ZERO..=Duration::from_millis(10))
                .seed(seed),
        )
    };
    // The whole burst fits the receive window, so nothing ahead of a gap is
    // dropped.
    let cfg = config().mss(512).max_retries(10).recv_buffer(u16::MAX);

    let server_sock = Socket::bind(local()).await.unwrap().with_simulator(channel(1));
    let listener = Listener::listen(server_sock, cfg.clone());
    let client_sock = Socket::bind(local()).await.unwrap().with_simulator(channel(2));
    let (client, server) = pair(client_sock, &listener, cfg).await;

    let data = payload(16 * 1024);
    client.send(&data).await.unwrap();

    // The final ACK of the close may be lost, so only the payload is checked.
    let (_, got) = tokio::join!(client.close(), async {
        let got = read_to_end(&server).await;
        server.close().await;
        got
    });
    assert_eq!(got, data);
}
