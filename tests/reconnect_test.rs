//! Tests for automatic reconnection of client sessions

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use netbridge::{
    ClientConfig, ClientSession, ErrorKind, ExecutionModel, Protocol, ReconnectConfig, ServerCallbacks,
    ServerConfig, ServerListener, SessionState,
};
use tokio_test::assert_ok;

fn fast_reconnect(max_retries: i64) -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(400),
        max_retries,
    }
}

fn listen_uppercase(port: u16) -> ServerListener {
    let listener = ServerListener::new();
    let sender = listener.sender();
    let callbacks = ServerCallbacks::new().on_receive(move |id, _, data| {
        let _ = sender.send(id, &data.to_ascii_uppercase());
    });
    let config = ServerConfig::new(port).with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    listener.listen(config, callbacks).unwrap();
    listener
}

fn connected_session(addr: SocketAddr, model: ExecutionModel, reconnect: ReconnectConfig) -> ClientSession {
    let config = ClientConfig::new("127.0.0.1", addr.port())
        .with_protocol(Protocol::Tcp)
        .with_execution_model(model)
        .with_reconnect(reconnect);
    let session = ClientSession::new(config).unwrap();
    assert_ok!(session.connect());
    session
}

fn wait_for_state(session: &ClientSession, state: SessionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    session.state() == state
}

#[test]
fn test_server_restart_restores_session() {
    let listener = listen_uppercase(0);
    let addr = listener.local_addr().unwrap();
    let session = connected_session(addr, ExecutionModel::EventLoop, fast_reconnect(-1));

    let (tx, rx) = mpsc::channel();
    session.receive_async(move |result| {
        let _ = tx.send(result);
    });

    assert_ok!(listener.graceful_shutdown());

    let failure = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::ReceiveFailed);
    assert!(matches!(
        session.state(),
        SessionState::Reconnecting | SessionState::Connected
    ));

    // Let at least one attempt hit the closed port before the server returns.
    thread::sleep(Duration::from_millis(250));
    let restarted = listen_uppercase(addr.port());

    assert!(wait_for_state(&session, SessionState::Connected, Duration::from_secs(5)));
    assert_eq!(session.reconnect_attempts(), 0);

    assert_ok!(session.send_sync(b"back again"));
    assert_eq!(&session.receive_sync().unwrap()[..], b"BACK AGAIN");

    drop(session);
    assert_ok!(restarted.graceful_shutdown());
}

#[test]
fn test_blocking_receive_failure_starts_reconnect() {
    let listener = listen_uppercase(0);
    let addr = listener.local_addr().unwrap();
    let session = connected_session(addr, ExecutionModel::Blocking, fast_reconnect(-1));

    assert_ok!(listener.graceful_shutdown());

    let err = session.receive_sync().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReceiveFailed);
    assert_eq!(session.state(), SessionState::Reconnecting);

    // Data operations are refused while the loop is working.
    assert_eq!(session.send_sync(b"x").unwrap_err().kind(), ErrorKind::NotConnected);

    let restarted = listen_uppercase(addr.port());
    assert!(wait_for_state(&session, SessionState::Connected, Duration::from_secs(5)));

    assert_ok!(session.send_sync(b"blocking"));
    assert_eq!(&session.receive_sync().unwrap()[..], b"BLOCKING");
    drop(restarted);
}

#[test]
fn test_finite_retries_give_up() {
    let listener = listen_uppercase(0);
    let addr = listener.local_addr().unwrap();
    let session = connected_session(addr, ExecutionModel::EventLoop, fast_reconnect(2));

    assert_ok!(listener.graceful_shutdown());
    assert_eq!(session.receive_sync().unwrap_err().kind(), ErrorKind::ReceiveFailed);

    // Two attempts at 100ms and 200ms, then the loop stops.
    assert!(wait_for_state(&session, SessionState::Disconnected, Duration::from_secs(3)));
    assert_eq!(session.reconnect_attempts(), 0);

    let _restarted = listen_uppercase(addr.port());
    thread::sleep(Duration::from_millis(500));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_disconnect_cancels_reconnect() {
    let listener = listen_uppercase(0);
    let addr = listener.local_addr().unwrap();
    let session = connected_session(addr, ExecutionModel::EventLoop, fast_reconnect(-1));

    assert_ok!(listener.graceful_shutdown());
    assert_eq!(session.receive_sync().unwrap_err().kind(), ErrorKind::ReceiveFailed);
    assert_eq!(session.state(), SessionState::Reconnecting);

    assert_ok!(session.disconnect());
    assert_eq!(session.state(), SessionState::Disconnected);

    let _restarted = listen_uppercase(addr.port());
    thread::sleep(Duration::from_millis(600));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_reconnect_disabled_stays_disconnected() {
    let listener = listen_uppercase(0);
    let addr = listener.local_addr().unwrap();
    let policy = ReconnectConfig {
        enabled: false,
        ..fast_reconnect(-1)
    };
    let session = connected_session(addr, ExecutionModel::EventLoop, policy);

    assert_ok!(listener.graceful_shutdown());
    assert_eq!(session.receive_sync().unwrap_err().kind(), ErrorKind::ReceiveFailed);
    assert_eq!(session.state(), SessionState::Disconnected);

    // An explicit connect still works once the server is back.
    let restarted = listen_uppercase(addr.port());
    assert_ok!(session.connect());
    assert!(session.is_connected());
    drop(restarted);
}
