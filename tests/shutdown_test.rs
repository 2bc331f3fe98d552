//! Tests for listener binding errors and graceful shutdown

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netbridge::{ErrorKind, ExecutionModel, Protocol, ServerCallbacks, ServerConfig, ServerListener};
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Connect(u64),
    Receive(u64),
    Disconnect(u64),
}

fn recording_callbacks(events: &Arc<Mutex<Vec<Event>>>) -> ServerCallbacks {
    let on_connect = Arc::clone(events);
    let on_receive = Arc::clone(events);
    let on_disconnect = Arc::clone(events);
    ServerCallbacks::new()
        .on_connect(move |id, _| on_connect.lock().unwrap().push(Event::Connect(id)))
        .on_receive(move |id, _, _| on_receive.lock().unwrap().push(Event::Receive(id)))
        .on_disconnect(move |id, _| on_disconnect.lock().unwrap().push(Event::Disconnect(id)))
}

fn loopback(port: u16, protocol: Protocol, model: ExecutionModel) -> ServerConfig {
    ServerConfig::new(port)
        .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_protocol(protocol)
        .with_execution_model(model)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn count(events: &Mutex<Vec<Event>>, matches: impl Fn(&Event) -> bool) -> usize {
    events.lock().unwrap().iter().filter(|event| matches(event)).count()
}

#[test]
fn test_shutdown_disconnects_every_client() {
    for model in [ExecutionModel::EventLoop, ExecutionModel::Blocking] {
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = ServerListener::new();
        listener
            .listen(loopback(0, Protocol::Tcp, model), recording_callbacks(&events))
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        assert!(wait_until(Duration::from_secs(2), || listener.connections().len() == 3));

        assert_ok!(listener.graceful_shutdown());

        // Fired synchronously, before graceful_shutdown returned.
        let mut closed: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Disconnect(id) => Some(*id),
                _ => None,
            })
            .collect();
        closed.sort_unstable();
        assert_eq!(closed, vec![1, 2, 3], "model {:?}", model);
        assert!(listener.connections().is_empty());
        assert_eq!(listener.stats().active_connections, 0);
    }
}

#[test]
fn test_no_callbacks_after_shutdown() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let listener = ServerListener::new();
    listener
        .listen(
            loopback(0, Protocol::Tcp, ExecutionModel::EventLoop),
            recording_callbacks(&events),
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count(&events, |e| matches!(e, Event::Connect(_))) == 1));

    assert_ok!(listener.graceful_shutdown());
    assert_ok!(listener.graceful_shutdown());
    let seen = events.lock().unwrap().len();

    use std::io::Write;
    let _ = client.write_all(b"too late");

    thread::sleep(Duration::from_millis(300));
    assert_eq!(events.lock().unwrap().len(), seen);
}

#[test]
fn test_send_to_unknown_or_closed_connection() {
    let listener = ServerListener::new();
    listener
        .listen(loopback(0, Protocol::Tcp, ExecutionModel::EventLoop), ServerCallbacks::new())
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let err = assert_err!(listener.send(999, b"nobody"));
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    let client = TcpStream::connect(addr).unwrap();
    let local: SocketAddr = client.local_addr().unwrap();
    assert!(wait_until(Duration::from_secs(2), || listener.connections().len() == 1));

    let id = listener.connections()[0].id;
    assert_ok!(listener.send(id, b"hi"));
    assert_ok!(listener.send_to_address(local, b"hi again"));

    assert_ok!(listener.graceful_shutdown());
    assert_eq!(listener.send(id, b"gone").unwrap_err().kind(), ErrorKind::NotConnected);
}

#[test]
fn test_port_in_use() {
    for protocol in [Protocol::Tcp, Protocol::Udp] {
        let first = ServerListener::new();
        first
            .listen(loopback(0, protocol, ExecutionModel::EventLoop), ServerCallbacks::new())
            .unwrap();
        let port = first.local_addr().unwrap().port();

        let second = ServerListener::new();
        let err = assert_err!(second.listen(
            loopback(port, protocol, ExecutionModel::EventLoop),
            ServerCallbacks::new()
        ));
        assert_eq!(err.kind(), ErrorKind::PortInUse, "{:?}", protocol);
        assert!(!second.is_listening());
    }
}

#[test]
fn test_ids_not_reused_across_restarts() {
    let ids = Arc::new(AtomicUsize::new(0));
    let listener = ServerListener::new();

    for expected in 1..=2u64 {
        let last = Arc::clone(&ids);
        let callbacks = ServerCallbacks::new().on_connect(move |id, _| last.store(id as usize, Ordering::SeqCst));
        listener
            .listen(loopback(0, Protocol::Tcp, ExecutionModel::Blocking), callbacks)
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_until(Duration::from_secs(2), || ids.load(Ordering::SeqCst) == expected as usize));
        assert_ok!(listener.graceful_shutdown());
    }

    assert_eq!(listener.stats().total_connections, 2);
}
