//! ---
//! iocman_section: "02-control-plane"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Process-daemon control-plane client and wire codec."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use iocman_control::{ControlPlane, DaemonFault, ProcessState, SupervisorClient, UnixSocketTransport};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const RUNNING_INFO: &str = "<?xml version='1.0'?><methodResponse><params><param><value><struct>\
<member><name>name</name><value><string>magnet1</string></value></member>\
<member><name>group</name><value><string>magnet1</string></value></member>\
<member><name>state</name><value><int>20</int></value></member>\
<member><name>statename</name><value><string>RUNNING</string></value></member>\
<member><name>pid</name><value><int>4242</int></value></member>\
</struct></value></param></params></methodResponse>";

/// Read one HTTP request from the stream, returning its body. `None` on EOF.
async fn read_request(stream: &mut UnixStream) -> Option<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };
    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0);
    while buffer.len() < header_end + length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    Some(String::from_utf8_lossy(&buffer[header_end..header_end + length]).into_owned())
}

async fn write_response(stream: &mut UnixStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Fake daemon answering every request with process info. When
/// `close_after_each` is set it drops the connection after one response.
fn spawn_daemon(path: &Path, close_after_each: bool) -> Arc<AtomicUsize> {
    let listener = UnixListener::bind(path).expect("bind socket");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(body) = read_request(&mut stream).await {
                    assert!(body.contains("supervisor.getProcessInfo"));
                    write_response(&mut stream, RUNNING_INFO).await;
                    if close_after_each {
                        break;
                    }
                }
            });
        }
    });
    connections
}

const STARTED: &str = "<?xml version='1.0'?><methodResponse><params><param>\
<value><boolean>1</boolean></value></param></params></methodResponse>";

/// Fake daemon serving each connection on its own task. `startProcess` holds
/// its answer for `start_delay`, like supervisord waiting for the process to
/// settle; `getProcessInfo` answers at once.
fn spawn_blocking_start_daemon(path: &Path, start_delay: Duration) -> Arc<AtomicUsize> {
    let listener = UnixListener::bind(path).expect("bind socket");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(body) = read_request(&mut stream).await {
                    if body.contains("supervisor.startProcess") {
                        tokio::time::sleep(start_delay).await;
                        write_response(&mut stream, STARTED).await;
                    } else {
                        write_response(&mut stream, RUNNING_INFO).await;
                    }
                }
            });
        }
    });
    connections
}

#[tokio::test]
async fn reuses_one_connection_for_sequential_calls() {
    let dir = tempdir().expect("tempdir");
    let socket = dir.path().join("supervisor.sock");
    let connections = spawn_daemon(&socket, false);

    let client = SupervisorClient::new(
        Arc::new(UnixSocketTransport::new(&socket)),
        Duration::from_secs(2),
    );
    for _ in 0..3 {
        let info = client.query_state("magnet1").await.expect("query succeeds");
        assert_eq!(info.state, ProcessState::Running);
        assert_eq!(info.pid, 4242);
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnects_after_the_daemon_drops_the_connection() {
    let dir = tempdir().expect("tempdir");
    let socket = dir.path().join("supervisor.sock");
    let connections = spawn_daemon(&socket, true);

    let client = SupervisorClient::new(
        Arc::new(UnixSocketTransport::new(&socket)),
        Duration::from_secs(2),
    );
    client.query_state("magnet1").await.expect("first call");
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.query_state("magnet1").await.expect("second call");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_socket_is_unreachable() {
    let dir = tempdir().expect("tempdir");
    let client = SupervisorClient::new(
        Arc::new(UnixSocketTransport::new(dir.path().join("absent.sock"))),
        Duration::from_secs(1),
    );
    assert!(matches!(
        client.start("magnet1").await,
        Err(DaemonFault::Unreachable(_))
    ));
}

#[tokio::test]
async fn slow_start_does_not_hold_back_a_concurrent_query() {
    let dir = tempdir().expect("tempdir");
    let socket = dir.path().join("supervisor.sock");
    let connections = spawn_blocking_start_daemon(&socket, Duration::from_secs(2));

    let client = SupervisorClient::new(
        Arc::new(UnixSocketTransport::new(&socket)),
        Duration::from_secs(10),
    );
    let starter = client.clone();
    let start = tokio::spawn(async move { starter.start("magnet1").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let began = Instant::now();
    let info = tokio::time::timeout(Duration::from_secs(1), client.query_state("flow"))
        .await
        .expect("query answered while start is in flight")
        .expect("query succeeds");
    assert_eq!(info.state, ProcessState::Running);
    assert!(began.elapsed() < Duration::from_secs(1));
    assert!(!start.is_finished());

    start.await.expect("start task").expect("start succeeds");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abandoned_request_does_not_return_its_connection() {
    let dir = tempdir().expect("tempdir");
    let socket = dir.path().join("supervisor.sock");
    let connections = spawn_blocking_start_daemon(&socket, Duration::from_secs(30));

    let transport = Arc::new(UnixSocketTransport::new(&socket));
    let client = SupervisorClient::new(transport.clone(), Duration::from_secs(10));
    client.query_state("magnet1").await.expect("warm up");
    assert_eq!(transport.idle_connections(), 1);

    let abandoned = tokio::time::timeout(Duration::from_millis(200), client.start("magnet1")).await;
    assert!(abandoned.is_err());
    assert_eq!(transport.idle_connections(), 0);

    client.query_state("magnet1").await.expect("fresh connection");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}
