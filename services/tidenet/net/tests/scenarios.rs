//! End-to-end behavior of the facades over loopback sockets.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tide_net::{
    client_config, server_config, Client, Configure, NetError, Server, SessionEntry, TlsOptions,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn echo(server: &Server) {
    server.set_receive_cb(|session, data| {
        session.send(data.to_vec());
        Ok(data.len())
    });
}

fn collecting(client: &Client) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.set_receive_cb(move |_, data| {
        let _ = tx.send(data.to_vec());
        Ok(data.len())
    });
    rx
}

async fn read_total(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < len {
        let chunk = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for bytes")
            .expect("channel closed");
        got.extend_from_slice(&chunk);
    }
    got
}

#[tokio::test]
async fn scenario_a_ephemeral_port_and_connect() {
    let server = Server::new();
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();
    assert_ne!(local.port(), 0);
    assert_eq!(server.local_addr(), Some(local.clone()));

    let client = Client::new();
    let entry = client
        .connect(&format!("tcp://127.0.0.1:{}", local.port()))
        .await
        .unwrap();
    assert!(entry.is_established());
    assert!(client.is_established());
    assert_eq!(client.remote_addr().map(|r| r.port()), Some(local.port()));
    assert!(client.local_addr().is_some());

    eventually(|| server.session_count() == 1).await;
    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_b_timeout_on_unsent_message_keeps_session() {
    // Accepts and never reads
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let client = Client::new();
    client.set_send_timeout(Some(Duration::from_millis(50)));
    client
        .connect(&format!("tcp://127.0.0.1:{port}"))
        .await
        .unwrap();

    // Fill the socket buffers so nothing behind this can be written
    client.send(vec![0u8; 32 * 1024 * 1024]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    client.send_with(vec![1u8; 10], move |r| {
        let _ = tx.send((r, started.elapsed()));
    });

    let (result, elapsed) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(result, Err(NetError::SendTimeout)), "got {result:?}");
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "fired late: {elapsed:?}");
    assert!(client.is_established());

    client.shutdown(true);
    holder.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_c_admission_limit() {
    let connected = Arc::new(AtomicUsize::new(0));
    let received_from = Arc::new(Mutex::new(Vec::<SessionEntry>::new()));

    let server = Server::new();
    let c = connected.clone();
    let r = received_from.clone();
    server
        .set_max_connections(1)
        .set_connected_cb(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .set_receive_cb(move |session, data| {
            r.lock().push(session.clone());
            Ok(data.len())
        });
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();
    let url = local.to_string();

    let first = Client::new();
    let second = Client::new();
    let (a, b) = tokio::join!(first.connect(&url), second.connect(&url));
    a.unwrap();
    b.unwrap();

    // Exactly one of the two is closed by the server
    eventually(|| first.is_established() != second.is_established()).await;
    first.send(&b"one"[..]);
    second.send(&b"two"[..]);
    eventually(|| !received_from.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(server.session_count(), 1);
    let senders = received_from.lock();
    assert!(senders.iter().all(|s| *s == senders[0]));
    drop(senders);

    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_d_unconsumed_byte_is_represented() {
    const COUNT: usize = 1000;

    struct Trace {
        tail: Option<u8>,
        consumed: Vec<u8>,
    }
    let trace = Arc::new(Mutex::new(Trace {
        tail: None,
        consumed: Vec::new(),
    }));
    let broken = Arc::new(AtomicBool::new(false));

    let server = Server::new();
    let (t, bad) = (trace.clone(), broken.clone());
    server.set_receive_cb(move |_, data| {
        let mut trace = t.lock();
        if let Some(tail) = trace.tail {
            if data[0] != tail {
                bad.store(true, Ordering::SeqCst);
            }
        }
        let keep = data.len() - 1;
        trace.consumed.extend_from_slice(&data[..keep]);
        trace.tail = Some(data[keep]);
        Ok(keep)
    });
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    client.connect(&local.to_string()).await.unwrap();
    let sent: Vec<u8> = (0..COUNT).map(|i| (i % 251) as u8).collect();
    for byte in &sent {
        client.send(vec![*byte]);
    }

    eventually(|| trace.lock().consumed.len() == COUNT - 1).await;
    assert!(!broken.load(Ordering::SeqCst));

    let trace = trace.lock();
    let mut seen = trace.consumed.clone();
    seen.push(trace.tail.unwrap());
    assert_eq!(seen, sent);
    drop(trace);

    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn p1_fifo_bytes_and_completions() {
    let server = Server::new();
    echo(&server);
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();

    let client = Client::new();
    let mut rx = collecting(&client);
    client.connect(&local.to_string()).await.unwrap();

    let completions = Arc::new(Mutex::new(Vec::new()));
    let mut expected = Vec::new();
    for i in 0..200usize {
        let payload: Vec<u8> = std::iter::repeat((i % 256) as u8).take(1 + i * 37 % 3000).collect();
        expected.extend_from_slice(&payload);
        let c = completions.clone();
        client.send_with(payload, move |r| {
            assert!(r.is_ok());
            c.lock().push(i);
        });
    }

    let echoed = read_total(&mut rx, expected.len()).await;
    assert_eq!(echoed, expected);
    eventually(|| completions.lock().len() == 200).await;
    assert_eq!(*completions.lock(), (0..200).collect::<Vec<_>>());

    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn p2_every_message_completes_once_under_failure() {
    const COUNT: usize = 500;

    // Kill the session as soon as anything arrives
    let server = Server::new();
    server.set_receive_cb(|session, data| {
        session.shutdown(true);
        Ok(data.len())
    });
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();

    let (tx, mut disconnected) = mpsc::unbounded_channel();
    let client = Client::new();
    client.set_disconnected_cb(move |_, err| {
        let _ = tx.send(err.clone());
    });
    client.connect(&local.to_string()).await.unwrap();

    let fired: Arc<Vec<AtomicU8>> = Arc::new((0..COUNT).map(|_| AtomicU8::new(0)).collect());
    for i in 0..COUNT {
        let f = fired.clone();
        client.send_with(vec![7u8; 4096], move |_| {
            f[i].fetch_add(1, Ordering::SeqCst);
        });
    }

    tokio::time::timeout(WAIT, disconnected.recv()).await.unwrap().unwrap();
    // Late sends still complete exactly once
    let late = Arc::new(AtomicU8::new(0));
    let l = late.clone();
    client.send_with(&b"late"[..], move |r| {
        assert!(r.is_err());
        l.fetch_add(1, Ordering::SeqCst);
    });

    assert!(fired.iter().all(|f| f.load(Ordering::SeqCst) == 1));
    assert_eq!(late.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fired.iter().all(|f| f.load(Ordering::SeqCst) == 1));
    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn p5_concurrent_failures_disconnect_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let client = Client::new();
    let d = disconnects.clone();
    client.set_disconnected_cb(move |_, _| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let url = format!("tcp://127.0.0.1:{port}");
    let (accepted, connected) = tokio::join!(listener.accept(), client.connect(&url));
    connected.unwrap();
    let (peer, _) = accepted.unwrap();

    for _ in 0..64 {
        client.send(vec![0u8; 64 * 1024]);
    }
    // Abortive close: both pipelines see an error
    socket2::SockRef::from(&peer)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(peer);

    eventually(|| disconnects.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(!client.is_established());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_echo_round_trip() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = certified.cert.pem();
    let key_pem = certified.key_pair.serialize_pem();

    let server = Server::new();
    echo(&server);
    server.set_tls(TlsOptions {
        server: Some(server_config(&cert_pem, &key_pem, None).unwrap()),
        ..TlsOptions::default()
    });
    let local = server.start("tls://127.0.0.1:0").await.unwrap();
    assert_eq!(local.scheme(), tide_net::Scheme::Tls);

    let client = Client::new();
    client.set_tls(TlsOptions {
        client: Some(client_config(&cert_pem).unwrap()),
        server_name: Some("localhost".to_string()),
        ..TlsOptions::default()
    });
    let mut rx = collecting(&client);
    client.connect(&local.to_string()).await.unwrap();

    client.send(&b"over tls"[..]);
    // The fast path falls back to the queue on secure sessions
    client.send_no_delay(&b" and again"[..]);
    let echoed = read_total(&mut rx, 18).await;
    assert_eq!(echoed, b"over tls and again");

    server.shutdown(true).await;
}

#[tokio::test]
async fn tls_handshake_failure_is_silent() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let connected = Arc::new(AtomicUsize::new(0));

    let server = Server::new();
    let c = connected.clone();
    server.set_connected_cb(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    server.set_tls(TlsOptions {
        server: Some(
            server_config(&certified.cert.pem(), &certified.key_pair.serialize_pem(), None)
                .unwrap(),
        ),
        ..TlsOptions::default()
    });
    let local = server.start("tls://127.0.0.1:0").await.unwrap();

    // Plain TCP client talking to a TLS listener
    let client = Client::new();
    client
        .connect(&format!("tcp://127.0.0.1:{}", local.port()))
        .await
        .unwrap();
    client.send(&b"definitely not a client hello"[..]);

    eventually(|| !client.is_established()).await;
    assert_eq!(connected.load(Ordering::SeqCst), 0);
    assert_eq!(server.session_count(), 0);
    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_echo_through_facades() {
    let server = Server::new();
    echo(&server);
    let local = server.start("udp://127.0.0.1:0").await.unwrap();
    assert_ne!(local.port(), 0);

    let client = Client::new();
    let mut rx = collecting(&client);
    client.connect(&local.to_string()).await.unwrap();
    assert!(client.is_established());

    client.send(&b"datagram"[..]);
    let echoed = read_total(&mut rx, 8).await;
    assert_eq!(echoed, b"datagram");
    assert_eq!(server.session_count(), 0);

    server.shutdown(true).await;
    client.shutdown(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn options_set_after_start_reach_new_sessions() {
    let server = Server::new();
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();
    // Installed after the engine exists
    echo(&server);

    let client = Client::new();
    let mut rx = collecting(&client);
    client.connect(&local.to_string()).await.unwrap();
    client.send(&b"late options"[..]);
    assert_eq!(read_total(&mut rx, 12).await, b"late options");

    server.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_server_shutdown_closes_clients() {
    let server = Server::new();
    let local = server.start("tcp://127.0.0.1:0").await.unwrap();

    let (tx, mut disconnected) = mpsc::unbounded_channel();
    let client = Client::new();
    client.set_disconnected_cb(move |_, err| {
        let _ = tx.send(err.clone());
    });
    client.connect(&local.to_string()).await.unwrap();
    eventually(|| server.session_count() == 1).await;

    // Returns only after the client has closed its side as well
    tokio::time::timeout(WAIT, server.shutdown(false)).await.unwrap();

    let err = tokio::time::timeout(WAIT, disconnected.recv()).await.unwrap().unwrap();
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::UnexpectedEof));
    assert!(!client.is_established());
}
