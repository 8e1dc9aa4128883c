//! End-to-end session tests over in-memory WebSockets

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use vless_relay::header::{self, Destination, HeaderError};
use vless_relay::{
    serve_session, BoxedStream, Connector, DnsResolver, FallbackMode, RelayError, SessionConfig,
    SessionContext, UserId,
};

const ID: &str = "03ce5f91-ddf0-4ebb-9e5e-b2e480a16353";

/// Hands out pre-made remote streams and records every target
#[derive(Default)]
struct MockConnector {
    streams: Mutex<Vec<DuplexStream>>,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    fn with_streams(streams: Vec<DuplexStream>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        self.attempts.lock().unwrap().push(format!("{}:{}", host, port));
        let mut streams = self.streams.lock().unwrap();
        if streams.is_empty() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no route"));
        }
        Ok(Box::new(streams.remove(0)))
    }
}

/// Answers each query with its reversed bytes
#[derive(Default)]
struct ReverseResolver {
    queries: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl DnsResolver for ReverseResolver {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>, RelayError> {
        self.queries.lock().unwrap().push(message.to_vec());
        Ok(message.iter().rev().copied().collect())
    }
}

fn user() -> UserId {
    UserId::parse(ID).unwrap()
}

fn context(
    connector: Arc<MockConnector>,
    resolver: Arc<ReverseResolver>,
    fallback: Option<&str>,
) -> SessionContext {
    let hosts = fallback.map(|h| vec![h.to_string()]).unwrap_or_default();
    let config = SessionConfig::new(user()).with_fallback(hosts, FallbackMode::OnFailure);
    SessionContext::new(config, connector, resolver)
}

async fn ws_pair() -> (
    WebSocketStream<DuplexStream>,
    WebSocketStream<DuplexStream>,
) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

fn request(dest: &Destination, payload: &[u8]) -> Vec<u8> {
    header::encode(0, &user(), dest, payload).unwrap().to_vec()
}

fn record(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

async fn next_binary(ws: &mut WebSocketStream<DuplexStream>) -> Vec<u8> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return data,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected binary message, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_tcp_relay_prefixes_first_response() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let connector = MockConnector::with_streams(vec![local]);
    let ctx = context(connector.clone(), Arc::default(), None);
    let (server, mut client) = ws_pair().await;

    let session = tokio::spawn(async move { serve_session(server, None, ctx, "test").await });

    client
        .send(Message::Binary(request(
            &Destination::tcp("example.com", 80),
            b"GET / HTTP/1.1\r\n\r\n",
        )))
        .await
        .unwrap();

    let mut buf = [0u8; 18];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");

    remote.write_all(b"HTTP/1.1 200 OK").await.unwrap();
    let first = next_binary(&mut client).await;
    assert_eq!(&first[..2], &[0, 0]);
    assert_eq!(&first[2..], b"HTTP/1.1 200 OK");

    client.send(Message::Binary(b"more".to_vec())).await.unwrap();
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"more");

    remote.write_all(b"tail").await.unwrap();
    assert_eq!(next_binary(&mut client).await, b"tail");

    drop(remote);
    session.await.unwrap().unwrap();
    assert_eq!(connector.attempts(), vec!["example.com:80"]);
}

#[tokio::test]
async fn test_silent_destination_falls_back_once() {
    let (silent, silent_remote) = tokio::io::duplex(4096);
    let (backup, mut backup_remote) = tokio::io::duplex(4096);
    let connector = MockConnector::with_streams(vec![silent, backup]);
    let ctx = context(connector.clone(), Arc::default(), Some("cdn.example.org"));
    let (server, mut client) = ws_pair().await;

    let session = tokio::spawn(async move { serve_session(server, None, ctx, "test").await });

    client
        .send(Message::Binary(request(&Destination::tcp("blocked.example", 443), b"hello")))
        .await
        .unwrap();

    // first destination accepts and closes without answering
    drop(silent_remote);

    let mut buf = [0u8; 5];
    backup_remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    backup_remote.write_all(b"world").await.unwrap();

    let data = next_binary(&mut client).await;
    assert_eq!(data, b"\x00\x00world");

    drop(backup_remote);
    session.await.unwrap().unwrap();
    assert_eq!(
        connector.attempts(),
        vec!["blocked.example:443", "cdn.example.org:443"]
    );
}

#[tokio::test]
async fn test_answered_destination_is_not_retried() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let connector = MockConnector::with_streams(vec![local]);
    let ctx = context(connector.clone(), Arc::default(), Some("cdn.example.org"));
    let (server, mut client) = ws_pair().await;

    let session = tokio::spawn(async move { serve_session(server, None, ctx, "test").await });

    client
        .send(Message::Binary(request(&Destination::tcp("10.1.2.3", 22), b"")))
        .await
        .unwrap();
    remote.write_all(b"SSH-2.0").await.unwrap();
    assert_eq!(next_binary(&mut client).await, b"\x00\x00SSH-2.0");
    drop(remote);

    session.await.unwrap().unwrap();
    assert_eq!(connector.attempts(), vec!["10.1.2.3:22"]);
}

#[tokio::test]
async fn test_early_data_carries_header() {
    let (local, mut remote) = tokio::io::duplex(4096);
    let connector = MockConnector::with_streams(vec![local]);
    let ctx = context(connector.clone(), Arc::default(), None);
    let (server, mut client) = ws_pair().await;

    use base64::Engine as _;
    let first = request(&Destination::tcp("example.com", 443), b"0rtt");
    let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&first);

    let session =
        tokio::spawn(async move { serve_session(server, Some(token), ctx, "test").await });

    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"0rtt");

    remote.write_all(b"ok").await.unwrap();
    assert_eq!(next_binary(&mut client).await, b"\x00\x00ok");
    drop(remote);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_early_data_opens_no_connection() {
    let connector = MockConnector::with_streams(Vec::new());
    let ctx = context(connector.clone(), Arc::default(), None);
    let (server, _client) = ws_pair().await;

    let result = serve_session(server, Some("@@not base64@@".into()), ctx, "test").await;

    assert!(matches!(result, Err(RelayError::EarlyData(_))));
    assert!(connector.attempts().is_empty());
}

#[tokio::test]
async fn test_wrong_user_is_rejected() {
    let connector = MockConnector::with_streams(Vec::new());
    let ctx = context(connector.clone(), Arc::default(), None);
    let (server, mut client) = ws_pair().await;

    let stranger = UserId::random();
    let first = header::encode(0, &stranger, &Destination::tcp("example.com", 80), b"")
        .unwrap()
        .to_vec();
    client.send(Message::Binary(first)).await.unwrap();

    let result = serve_session(server, None, ctx, "test").await;
    assert!(matches!(
        result,
        Err(RelayError::Header(HeaderError::InvalidUser))
    ));
    assert!(connector.attempts().is_empty());
}

#[tokio::test]
async fn test_udp_outside_dns_is_rejected() {
    let connector = MockConnector::with_streams(Vec::new());
    let ctx = context(connector.clone(), Arc::default(), None);
    let (server, mut client) = ws_pair().await;

    client
        .send(Message::Binary(request(&Destination::udp("8.8.8.8", 5353), b"")))
        .await
        .unwrap();

    let result = serve_session(server, None, ctx, "test").await;
    match result {
        Err(RelayError::Header(e)) => {
            assert_eq!(e, HeaderError::UdpPortNotAllowed(5353));
            assert!(e.is_policy_rejection());
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(connector.attempts().is_empty());
}

#[tokio::test]
async fn test_dns_flow_reframes_responses() {
    let connector = MockConnector::with_streams(Vec::new());
    let resolver = Arc::new(ReverseResolver::default());
    let ctx = context(connector.clone(), resolver.clone(), None);
    let (server, mut client) = ws_pair().await;

    let session = tokio::spawn(async move { serve_session(server, None, ctx, "test").await });

    // header and first query together, second query split over two messages
    let mut first = request(&Destination::udp("1.1.1.1", 53), &record(b"abc"));
    let second = record(b"wxyz");
    first.extend_from_slice(&second[..3]);
    client.send(Message::Binary(first)).await.unwrap();

    let mut expect = vec![0, 0];
    expect.extend(record(b"cba"));
    assert_eq!(next_binary(&mut client).await, expect);

    client
        .send(Message::Binary(second[3..].to_vec()))
        .await
        .unwrap();
    assert_eq!(next_binary(&mut client).await, record(b"zyxw"));

    client.close(None).await.unwrap();
    session.await.unwrap().unwrap();

    assert_eq!(resolver.queries.lock().unwrap().len(), 2);
    assert!(connector.attempts().is_empty());
}
