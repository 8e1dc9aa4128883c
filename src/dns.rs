//! UDP-DNS sub-framer
//!
//! Client bytes for a UDP/53 session are a stream of `[u16 BE length][datagram]`
//! records. Each datagram is sent as a DNS-over-HTTPS query and the answer is
//! framed the same way on the way back.

use crate::socket::ClientSocket;
use crate::RelayError;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::sync::mpsc;

/// Media type of DNS wire-format messages over HTTP
pub const DNS_MESSAGE_TYPE: &str = "application/dns-message";

const LEN_PREFIX: usize = 2;

/// Reassembles length-prefixed records that may span transport chunks
#[derive(Debug, Default)]
pub struct DatagramFramer {
    buf: BytesMut,
}

impl DatagramFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transport chunk
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete datagram, if one is buffered
    pub fn next_datagram(&mut self) -> Option<BytesMut> {
        if self.buf.len() < LEN_PREFIX {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LEN_PREFIX + len {
            return None;
        }
        self.buf.advance(LEN_PREFIX);
        Some(self.buf.split_to(len))
    }

    /// Bytes waiting for the rest of their record
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Frame one response as `[u16 BE length][bytes]`, with `prefix` in front
/// when given. Fails for messages that do not fit the length field.
pub fn frame_response(response: &[u8], prefix: Option<[u8; 2]>) -> Result<Vec<u8>, RelayError> {
    let len = u16::try_from(response.len())
        .map_err(|_| RelayError::Dns(format!("response of {} bytes is too large", response.len())))?;

    let mut out = BytesMut::with_capacity(4 + response.len());
    if let Some(p) = prefix {
        out.put_slice(&p);
    }
    out.put_u16(len);
    out.put_slice(response);
    Ok(out.to_vec())
}

/// Resolves one DNS wire-format query
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>, RelayError>;
}

/// DNS-over-HTTPS resolver
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Dns(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn query(&self, message: &[u8]) -> Result<Vec<u8>, RelayError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_TYPE)
            .body(message.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::Dns(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Dns(format!("resolver answered {}", status)));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| RelayError::Dns(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Runs the DNS flow of one session
pub struct DnsRelay<'a> {
    resolver: &'a dyn DnsResolver,
    socket: &'a ClientSocket,
    prefix: Option<[u8; 2]>,
    framer: DatagramFramer,
    tag: &'a str,
    answered: usize,
}

impl<'a> DnsRelay<'a> {
    pub fn new(
        resolver: &'a dyn DnsResolver,
        socket: &'a ClientSocket,
        response_prefix: [u8; 2],
        tag: &'a str,
    ) -> Self {
        Self {
            resolver,
            socket,
            prefix: Some(response_prefix),
            framer: DatagramFramer::new(),
            tag,
            answered: 0,
        }
    }

    /// Feed `first` and then every chunk from `rx`. Queries are answered one at
    /// a time, in order. Returns the number of responses written.
    pub async fn run(mut self, first: &[u8], mut rx: mpsc::Receiver<Vec<u8>>) -> usize {
        self.handle_chunk(first).await;
        while let Some(chunk) = rx.recv().await {
            self.handle_chunk(&chunk).await;
        }
        if self.framer.pending() > 0 {
            log::debug!(
                "{} dropping {} bytes of incomplete dns record",
                self.tag,
                self.framer.pending()
            );
        }
        self.answered
    }

    async fn handle_chunk(&mut self, chunk: &[u8]) {
        self.framer.push(chunk);
        while let Some(query) = self.framer.next_datagram() {
            self.answer(&query).await;
        }
    }

    async fn answer(&mut self, query: &[u8]) {
        let response = match self.resolver.query(query).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{} dns query failed: {}", self.tag, e);
                return;
            }
        };

        if !self.socket.is_open() {
            return;
        }

        let frame = match frame_response(&response, self.prefix) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{} {}", self.tag, e);
                return;
            }
        };
        log::debug!("{} doh success and dns message length is {}", self.tag, response.len());

        match self.socket.send(frame).await {
            Ok(()) => {
                self.prefix = None;
                self.answered += 1;
            }
            Err(e) => log::debug!("{} dns response not delivered: {}", self.tag, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    /// Answers every query with `ans:` + query, remembering what it saw
    #[derive(Default)]
    struct EchoResolver {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DnsResolver for EchoResolver {
        async fn query(&self, message: &[u8]) -> Result<Vec<u8>, RelayError> {
            self.seen.lock().unwrap().push(message.to_vec());
            if message == b"fail" {
                return Err(RelayError::Dns("upstream down".into()));
            }
            let mut out = b"ans:".to_vec();
            out.extend_from_slice(message);
            Ok(out)
        }
    }

    fn socket() -> (ClientSocket, fmpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = fmpsc::unbounded();
        (
            ClientSocket::new(tx.sink_map_err(|_| WsError::ConnectionClosed)),
            rx,
        )
    }

    #[test]
    fn test_two_records_in_one_chunk() {
        let mut framer = DatagramFramer::new();
        let mut chunk = record(b"first");
        chunk.extend(record(b"second"));
        framer.push(&chunk);

        assert_eq!(&framer.next_datagram().unwrap()[..], b"first");
        assert_eq!(&framer.next_datagram().unwrap()[..], b"second");
        assert!(framer.next_datagram().is_none());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_record_split_across_chunks() {
        let mut framer = DatagramFramer::new();
        let rec = record(b"split-query");

        framer.push(&rec[..1]);
        assert!(framer.next_datagram().is_none());
        framer.push(&rec[1..6]);
        assert!(framer.next_datagram().is_none());
        framer.push(&rec[6..]);
        assert_eq!(&framer.next_datagram().unwrap()[..], b"split-query");
    }

    #[test]
    fn test_empty_record() {
        let mut framer = DatagramFramer::new();
        framer.push(&[0, 0, 0, 1, 7]);
        assert!(framer.next_datagram().unwrap().is_empty());
        assert_eq!(&framer.next_datagram().unwrap()[..], &[7]);
    }

    #[test]
    fn test_frame_response() {
        assert_eq!(
            frame_response(b"abc", Some([0, 0])).unwrap(),
            vec![0, 0, 0, 3, b'a', b'b', b'c']
        );
        assert_eq!(frame_response(b"abc", None).unwrap(), vec![0, 3, b'a', b'b', b'c']);
        assert!(frame_response(&vec![0u8; 70_000], None).is_err());
    }

    #[tokio::test]
    async fn test_prefix_on_first_response_only() {
        let resolver = EchoResolver::default();
        let (sock, mut out) = socket();
        let (tx, rx) = mpsc::channel(4);

        let mut first = record(b"q1");
        first.extend(record(b"q2"));
        let rest = record(b"q3");
        tx.send(rest[..3].to_vec()).await.unwrap();
        tx.send(rest[3..].to_vec()).await.unwrap();
        drop(tx);

        let answered = DnsRelay::new(&resolver, &sock, [0, 0], "[t]")
            .run(&first, rx)
            .await;
        assert_eq!(answered, 3);
        assert_eq!(resolver.seen.lock().unwrap().len(), 3);

        let mut expect = vec![0, 0];
        expect.extend(record(b"ans:q1"));
        assert_eq!(out.next().await, Some(Message::Binary(expect)));
        assert_eq!(out.next().await, Some(Message::Binary(record(b"ans:q2"))));
        assert_eq!(out.next().await, Some(Message::Binary(record(b"ans:q3"))));
    }

    #[tokio::test]
    async fn test_failed_query_is_skipped() {
        let resolver = EchoResolver::default();
        let (sock, mut out) = socket();
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(_tx);

        let mut first = record(b"fail");
        first.extend(record(b"ok"));
        let answered = DnsRelay::new(&resolver, &sock, [0, 0], "[t]")
            .run(&first, rx)
            .await;

        assert_eq!(answered, 1);
        let mut expect = vec![0, 0];
        expect.extend(record(b"ans:ok"));
        assert_eq!(out.next().await, Some(Message::Binary(expect)));
    }

    #[tokio::test]
    async fn test_closed_socket_skips_silently() {
        let resolver = EchoResolver::default();
        let (sock, _out) = socket();
        sock.safe_close().await;
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(tx);

        let answered = DnsRelay::new(&resolver, &sock, [0, 0], "[t]")
            .run(&record(b"q"), rx)
            .await;
        assert_eq!(answered, 0);
        assert_eq!(resolver.seen.lock().unwrap().len(), 1);
    }

    /// Serve one HTTP request on a local port with a canned `reply`. An empty
    /// reply never answers. The handle yields the raw request.
    async fn canned_http(reply: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/dns-query", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before the request was complete");
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .map(|v| v.trim().parse::<usize>().unwrap())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            if reply.is_empty() {
                std::future::pending::<()>().await;
            }
            stream.write_all(reply).await.unwrap();
            stream.flush().await.unwrap();
            request
        });

        (endpoint, handle)
    }

    #[tokio::test]
    async fn test_doh_posts_dns_message() {
        let (endpoint, server) = canned_http(
            b"HTTP/1.1 200 OK\r\ncontent-type: application/dns-message\r\ncontent-length: 4\r\nconnection: close\r\n\r\n\x12\x34\x81\x80",
        )
        .await;
        let resolver = DohResolver::new(endpoint.clone(), Duration::from_secs(5)).unwrap();
        assert_eq!(resolver.endpoint(), endpoint);

        let query = b"\x12\x34\x01\x00\x00\x01".to_vec();
        let answer = resolver.query(&query).await.unwrap();
        assert_eq!(answer, b"\x12\x34\x81\x80");

        let request = server.await.unwrap();
        let split = request
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        let head = String::from_utf8_lossy(&request[..split]).to_ascii_lowercase();
        assert!(head.starts_with("post /dns-query http/1.1"));
        assert!(head.contains("content-type: application/dns-message"));
        assert!(head.contains("accept: application/dns-message"));
        assert_eq!(&request[split + 4..], &query[..]);
    }

    #[tokio::test]
    async fn test_doh_error_status() {
        let (endpoint, _server) = canned_http(
            b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let resolver = DohResolver::new(endpoint, Duration::from_secs(5)).unwrap();

        match resolver.query(b"\x00\x01").await {
            Err(RelayError::Dns(msg)) => assert!(msg.contains("500")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_doh_timeout() {
        let (endpoint, _server) = canned_http(b"").await;
        let resolver = DohResolver::new(endpoint, Duration::from_millis(200)).unwrap();

        assert!(matches!(
            resolver.query(b"\x00\x01").await,
            Err(RelayError::Dns(_))
        ));
    }
}
