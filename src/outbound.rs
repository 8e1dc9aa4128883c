//! TCP outbound session manager
//!
//! Opens the destination connection, writes the first payload, then runs the
//! client → remote writer and the relay pump side by side. When an attempt
//! ends without the remote ever sending a byte, the retry policy decides
//! whether one more attempt goes to the fallback host.

use crate::relay::{remote_to_client, PumpEnd};
use crate::retry::{RetryDecision, RetryPolicy, RetryState, Target};
use crate::socket::ClientSocket;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Byte stream returned by a [`Connector`]
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Connect to `target` and write `first_payload` before anything else
pub async fn connect_and_send(
    connector: &dyn Connector,
    target: &Target,
    first_payload: &[u8],
    tag: &str,
) -> io::Result<BoxedStream> {
    let mut stream = connector.connect(&target.host, target.port).await?;
    log::debug!("{} connected to {}", tag, target);

    if !first_payload.is_empty() {
        stream.write_all(first_payload).await?;
        stream.flush().await?;
    }
    Ok(stream)
}

/// How one attempt ended
enum AttemptEnd {
    Pump(PumpEnd),
    ClientGone,
    ConnectFailed(io::Error),
}

/// Drives the TCP side of one session
pub struct TcpOutbound {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    first_payload: Vec<u8>,
    tag: String,
}

impl TcpOutbound {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        first_payload: Vec<u8>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            policy,
            first_payload,
            tag: tag.into(),
        }
    }

    /// Run attempts until the policy is done, then close the client socket.
    ///
    /// `client_rx` carries every client chunk that follows the header. It stays
    /// bound to whichever connection is current.
    pub async fn run(
        mut self,
        mut client_rx: mpsc::Receiver<Vec<u8>>,
        socket: ClientSocket,
        response_prefix: [u8; 2],
    ) -> RetryState {
        let mut prefix = Some(response_prefix);
        let mut target = self.policy.initial_target();

        let state = loop {
            let mut state = RetryState::default();
            let end = self
                .attempt(&target, &mut client_rx, &socket, &mut prefix, &mut state)
                .await;

            match &end {
                AttemptEnd::Pump(PumpEnd::RemoteClosed) => {}
                AttemptEnd::Pump(PumpEnd::RemoteFailed(e)) => {
                    log::debug!("{} remote {} failed: {}", self.tag, target, e)
                }
                AttemptEnd::Pump(PumpEnd::ClientFailed(_)) | AttemptEnd::ClientGone => {
                    log::debug!("{} client went away", self.tag)
                }
                AttemptEnd::ConnectFailed(e) => {
                    log::warn!("{} connect to {} failed: {}", self.tag, target, e)
                }
            }

            if !socket.is_open() {
                if self.policy.retry_pending() && !state.received_any() {
                    log::debug!("{} client closed, not retrying", self.tag);
                }
                break state;
            }
            match self.policy.on_attempt_finished(state.received_any()) {
                RetryDecision::Retry(next) => {
                    log::info!("{} retry via {}", self.tag, next);
                    target = next;
                }
                RetryDecision::Done => break state,
            }
        };

        log::debug!("{} outbound finished in stage {:?}", self.tag, self.policy.stage());
        socket.safe_close().await;
        state
    }

    async fn attempt(
        &self,
        target: &Target,
        client_rx: &mut mpsc::Receiver<Vec<u8>>,
        socket: &ClientSocket,
        prefix: &mut Option<[u8; 2]>,
        state: &mut RetryState,
    ) -> AttemptEnd {
        let stream =
            match connect_and_send(self.connector.as_ref(), target, &self.first_payload, &self.tag)
                .await
            {
                Ok(stream) => stream,
                Err(e) => return AttemptEnd::ConnectFailed(e),
            };
        let (mut reader, mut writer) = tokio::io::split(stream);

        let pump = remote_to_client(&mut reader, socket, prefix, state, &self.tag);
        let forward = forward_client(client_rx, &mut writer);
        tokio::pin!(pump);
        tokio::pin!(forward);

        tokio::select! {
            end = &mut pump => AttemptEnd::Pump(end),
            res = &mut forward => {
                if let Err(e) = &res {
                    log::debug!("{} write to remote failed: {}", self.tag, e);
                }
                if res.is_ok() && socket.is_open() {
                    // client finished sending; drain what the remote still has
                    AttemptEnd::Pump((&mut pump).await)
                } else {
                    AttemptEnd::ClientGone
                }
            }
        }
    }
}

/// Write client chunks to the remote in order, waiting for each write. Shuts
/// the remote write side down once the client stops sending.
async fn forward_client<W>(rx: &mut mpsc::Receiver<Vec<u8>>, writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
