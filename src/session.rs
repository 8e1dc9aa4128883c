//! Per-connection session
//!
//! One session per accepted WebSocket. The first client chunk carries the
//! request header; everything after it goes to the outbound side, which is
//! bound exactly once: a TCP connection with fallback, or the DNS flow.

use crate::config::SessionConfig;
use crate::dns::{DnsRelay, DnsResolver};
use crate::header::{self, Destination};
use crate::ingress::IngressStream;
use crate::outbound::{Connector, TcpOutbound};
use crate::retry::RetryPolicy;
use crate::socket::ClientSocket;
use crate::RelayError;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;

/// Shared, read-only state handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub connector: Arc<dyn Connector>,
    pub resolver: Arc<dyn DnsResolver>,
}

impl SessionContext {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            resolver,
        }
    }
}

/// Log prefix for a session once its destination is known
pub fn session_tag(dest: &Destination) -> String {
    format!(
        "[{}:{}--{:04x} {}]",
        dest.host,
        dest.port,
        rand::random::<u16>(),
        if dest.is_udp { "udp" } else { "tcp" }
    )
}

/// Serve one accepted WebSocket until both directions are done.
///
/// `early_data` is the raw `Sec-WebSocket-Protocol` value, if any. `peer` only
/// labels log lines before the destination is known.
pub async fn serve_session<S>(
    ws: WebSocketStream<S>,
    early_data: Option<String>,
    ctx: SessionContext,
    peer: &str,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let socket = ClientSocket::new(sink);
    let mut ingress = IngressStream::start(
        stream,
        socket.clone(),
        early_data.as_deref(),
        ctx.config.ingress_capacity,
    );

    let first = match ingress.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => {
            log::warn!("[{}] {}", peer, e);
            ingress.cancel(&e.to_string()).await;
            return Err(e);
        }
        None => {
            log::debug!("[{}] client closed before sending a header", peer);
            return Ok(());
        }
    };

    let request = match header::parse(&first, &ctx.config.user_id) {
        Ok(request) => request,
        Err(e) => {
            if e.is_policy_rejection() {
                log::warn!("[{}] rejected: {}", peer, e);
            } else {
                log::warn!("[{}] bad header: {}", peer, e);
            }
            ingress.cancel(&e.to_string()).await;
            return Err(e.into());
        }
    };

    let dest = request.destination.clone();
    let tag = session_tag(&dest);
    let payload = first[request.payload_offset..].to_vec();
    let prefix = request.response_prefix();
    log::info!("{} accepted from {}", tag, peer);

    let (tx, rx) = mpsc::channel(1);

    if dest.is_dns() {
        let relay = DnsRelay::new(ctx.resolver.as_ref(), &socket, prefix, &tag);
        let answered = drive(&mut ingress, tx, relay.run(&payload, rx), &tag).await;
        log::debug!("{} dns flow finished after {} responses", tag, answered);
    } else {
        let policy = RetryPolicy::new(
            dest.host.as_str(),
            dest.port,
            ctx.config.pick_fallback(),
            ctx.config.fallback_mode,
        );
        let outbound = TcpOutbound::new(Arc::clone(&ctx.connector), policy, payload, tag.as_str());
        let state = drive(&mut ingress, tx, outbound.run(rx, socket.clone(), prefix), &tag).await;
        log::debug!("{} tcp flow finished, {} bytes from remote", tag, state.bytes_received);
    }

    ingress.cancel("session finished").await;
    Ok(())
}

/// Forward client chunks into `tx` while `work` runs. Client end of stream
/// closes `tx`; `work` finishing first stops the forwarding.
async fn drive<F>(
    ingress: &mut IngressStream,
    tx: mpsc::Sender<Vec<u8>>,
    work: F,
    tag: &str,
) -> F::Output
where
    F: Future,
{
    let forward = forward_ingress(ingress, tx, tag);
    tokio::pin!(forward);
    tokio::pin!(work);

    tokio::select! {
        _ = &mut forward => (&mut work).await,
        out = &mut work => out,
    }
}

async fn forward_ingress(ingress: &mut IngressStream, tx: mpsc::Sender<Vec<u8>>, tag: &str) {
    while let Some(item) = ingress.next().await {
        match item {
            Ok(chunk) => {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("{} client stream failed: {}", tag, e);
                break;
            }
        }
    }
}
