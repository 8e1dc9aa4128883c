//! WebSocket listener
//!
//! Accepts TCP connections, performs the upgrade and hands each socket to a
//! session task. The `Sec-WebSocket-Protocol` request header carries the
//! early-data token; it is echoed back so that clients accept the handshake.

use crate::config::RelayConfig;
use crate::dns::DohResolver;
use crate::outbound::TcpConnector;
use crate::session::{serve_session, SessionContext};
use crate::RelayError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_PROTOCOL, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;

/// Upgrade `stream` to a WebSocket, returning it with the early-data token.
///
/// When `ws_path` is set, requests for any other path get a 404.
pub async fn accept_client<S>(
    stream: S,
    ws_path: Option<&str>,
    ws_config: WebSocketConfig,
) -> Result<(WebSocketStream<S>, Option<String>), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut early_data = None;

    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(path) = ws_path {
            if req.uri().path() != path {
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = StatusCode::NOT_FOUND;
                return Err(err);
            }
        }

        if let Some(value) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            early_data = Some(String::from_utf8_lossy(value.as_bytes()).into_owned());
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
        }
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(RelayError::WebSocket)?;

    Ok((ws, early_data))
}

/// Relay server bound to a listen address
pub struct RelayServer {
    listener: TcpListener,
    ctx: SessionContext,
    ws_path: Option<String>,
    ws_config: WebSocketConfig,
}

impl RelayServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &RelayConfig, ctx: SessionContext) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen_addr).await?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = config.websocket.max_message_size;
        ws_config.max_frame_size = config.websocket.max_frame_size;

        Ok(Self {
            listener,
            ctx,
            ws_path: config.ws_path.clone(),
            ws_config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) -> Result<(), RelayError> {
        log::info!("VLESS relay listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Accept error: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("[{}] set_nodelay failed: {}", peer, e);
            }

            let ctx = self.ctx.clone();
            let ws_path = self.ws_path.clone();
            let ws_config = self.ws_config.clone();
            tokio::spawn(async move {
                let (ws, early_data) = match accept_client(stream, ws_path.as_deref(), ws_config).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::debug!("[{}] upgrade failed: {}", peer, e);
                        return;
                    }
                };

                let peer = peer.to_string();
                if let Err(e) = serve_session(ws, early_data, ctx, &peer).await {
                    log::debug!("[{}] session ended with error: {}", peer, e);
                }
            });
        }
    }
}

/// Build the production session context for `config`
pub fn production_context(config: &RelayConfig) -> Result<SessionContext, RelayError> {
    let session = config.session_config()?;
    let resolver = DohResolver::new(config.dns.endpoint.clone(), config.dns.timeout)?;
    log::debug!("dns queries go to {}", resolver.endpoint());
    Ok(SessionContext::new(
        session,
        Arc::new(TcpConnector),
        Arc::new(resolver),
    ))
}

/// Bind and run a relay with TCP outbound and DNS-over-HTTPS
pub async fn serve(config: &RelayConfig) -> Result<(), RelayError> {
    let ctx = production_context(config)?;
    RelayServer::bind(config, ctx).await?.run().await
}
