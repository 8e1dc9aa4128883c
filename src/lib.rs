//! VLESS over WebSocket relay
//!
//! Tunnels one TCP connection (or a stream of DNS queries) per WebSocket,
//! using the VLESS request header to name the real destination.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use vless_relay::{RelayConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig {
//!         user_id: "03ce5f91-ddf0-4ebb-9e5e-b2e480a16353".to_string(),
//!         ..Default::default()
//!     };
//!     server::serve(&config).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Generate an identity
//! vless-relay gen-id
//!
//! # Serve with a fallback host for silent destinations
//! vless-relay serve --bind 0.0.0.0:8080 --uuid <ID> --fallback cdn.example.org
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws   ┌─────────┐ header ┌──────────┐  tcp  ┌─────────────┐
//! │  Client  │──────▶│ Ingress │───────▶│ Outbound │──────▶│ Destination │
//! └──────────┘       └─────────┘        └──────────┘       └─────────────┘
//!      ▲                                  │      │ udp/53
//!      │            ┌───────┐             │      ▼
//!      └────────────│ Relay │◀────────────┘  ┌──────────┐
//!                   └───────┘                │   DoH    │
//!                                            └──────────┘
//! ```

pub mod config;
pub mod dns;
pub mod early_data;
pub mod header;
pub mod identity;
pub mod ingress;
pub mod outbound;
pub mod relay;
pub mod retry;
pub mod server;
pub mod session;
pub mod socket;

// Re-export core types
pub use config::{FallbackMode, RelayConfig, SessionConfig};
pub use dns::{DatagramFramer, DnsResolver, DohResolver};
pub use early_data::{decode_early_data, EarlyDataError};
pub use header::{Command, Destination, HeaderError, RequestHeader};
pub use identity::{IdentityError, UserId};
pub use ingress::IngressStream;
pub use outbound::{BoxedStream, Connector, TcpConnector};
pub use retry::{RetryPolicy, RetryState};
pub use server::RelayServer;
pub use session::{serve_session, SessionContext};
pub use socket::{ClientSocket, ReadyState};

/// Relay error types
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed or rejected request header
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// Early data token could not be decoded
    #[error("{0}")]
    EarlyData(#[from] EarlyDataError),

    /// Outbound connect, read or write failed
    #[error("IO error: {0}")]
    Transport(#[from] std::io::Error),

    /// Client WebSocket failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// DNS-over-HTTPS query failed
    #[error("DNS error: {0}")]
    Dns(String),

    /// The client socket was not open for sending
    #[error("WebSocket is not open (state {0:?})")]
    SocketNotOpen(ReadyState),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
