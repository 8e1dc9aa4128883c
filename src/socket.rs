//! Client WebSocket handle
//!
//! Wraps the write half of an accepted WebSocket with a ready state so that
//! every component of a session can send to, or close, the client without
//! racing one another. Closing is idempotent.

use crate::RelayError;
use futures::{Sink, SinkExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

type BoxedWsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// WebSocket ready states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

struct Inner {
    state: AtomicU8,
    close_started: AtomicBool,
    sink: Mutex<BoxedWsSink>,
}

/// Shared handle to the client side of a session
#[derive(Clone)]
pub struct ClientSocket {
    inner: Arc<Inner>,
}

impl ClientSocket {
    /// Wrap the write half of an accepted (open) WebSocket
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self::with_state(sink, ReadyState::Open)
    }

    pub fn with_state<S>(sink: S, state: ReadyState) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(state as u8),
                close_started: AtomicBool::new(false),
                sink: Mutex::new(Box::pin(sink)),
            }),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Send one binary message. Fails if the socket is not open.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), RelayError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(RelayError::SocketNotOpen(state));
        }

        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.send(Message::Binary(data)).await {
            self.mark_closed();
            return Err(RelayError::WebSocket(e));
        }
        Ok(())
    }

    /// The peer started the closing handshake
    pub fn mark_closing(&self) {
        let _ = self.inner.state.compare_exchange(
            ReadyState::Open as u8,
            ReadyState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The underlying connection is gone
    pub fn mark_closed(&self) {
        self.inner
            .state
            .store(ReadyState::Closed as u8, Ordering::Release);
    }

    /// Close the socket if it is open or closing; a no-op otherwise.
    ///
    /// Errors while closing are logged and swallowed.
    pub async fn safe_close(&self) {
        let state = self.ready_state();
        if !matches!(state, ReadyState::Open | ReadyState::Closing) {
            return;
        }
        if self.inner.close_started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.mark_closing();
        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.close().await {
            log::debug!("safeCloseWebSocket error: {}", e);
        }
        self.mark_closed();
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("state", &self.ready_state())
            .finish()
    }
}
