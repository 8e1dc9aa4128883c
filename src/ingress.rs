//! Ingress stream adapter
//!
//! Turns the read half of a client WebSocket into an ordered sequence of byte
//! chunks delivered over a bounded channel. Early data, when present, is the
//! first chunk. The sequence ends when the client closes and terminates with an
//! error when the socket fails or the early data cannot be decoded.

use crate::early_data::decode_early_data;
use crate::socket::ClientSocket;
use crate::RelayError;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Default number of chunks buffered between the socket reader and the session
pub const DEFAULT_INGRESS_CAPACITY: usize = 16;

type Chunk = Result<Vec<u8>, RelayError>;

/// Ordered, cancellable stream of client chunks
pub struct IngressStream {
    rx: mpsc::Receiver<Chunk>,
    cancelled: Arc<AtomicBool>,
    socket: ClientSocket,
    reader: Option<JoinHandle<()>>,
}

impl IngressStream {
    /// Start reading `source`, with `early_data` (the raw subprotocol header
    /// value) spliced in front of the first socket message.
    pub fn start<St>(
        source: St,
        socket: ClientSocket,
        early_data: Option<&str>,
        capacity: usize,
    ) -> Self
    where
        St: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));

        let reader = match decode_early_data(early_data) {
            Err(e) => {
                // terminal; the socket is never read
                let _ = tx.try_send(Err(RelayError::EarlyData(e)));
                None
            }
            Ok(first) => {
                if let Some(bytes) = first {
                    log::debug!("early data: {} bytes", bytes.len());
                    let _ = tx.try_send(Ok(bytes));
                }
                Some(tokio::spawn(read_loop(
                    source,
                    tx,
                    socket.clone(),
                    Arc::clone(&cancelled),
                )))
            }
        };

        Self {
            rx,
            cancelled,
            socket,
            reader,
        }
    }

    /// Next chunk; `None` once the client has closed
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Stop delivering chunks and close the client socket. Only the first call
    /// has any effect.
    pub async fn cancel(&mut self, reason: &str) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("ReadableStream was canceled, due to {}", reason);
        self.rx.close();
        self.socket.safe_close().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for IngressStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop<St>(
    mut source: St,
    tx: mpsc::Sender<Chunk>,
    socket: ClientSocket,
    cancelled: Arc<AtomicBool>,
) where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(item) = source.next().await {
        let data = match item {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => {
                socket.mark_closing();
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                log::debug!("webSocketServer has error: {}", e);
                socket.mark_closed();
                if !cancelled.load(Ordering::Acquire) {
                    let _ = tx.send(Err(RelayError::WebSocket(e))).await;
                }
                return;
            }
        };

        if cancelled.load(Ordering::Acquire) {
            continue;
        }
        if tx.send(Ok(data)).await.is_err() {
            // consumer is gone
            break;
        }
    }

    socket.safe_close().await;
}
