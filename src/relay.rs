//! Relay pump: remote → client
//!
//! Drains the outbound connection onto the client WebSocket. The first chunk
//! that reaches the client carries the two byte response prefix.

use crate::retry::RetryState;
use crate::socket::ClientSocket;
use crate::RelayError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size for the remote side
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Why the pump stopped
#[derive(Debug)]
pub enum PumpEnd {
    /// The remote closed its side cleanly
    RemoteClosed,
    /// Reading from the remote failed
    RemoteFailed(io::Error),
    /// The client socket could not take more data; it has been closed
    ClientFailed(RelayError),
}

/// Copy `reader` to `socket` until either side stops.
///
/// `prefix` is taken on the first send and stays `None` afterwards, so it
/// is shared across attempts of one session. A send is attempted even when
/// the socket is no longer open so that the failure ends the pump instead of
/// dropping data.
pub async fn remote_to_client<R>(
    reader: &mut R,
    socket: &ClientSocket,
    prefix: &mut Option<[u8; 2]>,
    state: &mut RetryState,
    tag: &str,
) -> PumpEnd
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!(
                    "{} remoteConnection readable is close with hasIncomingData is {}",
                    tag,
                    state.received_any()
                );
                return PumpEnd::RemoteClosed;
            }
            Ok(n) => n,
            Err(e) => {
                log::debug!("{} remoteConnection readable abort: {}", tag, e);
                return PumpEnd::RemoteFailed(e);
            }
        };
        state.record(n);

        let frame = match prefix.take() {
            Some(p) => {
                let mut frame = Vec::with_capacity(p.len() + n);
                frame.extend_from_slice(&p);
                frame.extend_from_slice(&buf[..n]);
                frame
            }
            None => buf[..n].to_vec(),
        };

        if let Err(e) = socket.send(frame).await {
            log::warn!("{} remoteSocketToWS has exception: {}", tag, e);
            socket.safe_close().await;
            return PumpEnd::ClientFailed(e);
        }
    }
}
