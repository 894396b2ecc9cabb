//! Bidirectional WebSocket relay between an external client and an
//! instance's internal endpoint.
//!
//! Two sibling loops, one per direction, linked by a cancellation token:
//! whichever side ends first stops the other. Each loop holds at most one
//! frame in flight. Text frames are forwarded as binary frames carrying the
//! same bytes; control frames are answered by each socket locally and not
//! forwarded.

use std::time::Duration;

use axum::extract::ws::{Message as ExternalMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as InternalMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type InternalStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on reaching the internal endpoint, handshake included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("relay failed ({direction}): {message}")]
    Unexpected {
        direction: Direction,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// External client to internal endpoint.
    Inbound,
    /// Internal endpoint to external client.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("client -> emulator"),
            Direction::Outbound => f.write_str("emulator -> client"),
        }
    }
}

/// Frame counts of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub inbound: u64,
    pub outbound: u64,
}

/// Why a single forwarding loop stopped.
enum LoopEnd {
    /// End of stream, close frame, a protocol error, or the sibling stopped.
    Closed,
    Failed(String),
}

/// Open the internal WebSocket, optionally requesting `subprotocol`.
pub async fn connect_internal(
    url: &str,
    subprotocol: Option<&str>,
) -> Result<InternalStream, RelayError> {
    connect_internal_within(url, subprotocol, CONNECT_TIMEOUT).await
}

async fn connect_internal_within(
    url: &str,
    subprotocol: Option<&str>,
    limit: Duration,
) -> Result<InternalStream, RelayError> {
    let connect_err = |source| RelayError::Connect {
        url: url.to_string(),
        source,
    };
    let mut request = url.into_client_request().map_err(connect_err)?;
    if let Some(protocol) = subprotocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| connect_err(tungstenite::Error::HttpFormat(e.into())))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    let (stream, _response) = tokio::time::timeout(limit, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| {
            connect_err(tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "websocket handshake timed out",
            )))
        })?
        .map_err(connect_err)?;
    tracing::debug!(url, ?subprotocol, "connected to internal endpoint");
    Ok(stream)
}

/// Relay frames between `external` and an already connected `internal`
/// stream until either side closes. Returns after both loops have stopped.
pub async fn pump(external: WebSocket, internal: InternalStream) -> Result<RelayStats, RelayError> {
    let (external_tx, external_rx) = external.split();
    let (internal_tx, internal_rx) = internal.split();
    pump_split(external_tx, external_rx, internal_tx, internal_rx).await
}

/// Connect to `url` and relay `external` to it.
pub async fn relay(
    external: WebSocket,
    url: &str,
    subprotocol: Option<&str>,
) -> Result<RelayStats, RelayError> {
    let internal = connect_internal(url, subprotocol).await?;
    pump(external, internal).await
}

async fn pump_split<ETx, ERx, ITx, IRx>(
    mut external_tx: ETx,
    mut external_rx: ERx,
    mut internal_tx: ITx,
    mut internal_rx: IRx,
) -> Result<RelayStats, RelayError>
where
    ETx: Sink<ExternalMessage, Error = axum::Error> + Unpin,
    ERx: Stream<Item = Result<ExternalMessage, axum::Error>> + Unpin,
    ITx: Sink<InternalMessage, Error = tungstenite::Error> + Unpin,
    IRx: Stream<Item = Result<InternalMessage, tungstenite::Error>> + Unpin,
{
    let cancel = CancellationToken::new();

    let inbound = async {
        let mut count = 0u64;
        let end = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break LoopEnd::Closed,
                next = external_rx.next() => next,
            };
            let payload = match next {
                Some(Ok(ExternalMessage::Binary(data))) => data,
                Some(Ok(ExternalMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Some(Ok(ExternalMessage::Close(_))) | None => break LoopEnd::Closed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "client socket ended");
                    break LoopEnd::Closed;
                }
            };
            if let Err(e) = internal_tx.send(InternalMessage::Binary(payload)).await {
                break classify(e);
            }
            count += 1;
        };
        cancel.cancel();
        let _ = internal_tx.close().await;
        (end, count)
    };

    let outbound = async {
        let mut count = 0u64;
        let end = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break LoopEnd::Closed,
                next = internal_rx.next() => next,
            };
            let payload = match next {
                Some(Ok(InternalMessage::Binary(data))) => data,
                Some(Ok(InternalMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Some(Ok(InternalMessage::Close(_))) | None => break LoopEnd::Closed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break classify(e),
            };
            if let Err(e) = external_tx.send(ExternalMessage::Binary(payload)).await {
                tracing::debug!(error = %e, "client socket closed while sending");
                break LoopEnd::Closed;
            }
            count += 1;
        };
        cancel.cancel();
        let _ = external_tx.close().await;
        (end, count)
    };

    let ((inbound_end, inbound), (outbound_end, outbound)) = tokio::join!(inbound, outbound);
    let stats = RelayStats { inbound, outbound };
    tracing::debug!(inbound = stats.inbound, outbound = stats.outbound, "relay finished");

    for (direction, end) in [(Direction::Inbound, inbound_end), (Direction::Outbound, outbound_end)] {
        if let LoopEnd::Failed(message) = end {
            tracing::warn!(%direction, %message, "relay loop failed");
            return Err(RelayError::Unexpected { direction, message });
        }
    }
    Ok(stats)
}

/// Errors on the internal socket that simply mean the connection is over.
fn classify(error: tungstenite::Error) -> LoopEnd {
    match error {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(_)
        | tungstenite::Error::Io(_) => {
            tracing::debug!(%error, "emulator socket ended");
            LoopEnd::Closed
        }
        other => LoopEnd::Failed(other.to_string()),
    }
}
