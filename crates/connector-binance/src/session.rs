//! WebSocket plumbing shared by the market and user data streams.

use std::time::Duration;

use common::ExponentialBackoff;
use connector_core::ConnectorError;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A connection that lived this long resets the reconnect backoff.
pub(crate) const STABLE_CONNECTION_THRESHOLD: Duration = Duration::from_secs(300);

pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsWrite = SplitSink<WsStream, Message>;

pub(crate) enum ConnectResult {
    Connected(WsStream),
    Shutdown,
    Error(ConnectorError),
}

/// How a session ended.
pub(crate) enum SessionResult {
    Shutdown,
    /// The socket was up for `duration` before failing with `error`.
    Connected {
        duration: Duration,
        error: ConnectorError,
    },
    ConnectFailed(ConnectorError),
}

/// A dropped sender counts as a shutdown request.
pub(crate) fn shutdown_requested(
    changed: Result<(), watch::error::RecvError>,
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown_rx.borrow()
}

pub(crate) async fn connect_with_timeout(
    url: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectResult {
    let connect = tokio::time::timeout(CONNECTION_TIMEOUT, connect_async(url));
    tokio::pin!(connect);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if shutdown_requested(changed, shutdown_rx) {
                    return ConnectResult::Shutdown;
                }
            }

            result = &mut connect => {
                return match result {
                    Ok(Ok((stream, _))) => ConnectResult::Connected(stream),
                    Ok(Err(e)) => ConnectResult::Error(ConnectorError::WebSocket(e.to_string())),
                    Err(_) => ConnectResult::Error(ConnectorError::WebSocket(
                        "connection timeout".to_string(),
                    )),
                };
            }
        }
    }
}

/// Sleeps for the next backoff delay. Returns `false` if shutdown was
/// requested meanwhile.
pub(crate) async fn wait_backoff(
    backoff: &mut ExponentialBackoff,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => !shutdown_requested(changed, shutdown_rx),
    }
}

/// Answers a ping. Binance drops connections that miss pongs.
pub(crate) async fn pong(write: &mut WsWrite, data: Vec<u8>) -> Result<(), ConnectorError> {
    write
        .send(Message::Pong(data))
        .await
        .map_err(|e| ConnectorError::WebSocket(e.to_string()))
}
