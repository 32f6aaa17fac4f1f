//! Handshake-gated agent sessions over websockets.
//!
//! Each binary websocket message carries one encoded envelope. The
//! connecting side sends the initiator handshake first, the accepting side
//! answers with the acceptor handshake, and only then may either side send
//! other envelopes. A session that breaks this is closed without affecting
//! any other session on the same listener.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
mod frame;
mod listener;
mod options;
mod session;

pub use error::{Error, Result};
pub use listener::Listener;
pub use options::{HandshakeRecord, TransportOptions};
pub use session::{Session, SessionState};

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use vigil_envelope::EnvelopeCodec;

/// Connects to a listener and completes the handshake.
///
/// # Errors
///
/// `Timeout` if the session is not active within the handshake timeout,
/// `Connection` if the connection fails, `ProtocolViolation` if the peer
/// answers with the wrong handshake.
pub async fn connect(url: &Url, options: &TransportOptions) -> Result<Session> {
    connect_with_cancel(url, options, &CancellationToken::new()).await
}

/// [`connect`] that gives up when `cancel` fires.
///
/// # Errors
///
/// As [`connect`], plus `Cancelled`.
pub async fn connect_with_cancel(
    url: &Url,
    options: &TransportOptions,
    cancel: &CancellationToken,
) -> Result<Session> {
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(options.handshake_timeout, dial(url, options)) => {
            result.map_err(|_| Error::Timeout)?
        }
    }
}

async fn dial(url: &Url, options: &TransportOptions) -> Result<Session> {
    debug!("connecting to {}", url);

    let config = WebSocketConfig::default()
        .max_message_size(Some(options.max_message_size()))
        .max_frame_size(Some(options.max_message_size()));

    let (socket, _) = connect_async_with_config(url.as_str(), Some(config), true)
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    let peer_addr = if let MaybeTlsStream::Plain(tcp) = socket.get_ref() {
        tcp.peer_addr().ok()
    } else {
        None
    };

    let session = Session::new(
        frame::client(socket),
        peer_addr,
        EnvelopeCodec::new(options.max_payload_size),
        CancellationToken::new(),
    );

    session.initiate_handshake(options).await?;

    debug!("session {} to {} active", session.id(), url);

    Ok(session)
}
