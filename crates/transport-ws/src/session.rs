use crate::error::{Error, Result};
use crate::frame::{Frame, FrameSink, FrameStream};
use crate::options::TransportOptions;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use vigil_envelope::{Envelope, EnvelopeCodec};

/// How long a closing session waits to flush its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The protocol upgrade is in progress. Sessions are only handed out
    /// once the upgrade has completed.
    Connecting,
    /// Upgraded; waiting for the handshake pair.
    Unauthenticated,
    /// Handshake complete; any envelope may be exchanged.
    Active,
    /// Terminal.
    Closed,
}

/// One handshake-gated connection.
///
/// Cloning yields another handle to the same session. The session closes
/// when [`Session::close`] is called, when the peer closes, on a protocol
/// violation, or when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    peer_addr: Option<SocketAddr>,
    codec: EnvelopeCodec,
    state: Mutex<SessionState>,
    peer_handshake: Mutex<Option<Envelope>>,
    inbound_handshake_type: Mutex<Option<String>>,
    sink: Arc<tokio::sync::Mutex<FrameSink>>,
    stream: tokio::sync::Mutex<FrameStream>,
    sent: AtomicU64,
    received: AtomicU64,
    closing: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wraps an upgraded connection. `closing` is cancelled to close the
    /// session; passing a child of a listener token ties the session to it.
    pub(crate) fn new(
        (sink, stream): (FrameSink, FrameStream),
        peer_addr: Option<SocketAddr>,
        codec: EnvelopeCodec,
        closing: CancellationToken,
    ) -> Self {
        let id = Uuid::new_v4();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        tokio::spawn(close_when_cancelled(id, sink.clone(), closing.clone()));

        Self {
            inner: Arc::new(SessionInner {
                id,
                peer_addr,
                codec,
                state: Mutex::new(SessionState::Unauthenticated),
                peer_handshake: Mutex::new(None),
                inbound_handshake_type: Mutex::new(None),
                sink,
                stream: tokio::sync::Mutex::new(stream),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                closing,
            }),
        }
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.inner.closing.is_cancelled() {
            return SessionState::Closed;
        }
        *self.inner.state.lock()
    }

    /// Remote address, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The handshake envelope the peer sent.
    #[must_use]
    pub fn peer_handshake(&self) -> Option<Envelope> {
        self.inner.peer_handshake.lock().clone()
    }

    /// Envelopes sent since the handshake.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Envelopes received since the handshake.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    /// Sends one envelope.
    ///
    /// Sends on one session should come from a single task at a time; the
    /// order envelopes are sent in is the order the peer receives them.
    ///
    /// # Errors
    ///
    /// `NotActive` before the handshake, `ConnectionClosed` after close,
    /// `Encode` if the envelope exceeds the payload limit, `Connection` if
    /// the write fails.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Closed => return Err(Error::ConnectionClosed),
            SessionState::Connecting | SessionState::Unauthenticated => {
                return Err(Error::NotActive);
            }
        }

        self.write(envelope).await?;
        self.inner.sent.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Waits for the next envelope from the peer.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` on orderly close (either side), `Connection` on I/O
    /// failure, `ProtocolViolation`/`MalformedEnvelope` if the peer broke the
    /// protocol (the session is closed), `NotActive` before the handshake.
    pub async fn receive(&self) -> Result<Envelope> {
        match self.state() {
            SessionState::Active => {}
            SessionState::Closed => return Err(Error::ConnectionClosed),
            SessionState::Connecting | SessionState::Unauthenticated => {
                return Err(Error::NotActive);
            }
        }

        let envelope = self.read().await?;

        let repeated_handshake = self
            .inner
            .inbound_handshake_type
            .lock()
            .as_deref()
            .is_some_and(|expected| expected == envelope.type_id());
        if repeated_handshake {
            return Err(self.violation(format!(
                "handshake {} sent twice",
                envelope.type_id()
            )));
        }

        self.inner.received.fetch_add(1, Ordering::Relaxed);

        Ok(envelope)
    }

    /// [`Session::receive`] bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived in time; the session stays usable.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Envelope> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// [`Session::receive`] that gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// `Cancelled` if `cancel` fired first; the session stays usable.
    pub async fn receive_cancellable(&self, cancel: &CancellationToken) -> Result<Envelope> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.receive() => result,
        }
    }

    /// Closes the session. Blocked receives return `ConnectionClosed`.
    /// Closing twice does nothing.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if *state != SessionState::Closed {
            debug!("closing session {}", self.inner.id);
            *state = SessionState::Closed;
        }
        drop(state);
        self.inner.closing.cancel();
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.inner.closing.cancelled().await;
    }

    /// Accepting side: expects the initiator handshake, answers with ours.
    pub(crate) async fn accept_handshake(&self, options: &TransportOptions) -> Result<()> {
        let record = &options.handshake;

        let inbound = self.read().await?;
        if inbound.type_id() != record.initiator {
            return Err(self.violation(format!(
                "expected handshake {}, got {}",
                record.initiator,
                inbound.type_id()
            )));
        }

        self.write(&Envelope::new(
            record.acceptor.clone(),
            options.handshake_payload.clone(),
        ))
        .await?;

        self.activate(inbound, &record.initiator);

        Ok(())
    }

    /// Initiating side: sends our handshake, expects the acceptor's.
    pub(crate) async fn initiate_handshake(&self, options: &TransportOptions) -> Result<()> {
        let record = &options.handshake;

        self.write(&Envelope::new(
            record.initiator.clone(),
            options.handshake_payload.clone(),
        ))
        .await?;

        let inbound = self.read().await?;
        if inbound.type_id() != record.acceptor {
            return Err(self.violation(format!(
                "expected handshake {}, got {}",
                record.acceptor,
                inbound.type_id()
            )));
        }

        self.activate(inbound, &record.acceptor);

        Ok(())
    }

    fn activate(&self, handshake: Envelope, inbound_type: &str) {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Unauthenticated {
            *state = SessionState::Active;
        }
        drop(state);

        self.inner
            .inbound_handshake_type
            .lock()
            .replace(inbound_type.to_string());
        self.inner.peer_handshake.lock().replace(handshake);

        debug!("session {} active", self.inner.id);
    }

    fn violation(&self, reason: String) -> Error {
        warn!("protocol violation on session {}: {}", self.inner.id, reason);
        self.close();
        Error::ProtocolViolation(reason)
    }

    async fn write(&self, envelope: &Envelope) -> Result<()> {
        self.inner.codec.check(envelope).map_err(Error::Encode)?;
        let frame = Frame::Data(envelope.encode());

        let mut sink = self.inner.sink.lock().await;

        let result = tokio::select! {
            () = self.inner.closing.cancelled() => Err(Error::ConnectionClosed),
            result = sink.send(frame) => result,
        };

        drop(sink);

        if let Err(Error::Connection(_)) = &result {
            self.close();
        }

        result
    }

    async fn read(&self) -> Result<Envelope> {
        let mut stream = self.inner.stream.lock().await;

        let frame = tokio::select! {
            () = self.inner.closing.cancelled() => return Err(Error::ConnectionClosed),
            frame = stream.next() => frame,
        };

        drop(stream);

        match frame {
            Some(Ok(Frame::Data(data))) => self.inner.codec.decode_bytes(&data).map_err(|e| {
                warn!("malformed envelope on session {}: {}", self.inner.id, e);
                self.close();
                Error::MalformedEnvelope(e)
            }),
            Some(Ok(Frame::Close)) | None => {
                debug!("session {} closed by peer", self.inner.id);
                self.close();
                Err(Error::ConnectionClosed)
            }
            Some(Err(Error::ProtocolViolation(reason))) => Err(self.violation(reason)),
            Some(Err(e)) => {
                debug!("session {} failed: {}", self.inner.id, e);
                self.close();
                Err(e)
            }
        }
    }
}

/// Flushes a close frame once the session is closed, however that happens.
async fn close_when_cancelled(
    id: Uuid,
    sink: Arc<tokio::sync::Mutex<FrameSink>>,
    closing: CancellationToken,
) {
    closing.cancelled().await;

    let flush = async {
        let mut sink = sink.lock().await;
        let _ = sink.send(Frame::Close).await;
        let _ = sink.close().await;
    };

    if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
        debug!("session {} close frame not flushed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    use bytes::Bytes;
    use vigil_envelope::{AGENT_HANDSHAKE_TYPE, BACKEND_HANDSHAKE_TYPE};

    fn session_pair() -> (Session, Session) {
        let (a, b) = frame::pipe();
        let codec = EnvelopeCodec::default();

        (
            Session::new(a, None, codec, CancellationToken::new()),
            Session::new(b, None, codec, CancellationToken::new()),
        )
    }

    async fn active_pair() -> (Session, Session) {
        let (client, server) = session_pair();
        let options = TransportOptions::default();

        let server_options = options.clone();
        let server_side = server.clone();
        let accept =
            tokio::spawn(async move { server_side.accept_handshake(&server_options).await });

        client.initiate_handshake(&options).await.unwrap();
        accept.await.unwrap().unwrap();

        (client, server)
    }

    fn envelope(payload: &'static str) -> Envelope {
        Envelope::new("vigil.types.Any", Bytes::from_static(payload.as_bytes()))
    }

    #[tokio::test]
    async fn test_send_before_handshake_is_not_active() {
        let (client, _server) = session_pair();

        assert_eq!(client.state(), SessionState::Unauthenticated);
        assert!(matches!(
            client.send(&envelope("{}")).await,
            Err(Error::NotActive)
        ));
        assert!(matches!(client.receive().await, Err(Error::NotActive)));
    }

    #[tokio::test]
    async fn test_handshake_activates_both_sides() {
        let (client, server) = active_pair().await;

        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(server.state(), SessionState::Active);
        assert_eq!(
            client.peer_handshake().unwrap().type_id(),
            BACKEND_HANDSHAKE_TYPE
        );
        assert_eq!(
            server.peer_handshake().unwrap().type_id(),
            AGENT_HANDSHAKE_TYPE
        );
        assert_eq!(server.peer_handshake().unwrap().payload().as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_wrong_handshake_closes_session() {
        let (client, server) = session_pair();

        client.write(&envelope("{}")).await.unwrap();

        let result = server
            .accept_handshake(&TransportOptions::default())
            .await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert_eq!(server.state(), SessionState::Closed);

        // The violating envelope was never delivered.
        assert!(matches!(server.receive().await, Err(Error::ConnectionClosed)));
        assert_eq!(server.received(), 0);
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_order() {
        let (client, server) = active_pair().await;

        for i in 0..50u32 {
            client
                .send(&Envelope::new("vigil.types.Any", i.to_be_bytes().to_vec()))
                .await
                .unwrap();
        }

        for i in 0..50u32 {
            let received = server.receive().await.unwrap();
            assert_eq!(received.payload().as_ref(), i.to_be_bytes());
        }

        assert_eq!(client.sent(), 50);
        assert_eq!(server.received(), 50);
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let (_client, server) = active_pair().await;

        let blocked = server.clone();
        let receive = tokio::spawn(async move { blocked.receive().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();

        let result = tokio::time::timeout(Duration::from_secs(1), receive)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_peer_close_ends_receive() {
        let (client, server) = active_pair().await;

        client.close();
        client.close();

        let result = tokio::time::timeout(Duration::from_secs(1), server.receive())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(server.state(), SessionState::Closed);
        assert!(matches!(
            client.send(&envelope("{}")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes() {
        let (client, server) = active_pair().await;

        drop(client);

        let result = tokio::time::timeout(Duration::from_secs(1), server.receive())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_repeated_handshake_is_violation() {
        let (client, server) = active_pair().await;

        client
            .send(&Envelope::new(AGENT_HANDSHAKE_TYPE, Bytes::from_static(b"{}")))
            .await
            .unwrap();

        assert!(matches!(
            server.receive().await,
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let ((mut raw_sink, _raw_stream), b) = frame::pipe();
        let server = Session::new(b, None, EnvelopeCodec::default(), CancellationToken::new());
        *server.inner.state.lock() = SessionState::Active;

        raw_sink
            .send(Frame::Data(Bytes::from_static(&[0x0a, 0x05, b'a'])))
            .await
            .unwrap();

        assert!(matches!(
            server.receive().await,
            Err(Error::MalformedEnvelope(e)) if e.is_truncated()
        ));
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_receive_timeout_and_cancel_keep_session() {
        let (client, server) = active_pair().await;

        assert!(matches!(
            server.receive_timeout(Duration::from_millis(20)).await,
            Err(Error::Timeout)
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            server.receive_cancellable(&cancel).await,
            Err(Error::Cancelled)
        ));

        assert_eq!(server.state(), SessionState::Active);

        client.send(&envelope("after")).await.unwrap();
        let received = server
            .receive_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.payload().as_ref(), b"after");
    }

    #[tokio::test]
    async fn test_oversized_send_is_rejected() {
        let (a, _b) = frame::pipe();
        let client = Session::new(a, None, EnvelopeCodec::new(8), CancellationToken::new());
        *client.inner.state.lock() = SessionState::Active;

        assert!(matches!(
            client.send(&envelope("this payload is too long")).await,
            Err(Error::Encode(_))
        ));
        assert_eq!(client.state(), SessionState::Active);
    }
}
