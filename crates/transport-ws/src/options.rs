use std::time::Duration;

use bytes::Bytes;
use vigil_envelope::{
    AGENT_HANDSHAKE_TYPE, BACKEND_HANDSHAKE_TYPE, DEFAULT_MAX_PAYLOAD_SIZE, EnvelopeCodec,
};

/// The pair of envelope types exchanged before a session becomes active.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Sent first, by the connecting side.
    pub initiator: String,
    /// Sent in reply, by the accepting side.
    pub acceptor: String,
}

impl Default for HandshakeRecord {
    fn default() -> Self {
        Self {
            initiator: AGENT_HANDSHAKE_TYPE.to_string(),
            acceptor: BACKEND_HANDSHAKE_TYPE.to_string(),
        }
    }
}

/// Options shared by the listener and [`crate::connect`].
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Handshake types.
    pub handshake: HandshakeRecord,

    /// How long connect, or the accepting side of a handshake, may take.
    pub handshake_timeout: Duration,

    /// Largest payload accepted in either direction.
    pub max_payload_size: usize,

    /// Payload of the handshake envelope this side sends.
    pub handshake_payload: Bytes,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeRecord::default(),
            handshake_timeout: Duration::from_secs(5),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            handshake_payload: Bytes::from_static(b"{}"),
        }
    }
}

impl TransportOptions {
    /// Largest websocket message a session may carry: any envelope that
    /// passes the outbound check fits.
    pub(crate) const fn max_message_size(&self) -> usize {
        EnvelopeCodec::new(self.max_payload_size).max_encoded_len()
    }
}
