//! Raft type configuration and the key/value data model.

use std::io::Cursor;

use bytes::Bytes;
use openraft::BasicNode;
use serde::{Deserialize, Serialize};

/// Raft node identifier.
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Type configuration for the cluster's raft group.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// A write replicated through the raft log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Set `key` to `value`.
    Put {
        /// The key.
        key: String,
        /// The value.
        #[serde(with = "base64_bytes")]
        value: Bytes,
    },

    /// Remove `key`.
    Delete {
        /// The key.
        key: String,
    },
}

impl Request {
    /// Builds a put request.
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Builds a delete request.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Outcome of an applied [`Request`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Revision (log index) at which the request was applied.
    pub revision: u64,

    /// Number of keys removed by a delete.
    pub deleted: u64,
}

/// A stored key with its value and revision bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,

    /// The value.
    #[serde(with = "base64_bytes")]
    pub value: Bytes,

    /// Revision at which the key was created.
    pub create_revision: u64,

    /// Revision of the last modification.
    pub mod_revision: u64,

    /// Number of writes since the key was created.
    pub version: u64,
}

/// A change observed by a watcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchEvent {
    /// A key was created or updated.
    Put {
        /// The key after the write.
        kv: KeyValue,
    },

    /// A key was removed.
    Delete {
        /// The removed key.
        key: String,
        /// Revision of the delete.
        revision: u64,
    },
}

impl WatchEvent {
    /// The key the event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { kv } => &kv.key,
            Self::Delete { key, .. } => key,
        }
    }

    /// Revision of the change.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        match self {
            Self::Put { kv } => kv.mod_revision,
            Self::Delete { revision, .. } => *revision,
        }
    }
}

/// Serde adapter storing bytes as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes bytes as a base64 string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserializes bytes from a base64 string.
    ///
    /// # Errors
    ///
    /// Fails if the input is not valid base64.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
