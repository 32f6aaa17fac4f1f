//! HTTP surfaces of a member: raft RPCs on the peer URL, the key/value API on
//! the client URL.

use crate::error::Error;
use crate::node::{ClusterNode, ReadRequest};
use crate::types::{KeyValue, NodeId, Request, Response, TypeConfig, WatchEvent, base64_bytes};

use axum::Router;
use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Body of a put request.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    /// The key.
    pub key: String,
    /// The value.
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
}

/// Body of a put response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    /// Revision of the write.
    pub revision: u64,
}

/// Body of a range request.
#[derive(Debug, Serialize, Deserialize)]
pub struct RangeRequest {
    /// Key, or key prefix when `prefix` is set.
    pub key: String,
    /// Whether to match every key starting with `key`.
    #[serde(default)]
    pub prefix: bool,
}

/// Body of a range response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RangeResponse {
    /// Matching keys in key order.
    pub kvs: Vec<KeyValue>,
}

/// Body of a delete request.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// The key.
    pub key: String,
}

/// Body of a delete response.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Number of keys removed.
    pub deleted: u64,
    /// Revision of the delete.
    pub revision: u64,
}

/// Body of a watch request.
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchRequest {
    /// Only keys starting with this prefix are reported.
    pub prefix: String,
}

/// One line of a watch response stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchMessage {
    /// The watch is registered; changes from here on are reported.
    Created,
    /// A change.
    Event {
        /// The change.
        event: WatchEvent,
    },
}

/// Body of a health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Whether a leader is known.
    pub health: bool,
    /// This member's raft id.
    pub member_id: NodeId,
    /// The current leader's raft id.
    pub leader: Option<NodeId>,
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// What went wrong.
    pub error: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let status = if self.0.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Routes served on the peer-listen URL.
pub fn peer_router(node: ClusterNode) -> Router {
    Router::new()
        .route("/raft/append", post(append))
        .route("/raft/snapshot", post(snapshot))
        .route("/raft/vote", post(vote))
        .route("/raft/write", post(forwarded_write))
        .route("/raft/read", post(forwarded_read))
        .with_state(node)
}

async fn append(
    State(node): State<ClusterNode>,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(node.raft().append_entries(rpc).await)
}

async fn snapshot(
    State(node): State<ClusterNode>,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(node.raft().install_snapshot(rpc).await)
}

async fn vote(
    State(node): State<ClusterNode>,
    Json(rpc): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(node.raft().vote(rpc).await)
}

async fn forwarded_write(
    State(node): State<ClusterNode>,
    Json(request): Json<Request>,
) -> Json<Result<Response, String>> {
    Json(node.write_local(request).await.map_err(|e| e.to_string()))
}

async fn forwarded_read(
    State(node): State<ClusterNode>,
    Json(request): Json<ReadRequest>,
) -> Json<Result<Vec<KeyValue>, String>> {
    Json(node.read_local(request).await.map_err(|e| e.to_string()))
}

#[derive(Clone)]
struct ClientApi {
    node: ClusterNode,
    shutdown_token: CancellationToken,
}

/// Routes served on the client-listen URL.
pub fn client_router(node: ClusterNode, shutdown_token: CancellationToken) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/kv/put", post(put))
        .route("/v1/kv/range", post(range))
        .route("/v1/kv/delete", post(delete))
        .route("/v1/watch", post(watch))
        .with_state(ClientApi {
            node,
            shutdown_token,
        })
}

async fn health(State(api): State<ClientApi>) -> Json<HealthResponse> {
    let leader = api.node.leader().await;

    Json(HealthResponse {
        health: leader.is_some(),
        member_id: api.node.id(),
        leader,
    })
}

async fn put(
    State(api): State<ClientApi>,
    Json(body): Json<PutRequest>,
) -> Result<Json<PutResponse>, ApiError> {
    let response = api.node.write(Request::put(body.key, body.value)).await?;

    Ok(Json(PutResponse {
        revision: response.revision,
    }))
}

async fn range(
    State(api): State<ClientApi>,
    Json(body): Json<RangeRequest>,
) -> Result<Json<RangeResponse>, ApiError> {
    let kvs = api
        .node
        .read(ReadRequest {
            key: body.key,
            prefix: body.prefix,
        })
        .await?;

    Ok(Json(RangeResponse { kvs }))
}

async fn delete(
    State(api): State<ClientApi>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let response = api.node.write(Request::delete(body.key)).await?;

    Ok(Json(DeleteResponse {
        deleted: response.deleted,
        revision: response.revision,
    }))
}

async fn watch(State(api): State<ClientApi>, Json(body): Json<WatchRequest>) -> HttpResponse {
    let prefix = body.prefix;
    debug!("watch registered for prefix {:?}", prefix);

    let events = BroadcastStream::new(api.node.state_machine().subscribe())
        // A lagging watcher is dropped rather than silently skipping changes.
        .take_while(|item| future::ready(item.is_ok()))
        .filter_map(move |item| {
            future::ready(
                item.ok()
                    .filter(|event| event.key().starts_with(&prefix))
                    .map(|event| WatchMessage::Event { event }),
            )
        });

    let lines = stream::once(future::ready(WatchMessage::Created))
        .chain(events)
        .map(|message| {
            serde_json::to_vec(&message).map(|mut line| {
                line.push(b'\n');
                Bytes::from(line)
            })
        })
        .take_until(api.shutdown_token.cancelled_owned());

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}
