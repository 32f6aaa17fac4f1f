use crate::error::{Error, Result};
use crate::storage::StateMachineStore;
use crate::types::{KeyValue, NodeId, Request, Response, TypeConfig};

use std::time::Duration;

use openraft::error::{CheckIsLeaderError, ClientWriteError, ForwardToLeader, RaftError};
use openraft::{BasicNode, Raft};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A linearizable read, as forwarded between members.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Key, or key prefix when `prefix` is set.
    pub key: String,
    /// Whether to match every key starting with `key`.
    pub prefix: bool,
}

/// The running raft node plus the state it serves reads from.
#[derive(Clone)]
pub struct ClusterNode {
    id: NodeId,
    raft: Raft<TypeConfig>,
    state_machine: StateMachineStore,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl ClusterNode {
    pub const fn new(
        id: NodeId,
        raft: Raft<TypeConfig>,
        state_machine: StateMachineStore,
        http: reqwest::Client,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            raft,
            state_machine,
            http,
            request_timeout,
        }
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub const fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    pub const fn state_machine(&self) -> &StateMachineStore {
        &self.state_machine
    }

    /// Current leader, if one is known.
    pub async fn leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    /// Replicates `request`, forwarding to the leader when this member is not it.
    pub async fn write(&self, request: Request) -> Result<Response> {
        match self.raft.client_write(request.clone()).await {
            Ok(response) => Ok(response.data),
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(forward))) => {
                let addr = leader_addr(&forward)?;
                debug!("forwarding write to leader at {}", addr);
                self.forward("write", addr, &request).await
            }
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }

    /// Replicates `request` only if this member is the leader.
    pub async fn write_local(&self, request: Request) -> Result<Response> {
        self.raft
            .client_write(request)
            .await
            .map(|response| response.data)
            .map_err(|e| Error::Unavailable(e.to_string()))
    }

    /// Linearizable read, forwarding to the leader when this member is not it.
    pub async fn read(&self, request: ReadRequest) -> Result<Vec<KeyValue>> {
        match self.raft.ensure_linearizable().await {
            Ok(_) => Ok(self.state_machine.range(&request.key, request.prefix).await),
            Err(RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward))) => {
                let addr = leader_addr(&forward)?;
                debug!("forwarding read to leader at {}", addr);
                self.forward("read", addr, &request).await
            }
            Err(e) => Err(Error::Unavailable(e.to_string())),
        }
    }

    /// Linearizable read that fails rather than forwarding.
    pub async fn read_local(&self, request: ReadRequest) -> Result<Vec<KeyValue>> {
        self.raft
            .ensure_linearizable()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;

        Ok(self.state_machine.range(&request.key, request.prefix).await)
    }

    async fn forward<Req, Resp>(&self, path: &str, addr: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .post(format!("{addr}/raft/{path}"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(Error::from_reqwest)?;

        let result: std::result::Result<Resp, String> =
            response.json().await.map_err(Error::from_reqwest)?;

        result.map_err(Error::Unavailable)
    }
}

fn leader_addr(forward: &ForwardToLeader<NodeId, BasicNode>) -> Result<&str> {
    forward
        .leader_node
        .as_ref()
        .map(|node| node.addr.as_str())
        .ok_or_else(|| Error::Unavailable("no leader elected".to_string()))
}
