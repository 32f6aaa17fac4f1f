use crate::error::BootstrapError;
use crate::types::NodeId;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use openraft::BasicNode;
use url::Url;

/// Default member name, matching a single-member `default=<peer url>` cluster.
pub const DEFAULT_MEMBER_NAME: &str = "default";

/// Configuration for one cluster member.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// This member's name in the initial cluster.
    pub name: String,

    /// Directory holding the raft log, snapshots and the ownership lock.
    pub state_dir: PathBuf,

    /// URL serving the key/value client API.
    pub client_listen_url: Url,

    /// URL serving raft traffic between members.
    pub peer_listen_url: Url,

    /// Initial membership, `name=peer_url[,name=peer_url...]`.
    pub initial_cluster: String,

    /// Raft cluster name.
    pub cluster_name: String,

    /// How long bootstrap waits for a leader.
    pub startup_timeout: Duration,

    /// How long shutdown waits for in-flight work to drain.
    pub shutdown_timeout: Duration,

    /// Per-request timeout used by clients and peer RPCs.
    pub request_timeout: Duration,

    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Minimum election timeout; the maximum is twice this value.
    pub election_timeout: Duration,

    /// Number of applied entries after which a snapshot is taken.
    pub snapshot_threshold: u64,
}

impl ClusterConfig {
    /// Creates a configuration for the `default` member with default timings.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        client_listen_url: Url,
        peer_listen_url: Url,
        initial_cluster: impl Into<String>,
    ) -> Self {
        Self {
            name: DEFAULT_MEMBER_NAME.to_string(),
            state_dir: state_dir.into(),
            client_listen_url,
            peer_listen_url,
            initial_cluster: initial_cluster.into(),
            cluster_name: "vigil".to_string(),
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(300),
            snapshot_threshold: 5000,
        }
    }

    /// Sets the member name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Checks the configuration and resolves the initial membership.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<InitialCluster, BootstrapError> {
        check_listen_url("client listen url", &self.client_listen_url)?;
        check_listen_url("peer listen url", &self.peer_listen_url)?;

        if same_endpoint(&self.client_listen_url, &self.peer_listen_url) {
            return Err(invalid(format!(
                "client and peer listen urls must differ, both are {}",
                self.client_listen_url
            )));
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(invalid("state directory must be set"));
        }

        let members: InitialCluster = self.initial_cluster.parse()?;

        match members.url(&self.name) {
            Some(url) if same_endpoint(url, &self.peer_listen_url) => Ok(members),
            Some(url) => Err(invalid(format!(
                "initial cluster lists {}={url} but the peer listen url is {}",
                self.name, self.peer_listen_url
            ))),
            None => Err(invalid(format!(
                "member {} is missing from the initial cluster {}",
                self.name, self.initial_cluster
            ))),
        }
    }
}

/// Parsed initial-cluster membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialCluster {
    members: BTreeMap<String, Url>,
}

impl InitialCluster {
    /// Peer URL of the named member.
    #[must_use]
    pub fn url(&self, name: &str) -> Option<&Url> {
        self.members.get(name)
    }

    /// Raft node id of the named member: its 1-based position in name order.
    #[must_use]
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.members
            .keys()
            .position(|member| member == name)
            .map(|index| index as NodeId + 1)
    }

    /// Raft nodes for every member.
    #[must_use]
    pub fn nodes(&self) -> BTreeMap<NodeId, BasicNode> {
        self.members
            .values()
            .enumerate()
            .map(|(index, url)| (index as NodeId + 1, BasicNode::new(peer_addr(url))))
            .collect()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the membership is empty. Never true for a parsed value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromStr for InitialCluster {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut members = BTreeMap::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| invalid(format!("initial cluster entry {entry} is not name=url")))?;

            let name = name.trim();
            if name.is_empty() {
                return Err(invalid(format!("initial cluster entry {entry} has no name")));
            }

            let url = Url::parse(url.trim())
                .map_err(|e| invalid(format!("initial cluster url for {name}: {e}")))?;
            check_listen_url("initial cluster url", &url)?;

            if members.insert(name.to_string(), url).is_some() {
                return Err(invalid(format!("member {name} appears twice")));
            }
        }

        if members.is_empty() {
            return Err(invalid("initial cluster is empty"));
        }

        Ok(Self { members })
    }
}

/// Address stored in raft membership for a peer URL, without trailing slash.
pub fn peer_addr(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// Resolves a listen URL to a socket address.
pub fn socket_addr(url: &Url) -> Result<SocketAddr, BootstrapError> {
    url.socket_addrs(|| None)
        .map_err(|source| BootstrapError::Bind {
            url: url.clone(),
            source,
        })?
        .into_iter()
        .next()
        .ok_or_else(|| invalid(format!("{url} does not resolve to an address")))
}

fn check_listen_url(what: &str, url: &Url) -> Result<(), BootstrapError> {
    if url.scheme() != "http" {
        return Err(invalid(format!("{what} {url} must use http")));
    }
    if url.host_str().is_none() {
        return Err(invalid(format!("{what} {url} has no host")));
    }
    if url.port().is_none() {
        return Err(invalid(format!("{what} {url} has no explicit port")));
    }
    Ok(())
}

fn same_endpoint(a: &Url, b: &Url) -> bool {
    a.host() == b.host() && a.port_or_known_default() == b.port_or_known_default()
}

fn invalid(message: impl Into<String>) -> BootstrapError {
    BootstrapError::InvalidConfig(message.into())
}
