use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use vigil_cluster::ClusterConfig;
use vigil_messaging::Topic;
use vigil_transport_ws::TransportOptions;

/// Topic agent envelopes are published to unless configured otherwise.
pub const DEFAULT_AGENT_TOPIC: &str = "agent_events";

/// Everything a backend process needs to start.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Where agents connect.
    pub listen_addr: SocketAddr,

    /// Cluster state directory.
    pub state_dir: PathBuf,

    /// This member's name in `initial_cluster`.
    pub member_name: String,

    /// Cluster client-listen URL.
    pub cluster_client_url: Url,

    /// Cluster peer-listen URL.
    pub cluster_peer_url: Url,

    /// Initial cluster membership, `name=peer_url[,...]`.
    pub initial_cluster: String,

    /// Bus endpoint, if an external bus is used.
    pub bus_url: Option<String>,

    /// Topic inbound agent envelopes are published to.
    pub agent_topic: Topic,

    /// Session transport settings.
    pub transport: TransportOptions,

    /// How long the cluster may take to elect a leader.
    pub startup_timeout: Duration,

    /// How long `stop` may take.
    pub shutdown_timeout: Duration,
}

impl BackendConfig {
    /// The cluster member configuration derived from this config.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        let mut config = ClusterConfig::new(
            self.state_dir.clone(),
            self.cluster_client_url.clone(),
            self.cluster_peer_url.clone(),
            self.initial_cluster.clone(),
        )
        .with_name(self.member_name.clone());

        config.startup_timeout = self.startup_timeout;
        config.shutdown_timeout = self.shutdown_timeout;

        config
    }
}
