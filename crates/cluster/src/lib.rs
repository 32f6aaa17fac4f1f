//! Embedded, raft-replicated key/value store with a per-member client API.
//!
//! A [`ClusterStore`] owns one cluster member: its state directory, the raft
//! node, and the HTTP servers on the peer and client listen URLs. Clients
//! obtained from [`ClusterStore::new_client`] get linearizable single-key
//! reads and writes plus prefix watches.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod api;
mod client;
mod config;
mod error;
mod lock;
mod network;
mod node;
mod storage;
mod types;

pub use api::{HealthResponse, WatchMessage};
pub use client::{ClusterClient, WatchStream};
pub use config::{ClusterConfig, DEFAULT_MEMBER_NAME, InitialCluster};
pub use error::{BootstrapError, Error, Result};
pub use types::{KeyValue, NodeId, WatchEvent};

use crate::config::socket_addr;
use crate::lock::StateDirLock;
use crate::network::PeerNetwork;
use crate::node::ClusterNode;
use crate::storage::{LogStore, StateMachineStore};
use crate::types::TypeConfig;

use std::future::IntoFuture;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use openraft::error::{InitializeError, RaftError};
use openraft::{Raft, SnapshotPolicy};
use redb::Database;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;
use vigil_bootable::{Bootable, BootableError};

/// Everything a running member owns. Dropping it releases the database and
/// the directory lock.
struct Running {
    node: ClusterNode,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    _db: Arc<Database>,
    _lock: StateDirLock,
}

/// One member of the cluster.
///
/// Cheap to clone; clones share the running member.
#[derive(Clone)]
pub struct ClusterStore {
    config: ClusterConfig,
    running: Arc<Mutex<Option<Running>>>,
    stopped: CancellationToken,
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("name", &self.config.name)
            .field("state_dir", &self.config.state_dir)
            .field("client_listen_url", &self.config.client_listen_url)
            .finish_non_exhaustive()
    }
}

impl ClusterStore {
    /// Creates a stopped member.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(None)),
            stopped: CancellationToken::new(),
        }
    }

    /// Creates and starts a member.
    ///
    /// # Errors
    ///
    /// See [`ClusterStore::start`].
    pub async fn bootstrap(config: ClusterConfig) -> Result<Self> {
        let store = Self::new(config);
        store.start().await?;
        Ok(store)
    }

    /// The member configuration.
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Whether the member is running.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts the member and waits until a leader is elected.
    ///
    /// On failure everything acquired so far (lock, sockets, raft tasks) is
    /// released before returning.
    ///
    /// # Errors
    ///
    /// `Error::AlreadyStarted` if running, otherwise `Error::Bootstrap` when
    /// the configuration is invalid, the state directory is locked, a listen
    /// URL cannot be bound, or no quorum forms within the startup timeout.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        info!(
            "bootstrapping cluster member {} in {:?}",
            self.config.name, self.config.state_dir
        );

        let started = self.boot().await?;

        info!(
            "cluster member {} serving clients on {}",
            self.config.name, self.config.client_listen_url
        );

        running.replace(started);

        Ok(())
    }

    async fn boot(&self) -> std::result::Result<Running, BootstrapError> {
        let config = &self.config;
        let members = config.validate()?;
        let node_id = members
            .node_id(&config.name)
            .ok_or_else(|| BootstrapError::InvalidConfig(config.name.clone()))?;

        let lock = StateDirLock::acquire(&config.state_dir)?;
        let db = storage::open(&config.state_dir)?;

        let peer_listener = bind(&config.peer_listen_url).await?;
        let client_listener = bind(&config.client_listen_url).await?;

        let raft_config = openraft::Config {
            cluster_name: config.cluster_name.clone(),
            heartbeat_interval: millis(config.heartbeat_interval),
            election_timeout_min: millis(config.election_timeout),
            election_timeout_max: millis(config.election_timeout) * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| BootstrapError::InvalidConfig(e.to_string()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| BootstrapError::Raft(e.to_string()))?;

        let log_store = LogStore::new(db.clone());
        let state_machine = StateMachineStore::open(db.clone())?;

        let raft = Raft::<TypeConfig>::new(
            node_id,
            Arc::new(raft_config),
            PeerNetwork::new(http.clone()),
            log_store,
            state_machine.clone(),
        )
        .await
        .map_err(|e| BootstrapError::Raft(e.to_string()))?;

        let node = ClusterNode::new(
            node_id,
            raft.clone(),
            state_machine,
            http,
            config.request_timeout,
        );

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        serve(
            &task_tracker,
            "peer",
            peer_listener,
            api::peer_router(node.clone()),
            shutdown_token.clone(),
        );
        serve(
            &task_tracker,
            "client",
            client_listener,
            api::client_router(node.clone(), shutdown_token.clone()),
            shutdown_token.clone(),
        );
        task_tracker.close();

        let running = Running {
            node,
            shutdown_token,
            task_tracker,
            _db: db,
            _lock: lock,
        };

        if let Err(e) = self.join(&running, &members).await {
            error!("cluster member {} failed to start: {}", config.name, e);
            self.teardown(running).await;
            return Err(e);
        }

        Ok(running)
    }

    /// Initializes membership on a pristine store, then waits for a leader.
    async fn join(
        &self,
        running: &Running,
        members: &InitialCluster,
    ) -> std::result::Result<(), BootstrapError> {
        let raft = running.node.raft();

        match raft.initialize(members.nodes()).await {
            Ok(()) => debug!("initialized membership with {} member(s)", members.len()),
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!("membership already initialized");
            }
            Err(e) => return Err(BootstrapError::Raft(e.to_string())),
        }

        let timeout = self.config.startup_timeout;

        raft.wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map(|_| ())
            .map_err(|_| BootstrapError::QuorumTimeout(timeout))
    }

    /// Stops the member and releases its sockets and state directory.
    ///
    /// Calling this on a stopped member does nothing.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for storage flush errors.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            debug!("cluster member {} is not running", self.config.name);
            return Ok(());
        };

        info!("shutting down cluster member {}", self.config.name);

        self.teardown(running).await;
        self.stopped.cancel();

        info!("cluster member {} shut down", self.config.name);

        Ok(())
    }

    async fn teardown(&self, running: Running) {
        running.shutdown_token.cancel();

        if let Err(e) = running.node.raft().shutdown().await {
            warn!("raft shutdown failed: {}", e);
        }

        if tokio::time::timeout(self.config.shutdown_timeout, running.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "cluster servers did not drain within {:?}",
                self.config.shutdown_timeout
            );
        }

        drop(running);
    }

    /// Resolves once the member has been shut down.
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }

    /// Creates a client bound to this member's client-listen URL.
    ///
    /// # Errors
    ///
    /// `Error::NotStarted` if the member is not running.
    pub async fn new_client(&self) -> Result<ClusterClient> {
        if !self.is_running().await {
            return Err(Error::NotStarted);
        }

        ClusterClient::new(
            self.config.client_listen_url.clone(),
            self.config.request_timeout,
        )
    }

    /// Current leader as seen by this member.
    pub async fn leader(&self) -> Option<NodeId> {
        let node = self.running.lock().await.as_ref()?.node.clone();
        node.leader().await
    }
}

#[async_trait]
impl Bootable for ClusterStore {
    fn name(&self) -> &str {
        "cluster store"
    }

    async fn start(&self) -> std::result::Result<(), BootableError> {
        Self::start(self).await.map_err(Into::into)
    }

    async fn shutdown(&self) -> std::result::Result<(), BootableError> {
        Self::shutdown(self).await.map_err(Into::into)
    }

    async fn wait(&self) {
        Self::wait(self).await;
    }
}

async fn bind(url: &Url) -> std::result::Result<TcpListener, BootstrapError> {
    let addr = socket_addr(url)?;

    TcpListener::bind(addr)
        .await
        .map_err(|source| BootstrapError::Bind {
            url: url.clone(),
            source,
        })
}

fn serve(
    task_tracker: &TaskTracker,
    kind: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown_token: CancellationToken,
) {
    task_tracker.spawn(async move {
        let addr = listener.local_addr().ok();
        debug!("{} server listening on {:?}", kind, addr);

        let server = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_token.cancelled_owned())
            .into_future();

        if let Err(e) = server.await {
            error!("{} server exited: {}", kind, e);
        }

        debug!("{} server on {:?} stopped", kind, addr);
    });
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}
