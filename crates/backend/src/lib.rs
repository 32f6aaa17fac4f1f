//! Control plane of a monitoring backend.
//!
//! [`Backend::run`] starts the cluster store, then the agent session
//! listener; inbound agent envelopes are published to the configured bus
//! topic. [`Backend::stop`] undoes this in reverse order.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod config;
mod error;
pub mod retry;
mod sessions;

pub use config::{BackendConfig, DEFAULT_AGENT_TOPIC};
pub use error::{Error, Result};

use crate::sessions::SessionServer;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};
use vigil_bootable::{Bootable, BootSequence};
use vigil_cluster::ClusterStore;
use vigil_messaging::EventBus;

/// Options for creating a new `Backend`.
#[derive(Debug)]
pub struct BackendOptions<B>
where
    B: EventBus,
{
    /// Process configuration.
    pub config: BackendConfig,

    /// The event bus agent envelopes are published to.
    pub bus: B,
}

/// One backend process: cluster member, agent listener and bus.
pub struct Backend<B>
where
    B: EventBus,
{
    bus: B,
    cluster: ClusterStore,
    config: BackendConfig,
    sequence: Mutex<BootSequence>,
    sessions: Arc<SessionServer<B>>,
}

impl<B> std::fmt::Debug for Backend<B>
where
    B: EventBus,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("listen_addr", &self.config.listen_addr)
            .field("cluster", &self.cluster)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl<B> Backend<B>
where
    B: EventBus,
{
    /// Creates a stopped backend.
    pub fn new(BackendOptions { config, bus }: BackendOptions<B>) -> Self {
        let cluster = ClusterStore::new(config.cluster_config());
        let sessions = Arc::new(SessionServer::new(
            config.listen_addr,
            config.transport.clone(),
            bus.clone(),
            config.agent_topic.clone(),
            config.shutdown_timeout,
        ));

        Self {
            bus,
            cluster,
            config,
            sequence: Mutex::new(BootSequence::new()),
            sessions,
        }
    }

    /// Starts the cluster store, then the agent listener, and returns once
    /// agents can connect.
    ///
    /// # Errors
    ///
    /// `Error::Start` naming the subsystem that failed. Anything already
    /// started has been shut down before this returns.
    pub async fn run(&self) -> Result<()> {
        let mut sequence = self.sequence.lock().await;

        if !sequence.is_empty() {
            return Err(Error::AlreadyStarted);
        }

        let services: [Arc<dyn Bootable>; 2] =
            [Arc::new(self.cluster.clone()), self.sessions.clone()];

        for service in services {
            let name = service.name().to_string();

            if let Err(source) = sequence.start(service).await {
                error!("failed to start {}: {}", name, source);

                if let Err(e) = sequence.unwind().await {
                    error!("unwinding after failed start: {}", e);
                }

                return Err(Error::Start {
                    service: name,
                    source,
                });
            }
        }

        info!(
            "backend running: agents on {:?}, cluster clients on {}",
            self.sessions.local_addr(),
            self.config.cluster_client_url
        );

        Ok(())
    }

    /// Closes the agent listener and its sessions, then shuts the cluster
    /// store down. Stopping a stopped backend does nothing.
    ///
    /// # Errors
    ///
    /// `Error::Timeout` if shutdown exceeds the configured deadline,
    /// `Error::Stop` if a subsystem failed to shut down.
    pub async fn stop(&self) -> Result<()> {
        let mut sequence = self.sequence.lock().await;

        if sequence.is_empty() {
            return Ok(());
        }

        info!("stopping backend");

        // Each subsystem bounds its own drain by `shutdown_timeout`.
        let deadline = self.config.shutdown_timeout.saturating_mul(2);

        match tokio::time::timeout(deadline, sequence.unwind()).await {
            Ok(Ok(())) => {
                info!("backend stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Stop(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// The cluster store member.
    pub const fn cluster(&self) -> &ClusterStore {
        &self.cluster
    }

    /// The event bus.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Address agents connect to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sessions.local_addr()
    }

    /// The configuration.
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }
}
