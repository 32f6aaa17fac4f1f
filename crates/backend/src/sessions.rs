use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use vigil_bootable::{Bootable, BootableError};
use vigil_messaging::{EventBus, Topic};
use vigil_transport_ws::{Error as TransportError, Listener, Session, TransportOptions};

struct Serving {
    listener: Arc<Listener>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Accepts agent sessions and forwards what they send to the bus.
pub(crate) struct SessionServer<B: EventBus> {
    listen_addr: SocketAddr,
    options: TransportOptions,
    bus: B,
    agent_topic: Topic,
    shutdown_timeout: Duration,
    serving: tokio::sync::Mutex<Option<Serving>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stopped: CancellationToken,
}

impl<B: EventBus> SessionServer<B> {
    pub(crate) fn new(
        listen_addr: SocketAddr,
        options: TransportOptions,
        bus: B,
        agent_topic: Topic,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            options,
            bus,
            agent_topic,
            shutdown_timeout,
            serving: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl<B: EventBus> Bootable for SessionServer<B> {
    fn name(&self) -> &str {
        "agent sessions"
    }

    async fn start(&self) -> Result<(), BootableError> {
        let mut serving = self.serving.lock().await;

        if serving.is_some() {
            return Err("agent sessions already started".into());
        }

        let listener = Arc::new(Listener::bind(self.listen_addr, self.options.clone()).await?);
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        task_tracker.spawn(accept_loop(
            listener.clone(),
            self.bus.clone(),
            self.agent_topic.clone(),
            shutdown_token.clone(),
            task_tracker.clone(),
        ));
        task_tracker.close();

        info!("accepting agent sessions on {}", listener.local_addr());

        self.local_addr.lock().replace(listener.local_addr());
        serving.replace(Serving {
            listener,
            shutdown_token,
            task_tracker,
        });

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootableError> {
        let Some(serving) = self.serving.lock().await.take() else {
            return Ok(());
        };

        serving.shutdown_token.cancel();
        serving.listener.close().await;

        if tokio::time::timeout(self.shutdown_timeout, serving.task_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "agent sessions did not finish within {:?}",
                self.shutdown_timeout
            );
        }

        self.local_addr.lock().take();
        self.stopped.cancel();

        Ok(())
    }

    async fn wait(&self) {
        self.stopped.cancelled().await;
    }
}

async fn accept_loop<B: EventBus>(
    listener: Arc<Listener>,
    bus: B,
    agent_topic: Topic,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(session) => {
                info!(
                    "agent session {} connected from {:?}",
                    session.id(),
                    session.peer_addr()
                );
                task_tracker.spawn(forward(
                    session,
                    bus.clone(),
                    agent_topic.clone(),
                    shutdown_token.clone(),
                ));
            }
            Err(TransportError::ListenerClosed) => break,
            Err(e) => warn!("rejected agent connection: {}", e),
        }
    }

    debug!("agent accept loop stopped");
}

async fn forward<B: EventBus>(
    session: Session,
    bus: B,
    agent_topic: Topic,
    shutdown_token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            () = shutdown_token.cancelled() => break,
            received = session.receive() => received,
        };

        match received {
            Ok(envelope) => {
                if let Err(e) = bus.publish(&agent_topic, envelope).await {
                    warn!("dropping envelope from session {}: {}", session.id(), e);
                }
            }
            Err(TransportError::ConnectionClosed) => {
                info!("agent session {} closed", session.id());
                break;
            }
            Err(e) => {
                warn!("agent session {} failed: {}", session.id(), e);
                break;
            }
        }
    }

    session.close();
}
