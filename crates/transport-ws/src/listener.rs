use crate::error::{Error, Result};
use crate::frame;
use crate::options::TransportOptions;
use crate::session::Session;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade, ws::WebSocket};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vigil_envelope::EnvelopeCodec;

/// Accepted sessions waiting for [`Listener::accept`].
const ACCEPT_BACKLOG: usize = 128;

#[derive(Clone)]
struct AcceptState {
    options: Arc<TransportOptions>,
    accepted: mpsc::Sender<Result<Session>>,
    shutdown_token: CancellationToken,
}

/// Accepts agent sessions on a websocket endpoint.
///
/// Every connection is upgraded and handshaken on its own task, so a slow or
/// misbehaving peer never delays the others. Dropping the listener closes it.
pub struct Listener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<Result<Session>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Binds `addr` and starts accepting. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// `Error::Bind` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, options: TransportOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let router = Router::new()
            .route("/", get(upgrade))
            .with_state(AcceptState {
                options: Arc::new(options),
                accepted: tx,
                shutdown_token: shutdown_token.clone(),
            });

        let server_token = shutdown_token.clone();
        task_tracker.spawn(async move {
            let server = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(server_token.cancelled_owned())
            .into_future();

            if let Err(e) = server.await {
                error!("session listener on {} exited: {}", local_addr, e);
            }
        });
        task_tracker.close();

        info!("session listener bound to {}", local_addr);

        Ok(Self {
            local_addr,
            accepted: Mutex::new(rx),
            shutdown_token,
            task_tracker,
        })
    }

    /// The bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next session.
    ///
    /// Sessions are returned `Active`. A connection that fails its handshake
    /// is closed and reported as an `Err` item; keep calling `accept` to get
    /// the sessions after it.
    ///
    /// # Errors
    ///
    /// Per-connection handshake errors, or `ListenerClosed` once closed.
    pub async fn accept(&self) -> Result<Session> {
        let mut accepted = self.accepted.lock().await;

        tokio::select! {
            () = self.shutdown_token.cancelled() => Err(Error::ListenerClosed),
            next = accepted.recv() => next.unwrap_or(Err(Error::ListenerClosed)),
        }
    }

    /// Whether [`Listener::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Stops accepting, closes every session it accepted and waits for the
    /// server task to finish. Closing twice does nothing.
    pub async fn close(&self) {
        if !self.shutdown_token.is_cancelled() {
            info!("closing session listener on {}", self.local_addr);
        }

        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn upgrade(
    State(state): State<AcceptState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("upgrading connection from {}", peer_addr);

    ws.max_message_size(state.options.max_message_size())
        .max_frame_size(state.options.max_message_size())
        .on_upgrade(move |socket| handshake(state, peer_addr, socket))
}

async fn handshake(state: AcceptState, peer_addr: SocketAddr, socket: WebSocket) {
    let session = Session::new(
        frame::server(socket),
        Some(peer_addr),
        EnvelopeCodec::new(state.options.max_payload_size),
        state.shutdown_token.child_token(),
    );

    let result = match tokio::time::timeout(
        state.options.handshake_timeout,
        session.accept_handshake(&state.options),
    )
    .await
    {
        Ok(Ok(())) => {
            debug!("session {} from {} active", session.id(), peer_addr);
            Ok(session)
        }
        Ok(Err(e)) => {
            warn!("handshake with {} failed: {}", peer_addr, e);
            session.close();
            Err(e)
        }
        Err(_) => {
            warn!("handshake with {} timed out", peer_addr);
            session.close();
            Err(Error::Timeout)
        }
    };

    tokio::select! {
        () = state.shutdown_token.cancelled() => {
            debug!("listener closed, dropping connection from {}", peer_addr);
        }
        sent = state.accepted.send(result) => {
            if sent.is_err() {
                debug!("listener gone, dropping connection from {}", peer_addr);
            }
        }
    }
}
