//! Runs a backend until interrupted.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use url::Url;
use vigil_backend::{Backend, BackendConfig, BackendOptions, DEFAULT_AGENT_TOPIC, Result};
use vigil_messaging::{EventBus, Topic};
use vigil_messaging_memory::MemoryBus;
use vigil_messaging_nats::NatsBus;
use vigil_transport_ws::TransportOptions;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Port agents connect to
    #[arg(long, env = "VIGIL_PORT", default_value_t = 8081)]
    port: u16,

    /// Directory for cluster state
    #[arg(long, env = "VIGIL_STATE_DIR", default_value = "/var/lib/vigil")]
    state_dir: PathBuf,

    /// Name of this member in the initial cluster
    #[arg(long, env = "VIGIL_MEMBER_NAME", default_value = "default")]
    member_name: String,

    #[arg(long, env = "VIGIL_CLUSTER_CLIENT_URL", default_value = "http://127.0.0.1:2379")]
    cluster_client_url: Url,

    #[arg(long, env = "VIGIL_CLUSTER_PEER_URL", default_value = "http://127.0.0.1:2380")]
    cluster_peer_url: Url,

    /// Initial members, `name=peer_url[,name=peer_url...]`
    #[arg(
        long,
        env = "VIGIL_INITIAL_CLUSTER",
        default_value = "default=http://127.0.0.1:2380"
    )]
    initial_cluster: String,

    /// NATS server; an in-process bus is used when unset
    #[arg(long, env = "VIGIL_NATS_URL")]
    nats_url: Option<String>,

    #[arg(long, env = "VIGIL_AGENT_TOPIC", default_value = DEFAULT_AGENT_TOPIC)]
    agent_topic: Topic,

    #[arg(long, env = "VIGIL_LOG_LEVEL", default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .finish(),
    )?;

    let config = BackendConfig {
        listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)),
        state_dir: args.state_dir,
        member_name: args.member_name,
        cluster_client_url: args.cluster_client_url,
        cluster_peer_url: args.cluster_peer_url,
        initial_cluster: args.initial_cluster,
        bus_url: args.nats_url,
        agent_topic: args.agent_topic,
        transport: TransportOptions::default(),
        startup_timeout: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(10),
    };

    match config.bus_url.clone() {
        Some(url) => {
            info!("using NATS bus at {}", url);
            serve(config, NatsBus::connect(&url).await?).await
        }
        None => {
            info!("using in-process bus");
            serve(config, MemoryBus::new()).await
        }
    }
}

async fn serve<B: EventBus>(config: BackendConfig, bus: B) -> Result<()> {
    let backend = Backend::new(BackendOptions { config, bus });

    backend.run().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        () = backend.cluster().wait() => error!("cluster store exited"),
    }

    backend.stop().await
}
