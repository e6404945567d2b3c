use clap::Parser;
use meshcall::application::RoomController;
use meshcall::config::Config;
use meshcall::domain::shared::RoomId;
use meshcall::domain::signaling::ConnectionState;
use meshcall::infrastructure::signaling::{self, HubConnection, HubOptions};
use meshcall::infrastructure::webrtc::{SyntheticMediaSource, WebRtcTransportFactory};
use meshcall::interface::{console, metrics, StatusBroadcaster};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Join a peer-to-peer call room through a SignalR relay
#[derive(Parser, Debug)]
#[command(name = "meshcall", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Relay hub url, e.g. http://localhost:5000/hub/webrtc
    #[arg(long)]
    hub_url: Option<String>,

    /// Room to join instead of the configured default
    #[arg(short, long)]
    room: Option<String>,

    /// Display name announced to the room
    #[arg(short, long)]
    name: Option<String>,

    /// Print status events as JSON lines
    #[arg(long)]
    json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.hub_url {
        config.signaling.hub_url = url;
    }
    if let Some(room) = args.room {
        config.room.default_room = room;
    }
    if let Some(name) = args.name {
        config.signaling.display_name = name;
    }
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting meshcall as '{}'", config.signaling.display_name);

    if let Some(listen) = &config.metrics.listen {
        metrics::init_metrics(listen)?;
        info!("Metrics exporter listening on {}", listen);
    }

    let status = StatusBroadcaster::default();
    let status_log = console::spawn_status_log(status.subscribe(), args.json);

    let hub = HubConnection::new(
        &config.signaling.hub_url,
        HubOptions::from_config(&config.signaling),
    )?;
    let factory = WebRtcTransportFactory::new(&config.ice)?;
    let default_room = config.default_room();
    let config = Arc::new(config);

    let (controller, engine) = RoomController::new(
        config.clone(),
        Arc::new(hub.clone()),
        Arc::new(factory),
        Arc::new(SyntheticMediaSource::new()),
        status.clone(),
    );
    signaling::bind(&hub, &engine);
    let engine_task = controller.spawn();

    info!("Connecting to {}", config.signaling.hub_url);
    status.connection(ConnectionState::Connecting, "Connecting...");
    let connected = tokio::select! {
        result = hub.connect_with_retry() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            hub.stop().await;
            Err(meshcall::DomainError::SignalingClosed)
        }
    };

    match connected {
        Ok(()) => {
            status.connection(hub.state(), "Connected to signaling relay");
            join(&engine, default_room).await;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
        Err(e) => {
            error!("Could not connect to the signaling relay: {}", e);
            status.connection(ConnectionState::Disconnected, format!("Connection failed: {}", e));
        }
    }

    if let Err(e) = engine.shutdown().await {
        warn!("Engine shutdown: {}", e);
    }
    hub.stop().await;
    if let Err(e) = engine_task.await {
        error!("Engine task failed: {}", e);
    }
    drop(engine);
    drop(status);
    status_log.abort();

    info!("meshcall stopped");
    Ok(())
}

async fn join(engine: &meshcall::EngineHandle, room: RoomId) {
    match engine.join_room(room.clone()).await {
        Ok(()) => info!("Joined room {}", room),
        Err(e) => error!("Failed to join room {}: {}", room, e),
    }
}
