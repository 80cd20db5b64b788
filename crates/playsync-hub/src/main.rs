use playsync_hub::core::HubEvent;
use playsync_hub::http;
use playsync_hub::Hub;
use playsync_proto::config::Config;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = playsync_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("hub.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,playsync_hub=debug")),
        )
        .init();

    eprintln!("playsync-hub: logging to {}", log_path.display());
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    info!("Media root: {:?}", config.hub.media_root);

    let bind_address = config.hub.bind_address.clone();
    let port = config.hub.port;
    let hub = Hub::new(config);
    let state = hub.state();
    let event_tx = state.event_tx.clone();
    let core = tokio::spawn(hub.run());

    let server = http::start_server(bind_address.clone(), port, state);
    eprintln!("playsync-hub: listening on http://{}:{}", bind_address, port);

    tokio::select! {
        _ = server => warn!("HTTP server stopped"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    // Lets the core stop an mpv it spawned.
    let _ = event_tx.send(HubEvent::Shutdown).await;
    core.await??;
    Ok(())
}
