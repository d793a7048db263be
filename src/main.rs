//! mocap-relay - Motion capture ingestion and live pose relay
//!
//! Main entry point for the CLI application.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mocap_relay::{config::Config, scene::Scene, web::WebServer, AppState, Relay};

/// mocap-relay - Relay motion capture to web VTuber viewers
#[derive(Parser, Debug)]
#[command(name = "mocap-relay", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Web server IP (overrides config)
    #[arg(long)]
    web_ip: Option<String>,

    /// Web server port (overrides config)
    #[arg(short = 'p', long)]
    web_port: Option<u16>,

    /// VMC listen IP (overrides config)
    #[arg(long)]
    vmc_ip: Option<String>,

    /// VMC listen port (overrides config)
    #[arg(long)]
    vmc_port: Option<u16>,

    /// Pose pushes per second to each viewer (overrides config)
    #[arg(short = 'f', long)]
    update_frequency: Option<u32>,

    /// FaceMotion3D device IP; enables the FaceMotion3D receiver
    #[arg(long)]
    fm3d_device: Option<String>,

    /// Receiver active at startup (overrides config)
    #[arg(short, long)]
    receiver: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting {} v{}", mocap_relay::NAME, mocap_relay::VERSION);

    let runtime = tokio::runtime::Runtime::new()?;

    let state = runtime.block_on(async { setup_and_spawn_services(&args).await })?;

    runtime.block_on(async {
        shutdown_signal().await;
        info!("Shutdown signal received");
        state.shutdown();
        state.relay.stop_all().await;

        // Give the HTTP server a moment to drain
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    });

    info!("mocap-relay stopped");
    Ok(())
}

/// Load config, build the relay, and spawn the receivers and HTTP server.
async fn setup_and_spawn_services(args: &Args) -> anyhow::Result<Arc<AppState>> {
    // Load configuration
    let mut config = if let Some(ref path) = args.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_overrides(&mut config, args);

    // Validate configuration
    config.validate()?;

    info!("Receivers: {}", config.enabled_receivers().join(", "));
    info!("Default receiver: {}", config.relay.default_receiver);
    info!("Update frequency: {} Hz", config.relay.update_frequency);

    let scene = match Scene::load(&config.files.scene_path) {
        Ok(scene) => scene,
        Err(e) => {
            warn!("Ignoring scene file: {}", e);
            Scene::default()
        }
    };

    let relay = Relay::from_config(&config, scene)?;
    relay.start_all();

    let state = AppState::new(config, relay);

    let http_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = run_http_server(http_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    Ok(state)
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ref ip) = args.web_ip {
        config.http.host = ip.clone();
    }
    if let Some(port) = args.web_port {
        config.http.port = port;
    }
    if args.vmc_ip.is_some() || args.vmc_port.is_some() {
        let (host, port) = config
            .vmc
            .listen_addr
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.to_string()))
            .unwrap_or_else(|| (config.vmc.listen_addr.clone(), "39540".to_string()));

        let host = args.vmc_ip.clone().unwrap_or(host);
        let port = args.vmc_port.map(|p| p.to_string()).unwrap_or(port);
        config.vmc.listen_addr = format!("{}:{}", host, port);
    }
    if let Some(frequency) = args.update_frequency {
        config.relay.update_frequency = frequency;
    }
    if let Some(ref device) = args.fm3d_device {
        config.facemotion3d.enabled = true;
        config.facemotion3d.device_addr = device.clone();
    }
    if let Some(ref receiver) = args.receiver {
        config.relay.default_receiver = receiver.clone();
    }
}

async fn run_http_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let web_server = WebServer::new(Arc::clone(&state), &state.config.http);
    let mut shutdown_rx = state.subscribe_shutdown();

    web_server
        .serve(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
