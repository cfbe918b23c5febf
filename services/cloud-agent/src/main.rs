// cloud-agent: device-side cloud attachment daemon.
//
// Deployments embed the library and register concrete media streams and
// event producers; the bare binary runs the control session alone, which is
// enough to register, answer config pages, and accept sync commands against
// an empty timeline.

use cloud_agent::agent::Agent;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "cloud-agent starting");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match config_path {
        Some(path) => cloud_agent::config::load_config_from_path(&path),
        None => cloud_agent::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                api = %cfg.access_token.api,
                cam = %cfg.access_token.cam,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let agent = Agent::start(cfg, Vec::new(), Vec::new());

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: unable to wait for shutdown signal: {e}");
    }
    info!("shutdown signal received");
    agent.stop().await;
}
