//! labbox - per-student lab sandboxes behind a web terminal

use clap::Parser;
use labbox::config::{Args, Commands, Config};
use labbox::http_server;
use labbox::remote::SshRemote;
use labbox::runtime::DockerRuntime;
use labbox::state::AppState;
use labbox::store::SessionStore;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            config,
            port,
            database_url,
        } => {
            let mut config = match config {
                Some(path) => match Config::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("Error: failed to load {}: {}", path.display(), e);
                        exit(1);
                    }
                },
                None => Config::default(),
            };
            config.apply_env();
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(url) = database_url {
                config.database_url = url;
            }

            if let Err(e) = serve(config).await {
                error!("{}", e);
                exit(1);
            }
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = SessionStore::connect(&config.database_url).await?;
    let runtime = DockerRuntime::connect(config.sandbox.shell_port)?;
    let remote = SshRemote::from_config(&config.ssh)?;
    info!(image = %config.sandbox.image, "Sandbox runtime ready");

    let state = AppState::new(config, store, Arc::new(runtime), Arc::new(remote));
    if let Err(e) = state.registry.rediscover().await {
        warn!(error = %e, "Could not rediscover running sandboxes");
    }

    http_server::run_server(state).await?;
    Ok(())
}
