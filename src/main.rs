use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use raindrop_notes::api::RaindropClient;
use raindrop_notes::config::{Cli, Config, default_config_path};
use raindrop_notes::render::renderer_from_config;
use raindrop_notes::sync::Syncer;
use raindrop_notes::{logging, unpack_error};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let config_path = args
        .config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let cfg = Config::new(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to load config file {:?}: {:#}", config_path, e);
        std::process::exit(1);
    });

    let _log_guard = logging::init(cfg.log_file.as_deref()).unwrap_or_else(|e| {
        eprintln!("failed to setup logging: {:#}", e);
        std::process::exit(1);
    });
    tracing::info!(config = ?config_path, "raindrop-notes starting");

    if let Err(e) = std::fs::create_dir_all(&cfg.target_dir) {
        tracing::error!(error = %e, path = ?cfg.target_dir, "failed to create target directory");
        std::process::exit(1);
    }
    tracing::info!("'{}' will be used as target directory", cfg.target_dir.display());

    let renderer = renderer_from_config(&cfg).unwrap_or_else(|e| {
        tracing::error!(error = %unpack_error(&e), "failed to load templates");
        std::process::exit(1);
    });
    let client = RaindropClient::new(&cfg).unwrap_or_else(|e| {
        tracing::error!(error = %unpack_error(&e), "failed to setup raindrop client");
        std::process::exit(1);
    });

    let syncer = Arc::new(Syncer::new(&cfg, Arc::new(client), renderer));
    let cancellation_token = CancellationToken::new();

    let sync_task = {
        let syncer = Arc::clone(&syncer);
        let token = cancellation_token.clone();
        let interval = cfg.sync_interval();
        tokio::spawn(async move { syncer.run(interval, token).await })
    };

    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("ctrl+c signal received, stopping sync loop"),
        Err(e) => tracing::error!(error = %e, "failed to listen for ctrl+c, stopping sync loop"),
    }
    cancellation_token.cancel();

    if let Err(e) = sync_task.await {
        tracing::error!(error = %e, "sync loop ended abnormally");
    }
    tracing::info!("raindrop-notes stopped");
}
