// src/main.rs

//! The main entry point for the SpinelChat broker.

use anyhow::Result;
use spinelchat::config::Config;
use spinelchat::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const VERSION: &str = env!("SPINELCHAT_BUILD_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("SpinelChat version {VERSION}");
        return Ok(());
    }

    // The configuration file is optional; built-in defaults apply without it.
    let explicit_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let config_path = explicit_path.clone().unwrap_or_else(|| "config.toml".to_string());

    let (mut config, loaded_from) = if explicit_path.is_some()
        || std::path::Path::new(&config_path).exists()
    {
        match Config::from_file(&config_path) {
            Ok(cfg) => (cfg, Some(config_path)),
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
                std::process::exit(1);
            }
        }
    } else {
        (Config::default(), None)
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        let Some(port_str) = args.get(port_index + 1) else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        };
        match port_str.parse::<u16>() {
            Ok(port) => config.port = port,
            Err(_) => {
                eprintln!("Invalid port number: {port_str}");
                std::process::exit(1);
            }
        }
        if let Err(e) = config.validate() {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(1);
        }
    }

    // RUST_LOG wins over the configured level.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config, loaded_from, Arc::new(reload_handle)).await {
        error!("Broker runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
