// src/main.rs

//! The main entry point for the cluster failover daemon.

use clusterward::config::Config;
use clusterward::core::daemon;
use std::env;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("clusterwardd version {VERSION}");
        return;
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    // A reloadable filter layer: SIGHUP doesn't change the log level by
    // itself today, but the handle is wired up so a future config-driven
    // level change has somewhere to plug in, the way the teacher's server
    // entry point keeps one around for its own reload path.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let config = match Config::from_file(config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(daemon::ExitCode::BadConfig as i32);
        }
    };

    let exit_code = daemon::run(config).await;
    std::process::exit(exit_code as i32);
}
