//!
//! inscribe server binary
//! ----------------------
//! Command-line entry point for the signing server. Configuration comes from
//! a YAML file; the path is taken from `--config` or `INSCRIBE_CONFIG`.

use anyhow::{bail, Result};
use std::env;

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!(
            "inscribed - SSH certificate signing server\n\n\
             USAGE:\n  inscribed [--config PATH] [--listen ADDR] [--check]\n\n\
             OPTIONS:\n  \
             --config PATH   Configuration file (env: INSCRIBE_CONFIG, default /etc/inscribe/config.yaml)\n  \
             --listen ADDR   Override the configured bind address\n  \
             --check         Validate the configuration and exit\n"
        );
        return Ok(());
    }

    let config_path = parse_arg(&args, "--config")
        .or_else(|| env::var("INSCRIBE_CONFIG").ok())
        .unwrap_or_else(|| "/etc/inscribe/config.yaml".to_string());

    let mut config = inscribe::config::Config::load(&config_path)?;
    if let Some(listen) = parse_arg(&args, "--listen") {
        config.listen = listen;
    }

    if has_flag(&args, "--check") {
        // Build everything the server would build, then exit.
        let fingerprints = config.ca_fingerprints().unwrap_or_default();
        if let Err(e) = config.build_pipeline(fingerprints) {
            bail!("configuration invalid: {}", e);
        }
        println!("configuration ok: {}", config_path);
        return Ok(());
    }

    println!("inscribed starting: listen={}, config={}", config.listen, config_path);
    tracing::info!("using configuration {}", config_path);
    inscribe::server::run(config).await
}
