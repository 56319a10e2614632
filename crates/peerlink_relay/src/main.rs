//! PeerLink relay server.
//!
//! Run with: peerlink-relay --port 8000 [--saveloc state.json]
//!       or: peerlink-relay --state state.json [--config relay.json]
//!       or: peerlink-relay --config relay.json

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use peerlink_network::logging::{DEFAULT_FILTER, init_logging};
use peerlink_network::relay::DEFAULT_CLEAR_TIME;
use peerlink_network::{RelayConfig, RelayService, RelayState};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "peerlink-relay")]
#[command(about = "Store-and-forward relay for PeerLink nodes")]
struct Args {
    /// Saved state file. When it does not exist yet, --config is used instead.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Config file for a fresh relay.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to serve on when neither --state nor --config is given.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Where to save the relay state. Nothing is saved when unset.
    #[arg(long)]
    saveloc: Option<PathBuf>,

    /// Seconds a node may stay silent before it is forgotten.
    #[arg(long, default_value_t = DEFAULT_CLEAR_TIME)]
    timeout: f64,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Also write daily log files to this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Pick the relay's starting state: saved state, then config, then flags.
fn load_state(args: &Args) -> anyhow::Result<RelayState> {
    if let Some(state) = &args.state {
        return Ok(RelayState::from_state(state, args.config.as_deref())?);
    }
    if let Some(config) = &args.config {
        return Ok(RelayConfig::from_config(config)?.into());
    }
    if args.port > 0 {
        return Ok(RelayConfig {
            port: args.port,
            save_location: args.saveloc.clone(),
            clear_time: args.timeout,
        }
        .into());
    }
    anyhow::bail!("Please include --state, --config, or --port (and optionally --saveloc)")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(DEFAULT_FILTER, args.log_dir.as_deref())?;

    let state = load_state(&args)?;
    let addr = SocketAddr::new(args.host, state.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind relay to {addr}"))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                error!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    let relay = Arc::new(RelayService::new(state));
    relay.serve(listener, shutdown_rx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("peerlink-relay").chain(flags.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let parsed = args(&[]);
        assert_eq!(parsed.port, 0);
        assert_eq!(parsed.timeout, DEFAULT_CLEAR_TIME);
        assert_eq!(parsed.host, IpAddr::from([0, 0, 0, 0]));
    }

    #[test]
    fn test_no_source_is_an_error() {
        assert!(load_state(&args(&[])).is_err());
    }

    #[test]
    fn test_port_flags() {
        let state = load_state(&args(&["--port", "8000", "--saveloc", "s.json", "--timeout", "2"]))
            .unwrap();
        assert_eq!(state.port, 8000);
        assert_eq!(state.save_location, Some(PathBuf::from("s.json")));
        assert_eq!(state.clear_time, 2.0);
    }

    #[test]
    fn test_config_beats_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("relay.json");
        std::fs::write(&config, r#"{"port": 8100, "clear_time": 1.0}"#).unwrap();

        let state =
            load_state(&args(&["--config", config.to_str().unwrap(), "--port", "9000"])).unwrap();
        assert_eq!(state.port, 8100);
    }

    #[test]
    fn test_state_then_config_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("relay.json");
        let saved = dir.path().join("state.json");
        std::fs::write(&config, r#"{"port": 8100}"#).unwrap();

        let flags = [
            "--state",
            saved.to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
        ];
        assert_eq!(load_state(&args(&flags)).unwrap().port, 8100);

        std::fs::write(
            &saved,
            r#"{"port": 8200, "save_location": null, "peers": {}, "altservers": [], "clear_time": 0.5}"#,
        )
        .unwrap();
        assert_eq!(load_state(&args(&flags)).unwrap().port, 8200);

        assert!(load_state(&args(&["--state", dir.path().join("none.json").to_str().unwrap()])).is_err());
    }
}
