//! claw-stream-bridge - serve a stdio JSON engine over HTTP and SSE
//!
//! ## Usage
//!
//! ```bash
//! ENGINE_PATH=/usr/local/bin/engine PORT=8000 claw-stream-bridge
//! claw-stream-bridge --engine-path ./engine --engine-arg --stdio --port 9000
//! ```
//!
//! Logs go to stderr; the engine's own stderr is passed through unchanged.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use claw_stream_bridge::config::DEFAULT_PORT;
use claw_stream_bridge::{BridgeConfig, BridgeService};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-stream-bridge")]
#[command(about = "Expose a stdio JSON engine to many clients over HTTP and SSE")]
#[command(version)]
struct Cli {
    /// Engine executable
    #[arg(long, env = "ENGINE_PATH")]
    engine_path: PathBuf,

    /// Argument passed to the engine unchanged (repeatable). Without any,
    /// `ENGINE_ARGS` is read and split on whitespace.
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen address
    #[arg(long, env = "BRIDGE_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let bind_addr = SocketAddr::new(cli.host, cli.port);
    let engine_args = resolve_engine_args(cli.engine_args, std::env::var("ENGINE_ARGS").ok());
    let config = BridgeConfig::new(cli.engine_path, bind_addr).with_engine_args(engine_args);

    info!(
        engine = %config.engine_path.display(),
        args = ?config.engine_args,
        addr = %bind_addr,
        "starting claw-stream-bridge"
    );

    let service = match BridgeService::new(config) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = service.run(shutdown_signal()).await {
        error!(error = %e, "bridge failed");
        std::process::exit(1);
    }

    Ok(())
}

fn resolve_engine_args(from_cli: Vec<String>, from_env: Option<String>) -> Vec<String> {
    if !from_cli.is_empty() {
        return from_cli;
    }
    from_env
        .map(|args| args.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default()
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("claw_stream_bridge=info,tower_http=info"))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(io::stderr).with_ansi(false))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
        info!("received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_engine_arg_values_are_not_split() {
        let cli = Cli::try_parse_from([
            "claw-stream-bridge",
            "--engine-path",
            "/usr/bin/engine",
            "--engine-arg",
            "a b",
            "--engine-arg",
            "--stdio",
        ])
        .unwrap();

        assert_eq!(cli.engine_args, vec!["a b".to_string(), "--stdio".to_string()]);
        assert_eq!(
            resolve_engine_args(cli.engine_args, Some("ignored args".into())),
            vec!["a b".to_string(), "--stdio".to_string()]
        );
    }

    #[test]
    fn test_env_engine_args_split_on_whitespace() {
        assert_eq!(
            resolve_engine_args(Vec::new(), Some("  --stdio   --verbose ".into())),
            vec!["--stdio".to_string(), "--verbose".to_string()]
        );
        assert!(resolve_engine_args(Vec::new(), None).is_empty());
    }
}
