//! rpc-node: a standalone RPC server.
//!
//! Serves the built-in `echo`, `ping` and `echo.push` services; useful as a
//! smoke-test target for `rpc-call` and as a template for embedding
//! [`RpcServer`] in an application.

use std::path::PathBuf;

use clap::Parser;

use rpc_transport::config::{load_config, TransportConfig};
use rpc_transport::duplex::Envelope;
use rpc_transport::lifecycle::signals::shutdown_on_signal;
use rpc_transport::net::Listener;
use rpc_transport::observability::{logging, metrics};
use rpc_transport::server::{handler_fn, HandlerError, HandlerRegistry, RpcServer};
use rpc_transport::{ChannelKind, RpcRequest, RpcResponse, Shutdown};

#[derive(Parser)]
#[command(name = "rpc-node")]
#[command(about = "RPC transport server", long_about = None)]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TransportConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-node starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.server).await?;
    let server = RpcServer::new(config.server.clone(), builtin_services())?;

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn builtin_services() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            "echo",
            handler_fn(|_ctx, request: RpcRequest| async move {
                Ok::<_, HandlerError>(RpcResponse::new(request.args))
            }),
        )
        .register(
            "ping",
            handler_fn(|_ctx, _request| async {
                Ok::<_, HandlerError>(RpcResponse::new("pong".into()))
            }),
        )
        .register(
            "echo.push",
            handler_fn(|ctx, request: RpcRequest| async move {
                let Some(push) = ctx.push else {
                    return Err(HandlerError::BadRequest("echo.push needs a duplex channel".into()));
                };
                let message = RpcRequest::new("echo.push")
                    .with_channel(ChannelKind::Notify)
                    .with_args(request.args);
                push.send(Envelope::request(0, &message))
                    .await
                    .map_err(|e| HandlerError::Unavailable(e.to_string()))?;
                Ok(RpcResponse::empty())
            }),
        )
}
