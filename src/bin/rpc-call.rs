use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;

use rpc_transport::config::{ClientConfig, KeepaliveConfig, ObservabilityConfig};
use rpc_transport::observability::logging;
use rpc_transport::{
    ChannelKind, ClientTransport, Endpoint, KeepaliveSession, RpcRequest, ServiceInvoker, Verb,
};

#[derive(Parser)]
#[command(name = "rpc-call")]
#[command(about = "Invoke a service on an RPC node", long_about = None)]
struct Cli {
    /// Node URL: http(s):// for plain calls, ws(s):// for duplex.
    #[arg(short, long, default_value = "http://127.0.0.1:7700")]
    url: String,

    /// Caller identity sent as x-rpc-access.
    #[arg(short, long)]
    access: Option<String>,

    /// Log level for transport diagnostics.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One request/response over HTTP/1.1
    Call {
        service: String,
        /// JSON arguments
        #[arg(default_value = "null")]
        args: String,
        #[arg(long, default_value = "POST")]
        verb: String,
        /// DIRECT, NOTIFY or NOTIFY+BROADCAST
        #[arg(long, default_value = "DIRECT")]
        channel: String,
        /// Log headers and payload sizes
        #[arg(long)]
        debug: bool,
    },
    /// One request over a duplex channel, then print pushed messages
    Duplex {
        service: String,
        #[arg(default_value = "null")]
        args: String,
        /// Seconds to keep listening for pushes after the reply
        #[arg(long, default_value_t = 0)]
        listen: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(&ObservabilityConfig {
        log_level: cli.log_level.clone(),
        ..ObservabilityConfig::default()
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Call {
            service,
            args,
            verb,
            channel,
            debug,
        } => {
            let args: Value = serde_json::from_str(&args)?;
            let verb = parse_verb(&verb)?;
            let channel: ChannelKind = channel.parse()?;
            let config = ClientConfig {
                debug,
                ..ClientConfig::default()
            };

            let transport = ClientTransport::new(config, runtime.handle().clone());
            let mut invoker = ServiceInvoker::new(transport, Endpoint::parse(&cli.url)?).with_channel(channel);
            if let Some(access) = cli.access {
                invoker = invoker.with_access(access);
            }

            // Blocks this (non-runtime) thread on the bridge.
            let response = invoker.invoke_blocking(&service, verb, args)?;
            println!("{}", serde_json::to_string_pretty(&response.value)?);
        }
        Commands::Duplex { service, args, listen } => {
            let args: Value = serde_json::from_str(&args)?;
            runtime.block_on(duplex(&cli.url, cli.access, service, args, listen))?;
        }
    }

    Ok(())
}

async fn duplex(
    url: &str,
    access: Option<String>,
    service: String,
    args: Value,
    listen: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = KeepaliveConfig::default();
    let connect_timeout = config.connect_timeout();
    let session = KeepaliveSession::connect_ws(url, config)?;
    let mut pushes = session.subscribe();

    if !session.wait_connected(connect_timeout).await {
        return Err(format!("could not connect to {url}").into());
    }

    let mut request = RpcRequest::new(service).with_args(args);
    if let Some(access) = access {
        request = request.with_access(access);
    }
    let response = session.request(request).await?;
    println!("{}", serde_json::to_string_pretty(&response.value)?);

    let deadline = tokio::time::sleep(Duration::from_secs(listen));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            push = pushes.recv() => match push {
                Ok(envelope) => println!("{}", envelope.encode()?),
                Err(_) => break,
            },
        }
    }

    session.close();
    Ok(())
}

fn parse_verb(verb: &str) -> Result<Verb, String> {
    let method = verb
        .to_ascii_uppercase()
        .parse::<hyper::Method>()
        .map_err(|e| e.to_string())?;
    Verb::from_method(&method).ok_or_else(|| format!("unsupported verb '{verb}'"))
}
