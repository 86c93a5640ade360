//! Mesh node binary.
//!
//! `serve` runs a node exposing the demo handlers; `call` joins the mesh,
//! waits for a route and prints the reply. Both use TCP sockets and an etcd
//! coordination store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use micro_mesh::config::loader::load_config;
use micro_mesh::lifecycle::shutdown_signal;
use micro_mesh::observability::{logging, metrics};
use micro_mesh::{BoxError, EtcdStore, MeshConfig, MicroService, TcpTransport};

#[derive(Parser)]
#[command(name = "micro-mesh")]
#[command(about = "Pattern-routed RPC mesh node", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo handlers (role:adder, role:echo)
    Serve,
    /// Send one JSON message and print the reply
    Call {
        /// Message, e.g. '{"role":"adder","a":2,"b":3}'
        message: String,

        /// How long to wait for a peer to appear
        #[arg(long, default_value_t = 10_000)]
        discover_ms: u64,
    },
}

fn load(path: Option<&Path>) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => {
            let mut config = MeshConfig::default();
            config.apply_env();
            Ok(config)
        }
    }
}

async fn add(message: Value) -> Result<Value, BoxError> {
    let a = message["a"].as_f64().ok_or("field 'a' must be a number")?;
    let b = message["b"].as_f64().ok_or("field 'b' must be a number")?;
    let sum = a + b;
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        Ok(json!({ "sum": sum as i64 }))
    } else {
        Ok(json!({ "sum": sum }))
    }
}

async fn echo(message: Value) -> Result<Value, BoxError> {
    Ok(message)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(cli.config.as_deref())?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!("micro-mesh v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to install metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let transport = Arc::new(TcpTransport::new(&config.listener));
    let store = Arc::new(EtcdStore::new(&config.store)?);

    match cli.command {
        Commands::Serve => {
            let mut builder = MicroService::builder(config);
            builder
                .register_handler("role:adder", add)?
                .register_handler("role:echo", echo)?
                .on_ready(|| tracing::info!("Node discoverable"));
            let service = builder.start(transport, store).await?;

            tracing::info!(address = %service.address(), host_id = %service.host_id(), "Serving");
            shutdown_signal().await;
            service.shutdown().await;
        }
        Commands::Call { message, discover_ms } => {
            let message: Value = serde_json::from_str(&message)?;
            let service = MicroService::builder(config).start(transport, store).await?;

            let deadline = tokio::time::Instant::now() + Duration::from_millis(discover_ms);
            while !service.is_routable(&message) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let result = service.send(message).await;
            service.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
