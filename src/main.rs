//! CAPC - Cluster API infrastructure provider for Apache CloudStack

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capc::crd::all_crds;
use capc::webhook::{self, DEFAULT_WEBHOOK_PORT};

/// CAPC - CloudStack infrastructure for Cluster API
#[derive(Parser, Debug)]
#[command(name = "capc", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, env = "CAPC_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every CRD with all served versions as YAML and exit
    Crd,

    /// Serve the CRD conversion webhook
    Webhook(WebhookArgs),
}

/// Webhook mode arguments
#[derive(Parser, Debug)]
struct WebhookArgs {
    /// Address to listen on
    #[arg(long, env = "CAPC_WEBHOOK_BIND")]
    bind: Option<SocketAddr>,

    /// PEM certificate presented to the API server
    #[arg(long, env = "CAPC_TLS_CERT")]
    tls_cert: PathBuf,

    /// PEM private key of the certificate
    #[arg(long, env = "CAPC_TLS_KEY")]
    tls_key: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    match cli.command {
        Commands::Crd => print_crds(),
        Commands::Webhook(args) => run_webhook(args).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = all_crds().map_err(|e| anyhow::anyhow!("Failed to build CRDs: {}", e))?;
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)));
    let cert = tokio::fs::read(&args.tls_cert)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", args.tls_cert, e))?;
    let key = tokio::fs::read(&args.tls_key)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", args.tls_key, e))?;

    webhook::serve(bind, cert, key)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
