use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use lnsdk::{
    config::{DEFAULT_RPC_HOST, DEFAULT_RPC_PORT},
    LoggingListener, Network, Session, SessionConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Attach to lnd, log every invoice, HTLC event and intercepted forward until Ctrl-C.
///
/// Usage: RUST_LOG=lnsdk=debug cargo run --example monitor -- --lnd-dir ~/.lnd --network testnet
#[derive(Parser)]
#[command(name = "monitor")]
#[command(about = "Stream lnd events through an lnsdk session")]
struct Cli {
    /// Host of the lnd gRPC listener.
    #[arg(long, visible_alias = "lnh", default_value = DEFAULT_RPC_HOST)]
    ln_host: String,

    /// Port of the lnd gRPC listener.
    #[arg(long, visible_alias = "lnp", default_value_t = DEFAULT_RPC_PORT)]
    ln_port: u16,

    /// Network whose admin macaroon is used.
    #[arg(long, short = 'n', visible_alias = "n", default_value_t = Network::Mainnet)]
    network: Network,

    /// lnd data directory holding tls.cert and data/chain/bitcoin/<network>/admin.macaroon.
    #[arg(long)]
    lnd_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lnsdk=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = SessionConfig {
        host: cli.ln_host,
        port: cli.ln_port,
        network: cli.network,
        lnd_dir: cli.lnd_dir,
        ..SessionConfig::default()
    };

    let session = Session::connect(Arc::new(LoggingListener), config).await?;
    let node = session.get_info().await?;
    info!(alias = %node.alias, pubkey = %node.identity_pubkey, "attached; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    for status in session.feed_statuses() {
        info!(feed = %status.id, kind = %status.kind, state = ?status.state, "feed at shutdown");
    }
    session.cleanup().await?;
    Ok(())
}
