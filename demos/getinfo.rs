use lnsdk::transport::{direct::DirectGrpc, Transport};
use lnsdk::NodeRpc;
use tokio::fs;

/// One-shot `GetInfo` against lnd without starting a session.
///
/// Usage: cargo run --example getinfo -- --addr https://127.0.0.1:10009 \
///            --macaroon ~/.lnd/data/chain/bitcoin/mainnet/admin.macaroon --tls-cert ~/.lnd/tls.cert
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let addr = flag_value(&args, "--addr").unwrap_or_else(|| "https://127.0.0.1:10009".to_string());

    let macaroon = match flag_value(&args, "--macaroon") {
        Some(path) => Some(hex::encode(fs::read(path).await?)),
        None => None,
    };
    let tls = match flag_value(&args, "--tls-cert") {
        Some(path) => Some(fs::read(path).await?),
        None => None,
    };

    let mut transport = DirectGrpc::new(addr, macaroon, tls);
    let channel = transport.connect().await?;
    let node = transport.node(channel, lnsdk::config::MAX_MESSAGE_SIZE)?;
    let info = node.get_info().await?;
    println!("{info:?}");
    transport.disconnect().await?;
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}
