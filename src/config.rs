use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::listener::ForwardAction;

/// Default lnd gRPC host.
pub const DEFAULT_RPC_HOST: &str = "localhost";
/// Default lnd gRPC port.
pub const DEFAULT_RPC_PORT: u16 = 10009;
/// File name of lnd's TLS certificate inside the lnd directory.
pub const DEFAULT_TLS_CERT_FILENAME: &str = "tls.cert";
/// File name of the admin macaroon inside the per-network chain directory.
pub const DEFAULT_MACAROON_FILENAME: &str = "admin.macaroon";
/// Terminated feeds whose status rows are kept before the oldest are dropped.
pub const DEFAULT_RETAINED_CLOSED_FEEDS: usize = 1024;
/// Upper bound for a single inbound gRPC message (100 MiB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Bitcoin network the node runs on; selects the macaroon sub-directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Signet,
    Regtest,
    Simnet,
}

impl Network {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
            Network::Simnet => "simnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported network {0:?} (expected mainnet, testnet, signet, regtest or simnet)")]
pub struct ParseNetworkError(pub String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            "simnet" => Ok(Network::Simnet),
            _ => Err(ParseNetworkError(s.to_string())),
        }
    }
}

/// How the channel snapshot used for counterparty lookups is maintained.
///
/// `Static` takes one snapshot at session start and never refreshes it, so lookups
/// for channels opened later miss. `Periodic` re-lists channels on a fixed interval.
/// Either way [`crate::Session::refresh_channel_snapshot`] can be called explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    #[default]
    Static,
    Periodic { every: Duration },
}

/// Immutable per-session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host name or IP of the lnd gRPC listener.
    pub host: String,
    /// Port of the lnd gRPC listener.
    pub port: u16,
    /// Network used to locate the macaroon.
    pub network: Network,
    /// lnd data directory; a leading `~` expands to the home directory.
    pub lnd_dir: PathBuf,
    /// Deadline for credential loading and the TLS/HTTP2 handshake.
    pub connect_timeout: Duration,
    /// Deadline for every RPC the session issues: unary calls, and the daemon's
    /// acknowledgement when a stream is opened. Expiry surfaces as `DEADLINE_EXCEEDED`.
    pub rpc_timeout: Duration,
    /// How long `cleanup` waits for dispatch tasks before aborting them.
    pub shutdown_timeout: Duration,
    /// Largest inbound message accepted from lnd.
    pub max_message_size: usize,
    /// Decision sent for an intercepted forward when the listener does not decide.
    ///
    /// Defaults to [`ForwardAction::Resume`]: undecided forwards proceed. Risk-averse
    /// deployments should set [`ForwardAction::Reject`].
    pub default_forward_action: ForwardAction,
    /// Refresh behaviour of the channel snapshot.
    pub snapshot_policy: SnapshotPolicy,
    /// Status rows of terminated feeds kept for inspection. Once exceeded, the oldest
    /// terminated rows are dropped; open feeds are never dropped.
    pub retained_closed_feeds: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
            network: Network::default(),
            lnd_dir: PathBuf::from("~/.lnd"),
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
            default_forward_action: ForwardAction::Resume,
            snapshot_policy: SnapshotPolicy::Static,
            retained_closed_feeds: DEFAULT_RETAINED_CLOSED_FEEDS,
        }
    }
}

impl SessionConfig {
    /// `https://host:port` endpoint of the gRPC listener.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// The lnd directory with `~` expanded.
    #[must_use]
    pub fn resolved_lnd_dir(&self) -> PathBuf {
        expand_home(&self.lnd_dir)
    }
}

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a leading `~`, or hosts without a home directory, are returned unchanged.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
