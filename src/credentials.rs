use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::config::{Network, DEFAULT_MACAROON_FILENAME, DEFAULT_TLS_CERT_FILENAME};

const PEM_CERT_HEADER: &[u8] = b"-----BEGIN CERTIFICATE-----";

/// Failure to read or validate lnd's authentication material.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read {what} at {}", .path.display())]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tls certificate at {} is not PEM encoded", .0.display())]
    InvalidCertificate(PathBuf),
    #[error("macaroon at {} is empty", .0.display())]
    EmptyMacaroon(PathBuf),
    #[error("timed out loading credentials from {}", .0.display())]
    Timeout(PathBuf),
}

/// TLS certificate and macaroon for one lnd node.
#[derive(Clone)]
pub struct LndCredentials {
    /// PEM encoded `tls.cert`.
    pub tls_cert_pem: Vec<u8>,
    /// Hex encoded macaroon, sent as the `macaroon` request header.
    pub macaroon_hex: String,
}

impl fmt::Debug for LndCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LndCredentials")
            .field("tls_cert_pem", &format_args!("<{} bytes>", self.tls_cert_pem.len()))
            .field("macaroon_hex", &"<redacted>")
            .finish()
    }
}

impl LndCredentials {
    /// Location of `tls.cert` under `lnd_dir`.
    #[must_use]
    pub fn tls_cert_path(lnd_dir: &Path) -> PathBuf {
        lnd_dir.join(DEFAULT_TLS_CERT_FILENAME)
    }

    /// Location of the admin macaroon for `network` under `lnd_dir`.
    #[must_use]
    pub fn macaroon_path(lnd_dir: &Path, network: Network) -> PathBuf {
        lnd_dir
            .join("data/chain/bitcoin")
            .join(network.as_str())
            .join(DEFAULT_MACAROON_FILENAME)
    }

    /// Read the certificate and macaroon from an lnd directory.
    ///
    /// # Errors
    /// Returns [`CredentialError`] when a file cannot be read, the certificate lacks PEM
    /// framing, or the macaroon is empty.
    pub async fn load(lnd_dir: &Path, network: Network) -> Result<Self, CredentialError> {
        let cert_path = Self::tls_cert_path(lnd_dir);
        let macaroon_path = Self::macaroon_path(lnd_dir, network);
        debug!(
            target: "lnsdk::credentials",
            cert = %cert_path.display(),
            macaroon = %macaroon_path.display(),
            "loading credentials"
        );

        let tls_cert_pem =
            tokio::fs::read(&cert_path)
                .await
                .map_err(|source| CredentialError::Read {
                    what: "tls certificate",
                    path: cert_path.clone(),
                    source,
                })?;
        if !contains(&tls_cert_pem, PEM_CERT_HEADER) {
            return Err(CredentialError::InvalidCertificate(cert_path));
        }

        let macaroon =
            tokio::fs::read(&macaroon_path)
                .await
                .map_err(|source| CredentialError::Read {
                    what: "macaroon",
                    path: macaroon_path.clone(),
                    source,
                })?;
        if macaroon.is_empty() {
            return Err(CredentialError::EmptyMacaroon(macaroon_path));
        }

        Ok(Self {
            tls_cert_pem,
            macaroon_hex: hex::encode(macaroon),
        })
    }

    /// Per-request metadata carrying the macaroon.
    #[must_use]
    pub fn metadata(&self) -> Vec<(String, String)> {
        vec![("macaroon".to_string(), self.macaroon_hex.clone())]
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
