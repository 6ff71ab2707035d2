use std::time::Duration;

use async_trait::async_trait;
use tokio::time;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use super::{Transport, TransportError};
use crate::{
    config::SessionConfig,
    credentials::{CredentialError, LndCredentials},
    node::{LndNode, MacaroonInterceptor},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Direct TLS gRPC connection to lnd's RPC listener.
pub struct DirectGrpc {
    addr: String,
    macaroon_hex: Option<String>,
    tls_ca_cert: Option<Vec<u8>>, // PEM
    tls_domain: Option<String>,
    connect_timeout: Duration,
    channel: Option<Channel>,
}

impl DirectGrpc {
    #[must_use]
    pub fn new(addr: String, macaroon_hex: Option<String>, tls_ca_cert: Option<Vec<u8>>) -> Self {
        Self {
            addr,
            macaroon_hex,
            tls_ca_cert,
            tls_domain: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel: None,
        }
    }

    /// Build a transport for `config.endpoint()` with credentials loaded from `config.lnd_dir`.
    ///
    /// Loading is bounded by `config.connect_timeout`.
    ///
    /// # Errors
    /// [`TransportError::Credentials`] when the certificate or macaroon cannot be loaded in time.
    pub async fn from_config(config: &SessionConfig) -> Result<Self, TransportError> {
        let lnd_dir = config.resolved_lnd_dir();
        let creds = time::timeout(
            config.connect_timeout,
            LndCredentials::load(&lnd_dir, config.network),
        )
        .await
        .map_err(|_| CredentialError::Timeout(lnd_dir.clone()))??;
        Ok(Self::new(
            config.endpoint(),
            Some(creds.macaroon_hex),
            Some(creds.tls_cert_pem),
        )
        .with_connect_timeout(config.connect_timeout))
    }

    /// Deadline for TCP connect plus TLS and HTTP/2 handshakes.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the name checked against the certificate (lnd certs always cover `localhost`).
    #[must_use]
    pub fn with_tls_domain(mut self, domain: impl Into<String>) -> Self {
        self.tls_domain = Some(domain.into());
        self
    }

    fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let mut ep = Endpoint::from_shared(self.addr.clone())
            .map_err(|e| TransportError::connection("invalid gRPC endpoint", e))?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);
        if let Some(ca) = &self.tls_ca_cert {
            let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca.clone()));
            if let Some(domain) = &self.tls_domain {
                tls = tls.domain_name(domain.clone());
            }
            ep = ep
                .tls_config(tls)
                .map_err(|e| TransportError::connection("invalid TLS client config", e))?;
        }
        Ok(ep)
    }
}

#[async_trait]
impl Transport for DirectGrpc {
    type Svc = Channel;
    type Node = LndNode;

    async fn connect(&mut self) -> Result<Self::Svc, TransportError> {
        let ep = self.endpoint()?;
        debug!(target: "lnsdk::transport", addr = %self.addr, "dialing lnd");
        let channel = time::timeout(self.connect_timeout, ep.connect())
            .await
            .map_err(|_| TransportError::Timeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|e| TransportError::connection("direct transport connect failed", e))?;
        debug!(target: "lnsdk::transport", addr = %self.addr, "channel established");
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    fn node(&self, svc: Self::Svc, max_message_size: usize) -> Result<Self::Node, TransportError> {
        let interceptor = MacaroonInterceptor::new(&self.metadata())?;
        Ok(LndNode::new(svc, interceptor, max_message_size))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.channel.take().is_some() {
            debug!(target: "lnsdk::transport", addr = %self.addr, "channel released");
        }
        Ok(())
    }

    fn metadata(&self) -> Vec<(String, String)> {
        match &self.macaroon_hex {
            Some(m) => vec![("macaroon".to_string(), m.clone())],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_carries_macaroon() {
        let t = DirectGrpc::new("https://localhost:10009".into(), Some("ab".into()), None);
        assert_eq!(t.metadata(), vec![("macaroon".to_string(), "ab".to_string())]);
        let t = DirectGrpc::new("https://localhost:10009".into(), None, None);
        assert!(t.metadata().is_empty());
    }

    #[tokio::test]
    async fn invalid_endpoint_is_a_connection_error() {
        let mut t = DirectGrpc::new("not a uri".into(), None, None);
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection { .. }));
    }

    #[tokio::test]
    async fn missing_credentials_surface_as_credential_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig {
            lnd_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let err = DirectGrpc::from_config(&config).await.err().expect("empty lnd dir");
        assert!(matches!(
            err,
            TransportError::Credentials(CredentialError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_daemon_fails_within_deadline() {
        // Port 9 on localhost is the discard service and is closed on test hosts.
        let mut t = DirectGrpc::new("http://127.0.0.1:9".into(), None, None)
            .with_connect_timeout(Duration::from_millis(500));
        let res = time::timeout(Duration::from_secs(5), t.connect()).await;
        let err = res.expect("connect must respect its deadline").unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connection { .. } | TransportError::Timeout { .. }
        ));
    }
}
