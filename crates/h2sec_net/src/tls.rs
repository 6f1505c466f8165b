use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::SystemTime;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

use crate::transport::{BoxedStream, TransportBuilder};

const ALPN_H2: &[u8] = b"h2";

/// rustls client that only negotiates `h2` through ALPN.
pub struct TlsProvider {
    connector: TlsConnector,
}

impl TlsProvider {
    /// `insecure` accepts any certificate, for targets running with
    /// self-signed test certificates.
    pub fn new(insecure: bool) -> Result<Self> {
        let builder = ClientConfig::builder().with_safe_defaults();

        let mut config = if insecure {
            builder
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
                .with_no_client_auth()
        } else {
            let mut root_store = RootCertStore::empty();
            root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Runs the TLS handshake over `stream` and checks that the server
    /// selected `h2`.
    pub async fn handshake(&self, domain: &str, stream: BoxedStream) -> Result<BoxedStream> {
        let server_name = ServerName::try_from(domain)
            .map_err(|e| anyhow::anyhow!("invalid server name {:?}: {}", domain, e))?;

        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .context("TLS handshake failed")?;

        let (_, session) = tls_stream.get_ref();
        if session.alpn_protocol() != Some(ALPN_H2) {
            anyhow::bail!("server did not negotiate h2 via ALPN");
        }

        Ok(TransportBuilder::into_boxed(tls_stream))
    }
}

struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
