//! TLS listener answering TLS-ALPN-01 validation
//!
//! Handshakes offering `acme-tls/1` get the validation certificate and are
//! closed right after; every other handshake gets the selector's certificate
//! and is served by the regular HTTP endpoint.

use super::alpn::ACME_TLS_ALPN_NAME;
use super::selector::AcmeCertResolver;
use crate::defaults::TLS_HANDSHAKE_TIMEOUT;
use crate::http::HttpEndpoint;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub fn server_config(resolver: Arc<AcmeCertResolver>) -> Result<ServerConfig, rustls::Error> {
    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec(), ACME_TLS_ALPN_NAME.to_vec()];
    Ok(config)
}

#[derive(Clone)]
pub struct TlsValidationListener {
    acceptor: TlsAcceptor,
    endpoint: HttpEndpoint,
}

impl TlsValidationListener {
    pub fn new(
        resolver: Arc<AcmeCertResolver>,
        endpoint: HttpEndpoint,
    ) -> Result<Self, rustls::Error> {
        let config = server_config(resolver)?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            endpoint,
        })
    }

    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "TLS validation listener listening");
        }
        loop {
            let (stream, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept TLS connection");
                        continue;
                    }
                },
            };
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream, cancel).await {
                    tracing::debug!(remote = %remote, error = %e, "TLS connection failed");
                }
            });
        }
        tracing::info!("TLS validation listener stopped");
    }

    async fn handle(self, stream: TcpStream, cancel: CancellationToken) -> std::io::Result<()> {
        let accept = self.acceptor.accept(stream);
        let mut tls = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, accept) => {
                result.map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??
            }
        };

        let (_, session) = tls.get_ref();
        if session.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
            tracing::info!(
                hostname = session.server_name().unwrap_or_default(),
                "Completed TLS-ALPN-01 validation handshake"
            );
            return tls.shutdown().await;
        }

        self.endpoint.serve_connection(tls, cancel).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::alpn::AlpnChallengeResponder;
    use crate::tls::challenge::ChallengeResponseStore;
    use crate::tls::selector::CertificateSelector;
    use certpilot_core::{HostnameSet, ManagedCertificate, SystemClock};
    use rcgen::{CertificateParams, KeyPair};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::time::UNIX_EPOCH;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    /// Validation servers do not check the chain; neither does this client.
    #[derive(Debug)]
    struct AcceptAnyCertificate(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    fn connector(alpn: &[u8]) -> TlsConnector {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.to_vec()];
        TlsConnector::from(Arc::new(config))
    }

    fn served_certificate(hostname: &str) -> ManagedCertificate {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![hostname.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        ManagedCertificate::from_pem(
            HostnameSet::new([hostname]).unwrap(),
            &cert.pem(),
            &key.serialize_pem(),
            UNIX_EPOCH,
        )
        .unwrap()
    }

    struct Fixture {
        addr: std::net::SocketAddr,
        alpn: AlpnChallengeResponder,
        challenges: ChallengeResponseStore,
        served: ManagedCertificate,
        cancel: CancellationToken,
    }

    async fn start() -> Fixture {
        crate::tls::install_rustls_crypto_provider();
        let served = served_certificate("example.com");
        let selector = Arc::new(CertificateSelector::new(Arc::new(SystemClock)));
        selector.add(&served).unwrap();
        let alpn = AlpnChallengeResponder::new();
        let challenges = ChallengeResponseStore::new();

        let resolver = Arc::new(AcmeCertResolver::new(alpn.clone(), selector));
        let listener = TlsValidationListener::new(
            resolver,
            HttpEndpoint::new(challenges.clone(), None),
        )
        .unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(listener.serve(tcp, cancel.clone()));

        Fixture {
            addr,
            alpn,
            challenges,
            served,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_acme_tls_handshake_presents_validation_certificate() {
        let fixture = start().await;
        fixture
            .alpn
            .register("example.com", "token.thumbprint")
            .unwrap();

        let stream = TcpStream::connect(fixture.addr).await.unwrap();
        let tls = connector(ACME_TLS_ALPN_NAME)
            .connect(ServerName::try_from("example.com").unwrap(), stream)
            .await
            .unwrap();
        let (_, session) = tls.get_ref();
        assert_eq!(session.alpn_protocol(), Some(ACME_TLS_ALPN_NAME));
        let presented = session.peer_certificates().unwrap()[0].clone();
        let expected = fixture.alpn.resolve("example.com").unwrap().cert[0].clone();
        assert_eq!(presented, expected);
        assert_ne!(presented.as_ref(), fixture.served.chain()[0].as_slice());

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_acme_tls_handshake_fails_without_pending_challenge() {
        let fixture = start().await;
        let stream = TcpStream::connect(fixture.addr).await.unwrap();
        let result = connector(ACME_TLS_ALPN_NAME)
            .connect(ServerName::try_from("example.com").unwrap(), stream)
            .await;
        assert!(result.is_err());

        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_regular_handshake_is_served_over_https() {
        let fixture = start().await;
        fixture.challenges.put("abc", "abc.thumbprint");

        let stream = TcpStream::connect(fixture.addr).await.unwrap();
        let mut tls = connector(b"http/1.1")
            .connect(ServerName::try_from("example.com").unwrap(), stream)
            .await
            .unwrap();
        let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
        assert_eq!(presented.as_ref(), fixture.served.chain()[0].as_slice());

        tls.write_all(
            b"GET /.well-known/acme-challenge/abc HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let mut raw = Vec::new();
        let _ = tls.read_to_end(&mut raw).await;
        let raw = String::from_utf8_lossy(&raw);
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.ends_with("abc.thumbprint"));

        fixture.cancel.cancel();
    }
}
