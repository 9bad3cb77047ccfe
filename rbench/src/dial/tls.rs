use core::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::TlsConnector;

use super::{Conn, Error};

/// Wraps established connections into client-side TLS.
///
/// Server certificates are not verified: the goal is to load the server, not
/// to authenticate it.
#[derive(Clone)]
pub struct TlsWrap {
    connector: TlsConnector,
}

impl TlsWrap {
    pub fn new() -> Result<Self, Error> {
        let config = insecure_client_config()?;
        let connector = TlsConnector::from(Arc::new(config));

        Ok(Self { connector })
    }

    /// Performs the TLS handshake over the given connection.
    pub async fn wrap(&self, conn: Conn, host: &str) -> Result<Conn, Error> {
        let name = ServerName::try_from(host.to_owned()).map_err(|err| Error::Tls(err.to_string()))?;
        let stream = self.connector.connect(name, conn).await?;

        Ok(Box::new(stream))
    }
}

impl Debug for TlsWrap {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("TlsWrap").finish_non_exhaustive()
    }
}

/// Builds a client configuration accepting any server certificate.
pub(crate) fn insecure_client_config() -> Result<ClientConfig, Error> {
    let provider = Arc::new(ring::default_provider());

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::Tls(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
        .with_no_client_auth();

    Ok(config)
}

/// Certificate verifier that accepts everything, while still checking
/// handshake signatures.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod test {
    use rustls::{
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
        ServerConfig,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_rustls::TlsAcceptor;

    use super::*;

    fn acceptor() -> TlsAcceptor {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();

        TlsAcceptor::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_wrap_self_signed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();

        tokio::spawn(async move {
            let (sock, ..) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(sock).await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let conn: Conn = Box::new(TcpStream::connect(addr).await.unwrap());
        let mut conn = TlsWrap::new().unwrap().wrap(conn, "localhost").await.unwrap();

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"ping", &buf);
    }

    #[tokio::test]
    async fn test_wrap_plaintext_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, ..) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
        });

        let conn: Conn = Box::new(TcpStream::connect(addr).await.unwrap());
        assert!(TlsWrap::new().unwrap().wrap(conn, "127.0.0.1").await.is_err());
    }
}
