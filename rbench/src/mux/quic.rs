use core::{
    fmt::{self, Debug, Formatter},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};
use std::{io, sync::Arc};

use pin_project_lite::pin_project;
use quinn::{crypto::rustls::QuicClientConfig, ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Establish, Session};
use crate::dial::{self, resolve, Error};

/// Establishes QUIC sessions to the proxy server.
#[derive(Clone)]
pub struct QuicEstablish {
    host: String,
    port: u16,
    config: ClientConfig,
}

impl QuicEstablish {
    /// Prepares sessions to "host:port", negotiating one of the given
    /// application protocols.
    pub fn new(host: &str, port: u16, protocols: &[String]) -> Result<Self, Error> {
        let mut crypto = dial::insecure_client_config()?;
        crypto.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        let crypto = QuicClientConfig::try_from(crypto).map_err(|err| Error::Tls(err.to_string()))?;
        let config = ClientConfig::new(Arc::new(crypto));

        let m = Self { host: host.to_string(), port, config };

        Ok(m)
    }
}

impl Debug for QuicEstablish {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("QuicEstablish")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Establish for QuicEstablish {
    type Session = QuicSession;

    async fn establish(&self) -> Result<QuicSession, Error> {
        let addr = resolve(&self.host, self.port).await?;
        let bind: SocketAddr = match addr {
            SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(self.config.clone());

        let conn = endpoint.connect(addr, &self.host)?.await?;
        log::debug!("QUIC session to {addr} established");

        Ok(QuicSession { endpoint, conn })
    }
}

/// QUIC connection to the proxy server.
#[derive(Debug, Clone)]
pub struct QuicSession {
    // Keeps the endpoint driver alive for the connection lifetime.
    #[allow(dead_code)]
    endpoint: Endpoint,
    conn: Connection,
}

impl Session for QuicSession {
    type Stream = QuicStream;
    type Error = Error;

    async fn open(&self) -> Result<QuicStream, Error> {
        let (send, recv) = self.conn.open_bi().await?;

        Ok(QuicStream { send, recv })
    }
}

pin_project! {
    /// Bidirectional QUIC stream, viewed as a single byte stream.
    pub struct QuicStream {
        #[pin]
        send: SendStream,
        #[pin]
        recv: RecvStream,
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

#[cfg(test)]
mod test {
    use quinn::crypto::rustls::QuicServerConfig;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::mux::MuxPool;

    /// Spawns a QUIC server echoing back the first 4 bytes of every stream.
    fn spawn_echo_server() -> u16 {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut crypto =
            rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_protocol_versions(&[&rustls::version::TLS13])
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert.der().clone()], key)
                .unwrap();
        crypto.alpn_protocols = vec![b"h3".to_vec()];
        let config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto).unwrap()));

        let endpoint = Endpoint::server(config, (Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let port = endpoint.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                tokio::spawn(async move {
                    let conn = incoming.await.unwrap();
                    while let Ok((mut send, mut recv)) = conn.accept_bi().await {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 4];
                            recv.read_exact(&mut buf).await.unwrap();
                            send.write_all(&buf).await.unwrap();
                            send.finish().unwrap();
                            // Wait for the peer to receive the data.
                            let _ = send.stopped().await;
                        });
                    }
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_streams_share_session() {
        let port = spawn_echo_server();
        let establish = QuicEstablish::new("127.0.0.1", port, &["h3".to_string()]).unwrap();
        let pool = MuxPool::new(establish, 32);

        let mut streams = Vec::new();
        for idx in 0..3u8 {
            let mut stream = pool.open().await.unwrap();
            stream.write_all(&[idx; 4]).await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!([idx; 4], buf);
            streams.push(stream);
        }

        assert_eq!(1, pool.num_sessions());
    }

    #[tokio::test]
    async fn test_session_rollover() {
        let port = spawn_echo_server();
        let establish = QuicEstablish::new("127.0.0.1", port, &["h3".to_string()]).unwrap();
        let pool = MuxPool::new(establish, 2);

        for idx in 0..3u8 {
            let mut stream = pool.open().await.unwrap();
            stream.write_all(&[idx; 4]).await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!([idx; 4], buf);
        }

        assert_eq!(2, pool.num_sessions());
    }

    #[test]
    fn test_alpn_protocols() {
        let establish = QuicEstablish::new("proxy.local", 443, &["h3".to_string(), "hq-29".to_string()]);
        assert!(establish.is_ok());
    }

    #[tokio::test]
    async fn test_establish_unresolvable() {
        let establish = QuicEstablish::new("unresolvable.invalid", 443, &["h3".to_string()]).unwrap();
        assert!(establish.establish().await.is_err());
    }
}
