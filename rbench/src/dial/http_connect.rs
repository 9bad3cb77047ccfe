use core::time::Duration;

use base64::{engine::general_purpose, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{with_timeout, Conn, Dial, Error, Hop, Proxy};

/// Maximum size of the proxy response header.
const MAX_RESPONSE_HEAD: usize = 8192;

/// Dialer tunneling connections through an HTTP proxy with the CONNECT
/// method.
#[derive(Debug)]
pub struct HttpConnectDialer {
    proxy: Proxy,
    hop: Hop,
}

impl HttpConnectDialer {
    pub fn new(proxy: Proxy, hop: Hop) -> Self {
        Self { proxy, hop }
    }
}

impl Dial for HttpConnectDialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<Conn, Error> {
        with_timeout(timeout, async {
            let mut conn = self.hop.connect(&self.proxy.host, self.proxy.port).await?;

            // The connection is dropped, and thus closed, on handshake failure.
            let authority = super::join_host_port(host, port);
            handshake(&mut conn, &authority, self.proxy.credentials()).await?;

            Ok(conn)
        })
        .await
    }
}

/// Performs the CONNECT handshake over the given stream.
///
/// On success the stream becomes a transparent tunnel to the authority.
pub(crate) async fn handshake<S>(stream: &mut S, authority: &str, credentials: Option<(&str, &str)>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some((username, password)) = credentials {
        let token = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&head) {
        Ok(httparse::Status::Complete(..)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::ProxyProtocol("incomplete response".into())),
        Err(err) => return Err(Error::ProxyProtocol(err.to_string())),
    }

    match resp.code {
        Some(200) => Ok(()),
        Some(code) => Err(Error::ProxyStatus(format!("{} {}", code, resp.reason.unwrap_or_default()))),
        None => Err(Error::ProxyProtocol("missing status code".into())),
    }
}

/// Reads the response header block.
///
/// Reads byte by byte, so that no tunneled data following the header is
/// consumed.
async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(128);
    loop {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::ProxyProtocol("response header too large".into()));
        }

        let b = stream.read_u8().await?;
        head.push(b);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
    }
}
