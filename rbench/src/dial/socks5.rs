use core::time::Duration;

use tokio_socks::tcp::Socks5Stream;

use super::{with_timeout, Conn, Dial, Error, Hop, Proxy};

/// Dialer tunneling connections through a SOCKS5 proxy.
///
/// The proxy is asked to resolve the target host name itself.
#[derive(Debug)]
pub struct Socks5Dialer {
    proxy: Proxy,
    hop: Hop,
}

impl Socks5Dialer {
    pub fn new(proxy: Proxy, hop: Hop) -> Self {
        Self { proxy, hop }
    }
}

impl Dial for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<Conn, Error> {
        with_timeout(timeout, async {
            let conn = self.hop.connect(&self.proxy.host, self.proxy.port).await?;

            let stream = match self.proxy.credentials() {
                Some((username, password)) => {
                    Socks5Stream::connect_with_password_and_socket(conn, (host, port), username, password).await?
                }
                None => Socks5Stream::connect_with_socket(conn, (host, port)).await?,
            };

            Ok(Box::new(stream) as Conn)
        })
        .await
    }
}
