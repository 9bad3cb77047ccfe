use core::{net::SocketAddr, time::Duration};

use tokio::sync::OnceCell;

use super::{resolve, with_timeout, Conn, Dial, Error, SocketOpts};

/// Direct TCP dialer.
///
/// The target address is resolved once, on the first dial, and the result is
/// reused by all subsequent dials. A dialer is therefore bound to the first
/// target it is asked for.
#[derive(Debug)]
pub struct DirectDialer {
    opts: SocketOpts,
    addr: OnceCell<SocketAddr>,
}

impl DirectDialer {
    pub fn new(opts: SocketOpts) -> Self {
        Self { opts, addr: OnceCell::new() }
    }
}

impl Dial for DirectDialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<Conn, Error> {
        with_timeout(timeout, async {
            let addr = self.addr.get_or_try_init(|| resolve(host, port)).await?;
            let stream = self.opts.connect(*addr).await?;

            Ok(Box::new(stream) as Conn)
        })
        .await
    }
}
