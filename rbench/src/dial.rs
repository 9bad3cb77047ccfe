//! Connection establishment.
//!
//! A [`Connector`] yields a fresh byte stream to the target for every call,
//! tunneling through the configured proxy (if any) and wrapping the result
//! into TLS when the target is secure.
//!
//! The proxy hop itself is carried either over plain TCP or over a stream of
//! a shared multiplexed QUIC session, see [`crate::mux`].

use core::{fmt, future::Future, net::SocketAddr, time::Duration};
use std::{io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{lookup_host, TcpSocket, TcpStream},
};
use url::Url;

pub(crate) use self::tls::insecure_client_config;
pub use self::{direct::DirectDialer, http_connect::HttpConnectDialer, socks5::Socks5Dialer, tls::TlsWrap};
use crate::mux::{
    quic::{QuicEstablish, QuicStream},
    MuxPool,
};

mod direct;
mod http_connect;
mod socks5;
mod tls;

/// Maximum number of concurrent streams issued over a single multiplexed
/// session.
pub const MAX_STREAMS_PER_SESSION: u32 = 32;

/// Bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Established connection, exclusively owned by a single worker.
pub type Conn = Box<dyn Stream>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no addresses found for {0}")]
    Resolve(String),
    #[error("proxy error {0}")]
    ProxyStatus(String),
    #[error("malformed proxy response: {0}")]
    ProxyProtocol(String),
    #[error("SOCKS5: {0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("TLS: {0}")]
    Tls(String),
    #[error("QUIC connect: {0}")]
    QuicConnect(#[from] quinn::ConnectError),
    #[error("QUIC connection: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),
    #[error("invalid proxy '{0}': {1}")]
    InvalidProxy(String, String),
}

/// Target URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Target endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or IP address, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl Target {
    #[inline]
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self { host: host.into(), port, scheme }
    }

    /// Returns `true` if the stream must be wrapped into TLS.
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Returns the "host:port" representation.
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(&self.addr())
    }
}

/// Carrier used for the hop to the proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// Streams of a shared multiplexed QUIC session.
    Quic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carrier {
    Tcp,
    /// Multiplexed QUIC session with the given ALPN protocols.
    Multiplexed(Vec<String>),
}

/// Proxy server endpoint with optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    fn from_url(url: &Url, raw: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidProxy(raw.to_string(), reason.to_string());

        let host = match url.host() {
            Some(url::Host::Domain(v)) if !v.is_empty() => v.to_string(),
            Some(url::Host::Ipv4(v)) => v.to_string(),
            Some(url::Host::Ipv6(v)) => v.to_string(),
            _ => return Err(invalid("missing host")),
        };
        let port = url.port_or_known_default().ok_or_else(|| invalid("missing port"))?;

        let username = match url.username() {
            "" => None,
            v => Some(decode(v)),
        };
        let password = url.password().map(decode);

        let m = Self { host, port, username, password };

        Ok(m)
    }

    /// Returns the "host:port" representation.
    #[inline]
    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Returns credentials, if a username was given.
    #[inline]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|u| (u, self.password.as_deref().unwrap_or_default()))
    }
}

/// How connections to the target are established.
///
/// Resolved once at startup and immutable for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPolicy {
    /// Direct TCP connection.
    None,
    Socks5 { proxy: Proxy, carrier: Carrier },
    HttpConnect { proxy: Proxy, carrier: Carrier },
}

impl ProxyPolicy {
    /// Parses the proxy URL.
    ///
    /// Supported schemes are "socks5" and "http". Missing or empty URL means
    /// direct connection.
    pub fn parse(url: Option<&str>, transport: Transport, protocols: &[String]) -> Result<Self, Error> {
        let raw = match url.map(str::trim) {
            None | Some("") => {
                if transport == Transport::Quic {
                    return Err(Error::InvalidProxy(
                        String::new(),
                        "QUIC transport requires a proxy".into(),
                    ));
                }
                return Ok(Self::None);
            }
            Some(raw) => raw,
        };

        let url = Url::parse(raw).map_err(|err| Error::InvalidProxy(raw.to_string(), err.to_string()))?;
        let proxy = Proxy::from_url(&url, raw)?;
        let carrier = match transport {
            Transport::Tcp => Carrier::Tcp,
            Transport::Quic => Carrier::Multiplexed(protocols.to_vec()),
        };

        let m = match url.scheme() {
            "socks5" | "socks5h" => Self::Socks5 { proxy, carrier },
            "http" => Self::HttpConnect { proxy, carrier },
            scheme => {
                return Err(Error::InvalidProxy(
                    raw.to_string(),
                    format!("unsupported scheme '{scheme}'"),
                ))
            }
        };

        Ok(m)
    }
}

/// TCP socket options applied to every TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY socket option.
    pub no_delay: bool,
    /// Set linger TCP option with specified value.
    pub linger: Option<Duration>,
}

impl SocketOpts {
    /// Connects to the given address, applying these options.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, io::Error> {
        let sock = match addr {
            SocketAddr::V4(..) => TcpSocket::new_v4()?,
            SocketAddr::V6(..) => TcpSocket::new_v6()?,
        };
        if let Some(linger) = self.linger {
            sock.set_linger(Some(linger))?;
        }

        let stream = sock.connect(addr).await?;
        if self.no_delay {
            stream.set_nodelay(true)?;
        }

        Ok(stream)
    }
}

/// Strategy of obtaining a raw connection to an address.
pub trait Dial {
    /// Connects to "host:port", giving up after the given timeout.
    fn dial(&self, host: &str, port: u16, timeout: Duration) -> impl Future<Output = Result<Conn, Error>> + Send;
}

/// Carrier for the hop to a proxy server.
#[derive(Debug, Clone)]
pub enum Hop {
    Tcp(SocketOpts),
    Quic(Arc<MuxPool<QuicEstablish>>),
}

impl Hop {
    pub fn new(proxy: &Proxy, carrier: &Carrier, opts: SocketOpts) -> Result<Self, Error> {
        let m = match carrier {
            Carrier::Tcp => Self::Tcp(opts),
            Carrier::Multiplexed(protocols) => {
                let establish = QuicEstablish::new(&proxy.host, proxy.port, protocols)?;
                Self::Quic(Arc::new(MuxPool::new(establish, MAX_STREAMS_PER_SESSION)))
            }
        };

        Ok(m)
    }

    /// Opens a new connection to the proxy server.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Conn, Error> {
        match self {
            Self::Tcp(opts) => {
                let addr = resolve(host, port).await?;
                let stream = opts.connect(addr).await?;

                Ok(Box::new(stream))
            }
            Self::Quic(pool) => {
                let stream: QuicStream = pool.open().await?;

                Ok(Box::new(stream))
            }
        }
    }
}

/// Transport dialer, selected once from the [`ProxyPolicy`].
#[derive(Debug)]
pub enum Dialer {
    Direct(DirectDialer),
    Socks5(Socks5Dialer),
    HttpConnect(HttpConnectDialer),
}

impl Dialer {
    pub fn new(policy: &ProxyPolicy, opts: SocketOpts) -> Result<Self, Error> {
        let m = match policy {
            ProxyPolicy::None => Self::Direct(DirectDialer::new(opts)),
            ProxyPolicy::Socks5 { proxy, carrier } => {
                let hop = Hop::new(proxy, carrier, opts)?;
                Self::Socks5(Socks5Dialer::new(proxy.clone(), hop))
            }
            ProxyPolicy::HttpConnect { proxy, carrier } => {
                let hop = Hop::new(proxy, carrier, opts)?;
                Self::HttpConnect(HttpConnectDialer::new(proxy.clone(), hop))
            }
        };

        Ok(m)
    }
}

impl Dial for Dialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<Conn, Error> {
        match self {
            Self::Direct(d) => d.dial(host, port, timeout).await,
            Self::Socks5(d) => d.dial(host, port, timeout).await,
            Self::HttpConnect(d) => d.dial(host, port, timeout).await,
        }
    }
}

/// Establishes logical connections to the target.
#[derive(Debug)]
pub struct Connector {
    target: Target,
    dialer: Dialer,
    tls: Option<TlsWrap>,
    timeout: Duration,
}

impl Connector {
    pub fn new(target: Target, policy: &ProxyPolicy, opts: SocketOpts, timeout: Duration) -> Result<Self, Error> {
        let dialer = Dialer::new(policy, opts)?;
        let tls = match target.is_secure() {
            true => Some(TlsWrap::new()?),
            false => None,
        };

        let m = Self { target, dialer, tls, timeout };

        Ok(m)
    }

    #[inline]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Opens a new connection to the target.
    pub async fn connect(&self) -> Result<Conn, Error> {
        let conn = self
            .dialer
            .dial(&self.target.host, self.target.port, self.timeout)
            .await?;

        match &self.tls {
            Some(tls) => {
                let handshake = tls.wrap(conn, &self.target.host);
                match tokio::time::timeout(self.timeout, handshake).await {
                    Ok(conn) => conn,
                    Err(..) => Err(Error::Timeout(self.timeout)),
                }
            }
            None => Ok(conn),
        }
    }
}

/// Resolves "host:port" into the first socket address found.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Resolve(join_host_port(host, port)))
}

/// Runs the given dialing future under the timeout.
pub(crate) async fn with_timeout<F, T>(timeout: Duration, f: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(rc) => rc,
        Err(..) => Err(Error::Timeout(timeout)),
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn decode(v: &str) -> String {
    percent_encoding::percent_decode_str(v).decode_utf8_lossy().into_owned()
}
