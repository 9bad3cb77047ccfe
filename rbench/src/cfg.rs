use core::{error::Error, num::NonZero, time::Duration};

use bytes::Bytes;
use url::{Host, Url};

use crate::{
    cmd::Cmd,
    dial::{ProxyPolicy, Scheme, SocketOpts, Target},
    report::Format,
    request::{self, RequestBuilder},
};

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target endpoint.
    pub target: Target,
    /// Pre-serialized request, replayed by every connection.
    pub request: Bytes,
    pub proxy: ProxyPolicy,
    pub socket: SocketOpts,
    /// Per-operation timeout.
    pub timeout: Duration,
    /// Number of parallel connections, never more than requests.
    pub connections: NonZero<usize>,
    /// Total number of requests.
    pub requests: NonZero<u64>,
    /// Number of runtime worker threads.
    pub threads: NonZero<usize>,
    /// Whether failing to establish a connection is tolerated.
    pub ignore_err: bool,
    /// Maximum number of requests executed per connection before
    /// reconnection.
    /// If none given (default) connections renew is disabled.
    requests_per_socket: Option<NonZero<u64>>,
    pub format: Format,
}

impl Config {
    /// Returns the maximum number of requests executed per connection before
    /// reconnection.
    #[inline]
    pub fn requests_per_socket(&self) -> u64 {
        self.requests_per_socket.map(NonZero::get).unwrap_or(u64::MAX)
    }
}

impl TryFrom<Cmd> for Config {
    type Error = Box<dyn Error>;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let Cmd {
            url,
            method,
            headers,
            body,
            host,
            timeout,
            connections,
            requests,
            threads,
            proxy,
            transport,
            quic_protocols,
            ignore_err,
            requests_per_socket,
            tcp_no_delay,
            tcp_linger,
            format,
            verbose: _,
        } = cmd;

        let url = Url::parse(&url).map_err(|err| format!("the request url '{url}' is not correct: {err}"))?;
        let target = target(&url)?;

        let method = request::parse_method(&method)?;
        let headers = request::parse_headers(&headers)?;
        let mut builder = RequestBuilder::new(method, &url).headers(headers).body(body);
        if let Some(host) = host {
            builder = builder.host(host);
        }
        let request = builder.build();

        let requests = NonZero::new(requests).ok_or("number of requests must be positive")?;
        let connections = NonZero::new(connections).ok_or("number of connections must be positive")?;
        // Extra connections would never issue a request.
        let connections = connections.min(requests);
        let connections = NonZero::new(usize::try_from(connections.get())?).ok_or("no connections")?;

        if timeout == 0 {
            return Err("timeout must be positive".into());
        }

        let requests_per_socket = match requests_per_socket {
            Some(v) => Some(NonZero::new(v).ok_or("requests per socket must be positive")?),
            None => None,
        };

        let proxy = ProxyPolicy::parse(proxy.as_deref(), transport, &quic_protocols)?;

        let socket = SocketOpts {
            no_delay: tcp_no_delay,
            linger: tcp_linger.map(Duration::from_secs),
        };

        let m = Self {
            target,
            request,
            proxy,
            socket,
            timeout: Duration::from_millis(timeout),
            connections,
            requests,
            threads,
            ignore_err,
            requests_per_socket,
            format,
        };

        Ok(m)
    }
}

/// Extracts the endpoint from the target URL, defaulting the port by scheme.
fn target(url: &Url) -> Result<Target, Box<dyn Error>> {
    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        scheme => return Err(format!("unsupported scheme '{scheme}', expected 'http' or 'https'").into()),
    };

    let host = match url.host() {
        Some(Host::Domain(v)) if !v.is_empty() => v.to_string(),
        Some(Host::Ipv4(v)) => v.to_string(),
        Some(Host::Ipv6(v)) => v.to_string(),
        _ => return Err(format!("the request url '{url}' has no host").into()),
    };
    let port = url.port_or_known_default().ok_or("missing port")?;

    Ok(Target::new(host, port, scheme))
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;
    use crate::dial::Carrier;

    fn parse(args: &[&str]) -> Result<Config, Box<dyn Error>> {
        let cmd = Cmd::try_parse_from(core::iter::once("rbench").chain(args.iter().copied()))?;
        Config::try_from(cmd)
    }

    #[test]
    fn test_config_defaults() {
        let cfg = parse(&["http://example.com/path"]).unwrap();

        assert_eq!(Target::new("example.com", 80, Scheme::Http), cfg.target);
        assert_eq!(ProxyPolicy::None, cfg.proxy);
        assert_eq!(Duration::from_secs(10), cfg.timeout);
        assert_eq!(1000, cfg.connections.get());
        assert_eq!(100000, cfg.requests.get());
        assert_eq!(u64::MAX, cfg.requests_per_socket());
        assert_eq!(
            &b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n"[..],
            &cfg.request[..]
        );
    }

    #[test]
    fn test_config_https_port() {
        let cfg = parse(&["https://[::1]/"]).unwrap();

        assert_eq!(Target::new("::1", 443, Scheme::Https), cfg.target);
        assert_eq!("[::1]:443", cfg.target.addr());
    }

    #[test]
    fn test_config_connections_clamped() {
        let cfg = parse(&["-c", "50", "-n", "10", "http://example.com"]).unwrap();

        assert_eq!(10, cfg.connections.get());
        assert_eq!(10, cfg.requests.get());
    }

    #[test]
    fn test_config_socket_opts() {
        let cfg = parse(&[
            "--tcp-no-delay",
            "--tcp-linger",
            "3",
            "--requests-per-socket",
            "5",
            "http://example.com",
        ])
        .unwrap();

        assert!(cfg.socket.no_delay);
        assert_eq!(Some(Duration::from_secs(3)), cfg.socket.linger);
        assert_eq!(5, cfg.requests_per_socket());
    }

    #[test]
    fn test_config_proxy() {
        let cfg = parse(&["--proxy", "socks5://127.0.0.1:1080", "http://example.com"]).unwrap();
        assert!(matches!(cfg.proxy, ProxyPolicy::Socks5 { .. }));

        let cfg = parse(&[
            "--proxy",
            "http://proxy:3128",
            "--transport",
            "quic",
            "http://example.com",
        ])
        .unwrap();
        let ProxyPolicy::HttpConnect { carrier, .. } = cfg.proxy else {
            panic!("unexpected policy: {:?}", cfg.proxy);
        };
        assert_eq!(Carrier::Multiplexed(vec!["h3".into()]), carrier);
    }

    #[test]
    fn test_config_invalid() {
        assert!(parse(&["not a url"]).is_err());
        assert!(parse(&["ftp://example.com"]).is_err());
        assert!(parse(&["-c", "0", "http://example.com"]).is_err());
        assert!(parse(&["-n", "0", "http://example.com"]).is_err());
        assert!(parse(&["-t", "0", "http://example.com"]).is_err());
        assert!(parse(&["-m", "GE T", "http://example.com"]).is_err());
        assert!(parse(&["-H", "broken", "http://example.com"]).is_err());
        assert!(parse(&["--requests-per-socket", "0", "http://example.com"]).is_err());
        assert!(parse(&["--proxy", "ftp://proxy:21", "http://example.com"]).is_err());
        assert!(parse(&["--transport", "quic", "http://example.com"]).is_err());
    }
}
