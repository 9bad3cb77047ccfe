use core::num::NonZero;

use clap::{ArgAction, Parser};

use crate::{dial::Transport, report::Format};

/// HTTP(S) benchmarking tool, capable of tunneling through proxies.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Target URL, "http://" or "https://".
    #[clap(required = true)]
    pub url: String,
    /// Request method.
    #[clap(short, long, default_value = "GET")]
    pub method: String,
    /// Request header in "Name: value" form.
    ///
    /// May be repeated. A single value may also carry several headers
    /// separated by a literal "\r\n".
    #[clap(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,
    /// Request body.
    #[clap(short, long, default_value = "")]
    pub body: String,
    /// Override the "Host" header of the request.
    ///
    /// Connections are still made to the URL host.
    #[clap(long)]
    pub host: Option<String>,
    /// Request and socket timeout in milliseconds.
    #[clap(short, long, default_value_t = 10000)]
    pub timeout: u64,
    /// Number of parallel connections.
    ///
    /// Clamped to the number of requests.
    #[clap(short, long, default_value_t = 1000)]
    pub connections: u64,
    /// Total number of requests.
    #[clap(short = 'n', long, default_value_t = 100000)]
    pub requests: u64,
    /// Number of runtime worker threads.
    #[clap(long, default_value_t = std::thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN))]
    pub threads: NonZero<usize>,
    /// Proxy URL, "socks5://[user:pass@]host:port" or
    /// "http://[user:pass@]host:port".
    #[clap(long)]
    pub proxy: Option<String>,
    /// Carrier used for the hop to the proxy server.
    #[clap(long, value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,
    /// Application protocol negotiated with the proxy over QUIC.
    ///
    /// May be repeated.
    #[clap(long = "quic-protocol", value_name = "ALPN", default_value = "h3")]
    pub quic_protocols: Vec<String>,
    /// Tolerate errors when creating connections.
    #[clap(long)]
    pub ignore_err: bool,
    /// Maximum number of requests executed per connection before
    /// reconnection.
    ///
    /// If none given (the default) connections renew is disabled.
    #[clap(long)]
    pub requests_per_socket: Option<u64>,
    /// Enable TCP_NODELAY socket option.
    #[clap(long)]
    pub tcp_no_delay: bool,
    /// Set linger TCP option with specified value in seconds.
    #[clap(long)]
    pub tcp_linger: Option<u64>,
    /// Report format.
    #[clap(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}
