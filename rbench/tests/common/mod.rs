#![allow(dead_code)]

use core::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use rbench::{cfg::Config, cmd::Cmd};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};

pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";

/// Builds the run configuration from command line arguments.
pub fn config(args: &[&str]) -> Config {
    let cmd = Cmd::try_parse_from(core::iter::once("rbench").chain(args.iter().copied())).unwrap();
    Config::try_from(cmd).unwrap()
}

/// How the target treats connections after answering.
#[derive(Debug, Clone, Copy)]
pub enum Mode {
    KeepAlive,
    /// Closes the connection after every single response.
    Close,
}

/// Spawns a target answering every request with [`RESPONSE`].
pub async fn spawn_target(mode: Mode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((sock, ..)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve(sock, mode));
        }
    });

    addr
}

/// Answers requests on the given stream.
pub async fn serve<S>(stream: S, mode: Mode)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    loop {
        if read_head(&mut stream).await.is_none() {
            return;
        }
        if stream.get_mut().write_all(RESPONSE).await.is_err() {
            return;
        }
        if let Mode::Close = mode {
            let _ = stream.get_mut().shutdown().await;
            return;
        }
    }
}

/// Reads the request head up to the blank line.
///
/// Returns `None` on EOF or error.
pub async fn read_head<S>(stream: &mut BufReader<S>) -> Option<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = String::new();
    loop {
        let mut line = String::new();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(..) => return None,
            Ok(..) => {}
        }
        head.push_str(&line);
        if line == "\r\n" {
            return Some(head);
        }
    }
}

/// Returns the address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Generates a self-signed certificate and builds the TLS acceptor around it.
pub fn tls_acceptor() -> tokio_rustls::TlsAcceptor {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();

    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}
