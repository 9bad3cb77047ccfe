//! Request payload construction.
//!
//! The request is serialized exactly once and then replayed verbatim by every
//! connection.

use bytes::{BufMut, Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, HOST},
    HeaderName, HeaderValue, Method,
};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid method '{0}'")]
    InvalidMethod(String),
    #[error("invalid header '{0}': expected 'Name: value'")]
    InvalidHeader(String),
}

/// Builder of the HTTP/1.1 request payload.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    /// Path with the query, if any.
    path: String,
    host: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl RequestBuilder {
    /// Constructs a new builder targeting the given URL.
    ///
    /// The `Host` header defaults to the URL authority.
    pub fn new(method: Method, url: &Url) -> Self {
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut host = url.host_str().unwrap_or_default().to_string();
        if let Some(port) = url.port() {
            host.push_str(&format!(":{port}"));
        }

        Self {
            method,
            path,
            host,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Overrides the `Host` header.
    ///
    /// This does not affect the address connections are made to.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (HeaderName, HeaderValue)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes the request.
    pub fn build(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());

        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        put_header(&mut buf, "Host", self.host.as_bytes());

        let mut has_content_length = false;
        for (name, value) in &self.headers {
            if *name == HOST {
                continue;
            }
            has_content_length |= *name == CONTENT_LENGTH;

            put_header(&mut buf, name.as_str(), value.as_bytes());
        }

        if !self.body.is_empty() && !has_content_length {
            put_header(&mut buf, "Content-Length", self.body.len().to_string().as_bytes());
        }

        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);

        buf.freeze()
    }
}

#[inline]
fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Parses the request method.
pub fn parse_method(v: &str) -> Result<Method, Error> {
    Method::from_bytes(v.as_bytes()).map_err(|_| Error::InvalidMethod(v.to_string()))
}

/// Parses "Name: value" header lines.
///
/// Each line may itself contain several headers separated by a literal `\r\n`
/// (backslash escapes, as typed in a shell).
pub fn parse_headers<S>(lines: &[S]) -> Result<Vec<(HeaderName, HeaderValue)>, Error>
where
    S: AsRef<str>,
{
    let mut headers = Vec::new();

    for line in lines {
        for v in line.as_ref().split("\\r\\n") {
            let v = v.trim();
            if v.is_empty() {
                continue;
            }

            let invalid = || Error::InvalidHeader(v.to_string());
            let (name, value) = v.split_once(':').ok_or_else(invalid)?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;

            headers.push((name, value));
        }
    }

    Ok(headers)
}
