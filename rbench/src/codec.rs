//! Request/response exchange over an established byte stream.

use core::future::Future;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Produce;

/// Receive buffer size.
pub const RECV_BUF_SIZE: usize = 64 * 1024;

/// Separator between the header block and the body.
const HEAD_SEP: &[u8] = b"\r\n\r\n";
const LINE_SEP: &[u8] = b"\r\n";
/// The header name, anchored at the start of a line.
const CONTENT_LENGTH: &[u8] = b"\r\nContent-Length:";

/// Writes a request and reads back exactly one framed response.
///
/// Implementations never retry: any I/O error is returned to the caller as
/// is.
pub trait Codec {
    /// Writes the whole request, returning the number of bytes written.
    fn write<S>(&mut self, stream: &mut S) -> impl Future<Output = Result<usize, io::Error>> + Send
    where
        S: AsyncWrite + Unpin + Send + ?Sized;

    /// Reads a single complete response, returning the number of bytes read
    /// by all read calls made for it.
    fn read<S>(&mut self, stream: &mut S) -> impl Future<Output = Result<usize, io::Error>> + Send
    where
        S: AsyncRead + Unpin + Send + ?Sized;
}

/// HTTP/1.x codec replaying the same request over and over.
///
/// The response is framed by the blank line terminating the header block
/// and the `Content-Length` header. A missing or malformed length means an
/// empty body.
#[derive(Debug)]
pub struct HttpCodec<D> {
    /// Data to send.
    data: D,
    /// Response buffer, reused between exchanges.
    buf: Box<[u8]>,
}

impl<D> HttpCodec<D> {
    pub fn new(data: D) -> Self {
        Self {
            data,
            buf: vec![0; RECV_BUF_SIZE].into_boxed_slice(),
        }
    }
}

impl<D> Codec for HttpCodec<D>
where
    D: Produce<Item = Bytes> + Send + Sync,
{
    async fn write<S>(&mut self, stream: &mut S) -> Result<usize, io::Error>
    where
        S: AsyncWrite + Unpin + Send + ?Sized,
    {
        let request = self.data.next();
        stream.write_all(request).await?;
        stream.flush().await?;

        Ok(request.len())
    }

    async fn read<S>(&mut self, stream: &mut S) -> Result<usize, io::Error>
    where
        S: AsyncRead + Unpin + Send + ?Sized,
    {
        let buf = &mut self.buf[..];
        let mut n_read = 0;
        let mut filled = 0;

        // Accumulate until the header block is complete. Unread header bytes
        // are never overwritten here.
        let head_len = loop {
            if filled == buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response header exceeds the receive buffer",
                ));
            }

            let n = read_some(stream, &mut buf[filled..]).await?;
            n_read += n;

            // The separator may straddle the previous read boundary.
            let from = filled.saturating_sub(HEAD_SEP.len() - 1);
            filled += n;

            if let Some(pos) = find(&buf[from..filled], HEAD_SEP) {
                break from + pos;
            }
        };

        let content_len = content_length(&buf[..head_len]);
        let mut body_read = filled - head_len - HEAD_SEP.len();

        // The header is no longer needed, so the whole buffer is reused for
        // the body.
        while body_read < content_len {
            let n = read_some(stream, buf).await?;
            n_read += n;
            body_read += n;
        }

        Ok(n_read)
    }
}

/// Reads at least one byte, treating the end of stream as an error.
#[inline]
async fn read_some<S>(stream: &mut S, buf: &mut [u8]) -> Result<usize, io::Error>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match stream.read(buf).await? {
        0 => Err(io::ErrorKind::UnexpectedEof.into()),
        n => Ok(n),
    }
}

#[inline]
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extracts the `Content-Length` value from the given header block, which
/// starts with the status line.
///
/// Returns zero if the header is absent or its value is not a number.
fn content_length(head: &[u8]) -> usize {
    let Some(pos) = find(head, CONTENT_LENGTH) else {
        return 0;
    };

    let value = &head[pos + CONTENT_LENGTH.len()..];
    let value = match find(value, LINE_SEP) {
        Some(end) => &value[..end],
        None => value,
    };

    core::str::from_utf8(value)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}
