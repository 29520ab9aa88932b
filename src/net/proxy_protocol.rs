//! PROXY protocol (v1 and v2) unwrapping.
//!
//! # Responsibilities
//! - Detect a PROXY header at the start of a connection
//! - Recover the original client address from it
//! - Hand the remaining bytes to the HTTP layer untouched
//!
//! # Design Decisions
//! - The header is optional: connections without one pass through raw
//! - Only peers inside the trusted subnet get their header parsed
//! - `LOCAL` / `UNKNOWN` headers keep the socket peer address

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";
const V2_HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("io error while reading proxy header: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed inside proxy header")]
    Truncated,

    #[error("malformed proxy header: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> ProxyProtocolError {
    ProxyProtocolError::Malformed(msg.into())
}

/// A stream that replays the bytes read past the PROXY header before
/// reading from the socket again.
#[derive(Debug)]
pub struct ProxiedStream<S> {
    inner: S,
    prefix: BytesMut,
}

impl<S> ProxiedStream<S> {
    pub fn raw(inner: S) -> Self {
        Self {
            inner,
            prefix: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> ProxiedStream<S> {
    /// Read an optional PROXY header. Returns the stream positioned after
    /// it and the source address it announced.
    pub async fn accept(mut inner: S) -> Result<(Self, Option<SocketAddr>), ProxyProtocolError> {
        let mut buf = BytesMut::with_capacity(256);

        loop {
            match inspect(&buf)? {
                Header::NotProxied => {
                    return Ok((Self { inner, prefix: buf }, None));
                }
                Header::Complete { len, source } => {
                    buf.advance(len);
                    return Ok((Self { inner, prefix: buf }, source));
                }
                Header::Incomplete => {}
            }

            if inner.read_buf(&mut buf).await? == 0 {
                if buf.is_empty() {
                    return Ok((Self { inner, prefix: buf }, None));
                }
                return Err(ProxyProtocolError::Truncated);
            }
        }
    }
}

enum Header {
    NotProxied,
    Incomplete,
    Complete { len: usize, source: Option<SocketAddr> },
}

fn prefix_of(buf: &[u8], signature: &[u8]) -> bool {
    let n = buf.len().min(signature.len());
    buf[..n] == signature[..n]
}

fn inspect(buf: &[u8]) -> Result<Header, ProxyProtocolError> {
    if buf.is_empty() {
        return Ok(Header::Incomplete);
    }

    if prefix_of(buf, V1_PREFIX) {
        if buf.len() < V1_PREFIX.len() {
            return Ok(Header::Incomplete);
        }
        return match buf.windows(2).position(|w| w == b"\r\n") {
            Some(end) => Ok(Header::Complete {
                len: end + 2,
                source: parse_v1(&buf[..end])?,
            }),
            None if buf.len() >= V1_MAX_LEN => Err(malformed("v1 header too long")),
            None => Ok(Header::Incomplete),
        };
    }

    if prefix_of(buf, V2_SIGNATURE) {
        if buf.len() < V2_HEADER_LEN {
            return Ok(Header::Incomplete);
        }
        let len = V2_HEADER_LEN + u16::from_be_bytes([buf[14], buf[15]]) as usize;
        if buf.len() < len {
            return Ok(Header::Incomplete);
        }
        return Ok(Header::Complete {
            len,
            source: parse_v2(&buf[..len])?,
        });
    }

    Ok(Header::NotProxied)
}

fn parse_v1(line: &[u8]) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| malformed("v1 header is not ascii"))?;
    let fields: Vec<&str> = line.split(' ').collect();

    match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => Ok(None),
        ["PROXY", proto @ ("TCP4" | "TCP6"), src, _dst, sport, _dport] => {
            let ip: IpAddr = src.parse().map_err(|_| malformed(format!("bad source address {}", src)))?;
            if (*proto == "TCP4") != ip.is_ipv4() {
                return Err(malformed(format!("{} header with address {}", proto, ip)));
            }
            let port: u16 = sport.parse().map_err(|_| malformed(format!("bad source port {}", sport)))?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        _ => Err(malformed(format!("unexpected v1 header '{}'", line))),
    }
}

fn parse_v2(header: &[u8]) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let version = header[12] >> 4;
    let command = header[12] & 0x0f;
    if version != 2 {
        return Err(malformed(format!("unsupported version {}", version)));
    }

    match command {
        0x0 => return Ok(None),
        0x1 => {}
        other => return Err(malformed(format!("unknown command {}", other))),
    }

    let body = &header[V2_HEADER_LEN..];
    match header[13] >> 4 {
        0x1 => {
            if body.len() < 12 {
                return Err(malformed("short ipv4 address block"));
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        0x2 => {
            if body.len() < 36 {
                return Err(malformed("short ipv6 address block"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        // unspecified or unix sockets
        _ => Ok(None),
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxiedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxiedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
