//! PROXY protocol v1 (text) header parsing.
//!
//! A load balancer in front of the gateway may prepend one line such as
//! `PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\n` carrying the real client
//! address. The line is read before anything else, including TLS.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest legal v1 header, CRLF included.
pub const MAX_HEADER_LEN: usize = 107;

const SIGNATURE: &[u8] = b"PROXY ";

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("connection did not start with a PROXY header")]
    Missing,
    #[error("PROXY header longer than 107 bytes")]
    TooLong,
    #[error("malformed PROXY header: bad {0}")]
    Malformed(&'static str),
    #[error("failed to read PROXY header: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a header line without its trailing CRLF.
///
/// Returns the source address, or `None` for `PROXY UNKNOWN`.
pub fn parse_v1(line: &str) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(ProxyProtocolError::Missing);
    }

    let family = match fields.next() {
        Some("UNKNOWN") => return Ok(None),
        Some(family @ ("TCP4" | "TCP6")) => family,
        _ => return Err(ProxyProtocolError::Malformed("protocol")),
    };

    let source: IpAddr = field(fields.next(), "source address")?;
    let destination: IpAddr = field(fields.next(), "destination address")?;
    let source_port: u16 = field(fields.next(), "source port")?;
    let _destination_port: u16 = field(fields.next(), "destination port")?;

    if fields.next().is_some() {
        return Err(ProxyProtocolError::Malformed("field count"));
    }
    let v4 = family == "TCP4";
    if source.is_ipv4() != v4 || destination.is_ipv4() != v4 {
        return Err(ProxyProtocolError::Malformed("address family"));
    }

    Ok(Some(SocketAddr::new(source, source_port)))
}

fn field<T: std::str::FromStr>(
    value: Option<&str>,
    name: &'static str,
) -> Result<T, ProxyProtocolError> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or(ProxyProtocolError::Malformed(name))
}

/// Read and parse the header from the start of a stream.
///
/// Reads one byte at a time so nothing after the header is consumed.
pub async fn read_v1<S>(stream: &mut S) -> Result<Option<SocketAddr>, ProxyProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    loop {
        line.push(stream.read_u8().await?);

        if line.len() <= SIGNATURE.len() && !SIGNATURE.starts_with(&line) {
            return Err(ProxyProtocolError::Missing);
        }
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(ProxyProtocolError::TooLong);
        }
    }

    let text = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| ProxyProtocolError::Malformed("encoding"))?;
    parse_v1(text)
}
