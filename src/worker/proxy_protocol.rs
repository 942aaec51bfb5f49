//! PROXY protocol v1 header unwrapping
//!
//! A load balancer speaking the protocol prefixes every connection with one
//! text line such as `PROXY TCP4 192.0.2.1 198.51.100.7 56324 443\r\n`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest legal v1 header, terminator included
pub const MAX_HEADER_LEN: usize = 107;

/// How long a new connection may take to send its header
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

const SIGNATURE: &str = "PROXY ";

/// Read the header off the stream, stopping right after its `\r\n`.
///
/// Returns the original client address, or `None` for `UNKNOWN` connections.
/// The stream is read one byte at a time so no payload is consumed. A peer
/// that has not sent the whole line within `timeout` is rejected.
pub async fn read_header<S>(stream: &mut S, timeout: Duration) -> anyhow::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let line = tokio::time::timeout(timeout, read_line(stream))
        .await
        .map_err(|_| anyhow::anyhow!("PROXY header not received within {:?}", timeout))??;

    let line = std::str::from_utf8(&line)
        .map_err(|_| anyhow::anyhow!("PROXY header is not valid text"))?;
    parse_header(line)
}

async fn read_line<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    loop {
        if line.len() >= MAX_HEADER_LEN {
            anyhow::bail!("PROXY header exceeds {} bytes", MAX_HEADER_LEN);
        }
        let byte = stream.read_u8().await?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            return Ok(line);
        }
    }
}

/// Parse one complete header line
pub fn parse_header(line: &str) -> anyhow::Result<Option<SocketAddr>> {
    let rest = line
        .strip_suffix("\r\n")
        .and_then(|l| l.strip_prefix(SIGNATURE))
        .ok_or_else(|| anyhow::anyhow!("Missing PROXY header"))?;

    let parts: Vec<&str> = rest.split(' ').collect();
    match parts.first().copied() {
        Some("UNKNOWN") => Ok(None),
        Some(family @ ("TCP4" | "TCP6")) => {
            if parts.len() != 5 {
                anyhow::bail!("Malformed PROXY header: expected 5 fields, got {}", parts.len());
            }
            let source: IpAddr = parts[1]
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid PROXY source address: {}", parts[1]))?;
            let _destination: IpAddr = parts[2]
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid PROXY destination address: {}", parts[2]))?;
            let port: u16 = parts[3]
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid PROXY source port: {}", parts[3]))?;

            let family_matches = match family {
                "TCP4" => source.is_ipv4(),
                _ => source.is_ipv6(),
            };
            if !family_matches {
                anyhow::bail!("PROXY address {} does not match family {}", source, family);
            }
            Ok(Some(SocketAddr::new(source, port)))
        }
        Some(other) => anyhow::bail!("Unsupported PROXY protocol family: {}", other),
        None => anyhow::bail!("Empty PROXY header"),
    }
}
