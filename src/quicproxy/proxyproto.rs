//! Minimal PROXY protocol v1 (text) encode/decode. The wire format is a
//! single line: `PROXY TCP4|TCP6|UNKNOWN <src> <dst> <sport> <dport>\r\n`.
//! There is no ecosystem-standard crate for this in the corpus; the format
//! itself is about a dozen lines either direction, so it is hand-rolled
//! rather than reaching for a generic framework.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub async fn encode(stream: &mut (impl AsyncWriteExt + Unpin), remote: SocketAddr) -> std::io::Result<()> {
    let header = match remote {
        SocketAddr::V4(v4) => format!("PROXY TCP4 {} 0.0.0.0 {} 0\r\n", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("PROXY TCP6 {} :: {} 0\r\n", v6.ip(), v6.port()),
    };
    stream.write_all(header.as_bytes()).await
}

/// Reads and parses a PROXY protocol v1 header off the front of `conn`,
/// byte by byte so nothing past the trailing `\r\n` is consumed - the
/// tunneled payload that immediately follows belongs to the caller. Works
/// over any duplex stream: a real `TcpStream` on the mux front-end, a
/// `QuicStream` on the agent side of the tunnel.
pub async fn decode(conn: &mut (impl AsyncReadExt + Unpin)) -> std::io::Result<SocketAddr> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if conn.read_exact(&mut byte).await.is_err() {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 256 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "PROXY header too long",
            ));
        }
    }

    let line = String::from_utf8_lossy(&line);
    parse_header(line.trim_end_matches('\r')).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed PROXY header")
    })
}

fn parse_header(line: &str) -> Option<SocketAddr> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "PROXY" {
        return None;
    }
    let proto = parts.next()?;
    if proto == "UNKNOWN" {
        return None;
    }
    let src_ip = parts.next()?;
    let _dst_ip = parts.next()?;
    let src_port = parts.next()?;
    let _dst_port = parts.next()?;

    format!("{src_ip}:{src_port}").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp4_header() {
        let addr = parse_header("PROXY TCP4 203.0.113.1 198.51.100.1 54321 443").unwrap();
        assert_eq!(addr, "203.0.113.1:54321".parse().unwrap());
    }

    #[test]
    fn rejects_unknown_proto() {
        assert!(parse_header("PROXY UNKNOWN").is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_header("not a proxy header").is_none());
    }
}
