//! SOCKS5 CONNECT negotiation, no authentication. The target is sent
//! in hostname form (ATYP 3) carrying the server's printable address;
//! the reply's bound address (ATYP 1, 3 or 4) is consumed and
//! discarded.

use relaydns_core::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const OP_TIMEOUT: Duration = Duration::from_secs(2);

async fn send(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    timeout(OP_TIMEOUT, stream.write_all(bytes))
        .await
        .map_err(|_| Error::Other("socks5 proxy send timed out".into()))??;
    Ok(())
}

async fn recv_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    timeout(OP_TIMEOUT, stream.read_exact(buf))
        .await
        .map_err(|_| Error::Other("socks5 proxy recv timed out".into()))??;
    Ok(())
}

/// Runs the method greeting and CONNECT request for `server` over a
/// freshly connected proxy stream.
pub async fn negotiate(stream: &mut TcpStream, server: &SocketAddr) -> Result<()> {
    send(stream, &[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    recv_exact(stream, &mut method).await?;
    if method != [0x05, 0x00] {
        return Err(Error::Other(
            "socks5 proxy refused the no-auth method".into(),
        ));
    }

    let host = server.ip().to_string();
    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&server.port().to_be_bytes());
    send(stream, &req).await?;

    let mut head = [0u8; 4];
    recv_exact(stream, &mut head).await?;
    if head[1] != 0x00 {
        return Err(Error::Other(format!(
            "socks5 connect failed with code {}",
            head[1]
        )));
    }
    let bound_len = match head[3] {
        0x01 => 6,
        0x03 => {
            let mut l = [0u8; 1];
            recv_exact(stream, &mut l).await?;
            l[0] as usize + 2
        }
        0x04 => 18,
        other => {
            return Err(Error::Other(format!(
                "socks5 reply carries unknown address type {other}"
            )))
        }
    };
    let mut bound = vec![0u8; bound_len];
    recv_exact(stream, &mut bound).await?;
    Ok(())
}
