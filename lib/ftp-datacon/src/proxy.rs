/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProxyProtocol {
    Socks5,
    HttpConnect,
}

/// Proxy used to tunnel a data connection. Orthogonal to TLS: the handshake
/// (if requested) runs on top of the established tunnel.
#[derive(Debug, Clone)]
pub struct DataProxyConfig {
    pub protocol: DataProxyProtocol,
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid proxy reply")]
    InvalidReply,
    #[error("no acceptable auth method")]
    NoAuthMethod,
    #[error("proxy auth failed")]
    AuthFailed,
    #[error("proxy request failed: {0}")]
    RequestFailed(&'static str),
    #[error("proxy rejected CONNECT with status {0}")]
    HttpRejected(u16),
    #[error("an HTTP proxy cannot open a listening endpoint")]
    ListenNotSupported,
}

impl ProxyError {
    /// Sticky-error representation used by the connection state.
    pub(crate) fn to_io_error(&self) -> io::Error {
        match self {
            ProxyError::Io(e) => io::Error::new(e.kind(), e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

fn socks5_error_message(code: u8) -> &'static str {
    // messages from rfc1928
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

async fn socks5_login<S>(stream: &mut S, proxy: &DataProxyConfig) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let with_user = proxy.username.is_some();
    if with_user {
        stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
    }
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method[0] != 0x05 {
        return Err(ProxyError::InvalidReply);
    }
    match method[1] {
        0x00 => Ok(()),
        0x02 if with_user => {
            let user = proxy.username.as_deref().unwrap_or_default();
            let pass = proxy.password.as_deref().unwrap_or_default();
            if user.len() > 255 || pass.len() > 255 {
                return Err(ProxyError::AuthFailed);
            }
            let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
            buf.push(0x01);
            buf.push(user.len() as u8);
            buf.extend_from_slice(user.as_bytes());
            buf.push(pass.len() as u8);
            buf.extend_from_slice(pass.as_bytes());
            stream.write_all(&buf).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(ProxyError::AuthFailed);
            }
            Ok(())
        }
        _ => Err(ProxyError::NoAuthMethod),
    }
}

async fn socks5_send_request<S>(
    stream: &mut S,
    command: u8,
    addr: SocketAddr,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[0x05, command, 0x00]);
    match addr.ip() {
        IpAddr::V4(ip4) => {
            buf.push(0x01);
            buf.extend_from_slice(&ip4.octets());
        }
        IpAddr::V6(ip6) => {
            buf.push(0x04);
            buf.extend_from_slice(&ip6.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    stream.write_all(&buf).await?;
    Ok(())
}

async fn socks5_recv_reply<S>(stream: &mut S) -> Result<SocketAddr, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        return Err(ProxyError::InvalidReply);
    }
    if head[1] != 0x00 {
        return Err(ProxyError::RequestFailed(socks5_error_message(head[1])));
    }
    let ip = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        0x03 => {
            // domain replies make no sense for PORT/EPRT advertising
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        _ => return Err(ProxyError::InvalidReply),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

/// Establish an outbound tunnel to `target` through a SOCKS5 proxy.
pub(crate) async fn socks5_connect(
    stream: &mut TcpStream,
    proxy: &DataProxyConfig,
    target: SocketAddr,
) -> Result<(), ProxyError> {
    socks5_login(stream, proxy).await?;
    socks5_send_request(stream, 0x01, target).await?;
    socks5_recv_reply(stream).await?;
    Ok(())
}

/// Ask a SOCKS5 proxy to listen on our behalf (BIND). The returned address
/// is the proxy-side endpoint to advertise to the FTP server via PORT/EPRT;
/// the second reply is awaited later as the accept step.
pub(crate) async fn socks5_bind(
    stream: &mut TcpStream,
    proxy: &DataProxyConfig,
    advertised_peer: SocketAddr,
) -> Result<SocketAddr, ProxyError> {
    socks5_login(stream, proxy).await?;
    socks5_send_request(stream, 0x02, advertised_peer).await?;
    socks5_recv_reply(stream).await
}

/// Wait for the second BIND reply, i.e. for the server to connect to the
/// proxy-side listener. After this the tunnel carries the data transfer.
pub(crate) async fn socks5_bind_wait_peer(stream: &mut TcpStream) -> Result<SocketAddr, ProxyError> {
    socks5_recv_reply(stream).await
}

/// Establish an outbound tunnel to `target` through an HTTP proxy using
/// CONNECT. Only the status line of the response is interpreted.
pub(crate) async fn http_connect(
    stream: &mut TcpStream,
    proxy: &DataProxyConfig,
    target: SocketAddr,
) -> Result<(), ProxyError> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(user) = &proxy.username {
        let pass = proxy.password.as_deref().unwrap_or_default();
        let cred = basic_auth_value(user, pass);
        request.push_str(&format!("Proxy-Authorization: Basic {cred}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // read up to the header terminator, byte-wise: the tunnel payload that
    // may follow must stay in the socket
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::InvalidReply);
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > 16 * 1024 {
            return Err(ProxyError::InvalidReply);
        }
    }
    let line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = std::str::from_utf8(line).map_err(|_| ProxyError::InvalidReply)?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(ProxyError::InvalidReply)?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(ProxyError::HttpRejected(status))
    }
}

fn basic_auth_value(user: &str, pass: &str) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(format!("{user}:{pass}"))
}
