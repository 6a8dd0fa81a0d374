/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// TLS parameters for encrypting a data connection.
///
/// The `client_config` is shared with the control connection: its resumption
/// cache makes the data connection resume the control session instead of
/// running a full handshake, and its client certificate (if any) stays alive
/// for as long as any connection holds the `Arc`.
#[derive(Clone)]
pub struct TlsConnectContext {
    pub client_config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl TlsConnectContext {
    pub(crate) async fn handshake(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.client_config.clone());
        connector.connect(self.server_name.clone(), tcp).await
    }
}

pin_project_lite::pin_project! {
    /// The transport of one data transfer, plain or TLS-wrapped.
    #[project = DataStreamProj]
    pub enum DataStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: Box<TlsStream<TcpStream>> },
    }
}

impl DataStream {
    pub(crate) fn plain(inner: TcpStream) -> Self {
        DataStream::Plain { inner }
    }

    pub(crate) fn tls(inner: TlsStream<TcpStream>) -> Self {
        DataStream::Tls {
            inner: Box::new(inner),
        }
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DataStreamProj::Plain { inner } => inner.poll_read(cx, buf),
            DataStreamProj::Tls { inner } => Pin::new(inner.get_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            DataStreamProj::Plain { inner } => inner.poll_write(cx, buf),
            DataStreamProj::Tls { inner } => Pin::new(inner.get_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DataStreamProj::Plain { inner } => inner.poll_flush(cx),
            DataStreamProj::Tls { inner } => Pin::new(inner.get_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DataStreamProj::Plain { inner } => inner.poll_shutdown(cx),
            DataStreamProj::Tls { inner } => Pin::new(inner.get_mut()).poll_shutdown(cx),
        }
    }
}
