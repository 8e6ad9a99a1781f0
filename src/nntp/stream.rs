//! TLS stream wrapper for NNTP connections.
//!
//! Provides a unified stream type that can be either TLS-encrypted or
//! plain TCP. Providers with credentials require TLS; unauthenticated
//! providers may use plain TCP when `ssl` is off.

use std::sync::Arc;

use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// A stream that can be either TLS-encrypted or plain TCP.
pub enum NntpStream {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted connection
    Tls(Box<TlsStream<TcpStream>>),
}

impl NntpStream {
    /// Connect to `host:port`, negotiating TLS when `use_tls` is set.
    pub async fn connect(host: &str, port: u16, use_tls: bool) -> std::io::Result<Self> {
        let addr = format!("{host}:{port}");
        let tcp_stream = TcpStream::connect(&addr).await?;

        if !use_tls {
            return Ok(NntpStream::Plain(tcp_stream));
        }

        let connector = Self::create_tls_connector();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let tls_stream = connector.connect(server_name, tcp_stream).await?;
        Ok(NntpStream::Tls(Box::new(tls_stream)))
    }

    /// Create a TLS connector using the bundled webpki roots.
    fn create_tls_connector() -> TlsConnector {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(config))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, NntpStream::Tls(_))
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            NntpStream::Plain(stream) => stream.shutdown().await,
            NntpStream::Tls(stream) => stream.shutdown().await,
        }
    }
}

impl AsyncRead for NntpStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(stream) => std::pin::Pin::new(stream).poll_read(cx, buf),
            NntpStream::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NntpStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NntpStream::Plain(stream) => std::pin::Pin::new(stream).poll_write(cx, buf),
            NntpStream::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(stream) => std::pin::Pin::new(stream).poll_flush(cx),
            NntpStream::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(stream) => std::pin::Pin::new(stream).poll_shutdown(cx),
            NntpStream::Tls(stream) => std::pin::Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
