//! IRC transport
//!
//! The adapter only needs a byte stream. [`TcpConnector`] opens plain or TLS
//! TCP connections; tests substitute in-memory duplex streams.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tracing::debug;

pub trait IrcStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> IrcStream for T {}

pub type BoxedStream = Box<dyn IrcStream>;

/// Opens the byte stream an IRC session runs over
#[async_trait]
pub trait IrcConnector: Send + Sync {
    async fn connect(&self, address: &str, port: u16, use_ssl: bool) -> io::Result<BoxedStream>;
}

/// Connects over TCP, wrapping the socket in TLS when asked to
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl IrcConnector for TcpConnector {
    async fn connect(&self, address: &str, port: u16, use_ssl: bool) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect((address, port)).await?;
        tcp.set_nodelay(true)?;
        if !use_ssl {
            return Ok(Box::new(tcp));
        }

        let connector = TlsConnector::from(Arc::new(tls_config()?));
        let server_name = rustls::pki_types::ServerName::try_from(address.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = connector.connect(server_name, tcp).await?;
        debug!("TLS session established with {}:{}", address, port);
        Ok(Box::new(tls))
    }
}

fn tls_config() -> io::Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(io::Error::other)?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync + ?Sized>() {}

    #[test]
    fn test_boxed_stream_is_shareable() {
        // Handshake borrows the reader across awaits inside Send futures
        assert_send_sync::<BoxedStream>();
        assert_send_sync::<tokio::io::ReadHalf<BoxedStream>>();
    }

    #[test]
    fn test_tls_config_builds() {
        assert!(tls_config().is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is not expected to accept connections
        let result = TcpConnector.connect("127.0.0.1", 1, false).await;
        assert!(result.is_err());
    }
}
