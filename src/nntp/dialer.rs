//! Interface-bound dialing
//!
//! Every NNTP socket can be pinned to a named network interface before
//! connecting (`SO_BINDTODEVICE` on Linux), so traffic egresses through the
//! VPN tunnel regardless of the routing table. TLS, when requested, runs
//! over the already-bound socket with SNI and certificate validation
//! against the system trust store.

use crate::error::NntpError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

/// Bound on the TCP connect plus TLS handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A plain or TLS-wrapped NNTP socket
#[derive(Debug)]
pub enum NntpStream {
    /// Unencrypted TCP
    Plain(TcpStream),
    /// Implicit TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NntpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NntpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open a connection to `host:port`, bound to `interface` when non-empty,
/// TLS-wrapped when `tls` is set.
pub async fn dial(
    host: &str,
    port: u16,
    tls: bool,
    interface: &str,
) -> Result<NntpStream, NntpError> {
    let addr = resolve(host, port).await?;
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect_bound(addr, interface))
        .await
        .map_err(|_| NntpError::Timeout("connect"))??;

    if !tls {
        debug!(%addr, interface, "NNTP connection established");
        return Ok(NntpStream::Plain(stream));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| NntpError::Protocol(format!("invalid TLS hostname '{host}': {e}")))?;
    let connector = TlsConnector::from(tls_client_config());
    let tls_stream = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| NntpError::Timeout("TLS handshake"))?
        .map_err(NntpError::Transport)?;

    debug!(%addr, interface, "NNTP TLS connection established");
    Ok(NntpStream::Tls(Box::new(tls_stream)))
}

/// Resolve to the first address for `host:port`
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NntpError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(NntpError::Transport)?;
    addrs.next().ok_or_else(|| {
        NntpError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses for {host}:{port}"),
        ))
    })
}

/// Create a socket for the address family, bind it to the interface when
/// requested, and connect.
async fn connect_bound(addr: SocketAddr, interface: &str) -> Result<TcpStream, NntpError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(NntpError::Transport)?;

    if !interface.is_empty() {
        bind_to_device(&socket, interface)?;
    }

    socket.connect(addr).await.map_err(NntpError::Transport)
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &TcpSocket, interface: &str) -> Result<(), NntpError> {
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(|e| {
            NntpError::Transport(std::io::Error::new(
                e.kind(),
                format!("SO_BINDTODEVICE to {interface}: {e}"),
            ))
        })
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &TcpSocket, interface: &str) -> Result<(), NntpError> {
    Err(NntpError::Transport(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("interface binding to {interface} is only supported on Linux"),
    )))
}

/// Shared rustls client config: system trust store with a Mozilla CA
/// bundle fallback. Built once per process.
fn tls_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                let _ = roots.add(cert);
            }
            for error in native.errors {
                warn!("TLS certificate loading error: {error}");
            }
            if roots.is_empty() {
                debug!("no system certificates available, using Mozilla CA bundle");
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}
