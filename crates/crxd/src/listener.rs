//! Listeners for the HTTP server
//!
//! Binds the TCP and unix socket listeners from `[listen]`, optionally wraps
//! accepted connections in TLS and serves the router on each connection with
//! hyper. Connections are drained gracefully once the shutdown token fires.

use anyhow::{anyhow, bail, Context, Result};
use axum::Router;
use crx_common::{TcpListenConfig, TlsConfig, UnixListenConfig};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::fmt;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

enum Endpoint {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A bound listener, ready to serve.
pub struct Listener {
    endpoint: Endpoint,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bound address of a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Endpoint::Unix(..) => None,
        }
    }

    async fn accept(&self) -> std::io::Result<(Connection, String)> {
        match &self.endpoint {
            Endpoint::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Endpoint::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), path.display().to_string()))
            }
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        match &self.endpoint {
            Endpoint::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => write!(f, "{}://{}", scheme, addr),
                Err(_) => write!(f, "{}://<unbound>", scheme),
            },
            #[cfg(unix)]
            Endpoint::Unix(_, path) => write!(f, "{}+unix://{}", scheme, path.display()),
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

pub async fn bind_tcp(config: &TcpListenConfig) -> Result<Listener> {
    let listener = TcpListener::bind((config.address.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.address, config.port))?;
    let tls = match &config.tls {
        Some(tls) => Some(load_tls(tls).await?),
        None => None,
    };
    Ok(Listener {
        endpoint: Endpoint::Tcp(listener),
        tls,
    })
}

/// Bind the unix socket, replacing a stale socket file left by a previous run.
#[cfg(unix)]
pub async fn bind_unix(config: &UnixListenConfig) -> Result<Listener> {
    use std::fs::{self, Permissions};
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    let path = &config.path;
    let mode = config
        .mode()
        .ok_or_else(|| anyhow!("Invalid socket permission {}", config.permission))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        Ok(_) => bail!("{} exists and is not a socket", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", path.display()));
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

    let tls = match &config.tls {
        Some(tls) => Some(load_tls(tls).await?),
        None => None,
    };
    Ok(Listener {
        endpoint: Endpoint::Unix(listener, path.clone()),
        tls,
    })
}

#[cfg(not(unix))]
pub async fn bind_unix(config: &UnixListenConfig) -> Result<Listener> {
    bail!(
        "Unix sockets are not supported on this platform ({})",
        config.path.display()
    )
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
///
/// The key is read from `key`, or from the certificate file when `key` is
/// not set.
pub async fn load_tls(config: &TlsConfig) -> Result<TlsAcceptor> {
    if config.password.is_some() {
        bail!("Encrypted TLS keys are not supported, decrypt the key and remove tls.password");
    }

    let cert_pem = tokio::fs::read(&config.cert)
        .await
        .with_context(|| format!("Failed to read TLS certificate: {}", config.cert.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(&cert_pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate")?;
    if certs.is_empty() {
        bail!("No certificates found in {}", config.cert.display());
    }

    let key_path = config.key.as_ref().unwrap_or(&config.cert);
    let key_pem = if key_path == &config.cert {
        cert_pem
    } else {
        tokio::fs::read(key_path)
            .await
            .with_context(|| format!("Failed to read TLS key: {}", key_path.display()))?
    };
    let key = rustls_pemfile::private_key(&mut BufReader::new(&key_pem[..]))
        .context("Failed to parse TLS key")?
        .ok_or_else(|| anyhow!("No private key found in {}", key_path.display()))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!("TLS config loaded from {}", config.cert.display());
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

// ============================================================================
// Serving
// ============================================================================

/// Serve `app` on `listener` until `shutdown` is cancelled, then let open
/// connections finish their in-flight requests.
pub async fn serve(listener: Listener, app: Router, shutdown: CancellationToken) {
    info!("Listening on {}", listener);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((connection, peer)) => {
                    debug!("Connection from {}", peer);
                    let tls = listener.tls.clone();
                    let app = app.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        match connection {
                            Connection::Tcp(stream) => handle(stream, tls, app, shutdown).await,
                            #[cfg(unix)]
                            Connection::Unix(stream) => handle(stream, tls, app, shutdown).await,
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed on {}: {}", listener, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    debug!("Draining {} connections on {}", connections.len(), listener);
    while connections.join_next().await.is_some() {}

    #[cfg(unix)]
    if let Endpoint::Unix(_, path) = &listener.endpoint {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove socket {}: {}", path.display(), e);
        }
    }
    info!("Stopped listening on {}", listener);
}

async fn handle<IO>(io: IO, tls: Option<TlsAcceptor>, app: Router, shutdown: CancellationToken)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tls {
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(io)).await {
                Ok(Ok(stream)) => serve_connection(stream, app, shutdown).await,
                Ok(Err(e)) => debug!("TLS handshake failed: {}", e),
                Err(_) => debug!("TLS handshake timed out"),
            }
        }
        None => serve_connection(io, app, shutdown).await,
    }
}

async fn serve_connection<IO>(io: IO, app: Router, shutdown: CancellationToken)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
        app.clone().oneshot(request)
    });

    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection closed with error: {}", e);
                }
                break;
            }
            _ = shutdown.cancelled(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}
