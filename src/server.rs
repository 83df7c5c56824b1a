//! Public listeners
//!
//! [`GatewayServer`] terminates TLS and serves HTTP/1.1 and HTTP/2 on the
//! public address. [`RedirectServer`] answers plain HTTP with a redirect to
//! the HTTPS listener.

use crate::body::GatewayBody;
use crate::error::redirect_response;
use crate::gateway::Gateway;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use anyhow::Context;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Bind a public listener; failure here aborts startup
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

pub struct GatewayServer {
    gateway: Arc<Gateway>,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        gateway: Arc<Gateway>,
        acceptor: TlsAcceptor,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let handshake_timeout = gateway.config().timeouts.handshake;
        Self {
            gateway,
            acceptor,
            handshake_timeout,
            shutdown_rx,
        }
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTPS, HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let acceptor = self.acceptor.clone();
                            let gateway = Arc::clone(&self.gateway);
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                                    Ok(Ok(tls_stream)) => tls_stream,
                                    Ok(Err(e)) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                    Err(_) => {
                                        debug!(addr = %addr, timeout_secs = handshake_timeout.as_secs(), "TLS handshake timed out");
                                        return;
                                    }
                                };
                                if let Err(e) = handle_connection(tls_stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "TLS connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Plain HTTP listener redirecting every request to the HTTPS listener
pub struct RedirectServer {
    public_base_url: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl RedirectServer {
    pub fn new(public_base_url: String, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            public_base_url,
            shutdown_rx,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, target = %self.public_base_url, "HTTP to HTTPS redirect listening");

        let base: Arc<str> = Arc::from(self.public_base_url.as_str());
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let base = Arc::clone(&base);
                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let base = Arc::clone(&base);
                                    async move { Ok::<_, Infallible>(build_https_redirect(&req, &base)) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Redirect server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// 301 to the same path on the public HTTPS address
fn build_https_redirect<B>(req: &Request<B>, public_base_url: &str) -> Response<GatewayBody> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    redirect_response(StatusCode::MOVED_PERMANENTLY, &format!("{}{}", public_base_url, path))
}
