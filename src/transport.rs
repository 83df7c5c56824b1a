//! Upstream transport
//!
//! Requests go through a pooled hyper-util client. Its connector reaches the
//! destination either through the Tor SOCKS5 endpoint, letting Tor resolve
//! the onion name, or with a plain TCP connect to the backend.

use crate::body::GatewayBody;
use crate::config::{GatewayConfig, Mode, Origin};
use crate::error::GatewayErrorCode;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::{capture_connection, CaptureConnection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tower_service::Service;
use tracing::{debug, trace};

/// Where a request is relayed, chosen once per request from the mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Hidden service, reached through the SOCKS5 endpoint
    Onion(Origin),
    /// Backend, reached over plain TCP
    Direct(Origin),
}

impl UpstreamTarget {
    pub fn for_mode(mode: &Mode) -> Self {
        match mode {
            Mode::Translation { onion } => UpstreamTarget::Onion(onion.clone()),
            Mode::Proxy { backend } => UpstreamTarget::Direct(backend.clone()),
        }
    }

    pub fn origin(&self) -> &Origin {
        match self {
            UpstreamTarget::Onion(origin) | UpstreamTarget::Direct(origin) => origin,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UpstreamTarget::Onion(_) => "onion",
            UpstreamTarget::Direct(_) => "direct",
        }
    }
}

/// Failure to open a connection to the destination
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("SOCKS endpoint unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("SOCKS negotiation failed: {0}")]
    Socks(String),

    #[error("upstream connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("no host in upstream URI {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("upstream response timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper_util::client::legacy::Error),
}

impl TransportError {
    /// Error page shown to the client
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            TransportError::Connect(ConnectError::ProxyUnreachable(_)) => GatewayErrorCode::ProxyUnreachable,
            TransportError::ReadTimeout(_) => GatewayErrorCode::UpstreamTimeout,
            TransportError::Connect(_) | TransportError::Request(_) => GatewayErrorCode::UpstreamUnreachable,
        }
    }

    /// Recover the connector's own error from a client error
    fn from_client(err: hyper_util::client::legacy::Error) -> Self {
        let mut cause = err.source();
        while let Some(source) = cause {
            if let Some(connect) = source.downcast_ref::<ConnectError>() {
                return TransportError::Connect(connect.clone());
            }
            cause = source.source();
        }
        TransportError::Request(err)
    }
}

fn classify_socks(err: tokio_socks::Error) -> ConnectError {
    use tokio_socks::Error as S;
    match err {
        S::HostUnreachable
        | S::NetworkUnreachable
        | S::ConnectionRefused
        | S::TtlExpired
        | S::GeneralSocksServerFailure => ConnectError::DestinationUnreachable(err.to_string()),
        other => ConnectError::Socks(other.to_string()),
    }
}

/// Connector service for the pooled client. With a SOCKS address every
/// connection is a SOCKS5 CONNECT by name; without one it is a direct TCP
/// connect. Both are bounded by the connect timeout.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    socks_addr: Option<SocketAddr>,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(socks_addr: Option<SocketAddr>, connect_timeout: Duration) -> Self {
        Self {
            socks_addr,
            connect_timeout,
        }
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
        let connect = async {
            let stream = match self.socks_addr {
                Some(socks_addr) => {
                    let stream = TcpStream::connect(socks_addr)
                        .await
                        .map_err(|e| ConnectError::ProxyUnreachable(e.to_string()))?;
                    Socks5Stream::connect_with_socket(stream, (host, port))
                        .await
                        .map_err(classify_socks)?
                        .into_inner()
                }
                None => TcpStream::connect((host, port))
                    .await
                    .map_err(|e| ConnectError::DestinationUnreachable(e.to_string()))?,
            };
            let _ = stream.set_nodelay(true);
            Ok(stream)
        };

        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
        }
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = TokioIo<TcpStream>;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let host = uri.host().ok_or_else(|| ConnectError::InvalidTarget(uri.to_string()))?;
            let port = uri.port_u16().unwrap_or(80);
            trace!(host, port, via_socks = connector.socks_addr.is_some(), "Opening upstream connection");
            connector.connect(host, port).await.map(TokioIo::new)
        })
    }
}

/// The pooled connection that carried one exchange
pub struct UpstreamConnection(CaptureConnection);

impl UpstreamConnection {
    /// Keep the connection out of the pool; used when its exchange failed part way
    pub fn poison(&self) {
        let metadata = self.0.connection_metadata();
        if let Some(connected) = &*metadata {
            connected.poison();
        }
    }
}

/// Pooled HTTP/1.1 client for the configured destination
pub struct Upstream {
    client: Client<UpstreamConnector, GatewayBody>,
    read_timeout: Duration,
}

impl Upstream {
    pub fn new(config: &GatewayConfig) -> Self {
        let socks_addr = match config.mode {
            Mode::Translation { .. } => Some(config.socks_addr),
            Mode::Proxy { .. } => None,
        };
        let connector = UpstreamConnector::new(socks_addr, config.timeouts.connect);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool.max_idle)
            .pool_idle_timeout(config.pool.idle_timeout)
            .pool_timer(TokioTimer::new())
            .http1_preserve_header_case(true)
            .set_host(false)
            .build(connector);

        debug!(
            max_idle = config.pool.max_idle,
            idle_timeout_secs = config.pool.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            read_timeout: config.timeouts.read,
        }
    }

    /// Send one request and wait for the response head.
    ///
    /// The request leaves as HTTP/1.1 in origin form whatever the client
    /// spoke. Connecting is bounded by the connector's connect timeout; once
    /// a connection is in hand the head must arrive within the read timeout.
    pub async fn send(
        &self,
        target: &UpstreamTarget,
        mut req: Request<GatewayBody>,
    ) -> Result<(Response<Incoming>, UpstreamConnection), TransportError> {
        *req.version_mut() = Version::HTTP_11;
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://{}{}", target.origin().authority(), path)
            .parse::<Uri>()
            .map_err(|_| ConnectError::InvalidTarget(target.origin().authority()))?;
        *req.uri_mut() = uri;

        let mut captured = capture_connection(&mut req);
        let response = self.client.request(req);
        tokio::pin!(response);

        let early = tokio::select! {
            biased;
            result = &mut response => Some(result),
            _ = async { captured.wait_for_connection_metadata().await.is_some() } => None,
        };

        let result = match early {
            Some(result) => result,
            None => match tokio::time::timeout(self.read_timeout, response).await {
                Ok(result) => result,
                Err(_) => {
                    UpstreamConnection(captured).poison();
                    return Err(TransportError::ReadTimeout(self.read_timeout));
                }
            },
        };

        result
            .map(|response| (response, UpstreamConnection(captured)))
            .map_err(TransportError::from_client)
    }
}
