//! Per-request engine
//!
//! Classifies each request, relays it upstream when needed, and turns the
//! upstream response into the client response.

use crate::body::{collect_limited, full_body, BodyError, BoxError, Framing, GatewayBody, UpstreamBody};
use crate::config::GatewayConfig;
use crate::error::{error_response, redirect_response, wants_json, GatewayErrorCode};
use crate::gettor::GetTor;
use crate::headers::{sanitize_request, sanitize_response};
use crate::rewrite::{Fragments, Rewriter};
use crate::router::{extract_hostname, load_tor_exits, Route, Router, ROBOTS_TXT};
use crate::transport::{TransportError, Upstream, UpstreamTarget};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure while relaying a request upstream
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Body(#[from] BodyError),
}

impl ForwardError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            ForwardError::Transport(e) => e.code(),
            ForwardError::Body(BodyError::IdleTimeout(_)) => GatewayErrorCode::UpstreamTimeout,
            ForwardError::Body(_) => GatewayErrorCode::UpstreamUnreachable,
        }
    }
}

/// Per-request bookkeeping, logged once the response head is ready
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: SocketAddr,
    pub host: Option<String>,
    pub method: Method,
    pub path: String,
    pub started: Instant,
}

impl RequestContext {
    pub fn new<B>(req: &Request<B>, client_addr: SocketAddr) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_addr,
            host: extract_hostname(req),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            started: Instant::now(),
        }
    }

    fn finish(&self, route: &Route, status: StatusCode) {
        debug!(request_id = %self.request_id, client = %self.client_addr, "Request client");
        info!(
            request_id = %self.request_id,
            host = self.host.as_deref().unwrap_or("-"),
            method = %self.method,
            path = %self.path,
            route = route.label(),
            status = status.as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Request completed"
        );
    }
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    router: Router,
    upstream: Upstream,
    rewriter: Rewriter,
    gettor: GetTor,
}

impl Gateway {
    pub fn new(config: Arc<GatewayConfig>) -> anyhow::Result<Self> {
        let fragments = Fragments::load(&config)
            .map_err(|e| anyhow::anyhow!("Failed to read banner or disclaimer file: {}", e))?;

        let tor_exits = match &config.tor_exits_file {
            Some(path) => load_tor_exits(path)
                .map_err(|e| anyhow::anyhow!("Failed to read Tor exit list {}: {}", path.display(), e))?,
            None => HashSet::new(),
        };
        debug!(tor_exits = tor_exits.len(), "Tor exit list loaded");

        Ok(Self {
            router: Router::new(Arc::clone(&config), tor_exits),
            upstream: Upstream::new(&config),
            rewriter: Rewriter::new(&config, fragments),
            gettor: GetTor::new(&config.datadir),
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let ctx = RequestContext::new(&req, client_addr);
        let route = self.router.route(&req, client_addr.ip());
        let json = wants_json(req.headers());

        let response = match &route {
            Route::Reject(code) => error_response(*code, json),
            Route::RobotsTxt => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain")
                .body(full_body(ROBOTS_TXT))
                .expect("valid response builder"),
            Route::TorRedirect(location) => redirect_response(StatusCode::FOUND, location),
            Route::GetTor(kind) => self.gettor.serve(req.headers(), *kind).await,
            Route::Upstream(target) => match self.forward(req, target).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(request_id = %ctx.request_id, target = target.label(), error = %e, "Upstream request failed");
                    error_response(e.code(), json)
                }
            },
        };

        ctx.finish(&route, response.status());
        response
    }

    async fn forward<B>(&self, req: Request<B>, target: &UpstreamTarget) -> Result<Response<GatewayBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let read_timeout = self.config.timeouts.read;
        let is_head = req.method() == Method::HEAD;

        let (mut parts, body) = req.into_parts();
        sanitize_request(&mut parts.headers, target.origin(), &self.config.basehost);
        let upstream_req = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());

        let (response, connection) = self.upstream.send(target, upstream_req).await?;

        let (mut parts, body) = response.into_parts();
        sanitize_response(&mut parts.headers, &self.rewriter);

        let pipeline = if matches!(parts.status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) {
            None
        } else {
            match self.rewriter.pipeline_for(&parts.headers) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    warn!(error = %e, "Passing response through unmodified");
                    None
                }
            }
        };

        // HEAD carries no body, but a GET would be rewritten to another length
        let pipeline = if is_head {
            if pipeline.is_some() {
                parts.headers.remove(CONTENT_LENGTH);
            }
            None
        } else {
            pipeline
        };

        let body = match pipeline {
            None => UpstreamBody::new(body, None, read_timeout)
                .on_abort(Box::new(move || connection.poison()))
                .into_body(),
            Some(pipeline) => match Framing::choose(&parts.headers, self.config.rewrite_buffer_limit) {
                Framing::Buffered => {
                    let data = match collect_limited(body, read_timeout, self.config.rewrite_buffer_limit).await {
                        Ok(data) => data,
                        Err(e) => {
                            connection.poison();
                            return Err(e.into());
                        }
                    };
                    let out = pipeline.apply(&data);
                    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(out.len()));
                    full_body(out)
                }
                Framing::Streamed => {
                    parts.headers.remove(CONTENT_LENGTH);
                    UpstreamBody::new(body, Some(pipeline), read_timeout)
                        .on_abort(Box::new(move || connection.poison()))
                        .into_body()
                }
            },
        };

        Ok(Response::from_parts(parts, body))
    }
}
