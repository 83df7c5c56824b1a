//! Response bodies
//!
//! Upstream bodies are relayed either fully buffered (small bodies, exact
//! `Content-Length`) or as a lazy stream of rewritten chunks. Every read
//! from upstream is bounded by the idle read timeout.

use crate::rewrite::Pipeline;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("upstream body stalled for more than {0:?}")]
    IdleTimeout(Duration),

    #[error("upstream body exceeded {0} bytes")]
    TooLarge(usize),

    #[error("upstream body error: {0}")]
    Upstream(BoxError),
}

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Declared body length, if any
pub fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// How a rewritten body is framed towards the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Read completely, rewrite, send with an exact Content-Length
    Buffered,
    /// Rewrite chunk by chunk, send without Content-Length
    Streamed,
}

impl Framing {
    pub fn choose(headers: &HeaderMap, buffer_limit: usize) -> Self {
        match content_length(headers) {
            Some(len) if len <= buffer_limit => Framing::Buffered,
            _ => Framing::Streamed,
        }
    }
}

/// Read a whole body, failing on an idle gap longer than `idle_timeout`
/// or once more than `limit` bytes arrive
pub async fn collect_limited<B>(mut body: B, idle_timeout: Duration, limit: usize) -> Result<Vec<u8>, BodyError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut data = Vec::new();
    loop {
        match tokio::time::timeout(idle_timeout, body.frame()).await {
            Err(_) => return Err(BodyError::IdleTimeout(idle_timeout)),
            Ok(None) => return Ok(data),
            Ok(Some(Err(e))) => return Err(BodyError::Upstream(e.into())),
            Ok(Some(Ok(frame))) => {
                if let Ok(chunk) = frame.into_data() {
                    if data.len() + chunk.len() > limit {
                        return Err(BodyError::TooLarge(limit));
                    }
                    data.extend_from_slice(&chunk);
                }
            }
        }
    }
}

/// Callback run when relaying an upstream body fails part way
pub type OnAbort = Box<dyn FnOnce() + Send>;

/// An upstream body relayed to the client chunk by chunk
pub struct UpstreamBody<B> {
    body: B,
    pipeline: Option<Pipeline>,
    idle_timeout: Duration,
    on_abort: Option<OnAbort>,
}

impl<B> UpstreamBody<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    pub fn new(body: B, pipeline: Option<Pipeline>, idle_timeout: Duration) -> Self {
        Self {
            body,
            pipeline,
            idle_timeout,
            on_abort: None,
        }
    }

    /// Run `f` if the upstream body errors or stalls; never runs on a clean end of stream
    pub fn on_abort(mut self, f: OnAbort) -> Self {
        self.on_abort = Some(f);
        self
    }

    /// Turn into a lazy, finite stream of output chunks. Trailers are dropped.
    pub fn into_body(self) -> GatewayBody {
        let chunks = stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            loop {
                let next = tokio::time::timeout(state.idle_timeout, state.body.frame()).await;
                match next {
                    Err(_) => return Some((state.abort(BodyError::IdleTimeout(state.idle_timeout)), None)),
                    Ok(Some(Err(e))) => return Some((state.abort(BodyError::Upstream(e.into())), None)),
                    Ok(None) => {
                        let tail = state.pipeline.as_mut().map(Pipeline::finish).unwrap_or_default();
                        if tail.is_empty() {
                            return None;
                        }
                        return Some((Ok(Frame::data(Bytes::from(tail))), None));
                    }
                    Ok(Some(Ok(frame))) => {
                        let Ok(data) = frame.into_data() else {
                            continue;
                        };
                        let out = match state.pipeline.as_mut() {
                            Some(pipeline) => Bytes::from(pipeline.push(&data)),
                            None => data,
                        };
                        if out.is_empty() {
                            continue;
                        }
                        return Some((Ok(Frame::data(out)), Some(state)));
                    }
                }
            }
        });
        StreamBody::new(chunks).boxed_unsync()
    }

    fn abort(&mut self, error: BodyError) -> Result<Frame<Bytes>, BoxError> {
        if let Some(hook) = self.on_abort.take() {
            hook();
        }
        Err(Box::new(error))
    }
}
