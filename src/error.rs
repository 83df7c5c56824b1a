//! Gateway error pages
//!
//! Every per-request failure is turned into one of a fixed set of responses.
//! Bodies only carry the static message of the error code so that nothing
//! about the destination or the gateway's internals leaks to the client.

use crate::body::{empty_body, full_body, GatewayBody};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the gateway error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Host header does not name this gateway
    BadHostname,
    /// Resource requested from a third-party page
    HotlinkBlocked,
    /// Request from a known crawler
    CrawlerBlocked,
    /// Unknown gateway-local resource
    NotFound,
    /// Destination could not be reached
    UpstreamUnreachable,
    /// The Tor SOCKS endpoint could not be reached
    ProxyUnreachable,
    /// Destination did not answer in time
    UpstreamTimeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::BadHostname => StatusCode::BAD_REQUEST,
            GatewayErrorCode::HotlinkBlocked => StatusCode::FORBIDDEN,
            GatewayErrorCode::CrawlerBlocked => StatusCode::FORBIDDEN,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ProxyUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::BadHostname => "BAD_HOSTNAME",
            GatewayErrorCode::HotlinkBlocked => "HOTLINK_BLOCKED",
            GatewayErrorCode::CrawlerBlocked => "CRAWLER_BLOCKED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            GatewayErrorCode::ProxyUnreachable => "PROXY_UNREACHABLE",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Fixed, client-safe description
    pub fn message(&self) -> &'static str {
        match self {
            GatewayErrorCode::BadHostname => "This gateway does not serve the requested hostname.",
            GatewayErrorCode::HotlinkBlocked => "Embedding this resource from another site is not allowed.",
            GatewayErrorCode::CrawlerBlocked => "Automated crawling of this gateway is not allowed.",
            GatewayErrorCode::NotFound => "The requested resource does not exist.",
            GatewayErrorCode::UpstreamUnreachable => "The site behind this gateway could not be reached.",
            GatewayErrorCode::ProxyUnreachable => "The gateway is temporarily unable to reach the Tor network.",
            GatewayErrorCode::UpstreamTimeout => "The site behind this gateway did not respond in time.",
            GatewayErrorCode::InternalError => "The gateway encountered an internal error.",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: &'static str,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: code.message(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message,
                self.status
            )
        })
    }

    pub fn to_html(&self) -> String {
        let reason = self.code.status_code().canonical_reason().unwrap_or("Error");
        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{status} {reason}</title></head>\
             <body><h1>{status} {reason}</h1><p>{message}</p></body></html>\n",
            status = self.status,
            reason = reason,
            message = self.message,
        )
    }
}

/// Whether the client prefers a JSON error body
pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json") && !v.contains("text/html"))
        .unwrap_or(false)
}

/// Build the error response for a failure
pub fn error_response(code: GatewayErrorCode, json: bool) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code);
    let (content_type, body) = if json {
        ("application/json", error.to_json())
    } else {
        ("text/html; charset=utf-8", error.to_html())
    };

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Build a redirect with an empty body
pub fn redirect_response(status: StatusCode, location: &str) -> Response<GatewayBody> {
    let location = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));
    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .body(empty_body())
        .expect("valid redirect response")
}
