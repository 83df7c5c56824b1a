//! Request and response header policy
//!
//! Nothing that identifies the client leaves the gateway, and nothing that
//! identifies the destination's software reaches the client.

use crate::config::Origin;
use crate::rewrite::Rewriter;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LOCATION, HOST, LOCATION, ORIGIN,
    REFERER, SET_COOKIE, STRICT_TRANSPORT_SECURITY,
};
use hyper::Uri;

/// Headers naming the client or the proxies in front of it
const CLIENT_IDENTIFYING: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-server",
    "x-real-ip",
    "via",
    "client-ip",
    "true-client-ip",
    "x-client-ip",
    "x-cluster-client-ip",
    "cf-connecting-ip",
    "fastly-client-ip",
    "x-originating-ip",
    "x-request-id",
    "proxy-authorization",
];

/// Connection-scoped headers never relayed in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers advertising the destination's software
const SERVER_FINGERPRINT: &[&str] = &[
    "server",
    "x-powered-by",
    "x-aspnet-version",
    "x-aspnetmvc-version",
    "x-runtime",
    "via",
];

const HSTS: &str = "max-age=31536000";

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Prepare client request headers for the upstream exchange
pub fn sanitize_request(headers: &mut HeaderMap, origin: &Origin, basehost: &str) {
    remove_hop_by_hop(headers);
    for name in CLIENT_IDENTIFYING {
        headers.remove(*name);
    }

    for name in [REFERER, ORIGIN] {
        let rewritten = headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| point_at_origin(v, origin, basehost))
            .and_then(|v| HeaderValue::from_str(&v).ok());
        match rewritten {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }

    if let Ok(host) = HeaderValue::from_str(&origin.authority()) {
        headers.insert(HOST, host);
    }
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
}

/// Map a gateway URL to the same path on the origin; `None` for anything
/// pointing elsewhere
fn point_at_origin(value: &str, origin: &Origin, basehost: &str) -> Option<String> {
    let uri: Uri = value.parse().ok()?;
    if !uri.host()?.eq_ignore_ascii_case(basehost) {
        return None;
    }
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    // Origin headers carry no path
    let path = if path == "/" && !value.ends_with('/') { "" } else { path };
    Some(format!("http://{}{}", origin.authority(), path))
}

/// Prepare upstream response headers for the client
pub fn sanitize_response(headers: &mut HeaderMap, rewriter: &Rewriter) {
    remove_hop_by_hop(headers);
    for name in SERVER_FINGERPRINT {
        headers.remove(*name);
    }

    for name in [LOCATION, CONTENT_LOCATION] {
        let rewritten = headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(|v| rewriter.rewrite_url(v))
            .and_then(|v| HeaderValue::from_str(&v).ok());
        if let Some(value) = rewritten {
            headers.insert(name, value);
        }
    }

    let cookies: Vec<HeaderValue> = headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| match v.to_str() {
            Ok(cookie) => HeaderValue::from_str(&rewrite_cookie(cookie)).unwrap_or_else(|_| v.clone()),
            Err(_) => v.clone(),
        })
        .collect();
    if !cookies.is_empty() {
        headers.remove(SET_COOKIE);
        for cookie in cookies {
            headers.append(SET_COOKIE, cookie);
        }
    }

    headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS));
}

/// Drop `Domain=` so cookies are scoped to the gateway host
fn rewrite_cookie(cookie: &str) -> String {
    cookie
        .split(';')
        .map(str::trim)
        .filter(|part| !part.to_ascii_lowercase().starts_with("domain="))
        .collect::<Vec<_>>()
        .join("; ")
}
