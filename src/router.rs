//! Request classification
//!
//! Every request is classified exactly once into a [`Route`]. The checks
//! run in a fixed order: hostname, robots.txt, crawlers, Tor redirection,
//! GetTor, hotlinking, and finally the upstream destination.

use crate::config::{GatewayConfig, Mode};
use crate::error::GatewayErrorCode;
use crate::gettor::{read_list, GetTorKind};
use crate::rewrite::STATIC_PREFIX;
use crate::transport::UpstreamTarget;
use hyper::header::{HOST, REFERER, USER_AGENT};
use hyper::{Request, Uri};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Served instead of the destination's robots.txt
pub const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

/// User-agent fragments of well-known crawlers, lowercase
const CRAWLERS: &[&str] = &[
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
    "sogou",
    "exabot",
    "facebot",
    "ia_archiver",
    "ahrefsbot",
    "semrushbot",
    "mj12bot",
    "dotbot",
    "petalbot",
    "bytespider",
    "gptbot",
    "ccbot",
];

/// Extensions of resources commonly embedded by third-party pages
const HOTLINKABLE: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "ico", "mp3", "ogg", "wav", "flac", "mp4", "webm", "avi",
    "mkv", "mov", "flv",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Upstream(UpstreamTarget),
    /// Tor users are sent to the hidden service itself
    TorRedirect(String),
    GetTor(GetTorKind),
    RobotsTxt,
    Reject(GatewayErrorCode),
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Upstream(target) => target.label(),
            Route::TorRedirect(_) => "tor-redirect",
            Route::GetTor(_) => "gettor",
            Route::RobotsTxt => "robots",
            Route::Reject(_) => "reject",
        }
    }
}

/// Load the Tor exit list, one IP per line
pub fn load_tor_exits(path: &Path) -> std::io::Result<HashSet<IpAddr>> {
    let mut exits = HashSet::new();
    for line in read_list(path)? {
        match line.parse() {
            Ok(ip) => {
                exits.insert(ip);
            }
            Err(_) => warn!(entry = %line, "Ignoring malformed Tor exit entry"),
        }
    }
    Ok(exits)
}

/// Requested hostname, from `Host` or the HTTP/2 `:authority`, port stripped
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let hostname = raw.split(':').next()?.trim_end_matches('.');
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }
    Some(hostname.to_ascii_lowercase())
}

pub struct Router {
    config: Arc<GatewayConfig>,
    tor_exits: HashSet<IpAddr>,
    target: UpstreamTarget,
}

impl Router {
    pub fn new(config: Arc<GatewayConfig>, tor_exits: HashSet<IpAddr>) -> Self {
        let target = UpstreamTarget::for_mode(&config.mode);
        Self {
            config,
            tor_exits,
            target,
        }
    }

    pub fn route<B>(&self, req: &Request<B>, client_ip: IpAddr) -> Route {
        let features = &self.config.features;

        match extract_hostname(req) {
            Some(host) if host == self.config.basehost => {}
            _ => return Route::Reject(GatewayErrorCode::BadHostname),
        }

        let path = req.uri().path();
        if features.override_robots_txt && path == "/robots.txt" {
            return Route::RobotsTxt;
        }

        if features.block_crawl && self.is_crawler(req) {
            return Route::Reject(GatewayErrorCode::CrawlerBlocked);
        }

        if let Mode::Translation { onion } = &self.config.mode {
            if !features.disable_tor_redirection && self.tor_exits.contains(&client_ip) {
                let pq = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                return Route::TorRedirect(format!("http://{}{}", onion.authority(), pq));
            }
        }

        if let Some(rest) = path.strip_prefix(STATIC_PREFIX) {
            if rest.is_empty() || rest.starts_with('/') {
                return self.route_static(rest);
            }
        }

        if features.block_hotlinking && self.is_hotlink(req) {
            return Route::Reject(GatewayErrorCode::HotlinkBlocked);
        }

        Route::Upstream(self.target.clone())
    }

    fn route_static(&self, rest: &str) -> Route {
        if self.config.gettor_enabled() {
            match rest.trim_end_matches('/') {
                "/gettor" => return Route::GetTor(GetTorKind::Bundle),
                "/gettor/signature" => return Route::GetTor(GetTorKind::Signature),
                _ => {}
            }
        }
        Route::Reject(GatewayErrorCode::NotFound)
    }

    fn is_crawler<B>(&self, req: &Request<B>) -> bool {
        let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let agent = agent.to_ascii_lowercase();
        CRAWLERS.iter().any(|bot| agent.contains(bot))
    }

    /// A hotlinkable resource requested from a page not served by the gateway
    fn is_hotlink<B>(&self, req: &Request<B>) -> bool {
        let path = req.uri().path();
        let last = path.rsplit('/').next().unwrap_or("");
        let hotlinkable = last
            .rsplit_once('.')
            .map(|(_, ext)| HOTLINKABLE.iter().any(|h| ext.eq_ignore_ascii_case(h)))
            .unwrap_or(false);
        if !hotlinkable {
            return false;
        }

        let Some(referer) = req.headers().get(REFERER).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        match referer.parse::<Uri>().ok().as_ref().and_then(Uri::host) {
            Some(host) => !host.eq_ignore_ascii_case(&self.config.basehost),
            None => true,
        }
    }
}
