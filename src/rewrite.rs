//! Streaming content rewriting
//!
//! Response bodies pass through a [`Pipeline`] of byte-level transforms.
//! Each transform holds back only the few bytes that could still be the
//! start of a match, so arbitrarily large bodies are rewritten with bounded
//! memory and chunk boundaries never affect the result.

use crate::config::{GatewayConfig, Mode, Origin};
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use std::path::Path;
use thiserror::Error;

/// Gateway-local path namespace (GetTor lives under it)
pub const STATIC_PREFIX: &str = "/_tor2web";

/// Longest scheme that may precede a matched `//host`
const SCHEME_LOOKBEHIND: usize = "https:".len();

/// Port implied by a link without one; origins are always plain HTTP
const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("cannot rewrite body with content-encoding '{0}'")]
    UnsupportedEncoding(String),
}

/// A stateful byte transform applied chunk by chunk
pub trait Transform: Send {
    /// Consume `input`, appending every byte that can already be emitted to `out`
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>);

    /// Flush held-back bytes at end of stream
    fn finish(&mut self, out: &mut Vec<u8>);
}

fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

fn ends_with_ci(haystack: &[u8], suffix: &[u8]) -> bool {
    haystack.len() >= suffix.len() && haystack[haystack.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

fn is_host_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@')
}

/// Outcome of inspecting the bytes that follow a matched host
enum Tail {
    /// Not enough input to decide
    Incomplete,
    /// The host continues (e.g. `origin.onion.evil.com`)
    Reject,
    /// Match; this many bytes of `:port` must be consumed with the host
    Accept(usize),
}

fn scan_tail(rest: &[u8], eof: bool, origin_port: u16) -> Tail {
    let mut consumed = 0;
    if rest.first() == Some(&b':') {
        let digits = rest[1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if 1 + digits == rest.len() && !eof {
            return Tail::Incomplete;
        }
        if digits > 0 {
            let port = std::str::from_utf8(&rest[1..1 + digits])
                .ok()
                .and_then(|p| p.parse::<u16>().ok());
            // Only the origin's own port matches
            if port != Some(origin_port) {
                return Tail::Reject;
            }
            consumed = 1 + digits;
        }
    }

    let tail = match rest.get(consumed) {
        None if eof => Tail::Accept(consumed),
        None => Tail::Incomplete,
        // A trailing dot ends a sentence, a dot followed by a label extends the host
        Some(b'.') => match rest.get(consumed + 1) {
            None if !eof => Tail::Incomplete,
            Some(b) if is_host_byte(*b) => Tail::Reject,
            _ => Tail::Accept(consumed),
        },
        Some(b) if is_host_byte(*b) => Tail::Reject,
        Some(_) => Tail::Accept(consumed),
    };

    match tail {
        Tail::Accept(0) if origin_port != DEFAULT_PORT => Tail::Reject,
        other => other,
    }
}

/// Replaces absolute and protocol-relative URLs naming the origin with the
/// gateway's public base URL
pub struct LinkRewriter {
    needle: Vec<u8>,
    origin_port: u16,
    absolute: Vec<u8>,
    relative: Vec<u8>,
    pending: Vec<u8>,
}

impl LinkRewriter {
    /// `public_base_url` must be of the form `https://host[:port]`
    pub fn new(origin: &Origin, public_base_url: &str) -> Self {
        let relative = public_base_url
            .strip_prefix("https:")
            .unwrap_or(public_base_url)
            .as_bytes()
            .to_vec();
        Self {
            needle: format!("//{}", origin.host.to_ascii_lowercase()).into_bytes(),
            origin_port: origin.port,
            absolute: public_base_url.as_bytes().to_vec(),
            relative,
            pending: Vec::new(),
        }
    }

    /// Rewrite a complete value such as a `Location` header
    pub fn rewrite_str(origin: &Origin, public_base_url: &str, value: &str) -> String {
        let mut rewriter = Self::new(origin, public_base_url);
        let mut out = Vec::with_capacity(value.len());
        rewriter.feed(value.as_bytes(), &mut out);
        rewriter.finish(&mut out);
        // Only ASCII is ever inserted or removed around UTF-8 input
        String::from_utf8(out).unwrap_or_else(|_| value.to_string())
    }

    fn process(&mut self, out: &mut Vec<u8>, eof: bool) {
        let buf = std::mem::take(&mut self.pending);
        let mut cursor = 0;
        let mut search = 0;

        while let Some(offset) = find_ci(&buf[search..], &self.needle) {
            let at = search + offset;
            let host_end = at + self.needle.len();

            let prefix = &buf[cursor..at];
            let (start, absolute) = if ends_with_ci(prefix, b"https:") {
                (at - 6, true)
            } else if ends_with_ci(prefix, b"http:") {
                (at - 5, true)
            } else {
                (at, false)
            };

            match scan_tail(&buf[host_end..], eof, self.origin_port) {
                Tail::Incomplete => {
                    out.extend_from_slice(&buf[cursor..start]);
                    self.pending = buf[start..].to_vec();
                    return;
                }
                Tail::Reject => search = at + 1,
                Tail::Accept(port_len) => {
                    out.extend_from_slice(&buf[cursor..start]);
                    out.extend_from_slice(if absolute { &self.absolute } else { &self.relative });
                    cursor = host_end + port_len;
                    search = cursor;
                }
            }
        }

        if eof {
            out.extend_from_slice(&buf[cursor..]);
        } else {
            let keep = self.needle.len() - 1 + SCHEME_LOOKBEHIND;
            let split = buf.len().saturating_sub(keep).max(cursor);
            out.extend_from_slice(&buf[cursor..split]);
            self.pending = buf[split..].to_vec();
        }
    }
}

impl Transform for LinkRewriter {
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        self.process(out, false);
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        self.process(out, true);
    }
}

enum TagSearch {
    Found(usize),
    Incomplete(usize),
    NotFound,
}

/// Find `tag` followed by a tag-name boundary
fn find_tag(haystack: &[u8], tag: &[u8], eof: bool) -> TagSearch {
    let mut search = 0;
    while let Some(offset) = find_ci(&haystack[search..], tag) {
        let at = search + offset;
        match haystack.get(at + tag.len()) {
            None if eof => return TagSearch::NotFound,
            None => return TagSearch::Incomplete(at),
            Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => {
                return TagSearch::Found(at)
            }
            Some(_) => search = at + 1,
        }
    }
    TagSearch::NotFound
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    SeekBodyOpen,
    SeekTagEnd,
    SeekBodyClose,
    Done,
}

/// Inserts the banner after `<body ...>` and the disclaimer before `</body>`.
/// Fragments whose anchor never shows up are appended at the end.
pub struct Injector {
    banner: Option<Vec<u8>>,
    disclaimer: Option<Vec<u8>>,
    stage: Stage,
    pending: Vec<u8>,
}

impl Injector {
    pub fn new(banner: Option<Vec<u8>>, disclaimer: Option<Vec<u8>>) -> Self {
        let mut injector = Self {
            banner,
            disclaimer,
            stage: Stage::Done,
            pending: Vec::new(),
        };
        injector.stage = injector.next_stage();
        injector
    }

    fn next_stage(&self) -> Stage {
        if self.banner.is_some() {
            Stage::SeekBodyOpen
        } else if self.disclaimer.is_some() {
            Stage::SeekBodyClose
        } else {
            Stage::Done
        }
    }

    fn append_remaining(&mut self, out: &mut Vec<u8>) {
        if let Some(banner) = self.banner.take() {
            out.extend_from_slice(&banner);
        }
        if let Some(disclaimer) = self.disclaimer.take() {
            out.extend_from_slice(&disclaimer);
        }
        self.stage = Stage::Done;
    }

    fn process(&mut self, out: &mut Vec<u8>, eof: bool) {
        let buf = std::mem::take(&mut self.pending);
        let mut cursor = 0;

        loop {
            let rest = &buf[cursor..];
            match self.stage {
                Stage::Done => {
                    out.extend_from_slice(rest);
                    return;
                }
                Stage::SeekTagEnd => match rest.iter().position(|b| *b == b'>') {
                    Some(i) => {
                        out.extend_from_slice(&rest[..=i]);
                        if let Some(banner) = self.banner.take() {
                            out.extend_from_slice(&banner);
                        }
                        cursor += i + 1;
                        self.stage = self.next_stage();
                    }
                    None => {
                        out.extend_from_slice(rest);
                        if eof {
                            self.append_remaining(out);
                        }
                        return;
                    }
                },
                Stage::SeekBodyOpen | Stage::SeekBodyClose => {
                    let tag: &[u8] = if self.stage == Stage::SeekBodyOpen {
                        b"<body"
                    } else {
                        b"</body"
                    };
                    match find_tag(rest, tag, eof) {
                        TagSearch::Found(i) if self.stage == Stage::SeekBodyOpen => {
                            out.extend_from_slice(&rest[..i + tag.len()]);
                            cursor += i + tag.len();
                            self.stage = Stage::SeekTagEnd;
                        }
                        TagSearch::Found(i) => {
                            out.extend_from_slice(&rest[..i]);
                            if let Some(disclaimer) = self.disclaimer.take() {
                                out.extend_from_slice(&disclaimer);
                            }
                            cursor += i;
                            self.stage = Stage::Done;
                        }
                        TagSearch::Incomplete(i) => {
                            out.extend_from_slice(&rest[..i]);
                            self.pending = rest[i..].to_vec();
                            return;
                        }
                        TagSearch::NotFound if eof => {
                            out.extend_from_slice(rest);
                            self.append_remaining(out);
                            return;
                        }
                        TagSearch::NotFound => {
                            let split = rest.len().saturating_sub(tag.len() - 1);
                            out.extend_from_slice(&rest[..split]);
                            self.pending = rest[split..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl Transform for Injector {
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        self.process(out, false);
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        self.process(out, true);
    }
}

/// Ordered chain of transforms; output of each stage feeds the next
pub struct Pipeline {
    stages: Vec<Box<dyn Transform>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Transform>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            let mut out = Vec::with_capacity(data.len());
            stage.feed(&data, &mut out);
            data = out;
        }
        data
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        for stage in &mut self.stages {
            let mut out = Vec::new();
            stage.feed(&data, &mut out);
            stage.finish(&mut out);
            data = out;
        }
        data
    }

    /// Rewrite a complete body
    pub fn apply(mut self, body: &[u8]) -> Vec<u8> {
        let mut out = self.push(body);
        out.extend_from_slice(&self.finish());
        out
    }
}

/// How a response body is treated, by media type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Links are rewritten and fragments injected
    Html,
    /// Links are rewritten
    Text,
    /// Passed through untouched
    Opaque,
}

impl ContentKind {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match media_type.as_str() {
            "text/html" | "application/xhtml+xml" => ContentKind::Html,
            "text/css" | "text/javascript" | "application/javascript" | "application/x-javascript"
            | "application/json" | "text/xml" | "application/xml" | "application/rss+xml"
            | "application/atom+xml" | "text/plain" => ContentKind::Text,
            _ => ContentKind::Opaque,
        }
    }
}

/// Banner and disclaimer markup injected into HTML pages
#[derive(Debug, Clone)]
pub struct Fragments {
    pub banner: Option<String>,
    pub disclaimer: Option<String>,
}

impl Fragments {
    /// Built-in fragments, honouring the disable flags
    pub fn builtin(config: &GatewayConfig) -> Self {
        let what = match config.mode {
            Mode::Translation { .. } => "a Tor hidden service through a Tor2web gateway",
            Mode::Proxy { .. } => "this site through a Tor2web gateway",
        };
        let gettor = if !config.gettor_enabled() {
            String::new()
        } else {
            format!(
                " <a href=\"{}/gettor\" style=\"color:#fff;text-decoration:underline\">Get Tor Browser</a>.",
                STATIC_PREFIX
            )
        };

        let banner = format!(
            "<div id=\"tor2web-banner\" style=\"background:#7d4698;color:#fff;padding:6px;\
             font:13px sans-serif;text-align:center\">You are viewing {}. \
             The gateway can see what you browse here; for anonymity use Tor Browser.{}</div>",
            what, gettor
        );
        let disclaimer = "<div id=\"tor2web-disclaimer\" style=\"font:11px sans-serif;color:#555;\
             padding:6px;text-align:center\">This content is not hosted by the gateway operator. \
             The gateway only relays it and does not endorse it.</div>"
            .to_string();

        Self {
            banner: (!config.features.disable_banner).then_some(banner),
            disclaimer: (!config.features.disable_disclaimer).then_some(disclaimer),
        }
    }

    /// Built-in fragments, replaced by the contents of `banner_file` and
    /// `disclaimer_file` when configured
    pub fn load(config: &GatewayConfig) -> std::io::Result<Self> {
        let mut fragments = Self::builtin(config);
        if fragments.banner.is_some() {
            if let Some(path) = &config.banner_file {
                fragments.banner = Some(read_fragment(path)?);
            }
        }
        if fragments.disclaimer.is_some() {
            if let Some(path) = &config.disclaimer_file {
                fragments.disclaimer = Some(read_fragment(path)?);
            }
        }
        Ok(fragments)
    }
}

fn read_fragment(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim_end().to_string())
}

/// Builds per-response pipelines from the gateway configuration
#[derive(Debug, Clone)]
pub struct Rewriter {
    /// Rewrite origin links in bodies (hotlink blocking)
    rewrite_links: bool,
    origin: Origin,
    public_base_url: String,
    fragments: Fragments,
}

impl Rewriter {
    pub fn new(config: &GatewayConfig, fragments: Fragments) -> Self {
        Self {
            rewrite_links: config.features.block_hotlinking,
            origin: config.mode.origin().clone(),
            public_base_url: config.public_base_url(),
            fragments,
        }
    }

    /// Pipeline for a response, `None` when the body passes through untouched
    pub fn pipeline_for(&self, headers: &HeaderMap) -> Result<Option<Pipeline>, RewriteError> {
        let kind = ContentKind::from_headers(headers);
        let mut stages: Vec<Box<dyn Transform>> = Vec::new();

        if kind != ContentKind::Opaque {
            if self.rewrite_links {
                stages.push(Box::new(LinkRewriter::new(&self.origin, &self.public_base_url)));
            }
        }
        if kind == ContentKind::Html
            && (self.fragments.banner.is_some() || self.fragments.disclaimer.is_some())
        {
            stages.push(Box::new(Injector::new(
                self.fragments.banner.clone().map(String::into_bytes),
                self.fragments.disclaimer.clone().map(String::into_bytes),
            )));
        }

        if stages.is_empty() {
            return Ok(None);
        }

        if let Some(encoding) = headers.get(CONTENT_ENCODING) {
            let encoding = encoding.to_str().unwrap_or("invalid").trim();
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(RewriteError::UnsupportedEncoding(encoding.to_string()));
            }
        }

        Ok(Some(Pipeline::new(stages)))
    }

    /// Rewrite a URL-valued header (`Location`, `Content-Location`).
    /// Redirects to the origin always point back at the gateway.
    pub fn rewrite_url(&self, value: &str) -> String {
        LinkRewriter::rewrite_str(&self.origin, &self.public_base_url, value)
    }
}
