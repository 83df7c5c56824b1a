//! Gateway configuration
//!
//! The configuration file is a flat list of `key = value` lines under a
//! `[main]` section. Lines are collected into a TOML table of strings and
//! deserialized into [`RawConfig`], which is then validated into the
//! immutable [`GatewayConfig`] shared by every component.

use hyper::Uri;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Section that holds gateway settings
const MAIN_SECTION: &str = "main";

/// Errors produced while loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected 'key = value'")]
    Syntax { line: usize },

    #[error("invalid configuration value: {0}")]
    Invalid(#[from] toml::de::Error),

    #[error("missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("unknown mode '{0}' (expected TRANSLATION or PROXY)")]
    InvalidMode(String),

    #[error("'{present}' must not be set in {mode} mode")]
    ConflictingDestination {
        mode: &'static str,
        present: &'static str,
    },

    #[error("invalid onion address '{0}'")]
    InvalidOnion(String),

    #[error("invalid dummyproxy URL '{0}' (expected http://host[:port])")]
    InvalidBackendUrl(String),

    #[error("invalid IP address for '{key}': '{value}'")]
    InvalidAddress { key: &'static str, value: String },

    #[error("'{0}' must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// A destination host and port, either a hidden service or a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Value used for the upstream `Host` header
    pub fn authority(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Routing strategy, carrying the one destination valid for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Destination is a hidden service reached through the Tor SOCKS port
    Translation { onion: Origin },
    /// Destination is an ordinary backend reached directly
    Proxy { backend: Origin },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Translation { .. } => "TRANSLATION",
            Mode::Proxy { .. } => "PROXY",
        }
    }

    pub fn origin(&self) -> &Origin {
        match self {
            Mode::Translation { onion } => onion,
            Mode::Proxy { backend } => backend,
        }
    }
}

/// Public listener settings
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub address: IpAddr,
    pub https_port: u16,
    /// Plain HTTP port answering with redirects to HTTPS (0 disables)
    pub http_port: u16,
}

/// PEM files making up the TLS identity
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub chain: PathBuf,
}

/// Feature toggles
#[derive(Debug, Clone)]
pub struct Features {
    pub disable_tor_redirection: bool,
    pub block_hotlinking: bool,
    pub disable_gettor: bool,
    pub disable_disclaimer: bool,
    pub disable_banner: bool,
    pub block_crawl: bool,
    pub override_robots_txt: bool,
}

/// Upstream timeouts
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Bounds TCP connect, SOCKS negotiation and the HTTP handshake
    pub connect: Duration,
    /// Bounds the response head and every idle gap while reading the body
    pub read: Duration,
    /// Bounds the client TLS handshake
    pub handshake: Duration,
}

/// Upstream session pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle sessions kept (0 disables pooling)
    pub max_idle: usize,
    /// Idle sessions older than this are discarded
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_pool_max_idle(),
            idle_timeout: Duration::from_secs(default_pool_idle_timeout()),
        }
    }
}

/// Validated, immutable gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub basehost: String,
    pub listen: ListenConfig,
    pub mode: Mode,
    pub tls: TlsPaths,
    pub features: Features,
    /// Tor SOCKS5 endpoint used in TRANSLATION mode
    pub socks_addr: SocketAddr,
    pub timeouts: Timeouts,
    pub pool: PoolConfig,
    /// Largest body rewritten in memory with an exact Content-Length
    pub rewrite_buffer_limit: usize,
    pub datadir: PathBuf,
    pub banner_file: Option<PathBuf>,
    pub disclaimer_file: Option<PathBuf>,
    pub tor_exits_file: Option<PathBuf>,
}

/// Settings as they appear in the file, before cross-field validation
#[derive(Debug, Deserialize)]
struct RawConfig {
    basehost: Option<String>,
    listen_ipv4: Option<String>,
    mode: Option<String>,
    onion: Option<String>,
    dummyproxy: Option<String>,
    ssl_key: Option<PathBuf>,
    ssl_cert: Option<PathBuf>,
    ssl_intermediate: Option<PathBuf>,

    #[serde(default, deserialize_with = "flag")]
    disable_tor_redirection: bool,
    #[serde(default = "default_true", deserialize_with = "flag")]
    blockhotlinking: bool,
    #[serde(default, deserialize_with = "flag")]
    disable_gettor: bool,
    #[serde(default, deserialize_with = "flag")]
    disable_disclaimer: bool,
    #[serde(default, deserialize_with = "flag")]
    disable_banner: bool,
    #[serde(default = "default_true", deserialize_with = "flag")]
    blockcrawl: bool,
    #[serde(default = "default_true", deserialize_with = "flag")]
    overriderobotstxt: bool,

    #[serde(default = "default_https_port", deserialize_with = "number")]
    listen_port_https: u16,
    #[serde(default, deserialize_with = "number")]
    listen_port_http: u16,

    #[serde(default = "default_socks_host")]
    sockshost: String,
    #[serde(default = "default_socks_port", deserialize_with = "number")]
    socksport: u16,

    #[serde(default = "default_connect_timeout", deserialize_with = "number")]
    connect_timeout: u64,
    #[serde(default = "default_read_timeout", deserialize_with = "number")]
    read_timeout: u64,
    #[serde(default = "default_handshake_timeout", deserialize_with = "number")]
    handshake_timeout: u64,

    #[serde(default = "default_pool_max_idle", deserialize_with = "number")]
    pool_max_idle: usize,
    #[serde(default = "default_pool_idle_timeout", deserialize_with = "number")]
    pool_idle_timeout: u64,

    #[serde(default = "default_rewrite_buffer_limit", deserialize_with = "number")]
    rewrite_buffer_limit: usize,

    #[serde(default = "default_datadir")]
    datadir: PathBuf,
    banner_file: Option<PathBuf>,
    disclaimer_file: Option<PathBuf>,
    tor_exits_file: Option<PathBuf>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_https_port() -> u16 {
    443
}

fn default_socks_host() -> String {
    "127.0.0.1".to_string()
}

fn default_socks_port() -> u16 {
    9050
}

fn default_connect_timeout() -> u64 {
    30 // circuits to hidden services are slow to build
}

fn default_read_timeout() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_pool_max_idle() -> usize {
    0
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_rewrite_buffer_limit() -> usize {
    1024 * 1024
}

fn default_datadir() -> PathBuf {
    PathBuf::from("/var/lib/tor2web")
}

/// Parse a boolean the way INI-style configuration files spell them
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_flag(&raw).ok_or_else(|| D::Error::custom(format!("expected a boolean, found '{}'", raw)))
}

fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.trim()
        .parse()
        .map_err(|e| D::Error::custom(format!("'{}': {}", raw, e)))
}

/// Collect the `[main]` section into a table of string values.
/// Empty values are treated as unset.
fn parse_lines(input: &str) -> Result<toml::Table, ConfigError> {
    let mut table = toml::Table::new();
    let mut in_main = true;

    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_main = section.trim().eq_ignore_ascii_case(MAIN_SECTION);
            if !in_main {
                warn!(section = section.trim(), "Ignoring unknown configuration section");
            }
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::Syntax { line: index + 1 })?;
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key.is_empty() {
            return Err(ConfigError::Syntax { line: index + 1 });
        }
        if !in_main || value.is_empty() {
            continue;
        }

        table.insert(key, toml::Value::String(value.to_string()));
    }

    Ok(table)
}

fn parse_onion(raw: &str) -> Result<Origin, ConfigError> {
    let invalid = || ConfigError::InvalidOnion(raw.to_string());

    let trimmed = raw.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (trimmed, 80),
    };
    let host = host.to_ascii_lowercase();

    let name = host.strip_suffix(".onion").ok_or_else(invalid)?;
    let labels_ok = !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !labels_ok || port == 0 {
        return Err(invalid());
    }

    Ok(Origin { host, port })
}

fn parse_backend(raw: &str) -> Result<Origin, ConfigError> {
    let invalid = || ConfigError::InvalidBackendUrl(raw.to_string());

    let uri: Uri = raw.trim().parse().map_err(|_| invalid())?;
    if uri.scheme_str() != Some("http") {
        return Err(invalid());
    }
    let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let path = uri.path();
    if !(path.is_empty() || path == "/") || uri.query().is_some() {
        return Err(invalid());
    }

    Ok(Origin {
        host: host.to_ascii_lowercase(),
        port: uri.port_u16().unwrap_or(80),
    })
}

fn nonzero_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroTimeout(key));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_ip(key: &'static str, raw: &str) -> Result<IpAddr, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidAddress {
        key,
        value: raw.to_string(),
    })
}

impl TryFrom<RawConfig> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let basehost = raw
            .basehost
            .ok_or(ConfigError::MissingKey("basehost"))?
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        let listen_ipv4 = raw.listen_ipv4.ok_or(ConfigError::MissingKey("listen_ipv4"))?;
        let mode_name = raw.mode.ok_or(ConfigError::MissingKey("mode"))?;

        let mode = match mode_name.trim().to_ascii_uppercase().as_str() {
            "TRANSLATION" => {
                if raw.dummyproxy.is_some() {
                    return Err(ConfigError::ConflictingDestination {
                        mode: "TRANSLATION",
                        present: "dummyproxy",
                    });
                }
                let onion = raw.onion.ok_or(ConfigError::MissingKey("onion"))?;
                Mode::Translation {
                    onion: parse_onion(&onion)?,
                }
            }
            "PROXY" => {
                if raw.onion.is_some() {
                    return Err(ConfigError::ConflictingDestination {
                        mode: "PROXY",
                        present: "onion",
                    });
                }
                let backend = raw.dummyproxy.ok_or(ConfigError::MissingKey("dummyproxy"))?;
                Mode::Proxy {
                    backend: parse_backend(&backend)?,
                }
            }
            _ => return Err(ConfigError::InvalidMode(mode_name)),
        };

        let tls = TlsPaths {
            key: raw.ssl_key.ok_or(ConfigError::MissingKey("ssl_key"))?,
            cert: raw.ssl_cert.ok_or(ConfigError::MissingKey("ssl_cert"))?,
            chain: raw
                .ssl_intermediate
                .ok_or(ConfigError::MissingKey("ssl_intermediate"))?,
        };

        let socks_ip = parse_ip("sockshost", &raw.sockshost)?;

        Ok(GatewayConfig {
            basehost,
            listen: ListenConfig {
                address: parse_ip("listen_ipv4", &listen_ipv4)?,
                https_port: raw.listen_port_https,
                http_port: raw.listen_port_http,
            },
            mode,
            tls,
            features: Features {
                disable_tor_redirection: raw.disable_tor_redirection,
                block_hotlinking: raw.blockhotlinking,
                disable_gettor: raw.disable_gettor,
                disable_disclaimer: raw.disable_disclaimer,
                disable_banner: raw.disable_banner,
                block_crawl: raw.blockcrawl,
                override_robots_txt: raw.overriderobotstxt,
            },
            socks_addr: SocketAddr::new(socks_ip, raw.socksport),
            timeouts: Timeouts {
                connect: nonzero_secs("connect_timeout", raw.connect_timeout)?,
                read: nonzero_secs("read_timeout", raw.read_timeout)?,
                handshake: nonzero_secs("handshake_timeout", raw.handshake_timeout)?,
            },
            pool: PoolConfig {
                max_idle: raw.pool_max_idle,
                idle_timeout: Duration::from_secs(raw.pool_idle_timeout),
            },
            rewrite_buffer_limit: raw.rewrite_buffer_limit,
            datadir: raw.datadir,
            banner_file: raw.banner_file,
            disclaimer_file: raw.disclaimer_file,
            tor_exits_file: raw.tor_exits_file,
        })
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let table = parse_lines(input)?;
        let raw: RawConfig = toml::Value::Table(table).try_into()?;
        GatewayConfig::try_from(raw)
    }

    /// Hidden service destination (TRANSLATION mode only)
    pub fn onion_address(&self) -> Option<&Origin> {
        match &self.mode {
            Mode::Translation { onion } => Some(onion),
            Mode::Proxy { .. } => None,
        }
    }

    /// Backend destination (PROXY mode only)
    pub fn backend(&self) -> Option<&Origin> {
        match &self.mode {
            Mode::Proxy { backend } => Some(backend),
            Mode::Translation { .. } => None,
        }
    }

    /// GetTor is offered only to visitors of a hidden service, and only while
    /// Tor redirection is active
    pub fn gettor_enabled(&self) -> bool {
        matches!(self.mode, Mode::Translation { .. })
            && !self.features.disable_tor_redirection
            && !self.features.disable_gettor
    }

    /// Absolute base URL under which clients reach the gateway
    pub fn public_base_url(&self) -> String {
        if self.listen.https_port == 443 {
            format!("https://{}", self.basehost)
        } else {
            format!("https://{}:{}", self.basehost, self.listen.https_port)
        }
    }

    pub fn https_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen.address, self.listen.https_port)
    }

    /// Bind address of the HTTP redirect listener, if enabled
    pub fn http_bind_addr(&self) -> Option<SocketAddr> {
        (self.listen.http_port > 0).then(|| SocketAddr::new(self.listen.address, self.listen.http_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSLATION: &str = r#"
## Tor2web gateway
[main]
basehost = example.org
listen_ipv4 = 0.0.0.0
mode = TRANSLATION
onion = abc123.onion
dummyproxy =

# TLS material
ssl_key = /etc/tor2web/key.pem
ssl_cert = /etc/tor2web/cert.pem
ssl_intermediate = /etc/tor2web/chain.pem

disable_tor_redirection = False
blockhotlinking = True
disable_gettor = False
disable_disclaimer = False
disable_banner = False
"#;

    fn proxy_config(extra: &str) -> String {
        format!(
            "[main]\nbasehost = example.org\nlisten_ipv4 = 127.0.0.1\nmode = PROXY\n\
             dummyproxy = http://127.0.0.1:8080\nssl_key = k.pem\nssl_cert = c.pem\n\
             ssl_intermediate = i.pem\n{}",
            extra
        )
    }

    #[test]
    fn test_parse_translation_template() {
        let config = GatewayConfig::parse(TRANSLATION).unwrap();
        assert_eq!(config.basehost, "example.org");
        assert_eq!(config.listen.address, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.mode.name(), "TRANSLATION");
        assert_eq!(
            config.onion_address(),
            Some(&Origin {
                host: "abc123.onion".to_string(),
                port: 80
            })
        );
        assert!(config.backend().is_none());
        assert_eq!(config.tls.key, PathBuf::from("/etc/tor2web/key.pem"));
        assert!(config.features.block_hotlinking);
        assert!(!config.features.disable_banner);
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::parse(&proxy_config("")).unwrap();
        assert_eq!(config.listen.https_port, 443);
        assert_eq!(config.listen.http_port, 0);
        assert!(config.http_bind_addr().is_none());
        assert_eq!(config.socks_addr, "127.0.0.1:9050".parse().unwrap());
        assert_eq!(config.timeouts.connect, Duration::from_secs(30));
        assert_eq!(config.timeouts.read, Duration::from_secs(60));
        assert_eq!(config.timeouts.handshake, Duration::from_secs(10));
        assert_eq!(config.pool.max_idle, 0);
        assert_eq!(config.rewrite_buffer_limit, 1024 * 1024);
        assert!(config.features.block_hotlinking);
        assert!(config.features.block_crawl);
        assert!(config.features.override_robots_txt);
        assert!(!config.features.disable_tor_redirection);
        assert_eq!(config.public_base_url(), "https://example.org");
    }

    #[test]
    fn test_proxy_mode_backend() {
        let config = GatewayConfig::parse(&proxy_config("")).unwrap();
        let backend = config.backend().unwrap();
        assert_eq!(backend.host, "127.0.0.1");
        assert_eq!(backend.port, 8080);
        assert_eq!(backend.authority(), "127.0.0.1:8080");
        assert!(config.onion_address().is_none());
    }

    #[test]
    fn test_translation_requires_onion() {
        let input = TRANSLATION.replace("onion = abc123.onion", "");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::MissingKey("onion"))
        ));
    }

    #[test]
    fn test_translation_rejects_dummyproxy() {
        let input = TRANSLATION.replace("dummyproxy =", "dummyproxy = http://127.0.0.1:8080");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::ConflictingDestination {
                present: "dummyproxy",
                ..
            })
        ));
    }

    #[test]
    fn test_proxy_requires_dummyproxy() {
        let input = proxy_config("").replace("dummyproxy = http://127.0.0.1:8080", "");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::MissingKey("dummyproxy"))
        ));
    }

    #[test]
    fn test_proxy_rejects_onion() {
        let input = proxy_config("onion = abc123.onion\n");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::ConflictingDestination { present: "onion", .. })
        ));
    }

    #[test]
    fn test_non_boolean_flag_rejected() {
        let input = proxy_config("disable_banner = maybe\n");
        let err = GatewayConfig::parse(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("maybe"));
    }

    #[test]
    fn test_flag_spellings() {
        assert_eq!(parse_flag("True"), Some(true));
        assert_eq!(parse_flag("yes"), Some(true));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("OFF"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("nope"), None);
    }

    #[test]
    fn test_missing_required_keys() {
        let input = proxy_config("").replace("basehost = example.org", "");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::MissingKey("basehost"))
        ));

        let input = proxy_config("").replace("ssl_intermediate = i.pem", "");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::MissingKey("ssl_intermediate"))
        ));
    }

    #[test]
    fn test_invalid_mode() {
        let input = proxy_config("").replace("mode = PROXY", "mode = MIRROR");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_mode_is_case_insensitive() {
        let input = proxy_config("").replace("mode = PROXY", "mode = proxy");
        assert_eq!(GatewayConfig::parse(&input).unwrap().mode.name(), "PROXY");
    }

    #[test]
    fn test_invalid_onion() {
        let input = TRANSLATION.replace("abc123.onion", "example.com");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::InvalidOnion(_))
        ));
    }

    #[test]
    fn test_onion_with_port() {
        let origin = parse_onion("ABC123.onion:8080").unwrap();
        assert_eq!(origin.host, "abc123.onion");
        assert_eq!(origin.port, 8080);
        assert_eq!(origin.authority(), "abc123.onion:8080");
    }

    #[test]
    fn test_invalid_backend_url() {
        for bad in ["https://127.0.0.1:8443", "127.0.0.1:8080", "http://127.0.0.1/app"] {
            assert!(
                matches!(parse_backend(bad), Err(ConfigError::InvalidBackendUrl(_))),
                "{} should be rejected",
                bad
            );
        }
        assert_eq!(parse_backend("http://localhost").unwrap().port, 80);
    }

    #[test]
    fn test_invalid_listen_address() {
        let input = proxy_config("").replace("listen_ipv4 = 127.0.0.1", "listen_ipv4 = example");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::InvalidAddress { key: "listen_ipv4", .. })
        ));
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let input = "[main]\nbasehost example.org\n";
        assert!(matches!(
            GatewayConfig::parse(input),
            Err(ConfigError::Syntax { line: 2 })
        ));
    }

    #[test]
    fn test_unknown_section_ignored() {
        let input = format!("{}\n[other]\ndisable_banner = garbage\n", proxy_config(""));
        let config = GatewayConfig::parse(&input).unwrap();
        assert!(!config.features.disable_banner);
    }

    #[test]
    fn test_supplementary_settings() {
        let input = proxy_config(
            "listen_port_https = 8443\nlisten_port_http = 8080\nsockshost = 10.0.0.1\n\
             socksport = 9150\nconnect_timeout = 5\npool_max_idle = 4\nblockcrawl = no\n",
        );
        let config = GatewayConfig::parse(&input).unwrap();
        assert_eq!(config.https_bind_addr(), "127.0.0.1:8443".parse().unwrap());
        assert_eq!(config.http_bind_addr(), Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.socks_addr, "10.0.0.1:9150".parse().unwrap());
        assert_eq!(config.timeouts.connect, Duration::from_secs(5));
        assert_eq!(config.pool.max_idle, 4);
        assert!(!config.features.block_crawl);
        assert_eq!(config.public_base_url(), "https://example.org:8443");
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for key in ["connect_timeout", "read_timeout", "handshake_timeout"] {
            let input = proxy_config(&format!("{} = 0\n", key));
            match GatewayConfig::parse(&input) {
                Err(ConfigError::ZeroTimeout(name)) => assert_eq!(name, key),
                other => panic!("expected ZeroTimeout for {}, got {:?}", key, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_invalid_number() {
        let input = proxy_config("socksport = ninety\n");
        assert!(matches!(
            GatewayConfig::parse(&input),
            Err(ConfigError::Invalid(_))
        ));
    }
}
