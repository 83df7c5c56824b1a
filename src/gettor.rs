//! GetTor: Tor Browser downloads served by the gateway
//!
//! Desktop visitors get the installer (or its signature) for their OS and
//! language straight from the data directory; mobile and unknown clients
//! are redirected to the right download page.

use crate::body::{BoxError, GatewayBody};
use crate::error::{error_response, redirect_response, wants_json, GatewayErrorCode};
use futures::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderMap, ACCEPT_LANGUAGE, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

pub const IPHONE_URL: &str = "https://itunes.apple.com/us/app/onion-browser/id519296448";
pub const ANDROID_URL: &str = "https://play.google.com/store/apps/details?id=org.torproject.android";
pub const DOWNLOAD_URL: &str = "https://www.torproject.org/download/";

const DEFAULT_LOCALE: &str = "en-US";
const CHUNK_SIZE: usize = 64 * 1024;

/// What the visitor asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTorKind {
    Bundle,
    Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOs {
    Windows,
    MacOs,
    IPhone,
    Android,
}

impl ClientOs {
    /// Guess the visitor's OS from its user agent. Mobile platforms are
    /// checked first since their agents mention desktop systems too.
    pub fn detect(user_agent: &str) -> Option<Self> {
        if user_agent.contains("iPhone") {
            Some(ClientOs::IPhone)
        } else if user_agent.contains("Android") {
            Some(ClientOs::Android)
        } else if user_agent.contains("Windows") {
            Some(ClientOs::Windows)
        } else if user_agent.contains("Mac OS X") {
            Some(ClientOs::MacOs)
        } else {
            None
        }
    }
}

fn language_only(locale: &str) -> &str {
    locale.split('-').next().unwrap_or(locale)
}

/// Best supported locale for an `Accept-Language` value.
///
/// For each requested language, in order: an exact match, then the bare
/// language, then any locale of the same language. Falls back to `en-US`.
pub fn best_language(accept_language: &str, supported: &[String]) -> String {
    let requested = accept_language
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .filter(|lc| !lc.is_empty());

    for lc in requested {
        if let Some(found) = supported.iter().find(|l| l.eq_ignore_ascii_case(lc)) {
            return found.clone();
        }
        let lang = language_only(lc);
        if let Some(found) = supported.iter().find(|l| l.eq_ignore_ascii_case(lang)) {
            return found.clone();
        }
        if let Some(found) = supported
            .iter()
            .find(|l| language_only(l).eq_ignore_ascii_case(lang))
        {
            return found.clone();
        }
    }
    DEFAULT_LOCALE.to_string()
}

/// File name and content type of a desktop bundle
pub fn bundle_file(os: ClientOs, version: &str, lang: &str, kind: GetTorKind) -> Option<(String, &'static str)> {
    let (name, ext, ctype) = match (os, kind) {
        (ClientOs::Windows, GetTorKind::Bundle) => ("torbrowser-install", "exe", "application/x-msdownload"),
        (ClientOs::Windows, GetTorKind::Signature) => ("torbrowser-install", "exe.asc", "application/pgp-signature"),
        (ClientOs::MacOs, GetTorKind::Bundle) => ("TorBrowser", "dmg", "application/x-apple-diskimage"),
        (ClientOs::MacOs, GetTorKind::Signature) => ("TorBrowser", "dmg.asc", "application/pgp-signature"),
        _ => return None,
    };
    let file = match os {
        ClientOs::Windows => format!("{}-{}_{}.{}", name, version, lang, ext),
        _ => format!("{}-{}-osx32_{}.{}", name, version, lang, ext),
    };
    Some((file, ctype))
}

/// Read a list file: one entry per line, `#` comments and blanks skipped
pub fn read_list(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

pub struct GetTor {
    version_file: PathBuf,
    bundle_dir: PathBuf,
    locales: Vec<String>,
}

impl GetTor {
    pub fn new(datadir: &Path) -> Self {
        let locales_file = datadir.join("lists/gettor_locales.txt");
        let locales = match read_list(&locales_file) {
            Ok(locales) if !locales.is_empty() => locales,
            Ok(_) => vec![DEFAULT_LOCALE.to_string()],
            Err(e) => {
                warn!(path = %locales_file.display(), error = %e, "GetTor locale list unavailable, using en-US");
                vec![DEFAULT_LOCALE.to_string()]
            }
        };
        Self {
            version_file: datadir.join("lists/latest_torbrowser.txt"),
            bundle_dir: datadir.join("torbrowser/latest"),
            locales,
        }
    }

    pub async fn serve(&self, headers: &HeaderMap, kind: GetTorKind) -> Response<GatewayBody> {
        let json = wants_json(headers);
        let agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("");
        let os = match ClientOs::detect(agent) {
            Some(ClientOs::IPhone) => return redirect_response(StatusCode::FOUND, IPHONE_URL),
            Some(ClientOs::Android) => return redirect_response(StatusCode::FOUND, ANDROID_URL),
            Some(os) => os,
            None => return redirect_response(StatusCode::FOUND, DOWNLOAD_URL),
        };

        let accept_language = headers.get(ACCEPT_LANGUAGE).and_then(|v| v.to_str().ok()).unwrap_or("");
        let lang = best_language(accept_language, &self.locales);

        let version = match tokio::fs::read_to_string(&self.version_file).await {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) | Err(_) => {
                debug!("No Tor Browser version available");
                return error_response(GatewayErrorCode::NotFound, json);
            }
        };

        let Some((name, content_type)) = bundle_file(os, &version, &lang, kind) else {
            return error_response(GatewayErrorCode::NotFound, json);
        };

        let path = self.bundle_dir.join(&name);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                debug!(file = %name, error = %e, "GetTor bundle missing");
                return error_response(GatewayErrorCode::NotFound, json);
            }
        };
        let len = file.metadata().await.map(|m| m.len()).ok();

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_DISPOSITION, format!("attachment; filename={}", name));
        if let Some(len) = len {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        builder
            .body(file_body(file))
            .expect("valid response builder")
    }
}

fn file_body(file: File) -> GatewayBody {
    let chunks = stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Frame::data(Bytes::from(buf))), Some(file)))
            }
            Err(e) => Some((Err(BoxError::from(e)), None)),
        }
    });
    StreamBody::new(chunks).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, LOCATION};
    use tempfile::TempDir;

    const WINDOWS_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Firefox/115.0";
    const MAC_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Safari/605.1.15";
    const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Safari/604.1";
    const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 14) Chrome/120.0 Mobile";

    fn locales(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn datadir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lists")).unwrap();
        std::fs::create_dir_all(dir.path().join("torbrowser/latest")).unwrap();
        std::fs::write(dir.path().join("lists/latest_torbrowser.txt"), "13.0.1\n").unwrap();
        std::fs::write(dir.path().join("lists/gettor_locales.txt"), "en-US\nes-ES\nfr\n").unwrap();
        std::fs::write(
            dir.path().join("torbrowser/latest/torbrowser-install-13.0.1_es-ES.exe"),
            b"MZ-installer",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("torbrowser/latest/torbrowser-install-13.0.1_es-ES.exe.asc"),
            b"-----BEGIN PGP SIGNATURE-----",
        )
        .unwrap();
        dir
    }

    fn headers(agent: &str, lang: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(agent).unwrap());
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(lang).unwrap());
        headers
    }

    #[test]
    fn test_detect_os() {
        assert_eq!(ClientOs::detect(WINDOWS_UA), Some(ClientOs::Windows));
        assert_eq!(ClientOs::detect(MAC_UA), Some(ClientOs::MacOs));
        assert_eq!(ClientOs::detect(IPHONE_UA), Some(ClientOs::IPhone));
        assert_eq!(ClientOs::detect(ANDROID_UA), Some(ClientOs::Android));
        assert_eq!(ClientOs::detect("curl/8.0"), None);
    }

    #[test]
    fn test_best_language() {
        let supported = locales(&["en-US", "es-ES", "fr", "pt-BR"]);
        assert_eq!(best_language("es-ES,es;q=0.9", &supported), "es-ES");
        assert_eq!(best_language("fr-CA", &supported), "fr");
        assert_eq!(best_language("pt-PT", &supported), "pt-BR");
        assert_eq!(best_language("de-DE, es", &supported), "es-ES");
        assert_eq!(best_language("ja", &supported), "en-US");
        assert_eq!(best_language("", &supported), "en-US");
    }

    #[test]
    fn test_bundle_file_names() {
        assert_eq!(
            bundle_file(ClientOs::Windows, "13.0.1", "en-US", GetTorKind::Bundle).unwrap(),
            ("torbrowser-install-13.0.1_en-US.exe".to_string(), "application/x-msdownload")
        );
        assert_eq!(
            bundle_file(ClientOs::MacOs, "13.0.1", "fr", GetTorKind::Signature).unwrap(),
            ("TorBrowser-13.0.1-osx32_fr.dmg.asc".to_string(), "application/pgp-signature")
        );
        assert!(bundle_file(ClientOs::Android, "13.0.1", "en-US", GetTorKind::Bundle).is_none());
    }

    #[test]
    fn test_missing_locale_list_defaults() {
        let dir = TempDir::new().unwrap();
        let gettor = GetTor::new(dir.path());
        assert_eq!(gettor.locales, vec!["en-US".to_string()]);
    }

    #[tokio::test]
    async fn test_serves_windows_bundle() {
        let dir = datadir();
        let gettor = GetTor::new(dir.path());
        let response = gettor.serve(&headers(WINDOWS_UA, "es-MX,es"), GetTorKind::Bundle).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=torbrowser-install-13.0.1_es-ES.exe"
        );
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "12");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"MZ-installer");
    }

    #[tokio::test]
    async fn test_serves_signature() {
        let dir = datadir();
        let gettor = GetTor::new(dir.path());
        let response = gettor.serve(&headers(WINDOWS_UA, "es"), GetTorKind::Signature).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/pgp-signature"
        );
    }

    #[tokio::test]
    async fn test_missing_bundle_not_found() {
        let dir = datadir();
        let gettor = GetTor::new(dir.path());
        let response = gettor.serve(&headers(MAC_UA, "en-US"), GetTorKind::Bundle).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mobile_and_unknown_redirects() {
        let dir = datadir();
        let gettor = GetTor::new(dir.path());

        let response = gettor.serve(&headers(IPHONE_UA, "en"), GetTorKind::Bundle).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), IPHONE_URL);

        let response = gettor.serve(&headers(ANDROID_UA, "en"), GetTorKind::Bundle).await;
        assert_eq!(response.headers().get(LOCATION).unwrap(), ANDROID_URL);

        let response = gettor.serve(&headers("curl/8.0", "en"), GetTorKind::Bundle).await;
        assert_eq!(response.headers().get(LOCATION).unwrap(), DOWNLOAD_URL);
    }
}
