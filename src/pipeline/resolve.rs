//! Image acquisition: turn a remote file reference into raw bytes.
//!
//! The transport layer hands us either an absolute URL or a path relative to
//! its file endpoint (Telegram's `photos/file_42.jpg` style). Relative paths
//! are joined to the configured base endpoint with the fetch token filled in.
//! Exactly one GET is issued per call; retrying is the caller's decision.
//!
//! The format is deliberately left undeclared here: extensions in the
//! reference are not trusted, the validator sniffs the bytes instead.

use crate::config::{CaptionConfig, ImageFormatTag};
use crate::error::{CaptionError, Failure};
use std::time::Duration;
use tracing::{debug, info};

/// Immutable image bytes plus an optional declared format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImageBytes {
    pub bytes: Vec<u8>,
    pub declared_format: Option<ImageFormatTag>,
}

impl RawImageBytes {
    /// Wrap bytes whose format is unknown.
    pub fn undeclared(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            declared_format: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Check if the reference looks like an absolute HTTP(S) URL.
pub fn is_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Fetches image bytes over HTTP with a bounded timeout.
#[derive(Debug, Clone)]
pub struct Resolver {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
    timeout_secs: u64,
}

impl Resolver {
    /// Build a resolver from the pipeline configuration.
    pub fn new(config: &CaptionConfig) -> Result<Self, CaptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| CaptionError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.fetch_base_url.clone(),
            token: config.fetch_token.clone(),
            timeout_secs: config.fetch_timeout_secs,
        })
    }

    /// Compute the URL to GET for `reference`.
    pub fn fetch_url(&self, reference: &str) -> Result<String, Failure> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Failure::acquisition("empty file reference"));
        }
        if is_url(reference) {
            return Ok(reference.to_string());
        }

        let base = self.base_url.as_deref().ok_or_else(|| {
            Failure::acquisition(format!(
                "'{reference}' is relative and no fetch base URL is configured"
            ))
        })?;

        let base = if base.contains("{token}") {
            let token = self
                .token
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Failure::acquisition("fetch token is not configured"))?;
            base.replace("{token}", token)
        } else {
            base.to_string()
        };

        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            reference.trim_start_matches('/')
        ))
    }

    /// Replace the fetch token in `url` so it can be logged.
    pub fn redact(&self, url: &str) -> String {
        match self.token.as_deref() {
            Some(t) if !t.is_empty() => url.replace(t, "***"),
            _ => url.to_string(),
        }
    }

    /// Download the bytes behind `reference`.
    pub async fn fetch(&self, reference: &str) -> Result<RawImageBytes, Failure> {
        let url = self.fetch_url(reference)?;
        let shown = self.redact(&url);
        info!("Downloading image from: {}", shown);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                Failure::acquisition(format!(
                    "download timed out after {}s for '{}'",
                    self.timeout_secs, shown
                ))
            } else {
                Failure::acquisition(format!(
                    "failed to download '{}': {}",
                    shown,
                    self.redact(&e.to_string())
                ))
            }
        })?;

        if !response.status().is_success() {
            return Err(Failure::acquisition(format!(
                "failed to download '{}': HTTP {}",
                shown,
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            Failure::acquisition(format!(
                "failed to read body of '{}': {}",
                shown,
                self.redact(&e.to_string())
            ))
        })?;

        debug!("Downloaded {} bytes from {}", bytes.len(), shown);
        Ok(RawImageBytes::undeclared(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn resolver(base: Option<&str>, token: Option<&str>) -> Resolver {
        let mut builder = CaptionConfig::builder();
        if let Some(t) = token {
            builder = builder.fetch_token(t);
        }
        let mut config = builder.build().unwrap();
        config.fetch_base_url = base.map(str::to_string);
        Resolver::new(&config).unwrap()
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/a.jpg"));
        assert!(is_url("http://example.com/a.jpg"));
        assert!(!is_url("photos/file_1.jpg"));
        assert!(!is_url("/tmp/a.jpg"));
        assert!(!is_url(""));
    }

    #[test]
    fn absolute_urls_are_used_verbatim() {
        let r = resolver(None, None);
        assert_eq!(
            r.fetch_url("https://cdn.example.com/x/y.png").unwrap(),
            "https://cdn.example.com/x/y.png"
        );
    }

    #[test]
    fn relative_paths_join_base_with_token() {
        let r = resolver(Some("https://api.telegram.org/file/bot{token}"), Some("123:ABC"));
        assert_eq!(
            r.fetch_url("photos/file_7.jpg").unwrap(),
            "https://api.telegram.org/file/bot123:ABC/photos/file_7.jpg"
        );
    }

    #[test]
    fn base_without_placeholder_needs_no_token() {
        let r = resolver(Some("http://files.local/"), None);
        assert_eq!(r.fetch_url("/a/b.bmp").unwrap(), "http://files.local/a/b.bmp");
    }

    #[test]
    fn missing_token_is_an_acquisition_error() {
        let r = resolver(Some("https://api.telegram.org/file/bot{token}"), None);
        let err = r.fetch_url("photos/file_7.jpg").unwrap_err();
        assert_eq!(err.kind, FailureKind::AcquisitionError);
    }

    #[test]
    fn empty_reference_rejected() {
        let r = resolver(None, None);
        let err = r.fetch_url("   ").unwrap_err();
        assert_eq!(err.kind, FailureKind::AcquisitionError);
    }

    #[test]
    fn relative_without_base_rejected() {
        let r = resolver(None, None);
        assert_eq!(
            r.fetch_url("photos/a.jpg").unwrap_err().kind,
            FailureKind::AcquisitionError
        );
    }

    #[test]
    fn redact_hides_token() {
        let r = resolver(Some("https://h/bot{token}"), Some("s3cr3t"));
        let url = r.fetch_url("p.jpg").unwrap();
        assert_eq!(r.redact(&url), "https://h/bot***/p.jpg");
    }

    #[tokio::test]
    async fn stalled_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever answering.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = CaptionConfig::builder().fetch_timeout_secs(1).build().unwrap();
        let r = Resolver::new(&config).unwrap();
        let started = std::time::Instant::now();
        let err = r
            .fetch(&format!("http://{addr}/slow.jpg"))
            .await
            .unwrap_err();
        server.abort();

        assert_eq!(err.kind, FailureKind::AcquisitionError);
        assert!(err.detail.contains("timed out"), "detail: {}", err.detail);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn unreachable_host_is_an_acquisition_error() {
        let r = resolver(None, None);
        let err = tokio_test::block_on(r.fetch("http://127.0.0.1:1/nothing.jpg")).unwrap_err();
        assert_eq!(err.kind, FailureKind::AcquisitionError);
    }
}
