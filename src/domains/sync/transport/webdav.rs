use crate::domains::sync::transport::{cancellable, with_retries, RetryPolicy, SyncTransport};
use crate::domains::sync::types::{AppData, CancellationToken, SyncBackendKind};
use crate::domains::sync::utils::{
    encode_document, parse_document, DOCUMENT_NAME, LEGACY_DOCUMENT_NAME,
};
use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum spacing between requests, to stay friendly with shared-hosting
/// DAV servers.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(400);

/// How long attachment traffic stays paused after a rate-limit response.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Upload cap for attachment blobs over WebDAV.
const MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;

/// WebDAV backend: the document and blobs live inside one collection,
/// authenticated with HTTP Basic.
pub struct WebDavTransport {
    client: Client,
    /// Collection URL, always with a trailing slash.
    base_url: String,
    auth_header: Option<String>,
    last_request: Mutex<Option<Instant>>,
    rate_limited_until: Mutex<Option<Instant>>,
    attachments_dir_ready: AtomicBool,
}

impl WebDavTransport {
    pub fn new(url: &str, username: Option<&str>, password: Option<&str>) -> SyncResult<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SyncError::Configuration(format!(
                "WEBDAV_URL must be an http(s) URL, got '{}'",
                url
            )));
        }

        let base_url = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        };

        let auth_header = username.map(|user| {
            let credentials = format!("{}:{}", user, password.unwrap_or_default());
            format!("Basic {}", BASE64.encode(credentials))
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            auth_header,
            last_request: Mutex::new(None),
            rate_limited_until: Mutex::new(None),
            attachments_dir_ready: AtomicBool::new(false),
        })
    }

    fn url_for(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}{}", self.base_url, encoded.join("/"))
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_header {
            Some(header) => request.header(reqwest::header::AUTHORIZATION, header.clone()),
            None => request,
        }
    }

    /// Enforce the minimum spacing between requests.
    async fn throttle(&self) {
        let wait = {
            let last = self.last_request.lock().unwrap_or_else(|p| p.into_inner());
            last.and_then(|at| MIN_REQUEST_INTERVAL.checked_sub(at.elapsed()))
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        let mut last = self.last_request.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(Instant::now());
    }

    fn note_rate_limit(&self) {
        let mut until = self
            .rate_limited_until
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *until = Some(Instant::now() + RATE_LIMIT_COOLDOWN);
    }

    fn map_status(&self, status: StatusCode) -> SyncError {
        match status.as_u16() {
            401 | 403 => SyncError::Auth {
                status: status.as_u16(),
                message: format!(
                    "WebDAV unauthorized ({}). Check folder URL/credentials",
                    status.as_u16()
                ),
            },
            429 | 503 => {
                self.note_rate_limit();
                SyncError::RateLimited {
                    status: status.as_u16(),
                }
            }
            s if s >= 500 => SyncError::Transient(format!("WebDAV server error {}", s)),
            s => SyncError::Other(format!("unexpected WebDAV status {}", s)),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        mime_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> SyncResult<Response> {
        cancel.check()?;
        self.throttle().await;

        let mut request = self.apply_auth(self.client.request(method, url));
        if let Some(mime) = mime_type {
            request = request.header(reqwest::header::CONTENT_TYPE, mime);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        cancellable(cancel, async {
            request.send().await.map_err(|e| SyncError::from_http(&e))
        })
        .await
    }

    /// Create the attachments collection if this instance has not seen it
    /// yet. Servers answer MKCOL on an existing collection with 405.
    async fn ensure_attachments_collection(&self, cancel: &CancellationToken) -> SyncResult<()> {
        if self.attachments_dir_ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| SyncError::Other(format!("MKCOL method: {}", e)))?;
        let url = self.url_for("attachments");
        let response = self.send(method, &url, None, None, cancel).await?;

        match response.status().as_u16() {
            201 | 405 | 301 => {
                self.attachments_dir_ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(self.map_status(response.status())),
        }
    }

    async fn fetch_document(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<Vec<u8>>> {
        let response = self
            .send(Method::GET, &self.url_for(name), None, None, cancel)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = cancellable(cancel, async {
                    response
                        .bytes()
                        .await
                        .map_err(|e| SyncError::Transient(format!("read body: {}", e)))
                })
                .await?;
                Ok(Some(bytes.to_vec()))
            }
            status => Err(self.map_status(status)),
        }
    }
}

#[async_trait]
impl SyncTransport for WebDavTransport {
    fn kind(&self) -> SyncBackendKind {
        SyncBackendKind::Webdav
    }

    async fn read_document(&self, cancel: &CancellationToken) -> SyncResult<Option<AppData>> {
        let bytes = with_retries(RetryPolicy::reads(), cancel, || async {
            match self.fetch_document(DOCUMENT_NAME, cancel).await? {
                Some(bytes) => Ok(Some(bytes)),
                None => self.fetch_document(LEGACY_DOCUMENT_NAME, cancel).await,
            }
        })
        .await?;

        match bytes {
            Some(bytes) => parse_document(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write_document(&self, data: &AppData, cancel: &CancellationToken) -> SyncResult<()> {
        let bytes = encode_document(data)?;
        with_retries(RetryPolicy::writes(), cancel, || {
            let body = bytes.clone();
            async move {
                let response = self
                    .send(
                        Method::PUT,
                        &self.url_for(DOCUMENT_NAME),
                        Some(body),
                        Some("application/json"),
                        cancel,
                    )
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(self.map_status(response.status()))
                }
            }
        })
        .await
    }

    async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
        with_retries(RetryPolicy::reads(), cancel, || async {
            let response = self
                .send(Method::GET, &self.url_for(key), None, None, cancel)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(SyncError::RemoteMissing(key.to_string())),
                status if status.is_success() => {
                    let bytes = cancellable(cancel, async {
                        response
                            .bytes()
                            .await
                            .map_err(|e| SyncError::Transient(format!("read body: {}", e)))
                    })
                    .await?;
                    Ok(bytes.to_vec())
                }
                status => Err(self.map_status(status)),
            }
        })
        .await
    }

    async fn put_file(
        &self,
        key: &str,
        bytes: &[u8],
        mime_type: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        if key.starts_with("attachments/") {
            self.ensure_attachments_collection(cancel).await?;
        }

        with_retries(RetryPolicy::writes(), cancel, || {
            let body = bytes.to_vec();
            async move {
                let response = self
                    .send(
                        Method::PUT,
                        &self.url_for(key),
                        Some(body),
                        Some(mime_type),
                        cancel,
                    )
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(self.map_status(response.status()))
                }
            }
        })
        .await
    }

    async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
        with_retries(RetryPolicy::writes(), cancel, || async {
            let response = self
                .send(Method::DELETE, &self.url_for(key), None, None, cancel)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(()),
                status if status.is_success() => Ok(()),
                status => Err(self.map_status(status)),
            }
        })
        .await
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
        let response = self
            .send(Method::HEAD, &self.url_for(key), None, None, cancel)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(self.map_status(status)),
        }
    }

    fn max_attachment_bytes(&self) -> Option<u64> {
        Some(MAX_ATTACHMENT_BYTES)
    }

    fn attachments_paused(&self) -> bool {
        let until = self
            .rate_limited_until
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        matches!(*until, Some(at) if at > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(WebDavTransport::new("ftp://dav.example.com", None, None).is_err());
        assert!(WebDavTransport::new("https://dav.example.com/gtd", None, None).is_ok());
    }

    #[test]
    fn urls_are_rooted_and_encoded() {
        let t = WebDavTransport::new("https://dav.example.com/gtd", Some("alice"), Some("pw"))
            .unwrap();
        assert_eq!(
            t.url_for("attachments/A 1.pdf"),
            "https://dav.example.com/gtd/attachments/A%201.pdf"
        );
        assert_eq!(t.url_for(DOCUMENT_NAME), "https://dav.example.com/gtd/data.json");
    }

    #[test]
    fn basic_auth_header_is_prebuilt() {
        let t =
            WebDavTransport::new("https://dav.example.com/", Some("alice"), Some("secret")).unwrap();
        let header = t.auth_header.as_deref().unwrap();
        assert!(header.starts_with("Basic "));
        assert_eq!(
            header,
            &format!("Basic {}", BASE64.encode("alice:secret"))
        );
    }

    #[test]
    fn rate_limit_pauses_attachments() {
        let t = WebDavTransport::new("https://dav.example.com/", None, None).unwrap();
        assert!(!t.attachments_paused());
        t.note_rate_limit();
        assert!(t.attachments_paused());
    }

    #[test]
    fn rate_limit_status_maps_and_arms_cooldown() {
        let t = WebDavTransport::new("https://dav.example.com/", None, None).unwrap();
        let err = t.map_status(StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(err, SyncError::RateLimited { status: 429 }));
        assert!(t.attachments_paused());

        let err = t.map_status(StatusCode::UNAUTHORIZED);
        assert!(matches!(err, SyncError::Auth { status: 401, .. }));
    }
}
