use crate::domains::sync::transport::{cancellable, with_retries, RetryPolicy, SyncTransport};
use crate::domains::sync::types::{AppData, CancellationToken, SyncBackendKind};
use crate::domains::sync::utils::{encode_document, parse_document};
use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Upload cap for attachment blobs on the self-hosted endpoint.
const MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;

/// Self-hosted HTTP backend: the server exposes `<base>/data` for the
/// document and mirrors blob keys beneath `<base>/`.
pub struct CloudTransport {
    client: Client,
    /// Canonical base URL, no trailing slash, no `/data` suffix.
    base_url: String,
    bearer: String,
}

impl CloudTransport {
    pub fn new(url: &str, token: &str) -> SyncResult<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SyncError::Configuration(format!(
                "CLOUD_URL must be an http(s) URL, got '{}'",
                url
            )));
        }

        // Users paste the document endpoint itself often enough that a
        // trailing /data segment is stripped so attachment paths append
        // cleanly.
        let mut base = url.trim_end_matches('/').to_string();
        if let Some(stripped) = base.strip_suffix("/data") {
            base = stripped.to_string();
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client init failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base,
            bearer: format!("Bearer {}", token),
        })
    }

    fn document_url(&self) -> String {
        format!("{}/data", self.base_url)
    }

    fn file_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(reqwest::header::AUTHORIZATION, self.bearer.clone())
    }

    fn map_status(status: StatusCode) -> SyncError {
        SyncError::from_status(status.as_u16(), "cloud endpoint")
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
        let mut request = self.authed(self.client.request(method, url));
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

    async fn read_body(response: Response, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
        cancellable(cancel, async {
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| SyncError::Transient(format!("read body: {}", e)))
        })
        .await
    }
}

#[async_trait]
impl SyncTransport for CloudTransport {
    fn kind(&self) -> SyncBackendKind {
        SyncBackendKind::Cloud
    }

    async fn read_document(&self, cancel: &CancellationToken) -> SyncResult<Option<AppData>> {
        let bytes = with_retries(RetryPolicy::reads(), cancel, || async {
            let response = self
                .send(Method::GET, &self.document_url(), None, None, cancel)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    Ok(Some(Self::read_body(response, cancel).await?))
                }
                status => Err(Self::map_status(status)),
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
                        &self.document_url(),
                        Some(body),
                        Some("application/json"),
                        cancel,
                    )
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(Self::map_status(response.status()))
                }
            }
        })
        .await
    }

    async fn get_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<Vec<u8>> {
        with_retries(RetryPolicy::reads(), cancel, || async {
            let response = self
                .send(Method::GET, &self.file_url(key), None, None, cancel)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(SyncError::RemoteMissing(key.to_string())),
                status if status.is_success() => Self::read_body(response, cancel).await,
                status => Err(Self::map_status(status)),
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
        with_retries(RetryPolicy::writes(), cancel, || {
            let body = bytes.to_vec();
            async move {
                let response = self
                    .send(
                        Method::PUT,
                        &self.file_url(key),
                        Some(body),
                        Some(mime_type),
                        cancel,
                    )
                    .await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(Self::map_status(response.status()))
                }
            }
        })
        .await
    }

    async fn delete_file(&self, key: &str, cancel: &CancellationToken) -> SyncResult<()> {
        with_retries(RetryPolicy::writes(), cancel, || async {
            let response = self
                .send(Method::DELETE, &self.file_url(key), None, None, cancel)
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(()),
                status if status.is_success() => Ok(()),
                status => Err(Self::map_status(status)),
            }
        })
        .await
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> SyncResult<bool> {
        let response = self
            .send(Method::HEAD, &self.file_url(key), None, None, cancel)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Self::map_status(status)),
        }
    }

    fn max_attachment_bytes(&self) -> Option<u64> {
        Some(MAX_ATTACHMENT_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_data_segment() {
        let t = CloudTransport::new("https://sync.example.com/api/data", "tok").unwrap();
        assert_eq!(t.document_url(), "https://sync.example.com/api/data");
        assert_eq!(
            t.file_url("attachments/A1.pdf"),
            "https://sync.example.com/api/attachments/A1.pdf"
        );
    }

    #[test]
    fn plain_base_url_gains_data_endpoint() {
        let t = CloudTransport::new("https://sync.example.com/api/", "tok").unwrap();
        assert_eq!(t.document_url(), "https://sync.example.com/api/data");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(CloudTransport::new("example.com/api", "tok").is_err());
    }
}
