//! Remote byte sources for the transfer manager.
//!
//! [`RemoteSource`] separates "where the bytes come from" from the chunked,
//! resumable write loop in [`TransferManager`](super::TransferManager):
//! - [`HttpSource`] talks to a download mirror over HTTP with Range requests
//! - [`MemorySource`] serves files from memory (offline runs and tests)

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{
    HeaderName, CONTENT_LENGTH, CONTENT_RANGE, COOKIE, ETAG, LAST_MODIFIED, RANGE,
};
use reqwest::StatusCode;

use crate::error::{SyncError, SyncResult};
use crate::manifest::ManifestEntry;

/// Default timeout for HTTP requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// What the transfer manager needs to know about a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileDetails {
    pub url: String,
    pub expected_hash: String,
    pub expected_size: u64,
    /// Identifies the remote revision; a resume is only valid against the same tag.
    pub version_tag: String,
    pub access_cookies: Option<String>,
}

/// An open response body positioned at `offset`.
pub struct RemoteStream {
    pub reader: Box<dyn Read + Send>,
    /// Byte offset the body starts at. May be 0 even if a resume was asked for.
    pub offset: u64,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("offset", &self.offset)
            .finish()
    }
}

/// Source of remote file contents.
pub trait RemoteSource: Send + Sync {
    /// Describe the remote file backing a manifest entry.
    fn details(&self, entry: &ManifestEntry) -> SyncResult<RemoteFileDetails>;

    /// Open the remote file, starting at `offset` if the source supports it.
    fn open(&self, details: &RemoteFileDetails, offset: u64) -> SyncResult<RemoteStream>;
}

/// Join a mirror base URL and a manifest-relative remote path.
pub fn join_url(base: &str, remote_path: &str) -> String {
    if base.is_empty() {
        return remote_path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        remote_path.trim_start_matches('/')
    )
}

/// Start offset of a `Content-Range: bytes start-end/total` value.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// HTTP download mirror.
#[derive(Debug)]
pub struct HttpSource {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSource {
    /// Create a source for `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a source with a custom request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn with_cookies(request: RequestBuilder, cookies: Option<&str>) -> RequestBuilder {
        match cookies {
            Some(c) if !c.is_empty() => request.header(COOKIE, c),
            _ => request,
        }
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            SyncError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl RemoteSource for HttpSource {
    fn details(&self, entry: &ManifestEntry) -> SyncResult<RemoteFileDetails> {
        let url = join_url(&self.base_url, &entry.remote_path);
        let request = Self::with_cookies(self.client.head(&url), entry.access_cookies.as_deref());
        let response = request.send().map_err(|e| self.map_send_error(&url, e))?;

        if !response.status().is_success() {
            return Err(SyncError::DownloadFailed {
                url,
                reason: format!("HEAD request failed with status {}", response.status()),
            });
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        if let Some(len) = header(CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok()) {
            if len != entry.size {
                tracing::warn!(
                    url = %url,
                    manifest_size = entry.size,
                    remote_size = len,
                    "Remote size differs from manifest"
                );
            }
        }

        let version_tag = header(ETAG)
            .or_else(|| header(LAST_MODIFIED))
            .unwrap_or_else(|| entry.hash.clone());

        Ok(RemoteFileDetails {
            url,
            expected_hash: entry.hash.clone(),
            expected_size: entry.size,
            version_tag,
            access_cookies: entry.access_cookies.clone(),
        })
    }

    fn open(&self, details: &RemoteFileDetails, offset: u64) -> SyncResult<RemoteStream> {
        let mut request = self.client.get(&details.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let request = Self::with_cookies(request, details.access_cookies.as_deref());
        let response = request
            .send()
            .map_err(|e| self.map_send_error(&details.url, e))?;

        let offset = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_start);
                match start {
                    Some(start) if start == offset => offset,
                    Some(0) => 0,
                    other => {
                        return Err(SyncError::DownloadFailed {
                            url: details.url.clone(),
                            reason: format!(
                                "partial response starts at {:?}, requested {}",
                                other, offset
                            ),
                        });
                    }
                }
            }
            // Server ignored the range; the body is the whole file.
            StatusCode::OK => 0,
            status => {
                return Err(SyncError::DownloadFailed {
                    url: details.url.clone(),
                    reason: format!("GET request failed with status {}", status),
                });
            }
        };

        Ok(RemoteStream {
            reader: Box::new(response),
            offset,
        })
    }
}

/// In-memory source keyed by remote path.
///
/// Supports injected failures so retry behaviour can be exercised offline.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
    version_tag: String,
    pending_failures: Mutex<HashMap<String, usize>>,
    opens: AtomicUsize,
    supports_range: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            version_tag: "v1".to_string(),
            supports_range: true,
            ..Default::default()
        }
    }

    /// Serve `data` for `remote_path`.
    pub fn with_file(mut self, remote_path: impl Into<String>, data: Vec<u8>) -> Self {
        self.files.insert(remote_path.into(), data);
        self
    }

    /// Report a different remote revision.
    pub fn with_version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }

    /// Ignore resume offsets, like a server without Range support.
    pub fn without_range_support(mut self) -> Self {
        self.supports_range = false;
        self
    }

    /// Make the next `count` opens of `remote_path` fail.
    pub fn fail_next(&self, remote_path: impl Into<String>, count: usize) {
        self.pending_failures.lock().insert(remote_path.into(), count);
    }

    /// Number of successful opens, i.e. network transfers started.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl RemoteSource for MemorySource {
    fn details(&self, entry: &ManifestEntry) -> SyncResult<RemoteFileDetails> {
        Ok(RemoteFileDetails {
            url: entry.remote_path.clone(),
            expected_hash: entry.hash.clone(),
            expected_size: entry.size,
            version_tag: self.version_tag.clone(),
            access_cookies: entry.access_cookies.clone(),
        })
    }

    fn open(&self, details: &RemoteFileDetails, offset: u64) -> SyncResult<RemoteStream> {
        {
            let mut failures = self.pending_failures.lock();
            if let Some(remaining) = failures.get_mut(&details.url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::DownloadFailed {
                        url: details.url.clone(),
                        reason: "injected failure".to_string(),
                    });
                }
            }
        }

        let data = self
            .files
            .get(&details.url)
            .ok_or_else(|| SyncError::DownloadFailed {
                url: details.url.clone(),
                reason: "not found".to_string(),
            })?;

        self.opens.fetch_add(1, Ordering::SeqCst);

        let offset = if self.supports_range {
            offset.min(data.len() as u64)
        } else {
            0
        };
        Ok(RemoteStream {
            reader: Box::new(Cursor::new(data[offset as usize..].to_vec())),
            offset,
        })
    }
}
