//! HTTP client for S3-compatible blob endpoints

use std::io::{Cursor, Read};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::header::{self, HeaderMap};
use reqwest::StatusCode;
use tracing::debug;

use blobstream_common::{IngestError, Result};

use super::{ObjectBody, ObjectHandle, RemoteStore};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Blocking HTTP client for object retrieval.
///
/// Listing stays with the discovery collaborator; this client only serves
/// `head` and ranged `get` against `{endpoint}/{bucket}/{key}` URLs.
pub struct HttpBlobStore {
    endpoint: String,
    client: Client,
}

impl HttpBlobStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| IngestError::Network(format!("Failed to build HTTP client: {}", e)))?;

        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self { endpoint, client })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, key)
    }

    fn check_status(&self, response: &Response, bucket: &str, key: &str) -> Result<()> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(IngestError::ObjectUnavailable {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(IngestError::Network(format!(
                "Request for {}/{} failed: {}",
                bucket, key, status
            )));
        }
        Ok(())
    }

    fn handle_from_headers(
        &self,
        bucket: &str,
        key: &str,
        headers: &HeaderMap,
        start: u64,
    ) -> ObjectHandle {
        // Total size comes from Content-Range on a ranged response, otherwise
        // from Content-Length plus the skipped prefix.
        let total_from_range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next().map(String::from))
            .and_then(|v| v.parse::<u64>().ok());

        let size = total_from_range.unwrap_or_else(|| {
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|len| len + start)
                .unwrap_or(0)
        });

        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|v| v.with_timezone(&Utc));

        let storage_class = headers
            .get("x-amz-storage-class")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        ObjectHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            etag,
            last_modified,
            storage_class,
        }
    }
}

impl RemoteStore for HttpBlobStore {
    fn list(
        &self,
        _bucket: &str,
        _prefix: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ObjectHandle>> {
        Err(IngestError::Unsupported(
            "object listing belongs to the discovery collaborator".to_string(),
        ))
    }

    fn head(&self, bucket: &str, key: &str) -> Result<ObjectHandle> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|e| IngestError::Network(format!("HEAD {} failed: {}", url, e)))?;

        self.check_status(&response, bucket, key)?;
        Ok(self.handle_from_headers(bucket, key, response.headers(), 0))
    }

    fn get(&self, bucket: &str, key: &str, start: u64) -> Result<(ObjectBody, ObjectHandle)> {
        let url = self.object_url(bucket, key);
        let response = self
            .client
            .get(&url)
            .header(header::RANGE, format!("bytes={}-", start))
            .send()
            .map_err(|e| IngestError::Network(format!("GET {} failed: {}", url, e)))?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // `start` is at or past the end of the object: an empty
            // remainder, not an error. Total size still arrives in the
            // "bytes */N" Content-Range.
            let handle = self.handle_from_headers(bucket, key, response.headers(), start);
            return Ok((Box::new(Cursor::new(Vec::new())), handle));
        }

        self.check_status(&response, bucket, key)?;

        let ignored_range = response.status() == StatusCode::OK && start > 0;
        let handle = self.handle_from_headers(bucket, key, response.headers(), start);
        debug!(
            bucket = %bucket,
            key = %key,
            start,
            size = handle.size,
            "Opened object body"
        );

        let mut body: ObjectBody = Box::new(response);
        if ignored_range {
            // The store served the whole object; discard the prefix so the
            // caller still starts at `start`.
            std::io::copy(&mut body.as_mut().take(start), &mut std::io::sink())?;
        }

        Ok((body, handle))
    }
}
