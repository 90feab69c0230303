//! Coverage report upload.
//!
//! `CodecovUploader` speaks the Codecov v4 upload protocol:
//!
//! 1. `POST {endpoint}/upload/v4?commit=..&branch=..` with the token in the
//!    `X-Upload-Token` header. The plain-text reply has the report URL on
//!    its first line and a pre-signed storage URL on its second.
//! 2. `PUT` the report bytes to the storage URL.

use crate::secret::Secret;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CODECOV_ENDPOINT: &str = "https://codecov.io";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload token variable {var} is not set")]
    MissingToken { var: String },

    #[error("Coverage report not found at {path}")]
    ReportMissing { path: String },

    #[error("Coverage service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Coverage service unreachable: {0}")]
    Transport(String),

    #[error("Malformed response from coverage service: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        // The URL can carry pre-signed query parameters; keep it out of errors.
        UploadError::Transport(err.without_url().to_string())
    }
}

/// One report to send.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// File name the service shows for the report.
    pub report_name: String,

    /// Report contents (lcov).
    pub report: Vec<u8>,

    /// Commit the report belongs to.
    pub commit: Option<String>,

    /// Branch the report belongs to.
    pub branch: String,

    /// Credential, acquired just before the upload.
    pub token: Option<Secret>,
}

/// Confirmation from the coverage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Where the uploaded report can be viewed.
    pub report_url: String,

    /// Bytes transmitted.
    pub bytes: u64,
}

/// Destination for coverage reports.
#[async_trait]
pub trait CoverageUploader: Send + Sync {
    /// Transmit one report.
    async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError>;

    /// Service name for logs.
    fn name(&self) -> &str;
}

/// Uploader for codecov.io (or a self-hosted Codecov).
pub struct CodecovUploader {
    endpoint: String,
    slug: Option<String>,
    http_client: reqwest::Client,
}

impl CodecovUploader {
    /// Create an uploader for `endpoint` (e.g. `https://codecov.io`).
    pub fn new(endpoint: &str) -> Result<Self, UploadError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("cinder/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            slug: None,
            http_client,
        })
    }

    /// Set the `owner/repo` slug sent with each upload.
    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    fn query(&self, request: &UploadRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("package", concat!("cinder-", env!("CARGO_PKG_VERSION")).to_string()),
            ("branch", request.branch.clone()),
            ("name", request.report_name.clone()),
        ];
        if let Some(commit) = &request.commit {
            query.push(("commit", commit.clone()));
        }
        if let Some(slug) = &self.slug {
            query.push(("slug", slug.clone()));
        }
        query
    }
}

/// Split the v4 reply into (report URL, storage URL).
pub fn parse_v4_response(body: &str) -> Result<(String, String), UploadError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let report_url = lines
        .next()
        .ok_or_else(|| UploadError::MalformedResponse("empty body".to_string()))?;
    let put_url = lines
        .next()
        .ok_or_else(|| UploadError::MalformedResponse("missing storage URL".to_string()))?;
    if !put_url.starts_with("http://") && !put_url.starts_with("https://") {
        return Err(UploadError::MalformedResponse(format!(
            "storage URL is not absolute: {}",
            put_url
        )));
    }
    Ok((report_url.to_string(), put_url.to_string()))
}

#[async_trait]
impl CoverageUploader for CodecovUploader {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError> {
        let url = format!("{}/upload/v4", self.endpoint);
        debug!(endpoint = %self.endpoint, bytes = request.report.len(), "Requesting upload slot");

        let mut post = self
            .http_client
            .post(&url)
            .query(&self.query(request))
            .header("Accept", "text/plain");
        if let Some(token) = &request.token {
            post = post.header("X-Upload-Token", token.expose());
        }

        let response = post.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(UploadError::Http {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        let (report_url, put_url) = parse_v4_response(&body)?;

        let stored = self
            .http_client
            .put(&put_url)
            .header("Content-Type", "text/plain")
            .body(request.report.clone())
            .send()
            .await?;
        let status = stored.status();
        if !status.is_success() {
            let body = stored.text().await.unwrap_or_default();
            return Err(UploadError::Http {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        info!(report_url = %report_url, "Coverage report uploaded");
        Ok(UploadReceipt {
            report_url,
            bytes: request.report.len() as u64,
        })
    }

    fn name(&self) -> &str {
        "codecov"
    }
}
