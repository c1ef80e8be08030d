//! Media relay: makes a downloaded attachment reachable by URL for the completion API.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use crate::truncate_for_error;

#[async_trait]
pub trait MediaRelay: Send + Sync {
    /// Uploads `bytes` and returns a publicly fetchable URL.
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TmpFilesUploadResponse {
    #[serde(default)]
    status: Option<String>,
    data: Option<TmpFilesUploadData>,
}

#[derive(Debug, Deserialize)]
struct TmpFilesUploadData {
    url: String,
}

/// Uploads to a tmpfiles.org-compatible host.
pub struct TmpFilesRelay {
    http: reqwest::Client,
    base_url: String,
}

impl TmpFilesRelay {
    pub fn new(base_url: &str, request_timeout_ms: u64) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            bail!("media relay base url cannot be empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create media relay client")?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl MediaRelay for TmpFilesRelay {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        if bytes.is_empty() {
            bail!("media relay upload requires non-empty payload");
        }
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/api/v1/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("media relay upload request failed")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read media relay response")?;
        if !status.is_success() {
            bail!(
                "media relay upload failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 320)
            );
        }
        let parsed = serde_json::from_str::<TmpFilesUploadResponse>(&body)
            .context("failed to decode media relay response")?;
        let data = parsed.data.ok_or_else(|| {
            anyhow!(
                "media relay response missing data (status={})",
                parsed.status.as_deref().unwrap_or("unknown")
            )
        })?;
        let url = direct_download_url(&data.url)?;
        tracing::debug!(file_name, url = %url, "media relayed");
        Ok(url)
    }
}

/// Rewrites the landing-page URL `<scheme>://<host>/<id>/<name>` into the
/// direct-download form `https://<host>/dl/<id>/<name>`.
pub fn direct_download_url(raw_url: &str) -> Result<String> {
    let parsed = Url::parse(raw_url.trim())
        .with_context(|| format!("media relay returned invalid url '{raw_url}'"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("media relay url '{raw_url}' has no host"))?;
    let segments = parsed
        .path_segments()
        .map(|segments| {
            segments
                .filter(|segment| !segment.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let [.., file_id, file_name] = segments.as_slice() else {
        bail!("media relay url '{raw_url}' must end with <id>/<name>");
    };
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!("https://{authority}/dl/{file_id}/{file_name}"))
}
