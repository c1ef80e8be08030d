use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ImageSearchConfig;
use crate::truncate_for_error;

#[async_trait]
/// Looks up an image URL for a free-text query.
pub trait ImageSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct UnsplashSearchResponse {
    #[serde(default)]
    results: Vec<UnsplashPhoto>,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhoto {
    urls: UnsplashPhotoUrls,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhotoUrls {
    #[serde(default)]
    regular: Option<String>,
}

pub struct UnsplashImageSearch {
    http: reqwest::Client,
    api_base: String,
    access_key: String,
}

impl UnsplashImageSearch {
    pub fn new(config: &ImageSearchConfig, request_timeout_ms: u64) -> Result<Self> {
        let access_key = config.access_key.trim();
        if access_key.is_empty() {
            bail!("image search access key cannot be empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create image search client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            access_key: access_key.to_string(),
        })
    }
}

#[async_trait]
impl ImageSearch for UnsplashImageSearch {
    async fn search(&self, query: &str) -> Result<Option<String>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        let response = self
            .http
            .get(format!("{}/search/photos", self.api_base))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Client-ID {}", self.access_key),
            )
            .header("Accept-Version", "v1")
            .query(&[("query", query), ("per_page", "1")])
            .send()
            .await
            .context("image search request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "image search failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 320)
            );
        }
        let parsed = response
            .json::<UnsplashSearchResponse>()
            .await
            .context("failed to decode image search response")?;
        Ok(parsed
            .results
            .into_iter()
            .find_map(|photo| photo.urls.regular)
            .filter(|url| !url.trim().is_empty()))
    }
}
