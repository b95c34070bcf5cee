//! Source fetch collaborator used by the cache phase.
//!
//! Fetching the upstream work list (bookmarks) is outside the core; the
//! cache phase only needs a way to pull one post's content and to download
//! media bytes. Callers inject an implementation; tests use an in-memory
//! one.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct FetchedMedia {
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedSegment {
    pub text: String,
    pub media: Vec<FetchedMedia>,
    /// Already-expanded external URLs referenced by this segment.
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedPost {
    pub is_thread: bool,
    pub segments: Vec<FetchedSegment>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the source data for one post or thread.
    async fn fetch_post(&self, item_id: &str, source_url: &str) -> Result<FetchedPost>;

    /// Download a media URL to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Fetcher that resolves posts from a JSON endpoint and downloads media
/// over plain HTTP. The endpoint template has `{item_id}` substituted.
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    post_endpoint: String,
}

impl HttpSourceFetcher {
    pub fn new(post_endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("build fetch client")?;
        Ok(Self { client, post_endpoint: post_endpoint.into() })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_post(&self, item_id: &str, _source_url: &str) -> Result<FetchedPost> {
        let url = self.post_endpoint.replace("{item_id}", item_id);
        let value: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetch post {item_id}"))?
            .error_for_status()
            .with_context(|| format!("fetch post {item_id}"))?
            .json()
            .await
            .with_context(|| format!("decode post {item_id}"))?;
        Ok(parse_post(&value))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url}"))?
            .bytes()
            .await
            .with_context(|| format!("download body {url}"))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write {}", dest.display()))?;
        Ok(())
    }
}

fn parse_post(value: &serde_json::Value) -> FetchedPost {
    let segments: Vec<FetchedSegment> = value["segments"]
        .as_array()
        .map(|segs| {
            segs.iter()
                .map(|seg| FetchedSegment {
                    text: seg["text"].as_str().unwrap_or_default().to_string(),
                    media: seg["media"]
                        .as_array()
                        .map(|media| {
                            media
                                .iter()
                                .filter_map(|m| {
                                    let url = m["url"].as_str()?.to_string();
                                    Some(FetchedMedia {
                                        url,
                                        mime_type: m["mime_type"]
                                            .as_str()
                                            .unwrap_or("image/jpeg")
                                            .to_string(),
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    urls: seg["urls"]
                        .as_array()
                        .map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    FetchedPost { is_thread: segments.len() > 1, segments }
}
