use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::catalog::Selection;
use crate::content_api::bearer_header;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Stream source request timed out")]
    Timeout,

    #[error("Stream source transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Stream source endpoint returned {0}")]
    Status(StatusCode),

    #[error("Malformed stream source payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub title_id: String,
    pub title_key: String,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    pub url: String,
    #[serde(default)]
    pub resolution: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionTrack {
    #[serde(rename = "lan")]
    pub language: String,
    #[serde(rename = "lanName", default)]
    pub label: Option<String>,
    pub url: String,
}

impl CaptionTrack {
    /// WebVTT tracks can be attached to a `<video>`; anything else is only
    /// offered as a download.
    pub fn is_native(&self) -> bool {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        path.to_ascii_lowercase().ends_with(".vtt")
    }

    pub fn display_label(&self) -> &str {
        self.label
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&self.language)
    }
}

/// Direct-playable sources for one title/episode, best resolution first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSources {
    #[serde(default)]
    pub downloads: Vec<DownloadSource>,
    #[serde(default)]
    pub captions: Vec<CaptionTrack>,
}

impl StreamSources {
    pub fn ranked(mut self) -> Self {
        self.downloads.retain(|d| !d.url.trim().is_empty());
        self.captions.retain(|c| !c.url.trim().is_empty());
        // unannotated sources sort after any known resolution
        self.downloads
            .sort_by(|a, b| b.resolution.unwrap_or(0).cmp(&a.resolution.unwrap_or(0)));
        self
    }

    pub fn has_direct(&self) -> bool {
        !self.downloads.is_empty()
    }

    pub fn best(&self) -> Option<&DownloadSource> {
        self.downloads.first()
    }

    pub fn native_captions(&self) -> impl Iterator<Item = &CaptionTrack> {
        self.captions.iter().filter(|c| c.is_native())
    }

    pub fn download_only_captions(&self) -> impl Iterator<Item = &CaptionTrack> {
        self.captions.iter().filter(|c| !c.is_native())
    }
}

#[async_trait]
pub trait StreamSourceFetcher: Send + Sync {
    async fn fetch_stream_sources(&self, request: &StreamRequest)
        -> Result<StreamSources, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HttpStreamSourceFetcher {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpStreamSourceFetcher {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
        })
    }
}

#[async_trait]
impl StreamSourceFetcher for HttpStreamSourceFetcher {
    async fn fetch_stream_sources(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamSources, SourceError> {
        let url = format!("{}/sources", self.base_url);

        let mut query = vec![
            ("id", request.title_id.clone()),
            ("detailPath", request.title_key.clone()),
        ];
        if let Some(selection) = request.selection {
            query.push(("season", selection.season.to_string()));
            query.push(("episode", selection.episode.to_string()));
        }

        let mut builder = self.client.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", bearer_header(key));
        }

        debug!(
            "Fetching stream sources for {} {:?}",
            request.title_id, request.selection
        );
        let response = builder.send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status()));
        }

        let body = response.text().await.map_err(classify)?;
        let sources: StreamSources = serde_json::from_str(&body)?;
        Ok(sources.ranked())
    }
}

fn classify(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Transport(err)
    }
}
