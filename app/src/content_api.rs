use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::catalog::{Episode, Season, Title, TitleKind};
use crate::error::AppError;

pub(crate) fn bearer_header(api_key: &str) -> String {
    if api_key.starts_with("Bearer ") {
        api_key.to_string()
    } else {
        format!("Bearer {}", api_key)
    }
}

/// Browsable shelves offered by the content API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Trending,
    Movies,
    Tv,
    Drama,
    Anime,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Trending,
        Category::Movies,
        Category::Tv,
        Category::Drama,
        Category::Anime,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Category::Trending => "trending",
            Category::Movies => "movies",
            Category::Tv => "tv",
            Category::Drama => "drama",
            Category::Anime => "anime",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Trending => "Trending Now",
            Category::Movies => "Movies",
            Category::Tv => "TV Series",
            Category::Drama => "Asian Drama",
            Category::Anime => "Anime",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.slug() == slug)
    }
}

#[derive(Debug, Clone)]
pub struct ContentClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl ContentClient {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            api_key: api_key.map(str::to_string),
        })
    }

    /// Appends `segments` to the base URL. Each segment is percent-encoded,
    /// so ids containing `/`, `?` or `#` stay inside their own segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AppError::InternalWithMessage(format!(
                    "Content API base {} cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let url = self.endpoint(segments)?;
        debug!("Content API request: {}", url);

        let mut request = self.client.get(url.clone()).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", bearer_header(key));
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Content API error {} for {}: {}", status, url.path(), error_text);
            return Err(AppError::Upstream(format!("Content API returned {}", status)));
        }

        Ok(response.json().await?)
    }

    pub async fn category(&self, category: Category, page: u32) -> Result<TitleList, AppError> {
        let segments = match category {
            Category::Trending => vec!["trending"],
            other => vec!["category", other.slug()],
        };
        self.get_json(&segments, &[("page", page.to_string())]).await
    }

    pub async fn search(&self, query: &str, page: u32) -> Result<TitleList, AppError> {
        debug!("Searching content API for: {}", query);
        self.get_json(
            &["search"],
            &[("q", query.to_string()), ("page", page.to_string())],
        )
        .await
    }

    pub async fn get_title(&self, id: &str) -> Result<Title, AppError> {
        let detail: TitleDetail = self.get_json(&["titles", id], &[]).await?;
        Ok(detail.into_title())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub detail_path: String,
    pub title: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl TitleSummary {
    pub fn year(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .and_then(|d| d.split('-').next())
            .filter(|y| !y.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleList {
    #[serde(default)]
    pub items: Vec<TitleSummary>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleDetail {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub detail_path: String,
    pub title: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub player_url: Option<String>,
    #[serde(default)]
    pub seasons: Vec<SeasonDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonDetail {
    pub season: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub episodes: Vec<EpisodeDetail>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeDetail {
    pub episode: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub player_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl TitleDetail {
    /// Normalizes the upstream payload. A title is episodic when it is not
    /// explicitly a movie and carries at least one season; duplicate episode
    /// numbers within a season keep their first occurrence.
    pub fn into_title(self) -> Title {
        let is_movie = matches!(self.kind.as_deref(), Some("movie") | Some("single"));
        let kind = if !is_movie && !self.seasons.is_empty() {
            TitleKind::Episodic
        } else {
            TitleKind::Single
        };

        let seasons = match kind {
            TitleKind::Single => Vec::new(),
            TitleKind::Episodic => self
                .seasons
                .into_iter()
                .map(|season| {
                    let mut episodes: Vec<Episode> = Vec::with_capacity(season.episodes.len());
                    for episode in season.episodes {
                        if episodes.iter().any(|e| e.number == episode.episode) {
                            continue;
                        }
                        episodes.push(Episode {
                            number: episode.episode,
                            title: episode.title,
                            runtime: episode.runtime,
                            player_url: episode.player_url,
                            thumbnail: episode.thumbnail,
                        });
                    }
                    Season {
                        number: season.season,
                        name: season.name,
                        episodes,
                    }
                })
                .collect(),
        };

        Title {
            key: if self.detail_path.is_empty() {
                self.id.clone()
            } else {
                self.detail_path
            },
            id: self.id,
            name: self.title,
            kind,
            cover: self.cover,
            description: self.description,
            release_date: self.release_date,
            genres: self.genres,
            player_url: self.player_url,
            seasons,
        }
    }
}
