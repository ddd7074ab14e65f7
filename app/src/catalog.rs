use serde::{Deserialize, Serialize};

/// Whether a title plays from a single endpoint or from a season/episode tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleKind {
    Single,
    Episodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub number: u32,
    pub title: Option<String>,
    pub runtime: Option<String>,
    pub player_url: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub number: u32,
    pub name: Option<String>,
    pub episodes: Vec<Episode>,
}

impl Season {
    pub fn episode(&self, number: u32) -> Option<&Episode> {
        self.episodes.iter().find(|e| e.number == number)
    }

    pub fn label(&self) -> String {
        self.name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Season {}", self.number))
    }
}

/// A title as loaded from the content API. Immutable for the lifetime of a page view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Title {
    pub id: String,
    /// Upstream detail path, sent alongside the id on playback and source requests.
    pub key: String,
    pub name: String,
    pub kind: TitleKind,
    pub cover: Option<String>,
    pub description: Option<String>,
    pub release_date: Option<String>,
    pub genres: Vec<String>,
    pub player_url: Option<String>,
    pub seasons: Vec<Season>,
}

/// The (season, episode) pair that should play now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selection {
    pub season: u32,
    pub episode: u32,
}

impl Selection {
    pub fn new(season: u32, episode: u32) -> Self {
        Self { season, episode }
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}E{}", self.season, self.episode)
    }
}

impl Title {
    pub fn is_episodic(&self) -> bool {
        self.kind == TitleKind::Episodic
    }

    pub fn season(&self, number: u32) -> Option<&Season> {
        self.seasons.iter().find(|s| s.number == number)
    }

    pub fn episode(&self, selection: Selection) -> Option<&Episode> {
        self.season(selection.season)?.episode(selection.episode)
    }

    /// True when the pair names an episode that exists in this title's catalog.
    pub fn contains(&self, selection: Selection) -> bool {
        self.episode(selection).is_some()
    }

    /// Turns a possibly partial (season, episode) request into a selection
    /// only when both halves are present and the episode exists.
    pub fn validate(&self, season: Option<u32>, episode: Option<u32>) -> Option<Selection> {
        let selection = Selection::new(season?, episode?);
        self.contains(selection).then_some(selection)
    }

    /// First episode of the first season in catalog order. Seasons without
    /// episodes are skipped.
    pub fn first_selection(&self) -> Option<Selection> {
        self.seasons.iter().find_map(|season| {
            season
                .episodes
                .first()
                .map(|e| Selection::new(season.number, e.number))
        })
    }

    /// Episode following `current` in catalog order, crossing into the next
    /// season when `current` is the last episode of its season.
    pub fn next_selection(&self, current: Selection) -> Option<Selection> {
        let mut flattened = self.seasons.iter().flat_map(|season| {
            season
                .episodes
                .iter()
                .map(move |e| Selection::new(season.number, e.number))
        });
        flattened.position(|s| s == current)?;
        flattened.next()
    }

    pub fn episode_count(&self) -> usize {
        self.seasons.iter().map(|s| s.episodes.len()).sum()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn episode(number: u32, player_url: Option<&str>) -> Episode {
        Episode {
            number,
            title: Some(format!("Episode {}", number)),
            runtime: None,
            player_url: player_url.map(str::to_string),
            thumbnail: None,
        }
    }

    pub fn series(seasons: &[(u32, &[u32])]) -> Title {
        Title {
            id: "8123".to_string(),
            key: "night-harbor-abc".to_string(),
            name: "Night Harbor".to_string(),
            kind: TitleKind::Episodic,
            cover: None,
            description: None,
            release_date: None,
            genres: vec![],
            player_url: None,
            seasons: seasons
                .iter()
                .map(|(number, episodes)| Season {
                    number: *number,
                    name: None,
                    episodes: episodes.iter().map(|e| episode(*e, None)).collect(),
                })
                .collect(),
        }
    }

    pub fn movie() -> Title {
        Title {
            id: "5001".to_string(),
            key: "long-walk-xyz".to_string(),
            name: "The Long Walk".to_string(),
            kind: TitleKind::Single,
            cover: None,
            description: None,
            release_date: None,
            genres: vec![],
            player_url: Some("https://play.example.net/v2/player.html?id=5001".to_string()),
            seasons: vec![],
        }
    }
}
