use tracing::debug;
use url::{form_urlencoded, Url};

use crate::catalog::{Selection, Title};

/// Filename every synthesized player URL points at.
pub const PLAYER_ENDPOINT: &str = "player.html";

/// Inputs for [`build_playback_url`].
#[derive(Debug, Clone, Copy)]
pub struct PlaybackTarget<'a> {
    pub base: &'a str,
    pub title_id: &'a str,
    pub title_key: &'a str,
    pub selection: Option<Selection>,
}

/// Strips a trailing filename-looking segment (one containing a `.`) and the
/// query from a known player URL, leaving `origin + path`.
///
/// Anything that does not parse as a hierarchical URL is returned unchanged.
pub fn derive_playback_base(player_url: &str) -> String {
    let Ok(parsed) = Url::parse(player_url) else {
        return player_url.to_string();
    };
    if !parsed.has_host() {
        return player_url.to_string();
    }
    let Some(segments) = parsed.path_segments() else {
        return player_url.to_string();
    };

    let mut segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    if segments.last().is_some_and(|s| s.contains('.')) {
        segments.pop();
    }

    let origin = parsed.origin().ascii_serialization();
    if segments.is_empty() {
        origin
    } else {
        format!("{}/{}", origin, segments.join("/"))
    }
}

/// Builds `{base}/player.html?id=..&detailPath=..[&season=..&episode=..]`.
pub fn build_playback_url(target: &PlaybackTarget<'_>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("id", target.title_id)
        .append_pair("detailPath", target.title_key);
    if let Some(selection) = target.selection {
        query
            .append_pair("season", &selection.season.to_string())
            .append_pair("episode", &selection.episode.to_string());
    }

    format!(
        "{}/{}?{}",
        target.base.trim_end_matches('/'),
        PLAYER_ENDPOINT,
        query.finish()
    )
}

/// Picks the embed URL for a title/selection.
///
/// An episode's own URL wins. Otherwise a base is borrowed, in order, from a
/// sibling episode (same season first), the title-level URL, and finally the
/// configured fallback endpoint.
pub fn resolve_embed_url(
    title: &Title,
    selection: Option<Selection>,
    fallback_base: Option<&str>,
) -> Option<String> {
    let fallback_base = fallback_base.filter(|b| !b.trim().is_empty());

    if !title.is_episodic() {
        if let Some(url) = non_empty(title.player_url.as_deref()) {
            return Some(url.to_string());
        }
        let base = fallback_base?;
        return Some(build_playback_url(&PlaybackTarget {
            base,
            title_id: &title.id,
            title_key: &title.key,
            selection: None,
        }));
    }

    let selection = selection?;
    if let Some(url) = title
        .episode(selection)
        .and_then(|e| non_empty(e.player_url.as_deref()))
    {
        return Some(url.to_string());
    }

    let base = sibling_player_url(title, selection)
        .map(derive_playback_base)
        .or_else(|| non_empty(title.player_url.as_deref()).map(derive_playback_base))
        .or_else(|| fallback_base.map(str::to_string))?;

    let url = build_playback_url(&PlaybackTarget {
        base: &base,
        title_id: &title.id,
        title_key: &title.key,
        selection: Some(selection),
    });
    debug!("Synthesized player URL for {} {}: {}", title.id, selection, url);
    Some(url)
}

fn sibling_player_url(title: &Title, selection: Selection) -> Option<&str> {
    let same_season = title
        .season(selection.season)
        .into_iter()
        .flat_map(|s| s.episodes.iter());
    let everywhere = title.seasons.iter().flat_map(|s| s.episodes.iter());

    same_season
        .chain(everywhere)
        .find_map(|e| non_empty(e.player_url.as_deref()))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{movie, series};

    /// Reads `season`/`episode` back out of a player URL.
    fn selection_from_url(player_url: &str) -> Option<Selection> {
        let parsed = Url::parse(player_url).ok()?;
        let mut season = None;
        let mut episode = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "season" => season = value.parse().ok(),
                "episode" => episode = value.parse().ok(),
                _ => {}
            }
        }
        Some(Selection::new(season?, episode?))
    }

    #[test]
    fn derive_base_strips_filename_and_query() {
        assert_eq!(
            derive_playback_base("https://cdn.example.org/embed/v3/player.html?id=9&season=1"),
            "https://cdn.example.org/embed/v3"
        );
        assert_eq!(
            derive_playback_base("https://cdn.example.org/embed/v3/"),
            "https://cdn.example.org/embed/v3"
        );
        assert_eq!(
            derive_playback_base("https://cdn.example.org/index.php"),
            "https://cdn.example.org"
        );
        assert_eq!(
            derive_playback_base("http://cdn.example.org:8080/watch"),
            "http://cdn.example.org:8080/watch"
        );
    }

    #[test]
    fn derive_base_returns_unparseable_input_unchanged() {
        assert_eq!(derive_playback_base("not a url"), "not a url");
        assert_eq!(derive_playback_base("/relative/player.html"), "/relative/player.html");
        assert_eq!(derive_playback_base("mailto:someone@example.org"), "mailto:someone@example.org");
    }

    #[test]
    fn build_is_deterministic_and_encodes_parameters() {
        let target = PlaybackTarget {
            base: "https://cdn.example.org/embed/",
            title_id: "42",
            title_key: "a b&c",
            selection: Some(Selection::new(2, 7)),
        };
        let first = build_playback_url(&target);
        assert_eq!(first, build_playback_url(&target));
        assert_eq!(
            first,
            "https://cdn.example.org/embed/player.html?id=42&detailPath=a+b%26c&season=2&episode=7"
        );
    }

    #[test]
    fn every_catalog_pair_survives_build_and_parse() {
        let title = series(&[(0, &[1, 2]), (1, &[1, 2, 3]), (4, &[10, 12, 40])]);
        for season in &title.seasons {
            for episode in &season.episodes {
                let selection = Selection::new(season.number, episode.number);
                let url = build_playback_url(&PlaybackTarget {
                    base: "https://cdn.example.org/embed",
                    title_id: &title.id,
                    title_key: &title.key,
                    selection: Some(selection),
                });
                assert_eq!(selection_from_url(&url), Some(selection));
            }
        }
    }

    #[test]
    fn embed_url_prefers_episode_then_sibling_then_title_then_fallback() {
        let mut title = series(&[(1, &[1, 2]), (2, &[1])]);
        title.seasons[0].episodes[0].player_url =
            Some("https://own.example.org/e/player.html?id=1".to_string());

        assert_eq!(
            resolve_embed_url(&title, Some(Selection::new(1, 1)), Some("https://fallback.example.org")),
            Some("https://own.example.org/e/player.html?id=1".to_string())
        );

        let sibling = resolve_embed_url(&title, Some(Selection::new(2, 1)), Some("https://fallback.example.org"))
            .expect("sibling url");
        assert!(sibling.starts_with("https://own.example.org/e/player.html?"));
        assert_eq!(selection_from_url(&sibling), Some(Selection::new(2, 1)));

        title.seasons[0].episodes[0].player_url = None;
        title.player_url = Some("https://title.example.org/t/play.php".to_string());
        let from_title = resolve_embed_url(&title, Some(Selection::new(1, 2)), None).expect("title url");
        assert!(from_title.starts_with("https://title.example.org/t/player.html?"));

        title.player_url = None;
        let from_fallback =
            resolve_embed_url(&title, Some(Selection::new(1, 2)), Some("https://fallback.example.org/"))
                .expect("fallback url");
        assert!(from_fallback.starts_with("https://fallback.example.org/player.html?"));

        assert_eq!(resolve_embed_url(&title, Some(Selection::new(1, 2)), Some("  ")), None);
        assert_eq!(resolve_embed_url(&title, None, Some("https://fallback.example.org")), None);
    }

    #[test]
    fn single_release_uses_title_url_or_fallback() {
        let mut title = movie();
        assert_eq!(resolve_embed_url(&title, None, None), title.player_url.clone());

        title.player_url = None;
        let url = resolve_embed_url(&title, None, Some("https://fallback.example.org")).expect("fallback");
        assert_eq!(
            url,
            "https://fallback.example.org/player.html?id=5001&detailPath=long-walk-xyz"
        );
        assert_eq!(resolve_embed_url(&title, None, None), None);
    }
}
