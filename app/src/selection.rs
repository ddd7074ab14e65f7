//! Decides which (season, episode) plays.
//!
//! The in-memory [`SelectionResolver`] is the only authority. The page URL and
//! the LastWatched record are projections written after every accepted change;
//! the URL is read back only at mount and on history navigation, and an
//! incoming URL that already matches the current selection is treated as our
//! own echo and ignored.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::form_urlencoded;

use crate::catalog::{Selection, Title};
use crate::continuity::LastWatched;

/// `season`/`episode` as found in a page query string. Unparseable values
/// count as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UrlSelection {
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl UrlSelection {
    pub fn from_query(query: &str) -> Self {
        let mut parsed = Self::default();
        for (key, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            match key.as_ref() {
                "season" if parsed.season.is_none() => parsed.season = value.trim().parse().ok(),
                "episode" if parsed.episode.is_none() => parsed.episode = value.trim().parse().ok(),
                _ => {}
            }
        }
        parsed
    }

    pub fn of(selection: Selection) -> Self {
        Self {
            season: Some(selection.season),
            episode: Some(selection.episode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Url,
    LastWatched,
    FirstEpisode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    User,
    UrlSync,
    Advance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectionChange {
    pub previous: Option<Selection>,
    pub current: Selection,
    pub cause: ChangeCause,
}

/// Initial selection: URL, then LastWatched, then the first episode. Each
/// candidate is adopted only if it exists in the catalog.
pub fn resolve_initial(
    title: &Title,
    url: &UrlSelection,
    last_watched: Option<&LastWatched>,
) -> Option<(Selection, SelectionSource)> {
    if let Some(selection) = title.validate(url.season, url.episode) {
        return Some((selection, SelectionSource::Url));
    }
    if let Some(selection) = last_watched
        .map(LastWatched::selection)
        .filter(|s| title.contains(*s))
    {
        return Some((selection, SelectionSource::LastWatched));
    }
    title
        .first_selection()
        .map(|s| (s, SelectionSource::FirstEpisode))
}

#[derive(Debug, Clone, Default)]
pub struct SelectionResolver {
    current: Option<Selection>,
    source: Option<SelectionSource>,
}

impl SelectionResolver {
    pub fn mount(title: &Title, url: &UrlSelection, last_watched: Option<&LastWatched>) -> Self {
        if !title.is_episodic() {
            return Self::default();
        }
        let resolved = resolve_initial(title, url, last_watched);
        if let Some((selection, source)) = resolved {
            debug!("Initial selection for {}: {} from {:?}", title.id, selection, source);
        }
        Self {
            current: resolved.map(|(s, _)| s),
            source: resolved.map(|(_, src)| src),
        }
    }

    pub fn current(&self) -> Option<Selection> {
        self.current
    }

    /// Where the initial selection came from.
    pub fn source(&self) -> Option<SelectionSource> {
        self.source
    }

    /// Adopts `requested` if it exists and differs from the current selection.
    pub fn select(
        &mut self,
        title: &Title,
        requested: Selection,
        cause: ChangeCause,
    ) -> Option<SelectionChange> {
        if !title.contains(requested) {
            debug!("Rejecting {} for {}: not in catalog", requested, title.id);
            return None;
        }
        if self.current == Some(requested) {
            return None;
        }
        let previous = self.current.replace(requested);
        Some(SelectionChange {
            previous,
            current: requested,
            cause,
        })
    }

    /// History navigation: follow the URL when it names a different, valid episode.
    pub fn reconcile_url(&mut self, title: &Title, url: &UrlSelection) -> Option<SelectionChange> {
        let requested = title.validate(url.season, url.episode)?;
        if self.current == Some(requested) {
            return None;
        }
        self.select(title, requested, ChangeCause::UrlSync)
    }

    pub fn advance(&mut self, title: &Title) -> Option<SelectionChange> {
        let next = title.next_selection(self.current?)?;
        self.select(title, next, ChangeCause::Advance)
    }
}

/// Query string mirroring `selection`, keeping unrelated parameters in order.
/// `None` when the query already mirrors it, so nothing needs writing.
pub fn project_query(query: &str, selection: Selection) -> Option<String> {
    let query = query.trim_start_matches('?');
    if UrlSelection::from_query(query) == UrlSelection::of(selection) {
        return None;
    }

    let mut projected = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key != "season" && key != "episode" {
            projected.append_pair(&key, &value);
        }
    }
    projected
        .append_pair("season", &selection.season.to_string())
        .append_pair("episode", &selection.episode.to_string());
    Some(projected.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::{movie, series};
    use chrono::Utc;

    fn last_watched(season: u32, episode: u32) -> LastWatched {
        LastWatched {
            season,
            episode,
            updated_at: Utc::now(),
            playback_offset: None,
        }
    }

    #[test]
    fn url_query_parsing_ignores_garbage() {
        assert_eq!(
            UrlSelection::from_query("?season=2&episode=7&ref=home"),
            UrlSelection {
                season: Some(2),
                episode: Some(7)
            }
        );
        assert_eq!(
            UrlSelection::from_query("season=two&episode=-1"),
            UrlSelection::default()
        );
        assert_eq!(UrlSelection::from_query(""), UrlSelection::default());
    }

    #[test]
    fn initial_selection_follows_priority_order() {
        let title = series(&[(1, &[1, 2, 3])]);

        let from_url = UrlSelection::from_query("season=1&episode=2");
        let resolver = SelectionResolver::mount(&title, &from_url, Some(&last_watched(1, 3)));
        assert_eq!(resolver.current(), Some(Selection::new(1, 2)));
        assert_eq!(resolver.source(), Some(SelectionSource::Url));

        let resolver =
            SelectionResolver::mount(&title, &UrlSelection::default(), Some(&last_watched(1, 3)));
        assert_eq!(resolver.current(), Some(Selection::new(1, 3)));
        assert_eq!(resolver.source(), Some(SelectionSource::LastWatched));

        let resolver = SelectionResolver::mount(&title, &UrlSelection::default(), None);
        assert_eq!(resolver.current(), Some(Selection::new(1, 1)));
        assert_eq!(resolver.source(), Some(SelectionSource::FirstEpisode));
    }

    #[test]
    fn invalid_inputs_fall_through() {
        let title = series(&[(1, &[1, 2, 3])]);
        let bad_url = UrlSelection::from_query("season=4&episode=1");

        let resolver = SelectionResolver::mount(&title, &bad_url, Some(&last_watched(9, 9)));
        assert_eq!(resolver.current(), Some(Selection::new(1, 1)));

        let half_url = UrlSelection::from_query("season=1");
        let resolver = SelectionResolver::mount(&title, &half_url, Some(&last_watched(1, 2)));
        assert_eq!(resolver.current(), Some(Selection::new(1, 2)));
    }

    #[test]
    fn single_release_titles_have_no_selection() {
        let resolver = SelectionResolver::mount(
            &movie(),
            &UrlSelection::from_query("season=1&episode=1"),
            None,
        );
        assert_eq!(resolver.current(), None);
    }

    #[test]
    fn select_rejects_unknown_and_unchanged() {
        let title = series(&[(1, &[1, 2])]);
        let mut resolver = SelectionResolver::mount(&title, &UrlSelection::default(), None);

        assert_eq!(resolver.select(&title, Selection::new(1, 5), ChangeCause::User), None);
        assert_eq!(resolver.select(&title, Selection::new(1, 1), ChangeCause::User), None);

        let change = resolver
            .select(&title, Selection::new(1, 2), ChangeCause::User)
            .expect("change");
        assert_eq!(change.previous, Some(Selection::new(1, 1)));
        assert_eq!(change.current, Selection::new(1, 2));
        assert_eq!(resolver.current(), Some(Selection::new(1, 2)));
    }

    #[test]
    fn url_reconciliation_ignores_own_echo() {
        let title = series(&[(1, &[1, 2, 3])]);
        let mut resolver = SelectionResolver::mount(&title, &UrlSelection::default(), None);

        let change = resolver
            .select(&title, Selection::new(1, 3), ChangeCause::User)
            .expect("change");
        let echoed = project_query("", change.current).expect("query written");
        assert_eq!(resolver.reconcile_url(&title, &UrlSelection::from_query(&echoed)), None);

        let back = UrlSelection::from_query("season=1&episode=1");
        let change = resolver.reconcile_url(&title, &back).expect("history change");
        assert_eq!(change.cause, ChangeCause::UrlSync);
        assert_eq!(resolver.current(), Some(Selection::new(1, 1)));

        let bogus = UrlSelection::from_query("season=1&episode=42");
        assert_eq!(resolver.reconcile_url(&title, &bogus), None);
        assert_eq!(resolver.current(), Some(Selection::new(1, 1)));
    }

    #[test]
    fn advance_walks_the_catalog() {
        let title = series(&[(1, &[1]), (2, &[1])]);
        let mut resolver = SelectionResolver::mount(&title, &UrlSelection::default(), None);
        assert_eq!(
            resolver.advance(&title).map(|c| c.current),
            Some(Selection::new(2, 1))
        );
        assert_eq!(resolver.advance(&title), None);
    }

    #[test]
    fn projection_keeps_other_parameters_and_skips_matching_writes() {
        assert_eq!(
            project_query("?ref=home&season=1&episode=1&lang=en", Selection::new(2, 4)).as_deref(),
            Some("ref=home&lang=en&season=2&episode=4")
        );
        assert_eq!(project_query("season=2&episode=4&ref=x", Selection::new(2, 4)), None);
    }

    #[test]
    fn every_catalog_pair_round_trips_through_the_url() {
        let title = series(&[(0, &[1]), (1, &[1, 2, 3]), (7, &[11, 13])]);
        for season in &title.seasons {
            for episode in &season.episodes {
                let selection = Selection::new(season.number, episode.number);
                let query = project_query("ref=shelf", selection).expect("query");
                let resolver =
                    SelectionResolver::mount(&title, &UrlSelection::from_query(&query), None);
                assert_eq!(resolver.current(), Some(selection));
            }
        }
    }
}
