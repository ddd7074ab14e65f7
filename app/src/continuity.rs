//! Watch continuity: the last episode picked per title and per-episode watch
//! progress, persisted through a [`KeyValueStorage`].
//!
//! Records are JSON strings under namespaced keys:
//!
//! - `streamshelf:last:{title}`
//! - `streamshelf:progress:{title}` (single-release titles)
//! - `streamshelf:progress:{title}:{season}:{episode}`
//!
//! Title identifiers are escaped (`%` as `%25`, `:` as `%3A`) before being
//! joined, so an identifier containing the delimiter still parses back to the
//! same title and episode.
//!
//! Reads never fail: a missing, malformed or out-of-range record is `None`.
//! Writes never fail either; storage errors are logged and dropped. Every
//! successful write is announced on the store's change channel, which all
//! clones of a store share.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::catalog::Selection;
use crate::storage::KeyValueStorage;

pub const KEY_PREFIX: &str = "streamshelf";
pub const WATCHED_THRESHOLD: f64 = 90.0;
pub const CONTINUE_WATCHING_LIMIT: usize = 20;

const LAST_WATCHED_SEGMENT: &str = "last";
const PROGRESS_SEGMENT: &str = "progress";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWatched {
    pub season: u32,
    pub episode: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_offset: Option<f64>,
}

impl LastWatched {
    pub fn selection(&self) -> Selection {
        Selection::new(self.season, self.episode)
    }

    fn is_valid(&self) -> bool {
        self.playback_offset.map_or(true, non_negative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastWatchedUpdate {
    pub season: u32,
    pub episode: u32,
    pub playback_offset: Option<f64>,
}

impl From<Selection> for LastWatchedUpdate {
    fn from(selection: Selection) -> Self {
        Self {
            season: selection.season,
            episode: selection.episode,
            playback_offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgress {
    pub percentage: f64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
}

impl WatchProgress {
    pub fn is_watched(&self) -> bool {
        self.percentage >= WATCHED_THRESHOLD
    }

    pub fn is_in_progress(&self) -> bool {
        self.percentage > 0.0 && self.percentage < WATCHED_THRESHOLD
    }

    /// Offset to resume from, if the episode was started and not finished.
    pub fn resume_offset(&self) -> Option<f64> {
        self.current_time
            .filter(|t| *t > 0.0 && self.is_in_progress())
    }

    fn is_valid(&self) -> bool {
        self.percentage.is_finite()
            && (0.0..=100.0).contains(&self.percentage)
            && self.current_time.map_or(true, non_negative)
            && self.duration.map_or(true, non_negative)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: f64,
    pub current_time: Option<f64>,
    pub duration: Option<f64>,
    pub title_name: Option<String>,
    pub cover: Option<String>,
}

impl ProgressUpdate {
    /// Percentage derived from playback position, clamped to 0..=100.
    pub fn from_position(current_time: f64, duration: f64) -> Option<Self> {
        if !non_negative(current_time) || !duration.is_finite() || duration <= 0.0 {
            return None;
        }
        Some(Self {
            percentage: (current_time / duration * 100.0).clamp(0.0, 100.0),
            current_time: Some(current_time),
            duration: Some(duration),
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinueWatchingEntry {
    pub title_id: String,
    pub selection: Option<Selection>,
    pub progress: WatchProgress,
}

/// Parsed form of a store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreKey {
    LastWatched {
        title_id: String,
    },
    Progress {
        title_id: String,
        selection: Option<Selection>,
    },
}

impl StoreKey {
    pub fn title_id(&self) -> &str {
        match self {
            StoreKey::LastWatched { title_id } | StoreKey::Progress { title_id, .. } => title_id,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(':');
        if parts.next()? != KEY_PREFIX {
            return None;
        }
        let kind = parts.next()?;
        let title_id = unescape_segment(parts.next()?)?;
        let rest: Vec<&str> = parts.collect();

        match (kind, rest.as_slice()) {
            (LAST_WATCHED_SEGMENT, []) => Some(StoreKey::LastWatched { title_id }),
            (PROGRESS_SEGMENT, []) => Some(StoreKey::Progress {
                title_id,
                selection: None,
            }),
            (PROGRESS_SEGMENT, [season, episode]) => Some(StoreKey::Progress {
                title_id,
                selection: Some(Selection::new(season.parse().ok()?, episode.parse().ok()?)),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::LastWatched { title_id } => write!(
                f,
                "{}:{}:{}",
                KEY_PREFIX,
                LAST_WATCHED_SEGMENT,
                escape_segment(title_id)
            ),
            StoreKey::Progress {
                title_id,
                selection: None,
            } => write!(f, "{}:{}:{}", KEY_PREFIX, PROGRESS_SEGMENT, escape_segment(title_id)),
            StoreKey::Progress {
                title_id,
                selection: Some(s),
            } => write!(
                f,
                "{}:{}:{}:{}:{}",
                KEY_PREFIX,
                PROGRESS_SEGMENT,
                escape_segment(title_id),
                s.season,
                s.episode
            ),
        }
    }
}

/// Announced after every successful local write or removal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreChange {
    pub key: StoreKey,
    pub removed: bool,
}

#[derive(Clone)]
pub struct ContinuityStore {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<StoreChange>,
}

impl fmt::Debug for ContinuityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuityStore")
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

impl ContinuityStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn KeyValueStorage>, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            storage,
            clock,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub async fn get_last_watched(&self, title_id: &str) -> Option<LastWatched> {
        let key = StoreKey::LastWatched {
            title_id: title_id.to_string(),
        };
        self.read_record::<LastWatched>(&key)
            .await
            .filter(LastWatched::is_valid)
    }

    pub async fn set_last_watched(&self, title_id: &str, update: LastWatchedUpdate) {
        let record = LastWatched {
            season: update.season,
            episode: update.episode,
            updated_at: self.clock.now(),
            playback_offset: update.playback_offset.filter(|o| non_negative(*o)),
        };
        let key = StoreKey::LastWatched {
            title_id: title_id.to_string(),
        };
        self.write_record(key, &record).await;
    }

    pub async fn clear_last_watched(&self, title_id: &str) {
        self.remove_record(StoreKey::LastWatched {
            title_id: title_id.to_string(),
        })
        .await;
    }

    pub async fn get_progress(
        &self,
        title_id: &str,
        selection: Option<Selection>,
    ) -> Option<WatchProgress> {
        self.read_record::<WatchProgress>(&progress_key(title_id, selection))
            .await
            .filter(WatchProgress::is_valid)
    }

    pub async fn update_progress(
        &self,
        title_id: &str,
        selection: Option<Selection>,
        update: ProgressUpdate,
    ) {
        if !update.percentage.is_finite() {
            warn!("Ignoring non-finite progress for {}", title_id);
            return;
        }
        let previous = self.get_progress(title_id, selection).await;
        let (title_name, cover) = match previous {
            Some(p) => (update.title_name.or(p.title_name), update.cover.or(p.cover)),
            None => (update.title_name, update.cover),
        };

        let record = WatchProgress {
            percentage: update.percentage.clamp(0.0, 100.0),
            updated_at: self.clock.now(),
            current_time: update.current_time.filter(|t| non_negative(*t)),
            duration: update.duration.filter(|d| non_negative(*d)),
            title_name,
            cover,
        };
        self.write_record(progress_key(title_id, selection), &record).await;
    }

    pub async fn clear_progress(&self, title_id: &str, selection: Option<Selection>) {
        self.remove_record(progress_key(title_id, selection)).await;
    }

    pub async fn is_watched(&self, title_id: &str, selection: Option<Selection>) -> bool {
        self.get_progress(title_id, selection)
            .await
            .is_some_and(|p| p.is_watched())
    }

    /// Every stored episode progress for one title, for episode list indicators.
    pub async fn progress_for_title(&self, title_id: &str) -> BTreeMap<Selection, WatchProgress> {
        let prefix = format!("{}:", progress_key(title_id, None));
        let mut progress = BTreeMap::new();
        for raw_key in self.keys_with_prefix(&prefix).await {
            let Some(StoreKey::Progress {
                selection: Some(selection),
                ..
            }) = StoreKey::parse(&raw_key)
            else {
                continue;
            };
            if let Some(record) = self.read_raw::<WatchProgress>(&raw_key).await {
                if record.is_valid() {
                    progress.insert(selection, record);
                }
            }
        }
        progress
    }

    /// In-progress episodes across all titles, newest first.
    pub async fn list_continue_watching(&self) -> Vec<ContinueWatchingEntry> {
        let prefix = format!("{}:{}:", KEY_PREFIX, PROGRESS_SEGMENT);
        let mut entries = Vec::new();
        for raw_key in self.keys_with_prefix(&prefix).await {
            let Some(StoreKey::Progress {
                title_id,
                selection,
            }) = StoreKey::parse(&raw_key)
            else {
                debug!("Skipping unparseable progress key {}", raw_key);
                continue;
            };
            let Some(progress) = self.read_raw::<WatchProgress>(&raw_key).await else {
                continue;
            };
            if progress.is_valid() && progress.is_in_progress() {
                entries.push(ContinueWatchingEntry {
                    title_id,
                    selection,
                    progress,
                });
            }
        }

        entries.sort_by(|a, b| b.progress.updated_at.cmp(&a.progress.updated_at));
        entries.truncate(CONTINUE_WATCHING_LIMIT);
        entries
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.storage.keys_with_prefix(prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Continuity storage scan failed: {}", err);
                Vec::new()
            }
        }
    }

    async fn read_record<T: DeserializeOwned>(&self, key: &StoreKey) -> Option<T> {
        self.read_raw(&key.to_string()).await
    }

    async fn read_raw<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.storage.get_item(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("Continuity storage read failed for {}: {}", key, err);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("Discarding malformed record at {}: {}", key, err);
                None
            }
        }
    }

    async fn write_record<T: Serialize>(&self, key: StoreKey, record: &T) {
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(err) => {
                warn!("Could not serialize record for {}: {}", key, err);
                return;
            }
        };
        let raw_key = key.to_string();
        if let Err(err) = self.storage.set_item(&raw_key, &value).await {
            warn!("Continuity storage write failed for {}: {}", raw_key, err);
            return;
        }
        self.notify(key, false);
    }

    async fn remove_record(&self, key: StoreKey) {
        let raw_key = key.to_string();
        if let Err(err) = self.storage.remove_item(&raw_key).await {
            warn!("Continuity storage removal failed for {}: {}", raw_key, err);
            return;
        }
        self.notify(key, true);
    }

    fn notify(&self, key: StoreKey, removed: bool) {
        // no subscribers is fine
        let _ = self.changes.send(StoreChange { key, removed });
    }
}

fn progress_key(title_id: &str, selection: Option<Selection>) -> StoreKey {
    StoreKey::Progress {
        title_id: title_id.to_string(),
        selection,
    }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn escape_segment(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_segment(encoded: &str) -> Option<String> {
    let mut decoded = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(at) = rest.find('%') {
        decoded.push_str(&rest[..at]);
        match rest.get(at + 1..at + 3)? {
            "25" => decoded.push('%'),
            "3A" => decoded.push(':'),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    decoded.push_str(rest);
    Some(decoded)
}
