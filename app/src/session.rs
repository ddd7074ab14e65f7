//! One player page view: selection, stream-source fetch and playback surface
//! for a single title, kept consistent across user actions, history
//! navigation, fetch completion and timers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Selection, Title};
use crate::continuity::{ContinuityStore, LastWatchedUpdate};
use crate::error::AppError;
use crate::playback::{PlaybackEffect, PlaybackEvent, PlaybackMachine};
use crate::playback_url::resolve_embed_url;
use crate::selection::{project_query, ChangeCause, SelectionChange, SelectionResolver, UrlSelection};
use crate::stream_sources::{SourceError, StreamRequest, StreamSourceFetcher, StreamSources};

/// Everything a session needs from the application.
#[derive(Clone)]
pub struct SessionDeps {
    pub fetcher: Arc<dyn StreamSourceFetcher>,
    pub store: ContinuityStore,
    pub fallback_base: Option<String>,
    pub embed_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub title_id: String,
    pub selection: Option<Selection>,
    pub machine: PlaybackMachine,
    pub sources: Option<StreamSources>,
    pub embed_url: Option<String>,
    pub resume_at: Option<f64>,
}

/// What the page reports back from the playback surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEventKind {
    DirectError,
    EmbedLoaded,
    EmbedError,
    TryDirect,
    UseEmbed,
    Retry,
    OpenExternal,
    Ended,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClientEvent {
    pub kind: ClientEventKind,
    /// Surface generation the event originated from.
    pub surface: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub snapshot: SessionSnapshot,
    /// New page query to push into history, when the selection moved.
    pub query: Option<String>,
    /// Set when the page should open this URL in a new context.
    pub external_url: Option<String>,
}

struct SessionInner {
    resolver: SelectionResolver,
    machine: PlaybackMachine,
    sources: Option<StreamSources>,
    embed_url: Option<String>,
    resume_at: Option<f64>,
    fetch_seq: u64,
    fetch_task: Option<JoinHandle<()>>,
    embed_timer: Option<JoinHandle<()>>,
    last_active: Instant,
    closed: bool,
}

pub struct PlayerSession {
    id: Uuid,
    title: Arc<Title>,
    deps: SessionDeps,
    inner: Mutex<SessionInner>,
    updates: watch::Sender<SessionSnapshot>,
}

impl PlayerSession {
    /// Resolves the initial selection, records it as LastWatched and starts
    /// fetching stream sources.
    pub async fn mount(title: Arc<Title>, url: &UrlSelection, deps: SessionDeps) -> Arc<Self> {
        let last_watched = deps.store.get_last_watched(&title.id).await;
        let resolver = SelectionResolver::mount(&title, url, last_watched.as_ref());
        let selection = resolver.current();
        let source = resolver.source();

        if let Some(selection) = selection {
            let offset = last_watched
                .filter(|r| r.selection() == selection)
                .and_then(|r| r.playback_offset);
            deps.store
                .set_last_watched(
                    &title.id,
                    LastWatchedUpdate {
                        season: selection.season,
                        episode: selection.episode,
                        playback_offset: offset,
                    },
                )
                .await;
        }

        let embed_url = resolve_embed_url(&title, selection, deps.fallback_base.as_deref());
        let resume_at = deps
            .store
            .get_progress(&title.id, selection)
            .await
            .and_then(|p| p.resume_offset());

        let id = Uuid::new_v4();
        let inner = SessionInner {
            resolver,
            machine: PlaybackMachine::new(embed_url.is_some()),
            sources: None,
            embed_url,
            resume_at,
            fetch_seq: 0,
            fetch_task: None,
            embed_timer: None,
            last_active: Instant::now(),
            closed: false,
        };
        let (updates, _) = watch::channel(Self::snapshot_of(id, &title, &inner));

        let session = Arc::new(Self {
            id,
            title,
            deps,
            inner: Mutex::new(inner),
            updates,
        });
        info!(
            "Mounted player session {} for {} at {:?} ({:?})",
            session.id, session.title.id, selection, source
        );

        {
            let mut inner = session.inner.lock().await;
            session.start_fetch(&mut inner);
        }
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn title(&self) -> &Arc<Title> {
        &self.title
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.updates.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        Self::snapshot_of(self.id, &self.title, &inner)
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_active.elapsed()
    }

    /// Query the page should carry for the selection resolved at mount.
    /// A page opened without `season`/`episode` replaces its URL with this so
    /// later history entries still resolve back to it.
    pub async fn mount_query(&self, current_query: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .resolver
            .current()
            .and_then(|selection| project_query(current_query, selection))
    }

    /// User picked an episode. `current_query` is the page's query string, so
    /// unrelated parameters survive the projection.
    pub async fn select(
        self: &Arc<Self>,
        requested: Selection,
        current_query: &str,
    ) -> Result<SessionResponse, AppError> {
        let mut inner = self.inner.lock().await;
        inner.last_active = Instant::now();
        if !self.title.contains(requested) {
            return Err(AppError::BadRequest(format!(
                "{} is not part of this title",
                requested
            )));
        }
        let change = inner.resolver.select(&self.title, requested, ChangeCause::User);
        let query = match change {
            Some(change) => {
                self.apply_selection_change(&mut inner, change).await;
                project_query(current_query, change.current)
            }
            None => None,
        };
        Ok(self.respond(&inner, query, None))
    }

    /// Browser history moved. The URL is adopted only when it names a valid
    /// episode other than the current one; no query is echoed back.
    pub async fn navigate(self: &Arc<Self>, url: &UrlSelection) -> SessionResponse {
        let mut inner = self.inner.lock().await;
        inner.last_active = Instant::now();
        if let Some(change) = inner.resolver.reconcile_url(&self.title, url) {
            self.apply_selection_change(&mut inner, change).await;
        }
        self.respond(&inner, None, None)
    }

    pub async fn handle_event(
        self: &Arc<Self>,
        event: ClientEvent,
        current_query: &str,
    ) -> SessionResponse {
        let mut inner = self.inner.lock().await;
        inner.last_active = Instant::now();

        if event.surface != inner.machine.surface {
            debug!(
                "Dropping {:?} from stale surface {} (current {})",
                event.kind, event.surface, inner.machine.surface
            );
            return self.respond(&inner, None, None);
        }

        let playback_event = match event.kind {
            ClientEventKind::Ended => {
                let query = match inner.resolver.advance(&self.title) {
                    Some(change) => {
                        self.apply_selection_change(&mut inner, change).await;
                        project_query(current_query, change.current)
                    }
                    None => None,
                };
                return self.respond(&inner, query, None);
            }
            ClientEventKind::DirectError => PlaybackEvent::DirectError,
            ClientEventKind::EmbedLoaded => PlaybackEvent::EmbedLoaded,
            ClientEventKind::EmbedError => PlaybackEvent::EmbedError,
            ClientEventKind::TryDirect => PlaybackEvent::TryDirect,
            ClientEventKind::UseEmbed => PlaybackEvent::UseEmbed,
            ClientEventKind::Retry => PlaybackEvent::Retry,
            ClientEventKind::OpenExternal => PlaybackEvent::OpenExternal,
        };

        let effects = self.apply_event(&mut inner, playback_event);
        let external_url = effects
            .contains(&PlaybackEffect::OpenExternal)
            .then(|| inner.embed_url.clone())
            .flatten();
        self.publish(&inner);
        self.respond(&inner, None, external_url)
    }

    /// Stops timers and any outstanding fetch. Later results are discarded.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        if let Some(task) = inner.fetch_task.take() {
            task.abort();
        }
        if let Some(timer) = inner.embed_timer.take() {
            timer.abort();
        }
        debug!("Closed player session {}", self.id);
    }

    async fn apply_selection_change(self: &Arc<Self>, inner: &mut SessionInner, change: SelectionChange) {
        info!(
            "Session {} selection {:?} -> {} ({:?})",
            self.id, change.previous, change.current, change.cause
        );
        let selection = Some(change.current);
        inner.embed_url =
            resolve_embed_url(&self.title, selection, self.deps.fallback_base.as_deref());
        inner.sources = None;
        inner.resume_at = self
            .deps
            .store
            .get_progress(&self.title.id, selection)
            .await
            .and_then(|p| p.resume_offset());

        let has_embed = inner.embed_url.is_some();
        self.apply_event(inner, PlaybackEvent::Reset { has_embed });

        self.deps
            .store
            .set_last_watched(&self.title.id, change.current.into())
            .await;

        self.start_fetch(inner);
        self.publish(inner);
    }

    fn apply_event(self: &Arc<Self>, inner: &mut SessionInner, event: PlaybackEvent) -> Vec<PlaybackEffect> {
        let transition = inner.machine.apply(event);
        debug!(
            "Session {} {:?}: {:?} -> {:?}",
            self.id, event, inner.machine.state, transition.machine.state
        );
        inner.machine = transition.machine;

        for effect in &transition.effects {
            match effect {
                PlaybackEffect::ArmEmbedTimeout => self.arm_embed_timer(inner),
                PlaybackEffect::DisarmEmbedTimeout => {
                    if let Some(timer) = inner.embed_timer.take() {
                        timer.abort();
                    }
                }
                PlaybackEffect::RefetchSources => self.start_fetch(inner),
                PlaybackEffect::RecreateSurface | PlaybackEffect::OpenExternal => {}
            }
        }
        transition.effects
    }

    fn start_fetch(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(previous) = inner.fetch_task.take() {
            previous.abort();
        }
        inner.fetch_seq += 1;
        let seq = inner.fetch_seq;
        let request = StreamRequest {
            title_id: self.title.id.clone(),
            title_key: self.title.key.clone(),
            selection: inner.resolver.current(),
        };

        let session = Arc::clone(self);
        let fetcher = Arc::clone(&self.deps.fetcher);
        inner.fetch_task = Some(tokio::spawn(async move {
            let result = fetcher.fetch_stream_sources(&request).await;
            session.finish_fetch(seq, request.selection, result).await;
        }));
    }

    async fn finish_fetch(
        self: &Arc<Self>,
        seq: u64,
        requested: Option<Selection>,
        result: Result<StreamSources, SourceError>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.closed || seq != inner.fetch_seq || inner.resolver.current() != requested {
            debug!(
                "Discarding stale stream sources for {:?} in session {}",
                requested, self.id
            );
            return;
        }
        inner.fetch_task = None;

        let event = match result {
            Ok(sources) => {
                let has_direct = sources.has_direct();
                inner.sources = Some(sources);
                PlaybackEvent::SourcesLoaded { has_direct }
            }
            Err(err) => {
                warn!(
                    "No direct sources for {} {:?}: {}",
                    self.title.id, requested, err
                );
                inner.sources = None;
                PlaybackEvent::SourcesFailed
            }
        };
        self.apply_event(&mut inner, event);
        self.publish(&inner);
    }

    fn arm_embed_timer(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(previous) = inner.embed_timer.take() {
            previous.abort();
        }
        let session = Arc::clone(self);
        let surface = inner.machine.surface;
        let timeout = self.deps.embed_timeout;
        inner.embed_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            session.embed_timed_out(surface).await;
        }));
    }

    async fn embed_timed_out(self: &Arc<Self>, surface: u64) {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.machine.surface != surface {
            return;
        }
        // this task is the timer; detach its own handle before transitioning
        inner.embed_timer = None;
        info!("Embed load timed out in session {}", self.id);
        self.apply_event(&mut inner, PlaybackEvent::EmbedTimeout);
        self.publish(&inner);
    }

    fn publish(&self, inner: &SessionInner) {
        self.updates
            .send_replace(Self::snapshot_of(self.id, &self.title, inner));
    }

    fn respond(
        &self,
        inner: &SessionInner,
        query: Option<String>,
        external_url: Option<String>,
    ) -> SessionResponse {
        SessionResponse {
            snapshot: Self::snapshot_of(self.id, &self.title, inner),
            query,
            external_url,
        }
    }

    fn snapshot_of(id: Uuid, title: &Title, inner: &SessionInner) -> SessionSnapshot {
        SessionSnapshot {
            session_id: id,
            title_id: title.id.clone(),
            selection: inner.resolver.current(),
            machine: inner.machine,
            sources: inner.sources.clone(),
            embed_url: inner.embed_url.clone(),
            resume_at: inner.resume_at,
        }
    }
}

/// Live sessions by id. Sessions idle past the TTL are closed and dropped
/// whenever a new one registers.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<PlayerSession>>>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn insert(&self, session: Arc<PlayerSession>) {
        self.prune_idle().await;
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id(), session);
        debug!("{} live player sessions", sessions.len());
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<PlayerSession>, AppError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AppError::SessionNotFound)
    }

    pub async fn remove(&self, id: Uuid) {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(session) = removed {
            session.close().await;
        }
    }

    async fn prune_idle(&self) {
        let sessions: Vec<Arc<PlayerSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if session.idle_for().await >= self.idle_ttl {
                debug!("Pruning idle player session {}", session.id());
                self.remove(session.id()).await;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{direct_sources, ScriptedFetcher};
    use super::*;
    use crate::catalog::fixtures::series;
    use crate::continuity::ProgressUpdate;
    use crate::playback::{PlaybackFailure, PlaybackState};
    use crate::storage::MemoryStorage;

    fn deps(fetcher: Arc<ScriptedFetcher>, fallback: Option<&str>) -> SessionDeps {
        SessionDeps {
            fetcher,
            store: ContinuityStore::new(Arc::new(MemoryStorage::new())),
            fallback_base: fallback.map(str::to_string),
            embed_timeout: Duration::from_secs(15),
        }
    }

    async fn settled(session: &PlayerSession) -> SessionSnapshot {
        let mut updates = session.subscribe();
        let snapshot = updates
            .wait_for(|s| !s.machine.is_loading())
            .await
            .expect("session alive")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn mount_resolves_records_and_plays_direct() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let s1e2 = Some(Selection::new(1, 2));
        fetcher.answer(s1e2, Ok(direct_sources("https://cdn/e2.mp4")));
        let deps = deps(fetcher.clone(), Some("https://fallback.example.org"));
        let store = deps.store.clone();

        let title = Arc::new(series(&[(1, &[1, 2, 3])]));
        let session =
            PlayerSession::mount(title, &UrlSelection::from_query("season=1&episode=2"), deps).await;

        let snapshot = settled(&session).await;
        assert_eq!(snapshot.selection, s1e2);
        assert_eq!(snapshot.machine.state, PlaybackState::Direct);
        assert!(snapshot.embed_url.is_some());
        assert_eq!(
            store.get_last_watched("8123").await.map(|r| r.selection()),
            s1e2
        );
    }

    #[tokio::test]
    async fn failed_fetch_falls_back_to_embed() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;

        let snapshot = settled(&session).await;
        assert_eq!(snapshot.machine.state, PlaybackState::SandboxedEmbed { loaded: false });
        assert_eq!(snapshot.sources, None);
    }

    #[tokio::test]
    async fn stale_fetch_never_overwrites_newer_selection() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let s1e1 = Some(Selection::new(1, 1));
        let s1e2 = Some(Selection::new(1, 2));
        let old_gate = fetcher.gate(s1e1);
        fetcher.answer(s1e1, Ok(direct_sources("https://cdn/e1.mp4")));
        fetcher.answer(s1e2, Err(()));

        let title = Arc::new(series(&[(1, &[1, 2])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher.clone(), Some("https://fallback.example.org")),
        )
        .await;

        let response = session.select(Selection::new(1, 2), "ref=home").await.unwrap();
        assert_eq!(response.query.as_deref(), Some("ref=home&season=1&episode=2"));
        let settled_snapshot = settled(&session).await;
        assert_eq!(settled_snapshot.selection, s1e2);
        assert_eq!(
            settled_snapshot.machine.state,
            PlaybackState::SandboxedEmbed { loaded: false }
        );

        // the superseded request resolving late (or its result arriving
        // directly) must not touch the new selection
        old_gate.notify_one();
        session
            .finish_fetch(1, s1e1, Ok(direct_sources("https://cdn/e1.mp4")))
            .await;
        tokio::task::yield_now().await;

        let after = session.snapshot().await;
        assert_eq!(after.selection, s1e2);
        assert_eq!(after.sources, None);
        assert_eq!(after.machine.state, PlaybackState::SandboxedEmbed { loaded: false });
    }

    #[tokio::test(start_paused = true)]
    async fn embed_that_never_loads_times_out() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        settled(&session).await;

        tokio::time::sleep(Duration::from_secs(16)).await;
        let snapshot = session.snapshot().await;
        assert_eq!(
            snapshot.machine.state,
            PlaybackState::Error { failure: PlaybackFailure::EmbedTimedOut }
        );

        let retried = session
            .handle_event(
                ClientEvent {
                    kind: ClientEventKind::Retry,
                    surface: snapshot.machine.surface,
                },
                "",
            )
            .await;
        assert_eq!(
            retried.snapshot.machine.state,
            PlaybackState::SandboxedEmbed { loaded: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_embed_disarms_the_timer() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        let snapshot = settled(&session).await;

        session
            .handle_event(
                ClientEvent {
                    kind: ClientEventKind::EmbedLoaded,
                    surface: snapshot.machine.surface,
                },
                "",
            )
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            session.snapshot().await.machine.state,
            PlaybackState::SandboxedEmbed { loaded: true }
        );
    }

    #[tokio::test]
    async fn direct_error_falls_back_once_and_ignores_stale_surfaces() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.answer(Some(Selection::new(1, 1)), Ok(direct_sources("https://cdn/e1.mp4")));
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        let direct = settled(&session).await;
        assert_eq!(direct.machine.state, PlaybackState::Direct);

        let error = ClientEvent {
            kind: ClientEventKind::DirectError,
            surface: direct.machine.surface,
        };
        let embed = session.handle_event(error, "").await.snapshot;
        assert_eq!(embed.machine.state, PlaybackState::SandboxedEmbed { loaded: false });

        // the old video element reporting again is ignored
        let again = session.handle_event(error, "").await.snapshot;
        assert_eq!(again.machine, embed.machine);

        let try_direct = session
            .handle_event(
                ClientEvent {
                    kind: ClientEventKind::TryDirect,
                    surface: embed.machine.surface,
                },
                "",
            )
            .await
            .snapshot;
        assert_eq!(try_direct.machine.state, PlaybackState::SandboxedEmbed { loaded: false });
    }

    #[tokio::test]
    async fn open_external_returns_embed_url() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        let snapshot = settled(&session).await;

        let response = session
            .handle_event(
                ClientEvent {
                    kind: ClientEventKind::OpenExternal,
                    surface: snapshot.machine.surface,
                },
                "",
            )
            .await;
        assert_eq!(response.external_url, snapshot.embed_url);
        assert_eq!(response.snapshot.machine, snapshot.machine);
    }

    #[tokio::test]
    async fn ended_advances_and_history_navigation_reconciles() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let deps = deps(fetcher, Some("https://fallback.example.org"));
        let store = deps.store.clone();
        store
            .update_progress(
                "8123",
                Some(Selection::new(2, 1)),
                ProgressUpdate::from_position(120.0, 1200.0).unwrap(),
            )
            .await;

        let title = Arc::new(series(&[(1, &[1]), (2, &[1])]));
        let session = PlayerSession::mount(title, &UrlSelection::default(), deps).await;
        let first = settled(&session).await;

        let response = session
            .handle_event(
                ClientEvent {
                    kind: ClientEventKind::Ended,
                    surface: first.machine.surface,
                },
                "",
            )
            .await;
        assert_eq!(response.query.as_deref(), Some("season=2&episode=1"));
        assert_eq!(response.snapshot.selection, Some(Selection::new(2, 1)));
        assert_eq!(response.snapshot.resume_at, Some(120.0));
        assert_eq!(
            store.get_last_watched("8123").await.map(|r| r.selection()),
            Some(Selection::new(2, 1))
        );

        let echoed = session
            .navigate(&UrlSelection::from_query("season=2&episode=1"))
            .await;
        assert_eq!(echoed.snapshot.selection, Some(Selection::new(2, 1)));
        assert_eq!(echoed.query, None);

        let back = session
            .navigate(&UrlSelection::from_query("season=1&episode=1"))
            .await;
        assert_eq!(back.snapshot.selection, Some(Selection::new(1, 1)));
        assert_eq!(back.query, None);
    }

    #[tokio::test]
    async fn selecting_unknown_episode_is_rejected() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session =
            PlayerSession::mount(title, &UrlSelection::default(), deps(fetcher, None)).await;
        assert!(matches!(
            session.select(Selection::new(3, 3), "").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn mount_query_mirrors_resolved_selection() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let deps = deps(fetcher, None);
        deps.store
            .set_last_watched("8123", Selection::new(1, 3).into())
            .await;

        let title = Arc::new(series(&[(1, &[1, 2, 3])]));
        let session =
            PlayerSession::mount(title, &UrlSelection::from_query("ref=home"), deps).await;

        assert_eq!(
            session.mount_query("ref=home").await.as_deref(),
            Some("ref=home&season=1&episode=3")
        );
        assert_eq!(session.mount_query("season=1&episode=3").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_leaves_no_embed_timer_behind() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        settled(&session).await;

        let mut updates = session.subscribe();
        updates.borrow_and_update();
        assert!(session.inner.lock().await.embed_timer.is_some());
        session.close().await;
        assert!(session.inner.lock().await.embed_timer.is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!updates.has_changed().unwrap());
        assert_eq!(
            session.snapshot().await.machine.state,
            PlaybackState::SandboxedEmbed { loaded: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn registry_removal_stops_the_embed_timer() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let title = Arc::new(series(&[(1, &[1])]));
        let session = PlayerSession::mount(
            title,
            &UrlSelection::default(),
            deps(fetcher, Some("https://fallback.example.org")),
        )
        .await;
        settled(&session).await;
        let id = session.id();
        registry.insert(session.clone()).await;

        let mut updates = session.subscribe();
        updates.borrow_and_update();
        registry.remove(id).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!updates.has_changed().unwrap());
        assert_ne!(
            session.snapshot().await.machine.state,
            PlaybackState::Error { failure: PlaybackFailure::EmbedTimedOut }
        );
    }

    #[tokio::test]
    async fn registry_drops_closed_sessions() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let registry = SessionRegistry::new(Duration::from_secs(3600));
        let title = Arc::new(series(&[(1, &[1])]));
        let session =
            PlayerSession::mount(title, &UrlSelection::default(), deps(fetcher, None)).await;
        let id = session.id();

        registry.insert(session).await;
        assert!(registry.get(id).await.is_ok());
        registry.remove(id).await;
        assert!(matches!(registry.get(id).await, Err(AppError::SessionNotFound)));
    }
}
