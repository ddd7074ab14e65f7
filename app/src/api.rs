use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{
    wrappers::{BroadcastStream, WatchStream},
    Stream, StreamExt,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{Selection, Title},
    content_api::{Category, TitleList},
    continuity::{ContinueWatchingEntry, LastWatched, LastWatchedUpdate, ProgressUpdate, WatchProgress},
    error::AppError,
    selection::UrlSelection,
    session::{ClientEvent, PlayerSession, SessionResponse, SessionSnapshot},
    templates, AppState,
};

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/catalog/:category", get(get_category))
        .route("/search", get(search))
        .route("/titles/:id", get(get_title))
        .route("/titles/:id/progress", get(get_title_progress))
        .route("/progress", post(update_progress))
        .route(
            "/progress/:title_id",
            get(get_progress).delete(clear_progress),
        )
        .route("/continue-watching", get(continue_watching))
        .route(
            "/last-watched/:title_id",
            get(get_last_watched).delete(clear_last_watched),
        )
        .route("/continuity/events", get(continuity_events))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/surface", get(get_surface))
        .route("/sessions/:id/select", post(select_episode))
        .route("/sessions/:id/navigate", post(navigate))
        .route("/sessions/:id/events", post(session_event))
        .route("/sessions/:id/stream", get(session_stream))
        .route("/sessions/:id/close", post(close_session))
        .with_state(state)
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    Event::default()
        .event(name)
        .json_data(payload)
        .map_err(|err| warn!("failed to encode {} event: {}", name, err))
        .ok()
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u32,
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_page")]
    page: u32,
}

fn default_page() -> u32 {
    1
}

/// Optional `season`/`episode` pair; both or neither.
#[derive(Debug, Default, Deserialize)]
struct SelectionQuery {
    #[serde(default)]
    season: Option<u32>,
    #[serde(default)]
    episode: Option<u32>,
}

impl SelectionQuery {
    fn selection(&self) -> Result<Option<Selection>, AppError> {
        match (self.season, self.episode) {
            (Some(season), Some(episode)) => Ok(Some(Selection::new(season, episode))),
            (None, None) => Ok(None),
            _ => Err(AppError::BadRequest(
                "season and episode must be given together".to_string(),
            )),
        }
    }
}

async fn get_category(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<PageQuery>,
) -> Result<Json<TitleList>, AppError> {
    let category = Category::from_slug(&slug).ok_or(AppError::NotFound)?;
    let list = state.content.category(category, params.page.max(1)).await?;
    Ok(Json(list))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<TitleList>, AppError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Ok(Json(TitleList::default()));
    }
    let results = state.content.search(query, params.page.max(1)).await?;
    Ok(Json(results))
}

async fn get_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Title>, AppError> {
    let title = state.content.get_title(&id).await?;
    Ok(Json(title))
}

#[derive(Debug, Serialize)]
struct EpisodeProgress {
    #[serde(flatten)]
    selection: Selection,
    progress: WatchProgress,
}

async fn get_title_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<EpisodeProgress>> {
    let progress = state
        .store
        .progress_for_title(&id)
        .await
        .into_iter()
        .map(|(selection, progress)| EpisodeProgress {
            selection,
            progress,
        })
        .collect();
    Json(progress)
}

#[derive(Deserialize)]
struct ProgressRequest {
    title_id: String,
    #[serde(default)]
    season: Option<u32>,
    #[serde(default)]
    episode: Option<u32>,
    current_time: f64,
    duration: f64,
    #[serde(default)]
    title_name: Option<String>,
    #[serde(default)]
    cover: Option<String>,
}

async fn update_progress(
    State(state): State<AppState>,
    Json(data): Json<ProgressRequest>,
) -> Result<Json<Option<WatchProgress>>, AppError> {
    let selection = SelectionQuery {
        season: data.season,
        episode: data.episode,
    }
    .selection()?;
    let mut update = ProgressUpdate::from_position(data.current_time, data.duration)
        .ok_or_else(|| AppError::BadRequest("invalid playback position".to_string()))?;
    update.title_name = data.title_name;
    update.cover = data.cover;

    state
        .store
        .update_progress(&data.title_id, selection, update)
        .await;

    if let Some(selection) = selection {
        let last = state.store.get_last_watched(&data.title_id).await;
        if last.is_some_and(|r| r.selection() == selection) {
            state
                .store
                .set_last_watched(
                    &data.title_id,
                    LastWatchedUpdate {
                        season: selection.season,
                        episode: selection.episode,
                        playback_offset: Some(data.current_time),
                    },
                )
                .await;
        }
    }

    Ok(Json(state.store.get_progress(&data.title_id, selection).await))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(title_id): Path<String>,
    Query(params): Query<SelectionQuery>,
) -> Result<Json<Option<WatchProgress>>, AppError> {
    let selection = params.selection()?;
    Ok(Json(state.store.get_progress(&title_id, selection).await))
}

async fn clear_progress(
    State(state): State<AppState>,
    Path(title_id): Path<String>,
    Query(params): Query<SelectionQuery>,
) -> Result<StatusCode, AppError> {
    let selection = params.selection()?;
    state.store.clear_progress(&title_id, selection).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn continue_watching(State(state): State<AppState>) -> Json<Vec<ContinueWatchingEntry>> {
    Json(state.store.list_continue_watching().await)
}

async fn get_last_watched(
    State(state): State<AppState>,
    Path(title_id): Path<String>,
) -> Json<Option<LastWatched>> {
    Json(state.store.get_last_watched(&title_id).await)
}

async fn clear_last_watched(
    State(state): State<AppState>,
    Path(title_id): Path<String>,
) -> StatusCode {
    state.store.clear_last_watched(&title_id).await;
    StatusCode::NO_CONTENT
}

async fn continuity_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.subscribe()).filter_map(|item| match item {
        Ok(change) => json_event("continuity", &change).map(Ok),
        Err(err) => {
            warn!("continuity broadcast error: {}", err);
            None
        }
    });

    Sse::new(stream).keep_alive(default_keep_alive())
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    title_id: String,
    #[serde(default)]
    query: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(data): Json<CreateSessionRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let title = state.content.get_title(&data.title_id).await?;
    let session = open_session(&state, title, &UrlSelection::from_query(&data.query)).await;
    Ok(Json(session.snapshot().await))
}

/// Mounts a player session for `title` and registers it.
pub async fn open_session(state: &AppState, title: Title, url: &UrlSelection) -> Arc<PlayerSession> {
    let session = PlayerSession::mount(Arc::new(title), url, state.session_deps.clone()).await;
    state.sessions.insert(session.clone()).await;
    session
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let session = state.sessions.get(id).await?;
    Ok(Json(session.snapshot().await))
}

async fn get_surface(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Html<String>, AppError> {
    let session = state.sessions.get(id).await?;
    let snapshot = session.snapshot().await;
    Ok(Html(templates::render_surface(session.title(), &snapshot)))
}

#[derive(Deserialize)]
struct SelectRequest {
    season: u32,
    episode: u32,
    #[serde(default)]
    query: String,
}

async fn select_episode(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<SelectRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.get(id).await?;
    let response = session
        .select(Selection::new(data.season, data.episode), &data.query)
        .await?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct NavigateRequest {
    #[serde(default)]
    query: String,
}

async fn navigate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<NavigateRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.get(id).await?;
    let response = session
        .navigate(&UrlSelection::from_query(&data.query))
        .await;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct EventRequest {
    #[serde(flatten)]
    event: ClientEvent,
    #[serde(default)]
    query: String,
}

async fn session_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(data): Json<EventRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.get(id).await?;
    Ok(Json(session.handle_event(data.event, &data.query).await))
}

async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session = state.sessions.get(id).await?;
    let stream = WatchStream::new(session.subscribe())
        .filter_map(|snapshot| json_event("snapshot", &snapshot).map(Ok));

    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

async fn close_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    state.sessions.remove(id).await;
    info!("Player session {} closed by page", id);
    StatusCode::NO_CONTENT
}
