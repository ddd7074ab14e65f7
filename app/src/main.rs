use axum::{
    extract::{Path, Query, RawQuery, State},
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod catalog;
mod config;
mod content_api;
mod continuity;
mod db;
mod error;
mod playback;
mod playback_url;
mod selection;
mod session;
mod storage;
mod stream_sources;
mod templates;

use crate::config::Config;
use crate::content_api::{Category, ContentClient, TitleList};
use crate::continuity::ContinuityStore;
use crate::error::AppError;
use crate::selection::UrlSelection;
use crate::session::{SessionDeps, SessionRegistry};
use crate::stream_sources::HttpStreamSourceFetcher;

/// Player sessions untouched for this long are torn down.
const SESSION_IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone)]
pub struct AppState {
    pub content: ContentClient,
    pub store: ContinuityStore,
    pub sessions: Arc<SessionRegistry>,
    pub session_deps: SessionDeps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting StreamShelf...");

    let config = Config::new()?;
    info!("Configuration loaded");

    let store = ContinuityStore::new(db::open_storage(&config.database_url).await);

    let content = ContentClient::new(
        &config.content_api_base,
        config.content_api_key.as_deref(),
        config.api_timeout(),
    )?;
    info!("Content API client initialized for {}", config.content_api_base);

    let fetcher = HttpStreamSourceFetcher::new(
        &config.content_api_base,
        config.content_api_key.as_deref(),
        config.stream_timeout(),
    )?;
    if config.player_fallback_base.is_none() {
        warn!("No player_fallback_base configured; titles without player URLs cannot embed");
    }

    let state = AppState {
        content,
        store: store.clone(),
        sessions: Arc::new(SessionRegistry::new(SESSION_IDLE_TTL)),
        session_deps: SessionDeps {
            fetcher: Arc::new(fetcher),
            store,
            fallback_base: config.player_fallback_base.clone(),
            embed_timeout: config.embed_timeout(),
        },
    };

    let app = Router::new()
        .route("/", get(home_page))
        .route("/search", get(search_page))
        .route("/category/:slug", get(category_page))
        .route("/title/:id", get(title_page))
        .route("/history", get(history_page))
        .nest("/api", api::routes(state.clone()))
        .nest_service("/static", ServeDir::new("app/static"))
        .with_state(state);

    let addr: SocketAddr = format!("127.0.0.1:{}", config.port).parse()?;
    info!("Server running on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn home_page(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let continue_watching = state.store.list_continue_watching().await;

    let mut shelves = Vec::new();
    for category in Category::ALL {
        match state.content.category(category, 1).await {
            Ok(list) => shelves.push((category, list)),
            // one broken shelf should not take the home page down
            Err(err) => warn!("Failed to load {} shelf: {}", category.slug(), err),
        }
    }

    Ok(Html(templates::render_home(&continue_watching, &shelves)))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    page: Option<u32>,
}

async fn search_page(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Html<String>, AppError> {
    let query = params.q.unwrap_or_default();
    let page = params.page.unwrap_or(1).max(1);

    let results = if query.trim().len() >= 2 {
        state.content.search(query.trim(), page).await?
    } else {
        TitleList::default()
    };

    Ok(Html(templates::render_search(&query, &results, page)))
}

async fn category_page(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(params): Query<ListQuery>,
) -> Result<Html<String>, AppError> {
    let category = Category::from_slug(&slug).ok_or(AppError::NotFound)?;
    let page = params.page.unwrap_or(1).max(1);
    let list = state.content.category(category, page).await?;
    Ok(Html(templates::render_category(category, &list, page)))
}

async fn title_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Html<String>, AppError> {
    let query = query.unwrap_or_default();
    let title = state.content.get_title(&id).await?;
    let url = UrlSelection::from_query(&query);

    let session = api::open_session(&state, title, &url).await;
    let snapshot = session.snapshot().await;
    let mount_query = session.mount_query(&query).await;
    let title_id = &session.title().id;
    let progress = state.store.progress_for_title(title_id).await;
    let own_progress = if session.title().is_episodic() {
        None
    } else {
        state.store.get_progress(title_id, None).await
    };

    Ok(Html(templates::render_title(
        session.title(),
        &snapshot,
        &progress,
        own_progress.as_ref(),
        mount_query.as_deref(),
    )))
}

async fn history_page(State(state): State<AppState>) -> Html<String> {
    let entries = state.store.list_continue_watching().await;
    Html(templates::render_history(&entries))
}
