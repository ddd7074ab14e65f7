use std::collections::BTreeMap;

use url::form_urlencoded;

use crate::catalog::{Selection, Title};
use crate::content_api::{Category, TitleList, TitleSummary};
use crate::continuity::{ContinueWatchingEntry, WatchProgress};
use crate::playback::{
    PlaybackFailure, PlaybackState, EMBED_ALLOW, EMBED_REFERRER_POLICY, EMBED_SANDBOX,
    EXTERNAL_WINDOW_FEATURES,
};
use crate::session::SessionSnapshot;

const PLACEHOLDER: &str = "/static/placeholder.svg";

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// `/title/{id}` with the id percent-encoded as a single path segment.
fn title_path(id: &str) -> String {
    let segment: String = form_urlencoded::byte_serialize(id.as_bytes()).collect();
    // form encoding writes spaces as '+', which a path would keep literally
    format!("/title/{}", segment.replace('+', "%20"))
}

fn title_link(id: &str, selection: Option<Selection>) -> String {
    match selection {
        Some(s) => format!("{}?season={}&episode={}", title_path(id), s.season, s.episode),
        None => title_path(id),
    }
}

fn progress_bar(progress: &WatchProgress) -> String {
    format!(
        r#"<div class="progress-bar"><div class="progress-bar-fill" style="width: {:.0}%;"></div></div>"#,
        progress.percentage
    )
}

fn render_card(item: &TitleSummary) -> String {
    let cover = item.cover.as_deref().unwrap_or(PLACEHOLDER);
    let meta = match (item.year(), item.rating) {
        (Some(year), Some(rating)) => format!("{} · ⭐ {:.1}", year, rating),
        (Some(year), None) => year.to_string(),
        (None, Some(rating)) => format!("⭐ {:.1}", rating),
        (None, None) => String::new(),
    };
    format!(
        r#"<div class="content-card"><a href="{}"><img src="{}" alt="{}" loading="lazy" onerror="this.src='{}'"><div class="card-info"><h3>{}</h3><p class="rating">{}</p></div></a></div>"#,
        escape_html(&title_path(&item.id)),
        escape_html(cover),
        escape_html(&item.title),
        PLACEHOLDER,
        escape_html(&item.title),
        meta
    )
}

fn render_continue_card(entry: &ContinueWatchingEntry) -> String {
    let name = entry
        .progress
        .title_name
        .as_deref()
        .unwrap_or(entry.title_id.as_str());
    let cover = entry.progress.cover.as_deref().unwrap_or(PLACEHOLDER);
    let label = entry
        .selection
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Movie".to_string());
    format!(
        r#"<div class="content-card"><a href="{}"><img src="{}" alt="{}" onerror="this.src='{}'"><div class="card-info"><h3>{}</h3><p class="rating">{}</p>{}</div></a></div>"#,
        escape_html(&title_link(&entry.title_id, entry.selection)),
        escape_html(cover),
        escape_html(name),
        PLACEHOLDER,
        escape_html(name),
        label,
        progress_bar(&entry.progress)
    )
}

pub fn render_home(
    continue_watching: &[ContinueWatchingEntry],
    shelves: &[(Category, TitleList)],
) -> String {
    let mut html = String::new();

    html.push_str(&base_start("StreamShelf"));
    html.push_str(
        r#"
    <div class="home-page">
        <h1>StreamShelf</h1>
        <form class="search-box" action="/search" method="get">
            <input type="text" name="q" placeholder="Search movies, series, anime...">
            <button type="submit">Search</button>
        </form>
"#,
    );

    if !continue_watching.is_empty() {
        html.push_str(
            r#"<section class="content-section"><div class="section-header"><h2>Continue Watching</h2><a href="/history">See all</a></div><div class="content-row">"#,
        );
        for entry in continue_watching.iter().take(10) {
            html.push_str(&render_continue_card(entry));
        }
        html.push_str("</div></section>");
    }

    for (category, list) in shelves {
        html.push_str(&format!(
            r#"<section class="content-section"><div class="section-header"><h2>{}</h2><a href="/category/{}">More</a></div><div class="content-row">"#,
            category.label(),
            category.slug()
        ));
        for item in list.items.iter().take(12) {
            html.push_str(&render_card(item));
        }
        html.push_str("</div></section>");
    }

    html.push_str("</div>");
    html.push_str(&base_end());
    html
}

pub fn render_category(category: Category, list: &TitleList, page: u32) -> String {
    let mut html = String::new();

    html.push_str(&base_start(&format!("{} - StreamShelf", category.label())));
    html.push_str(&format!(
        r#"<div class="category-page"><h1>{}</h1><div class="content-grid">"#,
        category.label()
    ));

    if list.items.is_empty() {
        html.push_str(r#"<div class="no-results"><p>Nothing here yet.</p></div>"#);
    }
    for item in &list.items {
        html.push_str(&render_card(item));
    }
    html.push_str("</div>");
    html.push_str(&pager(&format!("/category/{}?", category.slug()), page, list.has_more));
    html.push_str("</div>");

    html.push_str(&base_end());
    html
}

pub fn render_search(query: &str, results: &TitleList, page: u32) -> String {
    let mut html = String::new();

    html.push_str(&base_start("Search - StreamShelf"));
    html.push_str(&format!(
        r#"
    <div class="search-page">
        <h1>Search</h1>
        <form class="search-box" action="/search" method="get">
            <input type="text" name="q" placeholder="Search movies, series, anime..." value="{}" autofocus>
            <button type="submit">Search</button>
        </form>
        <div class="content-grid">
"#,
        escape_html(query)
    ));

    if !query.trim().is_empty() && results.items.is_empty() {
        html.push_str(&format!(
            r#"<div class="no-results"><p>No results for "{}".</p></div>"#,
            escape_html(query)
        ));
    }
    for item in &results.items {
        html.push_str(&render_card(item));
    }
    html.push_str("</div>");

    if !query.trim().is_empty() {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        html.push_str(&pager(&format!("/search?q={}&", encoded), page, results.has_more));
    }
    html.push_str("</div>");

    html.push_str(&base_end());
    html
}

fn pager(prefix: &str, page: u32, has_more: bool) -> String {
    let mut html = String::from(r#"<div class="pager">"#);
    if page > 1 {
        html.push_str(&format!(
            r#"<a href="{}page={}">← Previous</a>"#,
            escape_html(prefix),
            page - 1
        ));
    }
    if has_more {
        html.push_str(&format!(
            r#"<a href="{}page={}">Next →</a>"#,
            escape_html(prefix),
            page + 1
        ));
    }
    html.push_str("</div>");
    html
}

/// Detail page with the player surface and, for series, the episode browser.
pub fn render_title(
    title: &Title,
    snapshot: &SessionSnapshot,
    progress: &BTreeMap<Selection, WatchProgress>,
    own_progress: Option<&WatchProgress>,
    mount_query: Option<&str>,
) -> String {
    let mut html = String::new();

    html.push_str(&base_start(&format!("{} - StreamShelf", title.name)));

    let cover = title.cover.as_deref().unwrap_or(PLACEHOLDER);
    let year = title
        .release_date
        .as_deref()
        .and_then(|d| d.split('-').next())
        .unwrap_or("");
    let genres = title.genres.join(", ");
    let description = title
        .description
        .as_deref()
        .unwrap_or("No description available.");
    let selection_json = snapshot
        .selection
        .and_then(|s| serde_json::to_string(&s).ok())
        .unwrap_or_default();

    html.push_str(&format!(
        r#"<div class="detail-page"><div class="detail-content"><img class="detail-poster" src="{}" alt="{}" onerror="this.src='{}'"><div class="detail-info"><h1>{}</h1><div class="meta"><span class="year">{}</span><span class="episodes">{}</span></div><p class="genres">{}</p><p class="overview">{}</p></div></div>"#,
        escape_html(cover),
        escape_html(&title.name),
        PLACEHOLDER,
        escape_html(&title.name),
        escape_html(year),
        if title.is_episodic() {
            format!("{} episodes", title.episode_count())
        } else {
            String::new()
        },
        escape_html(&genres),
        escape_html(description)
    ));

    html.push_str(&format!(
        r#"<div class="player-container"><div id="player-root" data-session="{}" data-title-id="{}" data-title-name="{}" data-cover="{}" data-surface="{}" data-selection="{}"{}>"#,
        snapshot.session_id,
        escape_html(&title.id),
        escape_html(&title.name),
        escape_html(title.cover.as_deref().unwrap_or("")),
        snapshot.machine.surface,
        escape_html(&selection_json),
        mount_query
            .map(|q| format!(r#" data-query="{}""#, escape_html(q)))
            .unwrap_or_default()
    ));
    html.push_str(&render_surface(title, snapshot));
    html.push_str("</div></div>");

    if title.is_episodic() {
        html.push_str(&render_episode_browser(title, snapshot.selection, progress));
    } else if let Some(p) = own_progress.filter(|p| p.is_in_progress()) {
        html.push_str(&progress_bar(p));
    }

    html.push_str("</div>");
    html.push_str(&format!(
        "<script>const EXTERNAL_WINDOW_FEATURES = \"{}\";</script>",
        EXTERNAL_WINDOW_FEATURES
    ));
    html.push_str(PLAYER_SCRIPT);
    html.push_str(&base_end());
    html
}

fn render_episode_browser(
    title: &Title,
    current: Option<Selection>,
    progress: &BTreeMap<Selection, WatchProgress>,
) -> String {
    let mut html = String::from(r#"<section class="seasons-section" id="episode-browser">"#);

    for season in &title.seasons {
        html.push_str(&format!(
            r#"<div class="season-item"><h2>{}</h2><ol class="episode-list">"#,
            escape_html(&season.label())
        ));
        for episode in &season.episodes {
            let selection = Selection::new(season.number, episode.number);
            let active = if current == Some(selection) { " active" } else { "" };
            let name = episode
                .title
                .clone()
                .unwrap_or_else(|| format!("Episode {}", episode.number));
            let badge = match progress.get(&selection) {
                Some(p) if p.is_watched() => r#"<span class="completed-badge">✓ Watched</span>"#.to_string(),
                Some(p) if p.is_in_progress() => progress_bar(p),
                _ => String::new(),
            };
            html.push_str(&format!(
                r#"<li><a class="episode-link{}" href="?season={}&episode={}" data-season="{}" data-episode="{}"><span class="episode-number">{}</span><span class="episode-title">{}</span><span class="episode-runtime">{}</span>{}</a></li>"#,
                active,
                season.number,
                episode.number,
                season.number,
                episode.number,
                episode.number,
                escape_html(&name),
                escape_html(episode.runtime.as_deref().unwrap_or("")),
                badge
            ));
        }
        html.push_str("</ol></div>");
    }

    html.push_str("</section>");
    html
}

/// The playback surface for one snapshot. Every element carries the surface
/// generation so events from a replaced surface can be told apart.
pub fn render_surface(title: &Title, snapshot: &SessionSnapshot) -> String {
    let machine = &snapshot.machine;
    let surface = machine.surface;
    let mut html = format!(
        r#"<div class="player-surface" data-surface="{}" data-mode="{}">"#,
        surface,
        mode_name(&machine.state)
    );

    match machine.state {
        PlaybackState::Loading => {
            html.push_str(r#"<div class="player-loading"><div class="spinner"></div><p>Finding sources...</p></div>"#);
        }
        PlaybackState::Direct => {
            html.push_str(&format!(
                r#"<video id="videoPlayer" class="video-player" controls autoplay playsinline crossorigin="anonymous" data-resume="{}">"#,
                snapshot.resume_at.map(|t| format!("{:.1}", t)).unwrap_or_default()
            ));
            if let Some(sources) = &snapshot.sources {
                for source in &sources.downloads {
                    html.push_str(&format!(
                        r#"<source src="{}"{}>"#,
                        escape_html(&source.url),
                        source
                            .resolution
                            .map(|r| format!(r#" data-resolution="{}""#, r))
                            .unwrap_or_default()
                    ));
                }
                for (index, track) in sources.native_captions().enumerate() {
                    html.push_str(&format!(
                        r#"<track kind="subtitles" srclang="{}" label="{}" src="{}"{}>"#,
                        escape_html(&track.language),
                        escape_html(track.display_label()),
                        escape_html(&track.url),
                        if index == 0 { " default" } else { "" }
                    ));
                }
            }
            html.push_str("</video>");

            if let Some(sources) = &snapshot.sources {
                let downloads: Vec<String> = sources
                    .download_only_captions()
                    .map(|track| {
                        format!(
                            r#"<a href="{}" download rel="noreferrer">{}</a>"#,
                            escape_html(&track.url),
                            escape_html(track.display_label())
                        )
                    })
                    .collect();
                if !downloads.is_empty() {
                    html.push_str(&format!(
                        r#"<div class="caption-downloads">Subtitles: {}</div>"#,
                        downloads.join(" ")
                    ));
                }
            }
        }
        PlaybackState::SandboxedEmbed { loaded } => {
            if let Some(url) = &snapshot.embed_url {
                if !loaded {
                    html.push_str(r#"<div class="player-loading embed-pending"><div class="spinner"></div></div>"#);
                }
                html.push_str(r#"<div class="consent-shield" role="button" tabindex="0">▶ Click to start</div>"#);
                html.push_str(&format!(
                    r#"<iframe id="embedPlayer" class="video-player" src="{}" sandbox="{}" referrerpolicy="{}" allow="{}" allowfullscreen title="{}"></iframe>"#,
                    escape_html(url),
                    EMBED_SANDBOX,
                    EMBED_REFERRER_POLICY,
                    EMBED_ALLOW,
                    escape_html(&title.name)
                ));
            }
        }
        PlaybackState::Unavailable => {
            html.push_str(r#"<div class="player-message"><p>No playable source is available for this title.</p></div>"#);
        }
        PlaybackState::Error { failure } => {
            let message = match failure {
                PlaybackFailure::DirectFailed => "The video could not be played.",
                PlaybackFailure::EmbedFailed => "The embedded player failed to load.",
                PlaybackFailure::EmbedTimedOut => "The embedded player did not respond in time.",
            };
            html.push_str(&format!(
                r#"<div class="player-message error-message"><p>{}</p></div>"#,
                message
            ));
        }
    }

    html.push_str(r#"<div class="player-actions">"#);
    match machine.state {
        PlaybackState::Error { .. } | PlaybackState::Unavailable => {
            html.push_str(r#"<button data-action="retry">↻ Retry</button>"#);
        }
        PlaybackState::Direct if machine.has_embed => {
            html.push_str(r#"<button data-action="use_embed">Use embedded player</button>"#);
        }
        _ => {}
    }
    if machine.can_try_direct() && !machine.is_loading() {
        html.push_str(r#"<button data-action="try_direct">Try direct stream</button>"#);
    }
    if machine.can_open_external() {
        html.push_str(r#"<button data-action="open_external">Open in new tab ↗</button>"#);
    }
    html.push_str("</div></div>");
    html
}

fn mode_name(state: &PlaybackState) -> &'static str {
    match state {
        PlaybackState::Loading => "loading",
        PlaybackState::Direct => "direct",
        PlaybackState::SandboxedEmbed { .. } => "embed",
        PlaybackState::Unavailable => "unavailable",
        PlaybackState::Error { .. } => "error",
    }
}

pub fn render_history(entries: &[ContinueWatchingEntry]) -> String {
    let mut html = String::new();

    html.push_str(&base_start("Continue Watching - StreamShelf"));
    html.push_str(
        r#"
    <div class="history-page">
        <h1>Continue Watching</h1>
"#,
    );

    if entries.is_empty() {
        html.push_str(
            r#"<div class="no-results">
            <p>Nothing in progress.</p>
            <a href="/" class="play-button">Browse the catalog</a>
        </div>"#,
        );
    } else {
        html.push_str(r#"<div class="content-grid">"#);
        for entry in entries {
            html.push_str(&render_continue_card(entry));
        }
        html.push_str("</div>");
    }

    html.push_str("</div>");
    html.push_str(
        r#"<script>
    new EventSource("/api/continuity/events").addEventListener("continuity", function () {
        window.location.reload();
    });
    </script>"#,
    );
    html.push_str(&base_end());
    html
}

fn base_start(title: &str) -> String {
    let categories: String = Category::ALL
        .iter()
        .filter(|c| **c != Category::Trending)
        .map(|c| format!(r#"<a href="/category/{}">{}</a>"#, c.slug(), c.label()))
        .collect::<Vec<_>>()
        .join("\n            ");

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta name="referrer" content="no-referrer">
    <title>{}</title>
    <link rel="stylesheet" href="/static/style.css">
</head>
<body>
    <nav class="navbar">
        <div class="nav-brand">
            <a href="/">StreamShelf</a>
        </div>
        <div class="nav-links">
            <a href="/">Home</a>
            {}
            <a href="/search">Search</a>
            <a href="/history">History</a>
        </div>
    </nav>
    <main>"#,
        escape_html(title),
        categories
    )
}

fn base_end() -> String {
    String::from(r#"</main></body></html>"#)
}

const PLAYER_SCRIPT: &str = r#"
    <script>
    (function () {
        var root = document.getElementById("player-root");
        if (!root) return;
        var sessionId = root.dataset.session;
        var titleId = root.dataset.titleId;
        var selection = root.dataset.selection ? JSON.parse(root.dataset.selection) : null;
        var surface = Number(root.dataset.surface);
        var latest = surface;
        var lastReport = 0;

        if (root.dataset.query) {
            history.replaceState(null, "", "?" + root.dataset.query);
        }

        function query() {
            return window.location.search.replace(/^\?/, "");
        }

        function post(path, body) {
            return fetch("/api/sessions/" + sessionId + path, {
                method: "POST",
                headers: { "Content-Type": "application/json" },
                body: JSON.stringify(body || {})
            }).then(function (r) {
                if (r.status === 410) { window.location.reload(); }
                return r.ok ? r.json() : Promise.reject(r.status);
            });
        }

        function send(kind) {
            return post("/events", { kind: kind, surface: surface, query: query() })
                .then(apply)
                .catch(function (e) { console.log("Player event failed:", e); });
        }

        function apply(response) {
            if (response.query) {
                history.pushState(null, "", "?" + response.query);
            }
            if (response.external_url) {
                window.open(response.external_url, "_blank", EXTERNAL_WINDOW_FEATURES);
            }
            render(response.snapshot);
        }

        function render(snapshot) {
            var generation = snapshot.machine.surface;
            if (generation < latest) return;
            selection = snapshot.selection;
            markSelection();
            if (generation === latest) return;
            latest = generation;
            fetch("/api/sessions/" + sessionId + "/surface")
                .then(function (r) { return r.text(); })
                .then(function (html) {
                    var holder = document.createElement("div");
                    holder.innerHTML = html;
                    var fresh = holder.querySelector(".player-surface");
                    if (!fresh) return;
                    var rendered = Number(fresh.dataset.surface);
                    // fragments can arrive out of order; never step back
                    if (rendered < latest || rendered <= surface) return;
                    latest = rendered;
                    surface = rendered;
                    root.replaceChildren(fresh);
                    bind();
                });
        }

        function markSelection() {
            document.querySelectorAll(".episode-link").forEach(function (link) {
                var active = selection &&
                    Number(link.dataset.season) === selection.season &&
                    Number(link.dataset.episode) === selection.episode;
                link.classList.toggle("active", !!active);
            });
        }

        function report(currentTime, duration, force) {
            if (!duration || !isFinite(duration) || currentTime < 0) return;
            var now = Date.now();
            if (!force && now - lastReport < 10000) return;
            lastReport = now;
            fetch("/api/progress", {
                method: "POST",
                headers: { "Content-Type": "application/json" },
                body: JSON.stringify({
                    title_id: titleId,
                    season: selection ? selection.season : null,
                    episode: selection ? selection.episode : null,
                    current_time: currentTime,
                    duration: duration,
                    title_name: root.dataset.titleName || null,
                    cover: root.dataset.cover || null
                })
            }).catch(function (e) { console.log("Progress save failed:", e); });
        }

        function bind() {
            var video = root.querySelector("video");
            if (video) {
                var sources = video.querySelectorAll("source");
                var lastSource = sources[sources.length - 1];
                video.addEventListener("error", function () { send("direct_error"); });
                if (lastSource) lastSource.addEventListener("error", function () { send("direct_error"); });
                video.addEventListener("loadedmetadata", function () {
                    var resume = Number(video.dataset.resume);
                    if (resume > 0 && resume < video.duration) video.currentTime = resume;
                });
                video.addEventListener("timeupdate", function () { report(video.currentTime, video.duration, false); });
                video.addEventListener("pause", function () { report(video.currentTime, video.duration, true); });
                video.addEventListener("ended", function () {
                    report(video.duration, video.duration, true);
                    send("ended");
                });
            }

            var frame = root.querySelector("iframe");
            if (frame) {
                frame.addEventListener("load", function () { send("embed_loaded"); });
                frame.addEventListener("error", function () { send("embed_error"); });
            }

            var shield = root.querySelector(".consent-shield");
            if (shield) {
                shield.addEventListener("click", function (e) {
                    e.preventDefault();
                    e.stopPropagation();
                    shield.remove();
                }, { once: true });
            }

            root.querySelectorAll("[data-action]").forEach(function (button) {
                button.addEventListener("click", function () { send(button.dataset.action); });
            });
        }

        document.querySelectorAll(".episode-link").forEach(function (link) {
            link.addEventListener("click", function (e) {
                e.preventDefault();
                post("/select", {
                    season: Number(link.dataset.season),
                    episode: Number(link.dataset.episode),
                    query: query()
                }).then(apply).catch(function (e) { console.log("Select failed:", e); });
            });
        });

        window.addEventListener("popstate", function () {
            post("/navigate", { query: query() })
                .then(function (response) { render(response.snapshot); })
                .catch(function (e) { console.log("Navigate failed:", e); });
        });

        // Embedded players report position through postMessage
        window.addEventListener("message", function (event) {
            var frame = root.querySelector("iframe");
            if (!frame || event.source !== frame.contentWindow) return;
            try {
                var data = typeof event.data === "string" ? JSON.parse(event.data) : event.data;
                if (!data || data.type !== "PLAYER_EVENT" || !data.data) return;
                report(data.data.currentTime || 0, data.data.duration || 0, data.data.event !== "timeupdate");
                if (data.data.event === "ended") send("ended");
            } catch (e) {
                // not a player message
            }
        });

        var updates = new EventSource("/api/sessions/" + sessionId + "/stream");
        updates.addEventListener("snapshot", function (e) { render(JSON.parse(e.data)); });

        window.addEventListener("pagehide", function () {
            updates.close();
            navigator.sendBeacon("/api/sessions/" + sessionId + "/close");
        });

        bind();
        markSelection();
    })();
    </script>
"#;
