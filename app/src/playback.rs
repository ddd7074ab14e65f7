//! Playback surface state machine.
//!
//! [`transition`] is pure: it takes the current [`PlaybackMachine`] and an
//! event and returns the next machine plus the side effects the caller must
//! perform (timers, opening a window, rebuilding the surface).

use serde::Serialize;
use tracing::debug;

/// Sandbox tokens for the embed iframe. Scripts and same-origin access are
/// needed by third-party players; popups and top navigation are never granted.
pub const EMBED_SANDBOX: &str = "allow-scripts allow-same-origin allow-presentation";
pub const EMBED_REFERRER_POLICY: &str = "no-referrer";
pub const EMBED_ALLOW: &str = "autoplay; fullscreen; encrypted-media; picture-in-picture";
/// Window features for the external escape hatch.
pub const EXTERNAL_WINDOW_FEATURES: &str = "noopener,noreferrer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackFailure {
    DirectFailed,
    EmbedFailed,
    EmbedTimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PlaybackState {
    /// Stream sources are still being fetched.
    Loading,
    Direct,
    SandboxedEmbed {
        loaded: bool,
    },
    /// Neither a direct source nor an embed URL exists.
    Unavailable,
    Error {
        failure: PlaybackFailure,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    SourcesLoaded { has_direct: bool },
    SourcesFailed,
    DirectError,
    EmbedLoaded,
    EmbedError,
    EmbedTimeout,
    TryDirect,
    UseEmbed,
    Retry,
    OpenExternal,
    /// New selection; `has_embed` describes the new selection's embed URL.
    Reset { has_embed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEffect {
    ArmEmbedTimeout,
    DisarmEmbedTimeout,
    OpenExternal,
    RecreateSurface,
    RefetchSources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackMachine {
    pub state: PlaybackState,
    pub has_direct: bool,
    pub has_embed: bool,
    /// Set once the direct surface errored for the current selection.
    pub direct_failed: bool,
    /// Surface generation; bumped whenever the rendered surface must be rebuilt.
    pub surface: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub machine: PlaybackMachine,
    pub effects: Vec<PlaybackEffect>,
}

impl PlaybackMachine {
    pub fn new(has_embed: bool) -> Self {
        Self {
            state: PlaybackState::Loading,
            has_direct: false,
            has_embed,
            direct_failed: false,
            surface: 0,
        }
    }

    pub fn can_try_direct(&self) -> bool {
        self.has_direct && !self.direct_failed && self.state != PlaybackState::Direct
    }

    pub fn can_open_external(&self) -> bool {
        self.has_embed
    }

    pub fn is_loading(&self) -> bool {
        self.state == PlaybackState::Loading
    }

    pub fn apply(self, event: PlaybackEvent) -> Transition {
        transition(self, event)
    }
}

pub fn transition(machine: PlaybackMachine, event: PlaybackEvent) -> Transition {
    use PlaybackEvent as E;
    use PlaybackState as S;

    let mut next = machine;
    let mut effects = Vec::new();

    match (machine.state, event) {
        (_, E::Reset { has_embed }) => {
            next = PlaybackMachine {
                surface: machine.surface + 1,
                ..PlaybackMachine::new(has_embed)
            };
            effects.push(PlaybackEffect::DisarmEmbedTimeout);
            effects.push(PlaybackEffect::RecreateSurface);
        }
        (S::Loading, E::SourcesLoaded { has_direct }) => {
            next.has_direct = has_direct;
            enter_best(&mut next, &mut effects);
        }
        (S::Loading, E::SourcesFailed) => {
            next.has_direct = false;
            enter_best(&mut next, &mut effects);
        }
        (S::Direct, E::DirectError) => {
            next.direct_failed = true;
            if next.has_embed {
                enter_embed(&mut next, &mut effects);
            } else {
                enter(&mut next, &mut effects, S::Error { failure: PlaybackFailure::DirectFailed });
            }
        }
        (S::SandboxedEmbed { loaded: false }, E::EmbedLoaded) => {
            next.state = S::SandboxedEmbed { loaded: true };
            effects.push(PlaybackEffect::DisarmEmbedTimeout);
        }
        (S::SandboxedEmbed { .. }, E::EmbedError) => {
            enter(&mut next, &mut effects, S::Error { failure: PlaybackFailure::EmbedFailed });
        }
        (S::SandboxedEmbed { loaded: false }, E::EmbedTimeout) => {
            enter(&mut next, &mut effects, S::Error { failure: PlaybackFailure::EmbedTimedOut });
        }
        (S::SandboxedEmbed { .. } | S::Error { .. }, E::TryDirect) if machine.can_try_direct() => {
            enter(&mut next, &mut effects, S::Direct);
        }
        (S::Direct, E::UseEmbed) if machine.has_embed => {
            enter_embed(&mut next, &mut effects);
        }
        (S::Error { failure: PlaybackFailure::DirectFailed }, E::Retry) => {
            enter(&mut next, &mut effects, S::Direct);
        }
        (S::Error { .. }, E::Retry) if machine.has_embed => {
            enter_embed(&mut next, &mut effects);
        }
        (S::Unavailable, E::Retry) => {
            enter(&mut next, &mut effects, S::Loading);
            effects.push(PlaybackEffect::RefetchSources);
        }
        (_, E::OpenExternal) if machine.has_embed => {
            effects.push(PlaybackEffect::OpenExternal);
        }
        (state, event) => {
            debug!("Ignoring {:?} in {:?}", event, state);
        }
    }

    Transition {
        machine: next,
        effects,
    }
}

fn enter_best(machine: &mut PlaybackMachine, effects: &mut Vec<PlaybackEffect>) {
    if machine.has_direct && !machine.direct_failed {
        enter(machine, effects, PlaybackState::Direct);
    } else if machine.has_embed {
        enter_embed(machine, effects);
    } else {
        enter(machine, effects, PlaybackState::Unavailable);
    }
}

fn enter_embed(machine: &mut PlaybackMachine, effects: &mut Vec<PlaybackEffect>) {
    enter(machine, effects, PlaybackState::SandboxedEmbed { loaded: false });
    effects.push(PlaybackEffect::ArmEmbedTimeout);
}

fn enter(machine: &mut PlaybackMachine, effects: &mut Vec<PlaybackEffect>, state: PlaybackState) {
    if matches!(machine.state, PlaybackState::SandboxedEmbed { .. }) {
        effects.push(PlaybackEffect::DisarmEmbedTimeout);
    }
    machine.state = state;
    machine.surface += 1;
    effects.push(PlaybackEffect::RecreateSurface);
}
