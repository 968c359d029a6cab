// The polling state machine. Spotify never reports skips, so we infer
// them: a track transition well short of the previous track's duration is
// a skip. Classification is a pure function of (observation, playback, now)
// so it can be tested without timers or network.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::MonitorSettings;
use crate::ledger::SkipLedger;
use crate::spotify::{Playback, PlaybackItem, Session, SpotifyClient, SpotifyError};

/// In-memory record of the currently playing track and when it started.
/// Replaced wholesale on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackObservation {
    pub track_id: String,
    pub track_name: String,
    pub artist_name: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchState {
    Idle,
    Observing(TrackObservation),
}

/// A detected skip. Identity comes from the observation that was cut
/// short, never from the incoming track.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipEvent {
    pub track_id: String,
    pub track_name: String,
    pub artist_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollDelay {
    /// A track is under observation, poll on the tight cadence.
    Active,
    /// Nothing observable, poll lazily.
    Idle,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: WatchState,
    pub skip: Option<SkipEvent>,
    pub delay: PollDelay,
}

/// Advance the state machine by one observed playback snapshot.
pub fn advance(
    state: WatchState,
    playback: Option<Playback>,
    now: DateTime<Utc>,
    grace_secs: u64,
) -> Step {
    // Nothing observable: keep whatever we were watching. A paused track
    // that later resumes must not read as a transition, and a pause right
    // before a real skip still classifies against the old anchor.
    let idle = |state| Step {
        state,
        skip: None,
        delay: PollDelay::Idle,
    };

    let Some(playback) = playback else {
        return idle(state);
    };
    if !playback.is_playing {
        return idle(state);
    }
    let Some(item) = playback.item else {
        return idle(state);
    };
    let Some(track_id) = item.id.clone() else {
        // Local files carry no id; we cannot attribute skips to them
        return idle(state);
    };

    if let WatchState::Observing(obs) = &state {
        if obs.track_id == track_id {
            return Step {
                state,
                skip: None,
                delay: PollDelay::Active,
            };
        }
    }

    // Track transition (or first observation after Idle)
    let skip = match &state {
        WatchState::Observing(obs) if is_skip(obs, now, grace_secs) => Some(SkipEvent {
            track_id: obs.track_id.clone(),
            track_name: obs.track_name.clone(),
            artist_name: obs.artist_name.clone(),
        }),
        _ => None,
    };

    Step {
        state: WatchState::Observing(observe(&item, track_id, playback.progress_ms, now)),
        skip,
        delay: PollDelay::Active,
    }
}

/// A transition is a skip iff the outgoing track was cut short of its
/// duration by more than the grace buffer. The buffer absorbs poll
/// granularity and the API's progress slack around natural track ends.
fn is_skip(obs: &TrackObservation, now: DateTime<Utc>, grace_secs: u64) -> bool {
    let elapsed_secs = (now - obs.started_at).num_milliseconds() as f64 / 1000.0;
    let bound_secs = obs.duration_ms as f64 / 1000.0 - grace_secs as f64;
    elapsed_secs < bound_secs
}

fn observe(
    item: &PlaybackItem,
    track_id: String,
    progress_ms: Option<u64>,
    now: DateTime<Utc>,
) -> TrackObservation {
    // Anchor the start in the past by the reported progress, so elapsed
    // math is right even when we first see a track mid-play.
    let started_at = now - ChronoDuration::milliseconds(progress_ms.unwrap_or(0) as i64);
    TrackObservation {
        track_id,
        track_name: item.name.clone(),
        artist_name: item.primary_artist().map(str::to_string),
        duration_ms: item.duration_ms,
        started_at,
    }
}

/// The long-lived polling loop. Exits only when the active flag clears;
/// every failure inside a cycle is logged and followed by a backoff sleep.
pub(crate) async fn run(
    client: SpotifyClient,
    session: Arc<Session>,
    ledger: Arc<SkipLedger>,
    settings: MonitorSettings,
    active: Arc<AtomicBool>,
) {
    let mut state = WatchState::Idle;
    let backoff = Duration::from_secs(settings.error_backoff_secs);
    info!("playback monitor started");

    while active.load(Ordering::SeqCst) {
        // Keep the credential alive before touching the API
        if let Err(e) = session.ensure_fresh().await {
            log_cycle_error("credential refresh", &e);
            tokio::time::sleep(backoff).await;
            continue;
        }

        let playback = match client.current_playback().await {
            Ok(playback) => playback,
            Err(e) => {
                log_cycle_error("playback fetch", &e);
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let step = advance(state, playback, Utc::now(), settings.skip_grace_secs);
        state = step.state;

        if let Some(skip) = step.skip {
            info!(
                track = %skip.track_name,
                artist = skip.artist_name.as_deref().unwrap_or("?"),
                "skip detected"
            );
            // Losing one skip event beats killing the monitor
            if let Err(e) = ledger
                .record_skip(&skip.track_id, &skip.track_name, skip.artist_name.as_deref())
                .await
            {
                warn!("failed to record skip for '{}': {e:#}", skip.track_name);
            }
        }

        let delay = match step.delay {
            PollDelay::Active => Duration::from_secs(settings.active_poll_secs),
            PollDelay::Idle => Duration::from_secs(settings.idle_poll_secs),
        };
        tokio::time::sleep(delay).await;
    }

    info!("playback monitor stopped");
}

fn log_cycle_error(stage: &str, err: &SpotifyError) {
    if err.is_transient() {
        warn!("{stage} failed, backing off: {err}");
    } else {
        error!("{stage} failed with unexpected error: {err:?}");
    }
}
