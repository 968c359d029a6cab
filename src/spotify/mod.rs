// Spotify integration module - Web API client plus OAuth token lifecycle
// The monitor polls through here; the server proxies playlist reads through here

pub mod auth;

pub use auth::{Session, Token};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Spotify Web API base URL
const API_BASE: &str = "https://api.spotify.com/v1";

/// Failure classes for upstream calls. The monitor swallows transient
/// kinds with a backoff and error-logs the rest without dying.
#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("not authenticated with Spotify")]
    NotAuthenticated,

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("spotify api error ({status}): {message}")]
    Api { status: StatusCode, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl SpotifyError {
    /// Transient failures are expected in a long-lived polling loop and
    /// only warrant a warn + backoff, never a louder reaction.
    pub fn is_transient(&self) -> bool {
        match self {
            SpotifyError::Network(_) | SpotifyError::RateLimited { .. } | SpotifyError::Refresh(_) => {
                true
            }
            SpotifyError::Api { status, .. } => status.is_server_error(),
            SpotifyError::NotAuthenticated => false,
        }
    }
}

/// Current playback snapshot, as reported by `/v1/me/player`.
#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub is_playing: bool,
    pub progress_ms: Option<u64>,
    pub item: Option<PlaybackItem>,
}

/// The track inside a playback snapshot. `id` is null for local files,
/// which we cannot attribute skips to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackItem {
    pub id: Option<String>,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistRef {
    pub name: String,
}

impl PlaybackItem {
    /// Display name of the primary artist, when Spotify reports one.
    pub fn primary_artist(&self) -> Option<&str> {
        self.artists.first().map(|a| a.name.as_str())
    }
}

#[derive(Clone)]
pub struct SpotifyClient {
    http: reqwest::Client,
    session: Arc<Session>,
}

impl SpotifyClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            http: reqwest::Client::new(),
            session,
        }
    }

    /// Fetch the user's current playback state. `None` means nothing is
    /// playing (Spotify answers 204 with an empty body).
    pub async fn current_playback(&self) -> Result<Option<Playback>, SpotifyError> {
        let token = self.session.access_token().await?;

        let resp = self
            .http
            .get(format!("{}/me/player", API_BASE))
            .bearer_auth(token)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(resp.json().await?)),
            status => Err(Self::error_for(status, resp).await),
        }
    }

    /// The user's playlists, passed through verbatim for the dashboard.
    pub async fn current_user_playlists(&self) -> Result<serde_json::Value, SpotifyError> {
        let token = self.session.access_token().await?;

        let resp = self
            .http
            .get(format!("{}/me/playlists", API_BASE))
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            Err(Self::error_for(status, resp).await)
        }
    }

    async fn error_for(status: StatusCode, resp: reqwest::Response) -> SpotifyError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return SpotifyError::RateLimited { retry_after_secs };
        }

        let message = resp.text().await.unwrap_or_default();
        SpotifyError::Api { status, message }
    }
}
