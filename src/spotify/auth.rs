// OAuth token lifecycle for the Spotify Web API.
// Authorization-code flow: the server redirects the user to Spotify, the
// callback hands us a code, and from then on the session refreshes itself.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::SpotifyError;
use crate::config::Credentials;

const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Refresh this many seconds before the token actually expires, so a poll
/// never goes out with a token that dies mid-request.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Scopes: read playback for the monitor, modify for future pruning,
/// private playlists for the dashboard listing.
const SCOPES: &str = "user-read-playback-state user-modify-playback-state playlist-read-private";

/// A bearer credential with its refresh component and wall-clock expiry.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// True once the token is within the proactive refresh margin.
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }

    fn from_grant(grant: TokenGrant, fallback_refresh: Option<String>) -> Self {
        Self {
            access_token: grant.access_token,
            // Spotify omits the refresh token on refresh grants; keep the old one
            refresh_token: grant.refresh_token.or(fallback_refresh),
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
        }
    }
}

/// Shape of a token-endpoint response, for both grant types.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

/// Process-wide Spotify session: app credentials plus the current token.
pub struct Session {
    credentials: Credentials,
    http: reqwest::Client,
    token: RwLock<Option<Token>>,
}

impl Session {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
            token: RwLock::new(None),
        }
    }

    /// The Spotify consent-page URL the user is redirected to.
    pub fn authorize_url(&self) -> String {
        format!(
            "{}/authorize?response_type=code&client_id={}&scope={}&redirect_uri={}",
            ACCOUNTS_BASE,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(SCOPES),
            urlencoding::encode(&self.credentials.redirect_uri),
        )
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Exchange the authorization code from the callback for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<(), SpotifyError> {
        let grant = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.credentials.redirect_uri),
            ])
            .await?;

        let mut guard = self.token.write().await;
        *guard = Some(Token::from_grant(grant, None));
        info!("Spotify session established");
        Ok(())
    }

    /// Refresh the token if it is at or past the expiry margin. Cheap when
    /// the token is still fresh, so callers run it before every use.
    pub async fn ensure_fresh(&self) -> Result<(), SpotifyError> {
        let needs_refresh = {
            let guard = self.token.read().await;
            match guard.as_ref() {
                None => return Err(SpotifyError::NotAuthenticated),
                Some(token) => token.is_expired(),
            }
        };

        if needs_refresh {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Current bearer token, refreshed first when needed.
    pub async fn access_token(&self) -> Result<String, SpotifyError> {
        self.ensure_fresh().await?;
        let guard = self.token.read().await;
        guard
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(SpotifyError::NotAuthenticated)
    }

    async fn refresh(&self) -> Result<(), SpotifyError> {
        let refresh_token = {
            let guard = self.token.read().await;
            guard
                .as_ref()
                .and_then(|t| t.refresh_token.clone())
                .ok_or_else(|| SpotifyError::Refresh("no refresh token on session".to_string()))?
        };

        let grant = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
            ])
            .await
            .map_err(|e| SpotifyError::Refresh(e.to_string()))?;

        let mut guard = self.token.write().await;
        *guard = Some(Token::from_grant(grant, Some(refresh_token)));
        debug!("refreshed Spotify access token");
        Ok(())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, SpotifyError> {
        let resp = self
            .http
            .post(format!("{}/api/token", ACCOUNTS_BASE))
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SpotifyError::Api { status, message });
        }

        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> Credentials {
        Credentials {
            client_id: "abc123".to_string(),
            client_secret: "shh".to_string(),
            redirect_uri: "http://localhost:8888/auth/callback".to_string(),
        }
    }

    #[test]
    fn token_expires_within_margin() {
        let token = Token {
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(30),
        };
        assert!(token.is_expired());

        let token = Token {
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(600),
        };
        assert!(!token.is_expired());
    }

    #[test]
    fn refresh_grant_keeps_old_refresh_token() {
        let grant = TokenGrant {
            access_token: "fresh".to_string(),
            expires_in: 3600,
            refresh_token: None,
        };
        let token = Token::from_grant(grant, Some("old-refresh".to_string()));
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[test]
    fn authorize_url_carries_app_identity() {
        let session = Session::new(test_credentials());
        let url = session.authorize_url();
        assert!(url.starts_with("https://accounts.spotify.com/authorize?"));
        assert!(url.contains("client_id=abc123"));
        assert!(url.contains("user-read-playback-state"));
        assert!(url.contains(&urlencoding::encode("http://localhost:8888/auth/callback").into_owned()));
    }
}
