// Configuration management for Skipwatch
// Handles loading/saving settings, with sensible defaults when config is missing

use anyhow::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: PathBuf,
    pub spotify: SpotifyConfig,
    pub monitor: MonitorSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Poll cadence while a track is being observed, in seconds.
    pub active_poll_secs: u64,
    /// Poll cadence while nothing is playing, in seconds.
    pub idle_poll_secs: u64,
    /// Slack subtracted from a track's duration before a transition counts
    /// as a skip. Absorbs poll granularity and API progress imprecision.
    pub skip_grace_secs: u64,
    /// Sleep after a failed cycle before polling again, in seconds.
    pub error_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skipwatch");

        Self {
            database_path: config_dir.join("skipwatch.db"),
            spotify: SpotifyConfig {
                client_id: None,
                client_secret: None,
                redirect_uri: "http://localhost:8888/auth/callback".to_string(),
            },
            monitor: MonitorSettings {
                active_poll_secs: 3,
                idle_poll_secs: 5,
                skip_grace_secs: 10,
                error_backoff_secs: 5,
            },
            server: ServerSettings {
                bind_address: "127.0.0.1".to_string(),
                port: 8888,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
            .join("skipwatch");

        Ok(config_dir.join("config.toml"))
    }
}

impl SpotifyConfig {
    /// Resolved app credentials. Environment variables win over the config
    /// file so a `.env`-style deployment keeps working.
    pub fn credentials(&self) -> Result<Credentials> {
        let client_id = env::var("SPOTIFY_CLIENT_ID")
            .ok()
            .or_else(|| self.client_id.clone())
            .ok_or_else(|| anyhow::anyhow!("Missing Spotify client_id (config or SPOTIFY_CLIENT_ID)"))?;
        let client_secret = env::var("SPOTIFY_CLIENT_SECRET")
            .ok()
            .or_else(|| self.client_secret.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("Missing Spotify client_secret (config or SPOTIFY_CLIENT_SECRET)")
            })?;
        let redirect_uri = env::var("SPOTIFY_REDIRECT_URI")
            .ok()
            .unwrap_or_else(|| self.redirect_uri.clone());

        Ok(Credentials {
            client_id,
            client_secret,
            redirect_uri,
        })
    }
}

/// Resolved Spotify app credentials, after env overrides.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}
