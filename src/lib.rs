// Skipwatch Library - Core modules for the Spotify skip tracker
// Modular design makes it easy to swap out components

pub mod config;    // settings and preferences
pub mod ledger;    // persisted skip statistics
pub mod monitor;   // playback polling and skip detection
pub mod server;    // HTTP surface for the dashboard
pub mod spotify;   // Spotify Web API client + auth

// Export the stuff other modules actually use
pub use config::Config;
pub use ledger::{SkipLedger, SkipRecord, Timeframe};
pub use monitor::Monitor;
pub use spotify::{Session, SpotifyClient, SpotifyError};
