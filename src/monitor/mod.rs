// Playback monitoring - polls Spotify and writes detected skips to the ledger
// One watcher per process: starting a new session always retires the old one first

pub mod watcher;

pub use watcher::{PollDelay, SkipEvent, Step, TrackObservation, WatchState};

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::ledger::SkipLedger;
use crate::spotify::{Session, SpotifyClient};

/// How long start/stop wait for a worker to notice the cleared flag.
/// Comfortably above the longest in-loop sleep; abort is the last resort.
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

struct MonitorSession {
    active: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Owns the single monitor session for the process. All start/stop
/// requests go through the mutex, so two workers can never poll at once.
pub struct Monitor {
    client: SpotifyClient,
    session: Arc<Session>,
    ledger: Arc<SkipLedger>,
    settings: MonitorSettings,
    current: Mutex<Option<MonitorSession>>,
}

impl Monitor {
    pub fn new(
        client: SpotifyClient,
        session: Arc<Session>,
        ledger: Arc<SkipLedger>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            client,
            session,
            ledger,
            settings,
            current: Mutex::new(None),
        }
    }

    /// Start a monitor session. A running session is signalled and joined
    /// first, so a restart always begins from Idle and never double-counts
    /// the observation that was in flight.
    pub async fn start(&self) -> Result<()> {
        let mut current = self.current.lock().await;

        if let Some(old) = current.take() {
            Self::shut_down(old).await;
        }

        let active = Arc::new(AtomicBool::new(true));
        let worker = tokio::spawn(watcher::run(
            self.client.clone(),
            self.session.clone(),
            self.ledger.clone(),
            self.settings.clone(),
            active.clone(),
        ));

        *current = Some(MonitorSession { active, worker });
        info!("monitor session started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(old) => {
                Self::shut_down(old).await;
                info!("monitor session stopped");
            }
            None => debug!("stop requested with no active monitor"),
        }
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        let current = self.current.lock().await;
        current
            .as_ref()
            .map(|s| s.active.load(Ordering::SeqCst) && !s.worker.is_finished())
            .unwrap_or(false)
    }

    async fn shut_down(session: MonitorSession) {
        session.active.store(false, Ordering::SeqCst);
        let abort = session.worker.abort_handle();
        match tokio::time::timeout(JOIN_TIMEOUT, session.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("monitor worker ended abnormally: {e}"),
            Err(_) => {
                warn!("monitor worker ignored the stop signal, aborting it");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use tempfile::TempDir;

    fn test_monitor(dir: &TempDir) -> Monitor {
        let session = Arc::new(Session::new(Credentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8888/auth/callback".to_string(),
        }));
        let ledger = Arc::new(SkipLedger::new(dir.path().join("skips.db")).unwrap());
        let settings = MonitorSettings {
            active_poll_secs: 1,
            idle_poll_secs: 1,
            skip_grace_secs: 10,
            error_backoff_secs: 1,
        };
        Monitor::new(SpotifyClient::new(session.clone()), session, ledger, settings)
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let monitor = test_monitor(&dir);
        assert!(!monitor.is_active().await);
        monitor.stop().await.unwrap();
        assert!(!monitor.is_active().await);
    }

    #[tokio::test]
    async fn start_stop_round_trip() {
        let dir = TempDir::new().unwrap();
        let monitor = test_monitor(&dir);

        monitor.start().await.unwrap();
        assert!(monitor.is_active().await);

        monitor.stop().await.unwrap();
        assert!(!monitor.is_active().await);
    }

    #[tokio::test]
    async fn restart_replaces_the_running_worker() {
        let dir = TempDir::new().unwrap();
        let monitor = test_monitor(&dir);

        monitor.start().await.unwrap();
        // Superseding start must retire the old worker, not stack a second one
        monitor.start().await.unwrap();
        assert!(monitor.is_active().await);

        monitor.stop().await.unwrap();
        assert!(!monitor.is_active().await);
    }
}
