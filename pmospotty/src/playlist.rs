//! File de lecture et pré-chargement du morceau suivant.
//!
//! Le lecteur joue des URLs `http://localhost:<port>/track/<id>/<durée>`.
//! La file ([`TrackQueue`]) sait quel morceau suit le morceau courant ; au
//! démarrage de chaque morceau, le [`PrebufferScheduler`] lance le
//! pré-chargement du suivant.

use crate::endpoint::TrackStartedCallback;
use crate::error::{Result, SpottyError};
use crate::prebuffer::PrebufferManager;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Un morceau de la file : identifiant et durée annoncée
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTrack {
    pub track_id: String,
    pub duration: f64,
}

impl QueuedTrack {
    pub fn new(track_id: impl Into<String>, duration: f64) -> Self {
        Self {
            track_id: track_id.into(),
            duration,
        }
    }
}

/// URL de streaming d'un morceau
pub fn track_url(base_url: &str, track_id: &str, duration: f64) -> String {
    format!(
        "{}/track/{}/{}",
        base_url.trim_end_matches('/'),
        track_id,
        duration
    )
}

/// Décompose une URL produite par [`track_url`].
///
/// Seules les URLs locales (`localhost` ou `127.0.0.1`, port optionnel)
/// sont reconnues.
pub fn parse_track_url(url: &str) -> Result<QueuedTrack> {
    let invalid = || SpottyError::InvalidTrackUrl(url.to_string());
    let url = url.trim();

    let lower = url.to_ascii_lowercase();
    let rest = if lower.starts_with("http://") {
        &url[7..]
    } else if lower.starts_with("https://") {
        &url[8..]
    } else {
        return Err(invalid());
    };

    let (authority, path) = rest.split_once('/').ok_or_else(invalid)?;
    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (authority, None),
    };
    if !host.eq_ignore_ascii_case("localhost") && host != "127.0.0.1" {
        return Err(invalid());
    }
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
    }

    let mut segments = path.trim_end_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("track"), Some(id), Some(duration), None) if !id.is_empty() => {
            let duration = duration.parse::<f64>().map_err(|_| invalid())?;
            if !duration.is_finite() || duration < 0.0 {
                return Err(invalid());
            }
            Ok(QueuedTrack::new(id, duration))
        }
        _ => Err(invalid()),
    }
}

/// Source de la file de lecture du lecteur hôte
pub trait PlaylistProvider: Send + Sync {
    /// Morceau courant et morceau suivant
    fn current_and_next(&self) -> (Option<QueuedTrack>, Option<QueuedTrack>);

    /// Notifié quand le serveur commence à servir un morceau
    fn track_started(&self, _track_id: &str) {}
}

#[derive(Debug, Default)]
struct QueueState {
    tracks: Vec<QueuedTrack>,
    position: Option<usize>,
}

/// File de lecture en mémoire, alimentée par `POST /queue`
#[derive(Debug, Default)]
pub struct TrackQueue {
    state: Mutex<QueueState>,
}

/// Vue sérialisable de la file
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub position: Option<usize>,
    pub tracks: Vec<QueuedTrack>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remplace toute la file
    pub fn replace(&self, tracks: Vec<QueuedTrack>) {
        let mut state = self.state();
        info!("📋 Play queue replaced ({} tracks)", tracks.len());
        state.tracks = tracks;
        state.position = None;
    }

    pub fn push(&self, track: QueuedTrack) {
        self.state().tracks.push(track);
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.tracks.clear();
        state.position = None;
    }

    pub fn len(&self) -> usize {
        self.state().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().tracks.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        QueueSnapshot {
            position: state.position,
            tracks: state.tracks.clone(),
        }
    }
}

impl PlaylistProvider for TrackQueue {
    fn current_and_next(&self) -> (Option<QueuedTrack>, Option<QueuedTrack>) {
        let state = self.state();
        match state.position {
            Some(pos) => (
                state.tracks.get(pos).cloned(),
                state.tracks.get(pos + 1).cloned(),
            ),
            None => (None, None),
        }
    }

    fn track_started(&self, track_id: &str) {
        let mut state = self.state();
        let from = state.position.map(|p| p + 1).unwrap_or(0);

        // On cherche d'abord après la position courante, puis depuis le début
        let found = state.tracks[from.min(state.tracks.len())..]
            .iter()
            .position(|t| t.track_id == track_id)
            .map(|i| i + from)
            .or_else(|| state.tracks.iter().position(|t| t.track_id == track_id));

        if let Some(index) = found {
            debug!(track_id, index, "Queue position updated");
            state.position = Some(index);
        }
    }
}

/// Lance le pré-chargement du morceau suivant à chaque démarrage de morceau
pub struct PrebufferScheduler {
    provider: Arc<dyn PlaylistProvider>,
    prebuffer: Arc<PrebufferManager>,
    enabled: AtomicBool,
}

impl PrebufferScheduler {
    pub fn new(
        provider: Arc<dyn PlaylistProvider>,
        prebuffer: Arc<PrebufferManager>,
        enabled: bool,
    ) -> Self {
        Self {
            provider,
            prebuffer,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Active ou désactive le pré-chargement. La désactivation annule le
    /// remplissage en cours.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            info!("Prebuffer disabled, cancelling in-flight work");
            self.prebuffer.cancel();
        }
    }

    /// Réagit au démarrage d'un morceau.
    ///
    /// Retourne le morceau dont le pré-chargement a été demandé.
    pub fn on_track_started(&self, track_id: &str, _duration: f64) -> Option<QueuedTrack> {
        self.provider.track_started(track_id);

        if !self.is_enabled() {
            return None;
        }

        let (_current, next) = self.provider.current_and_next();
        let next = next?;
        if next.track_id == track_id {
            return None;
        }

        debug!(current = track_id, next = %next.track_id, "Scheduling prebuffer of next track");
        self.prebuffer.start_prebuffer(&next.track_id, next.duration);
        Some(next)
    }

    /// Callback à brancher sur l'endpoint de streaming
    pub fn callback(self: &Arc<Self>) -> TrackStartedCallback {
        let scheduler = self.clone();
        Arc::new(move |track_id: &str, duration: f64| {
            scheduler.on_track_started(track_id, duration);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderSettings;
    use crate::testing::FakeLauncher;
    use std::thread;
    use std::time::{Duration, Instant};

    fn queue(ids: &[&str]) -> Arc<TrackQueue> {
        let q = Arc::new(TrackQueue::new());
        q.replace(ids.iter().map(|id| QueuedTrack::new(*id, 30.0)).collect());
        q
    }

    #[test]
    fn test_track_url_roundtrip() {
        let url = track_url("http://localhost:52308/", "4uLU6hMCjMI75M1A2tKUQC", 178.795);
        assert_eq!(url, "http://localhost:52308/track/4uLU6hMCjMI75M1A2tKUQC/178.795");
        assert_eq!(
            parse_track_url(&url).unwrap(),
            QueuedTrack::new("4uLU6hMCjMI75M1A2tKUQC", 178.795)
        );
        assert_eq!(
            parse_track_url("http://127.0.0.1/track/abc/200/").unwrap(),
            QueuedTrack::new("abc", 200.0)
        );
    }

    #[test]
    fn test_foreign_urls_are_rejected() {
        for url in [
            "http://example.com/track/abc/200",
            "ftp://localhost/track/abc/200",
            "http://localhost:port/track/abc/200",
            "http://localhost/album/abc/200",
            "http://localhost/track/abc",
            "http://localhost/track/abc/xyz",
            "http://localhost/track/abc/200/extra",
        ] {
            assert!(parse_track_url(url).is_err(), "{url}");
        }
    }

    #[test]
    fn test_queue_follows_started_tracks() {
        let q = queue(&["a", "b", "c"]);
        assert_eq!(q.current_and_next(), (None, None));

        q.track_started("a");
        let (current, next) = q.current_and_next();
        assert_eq!(current.unwrap().track_id, "a");
        assert_eq!(next.unwrap().track_id, "b");

        q.track_started("c");
        let (current, next) = q.current_and_next();
        assert_eq!(current.unwrap().track_id, "c");
        assert!(next.is_none());

        // Inconnu : la position ne bouge pas
        q.track_started("zzz");
        assert_eq!(q.snapshot().position, Some(2));
    }

    #[test]
    fn test_repeated_track_advances_forward() {
        let q = queue(&["a", "b", "a", "c"]);
        q.track_started("a");
        q.track_started("b");
        q.track_started("a");
        assert_eq!(q.snapshot().position, Some(2));
        assert_eq!(q.current_and_next().1.unwrap().track_id, "c");
    }

    #[test]
    fn test_scheduler_prebuffers_next_track() {
        let launcher = Arc::new(FakeLauncher::new());
        let manager = Arc::new(PrebufferManager::new(
            launcher.clone(),
            DecoderSettings::default(),
            5,
        ));
        let q = queue(&["a", "b"]);
        let scheduler = Arc::new(PrebufferScheduler::new(q.clone(), manager.clone(), true));

        let scheduled = scheduler.on_track_started("a", 30.0);
        assert_eq!(scheduled.unwrap().track_id, "b");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !manager.is_ready("b") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.is_ready("b"));

        // Dernier morceau : rien à pré-charger
        assert!(scheduler.on_track_started("b", 30.0).is_none());
    }

    #[test]
    fn test_disabled_scheduler_only_tracks_position() {
        let launcher = Arc::new(FakeLauncher::new());
        let manager = Arc::new(PrebufferManager::new(
            launcher.clone(),
            DecoderSettings::default(),
            5,
        ));
        let q = queue(&["a", "b"]);
        let scheduler = PrebufferScheduler::new(q.clone(), manager, false);

        assert!(scheduler.on_track_started("a", 30.0).is_none());
        assert_eq!(q.snapshot().position, Some(0));
        assert_eq!(launcher.spawn_count(), 0);
    }
}
