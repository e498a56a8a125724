//! Relecture périodique des réglages.
//!
//! Le fichier `config.yaml` peut être modifié pendant que le service tourne.
//! Toutes les `spotty.settings_poll_interval` secondes, il est relu et les
//! réglages (volume, normalisation, pré-chargement, délai entre morceaux)
//! sont poussés vers le streamer et le cache.

use crate::config_ext::SpottyConfigExt;
use crate::endpoint::TrackStreamEndpoint;
use crate::playlist::PrebufferScheduler;
use crate::prebuffer::PrebufferManager;
use pmoconfig::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SettingsPoller {
    config: Arc<Config>,
    endpoint: Arc<TrackStreamEndpoint>,
    prebuffer: Arc<PrebufferManager>,
    scheduler: Arc<PrebufferScheduler>,
}

impl SettingsPoller {
    pub fn new(
        config: Arc<Config>,
        endpoint: Arc<TrackStreamEndpoint>,
        prebuffer: Arc<PrebufferManager>,
        scheduler: Arc<PrebufferScheduler>,
    ) -> Self {
        Self {
            config,
            endpoint,
            prebuffer,
            scheduler,
        }
    }

    /// Pousse les réglages courants sans relire le fichier
    pub fn apply(&self) {
        let settings = self.config.get_decoder_settings();
        self.endpoint.set_volume(settings.volume);
        self.endpoint.set_normalization(settings.normalization);
        self.endpoint
            .set_gap_between_tracks(self.config.get_gap_between_tracks());
        self.endpoint
            .streamer()
            .set_chunk_size(self.config.get_spotty_chunk_size());

        self.prebuffer.set_volume(settings.volume);
        self.prebuffer.set_normalization(settings.normalization);
        self.prebuffer
            .set_seconds(self.config.get_prebuffer_seconds() as i64);
        self.prebuffer
            .set_chunk_size(self.config.get_spotty_chunk_size());
        self.scheduler
            .set_enabled(self.config.get_prebuffer_enabled());

        debug!(
            volume = settings.volume,
            normalization = settings.normalization,
            prebuffer = self.scheduler.is_enabled(),
            "Settings applied"
        );
    }

    /// Relit le fichier puis applique les réglages
    pub fn poll(&self) {
        if let Err(e) = self.config.reload() {
            warn!("Could not reload configuration: {}", e);
            return;
        }
        self.apply();
    }

    /// Lance la boucle de relecture sur le runtime tokio
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let poller = self.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || poller.poll()).await {
                    warn!("Settings poll task failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderSettings;
    use crate::playlist::TrackQueue;
    use crate::streamer::AudioStreamer;
    use crate::testing::FakeLauncher;

    #[test]
    fn test_poll_pushes_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::load_config(dir.path().to_str().unwrap()).unwrap());

        let launcher = Arc::new(FakeLauncher::new());
        let endpoint = Arc::new(TrackStreamEndpoint::new(AudioStreamer::new(
            launcher.clone(),
            DecoderSettings::default(),
        )));
        let prebuffer = Arc::new(PrebufferManager::new(
            launcher,
            DecoderSettings::default(),
            15,
        ));
        let scheduler = Arc::new(PrebufferScheduler::new(
            Arc::new(TrackQueue::new()),
            prebuffer.clone(),
            true,
        ));
        let poller = SettingsPoller::new(config, endpoint.clone(), prebuffer.clone(), scheduler.clone());

        let path = dir.path().join("config.yaml");
        let edited = std::fs::read_to_string(&path)
            .unwrap()
            .replace("volume: 35", "volume: 80")
            .replace("normalization: true", "normalization: false")
            .replace("seconds: 15", "seconds: 25")
            .replace(
                "  prebuffer:\n    enabled: true",
                "  prebuffer:\n    enabled: false",
            );
        std::fs::write(&path, edited).unwrap();

        poller.poll();

        let settings = endpoint.streamer().settings();
        assert_eq!(settings.volume, 80);
        assert!(!settings.normalization);
        assert_eq!(prebuffer.seconds(), 25);
        assert!(!scheduler.is_enabled());
    }
}
