//! Historique des morceaux écoutés jusqu'au bout.
//!
//! Fichier JSON borné dans le répertoire de configuration, le plus récent
//! en tête. Alimenté par le callback de fin de morceau du streamer.

use crate::error::Result;
use crate::streamer::TrackCallback;
use pmoconfig::Config;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const RECENTLY_PLAYED_FILE: &str = "recently_played.json";
pub const DEFAULT_MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayedTrack {
    pub track_id: String,
    /// Secondes depuis l'epoch Unix
    pub played_at: u64,
}

pub struct RecentlyPlayed {
    path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl RecentlyPlayed {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            lock: Mutex::new(()),
        }
    }

    /// Historique rangé dans le répertoire de configuration
    pub fn in_config_dir(config: &Config) -> Self {
        let max = config.get_int(
            &["spotty", "recently_played", "max_entries"],
            DEFAULT_MAX_ENTRIES as i64,
        );
        Self::new(
            Path::new(config.get_config_dir()).join(RECENTLY_PLAYED_FILE),
            usize::try_from(max).unwrap_or(DEFAULT_MAX_ENTRIES),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entrées, de la plus récente à la plus ancienne
    pub fn tracks(&self) -> Vec<PlayedTrack> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read()
    }

    fn read(&self) -> Vec<PlayedTrack> {
        let data = match fs::read(&self.path) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_slice(&data) {
            Ok(list) => list,
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring corrupt history file: {}", e);
                Vec::new()
            }
        }
    }

    /// Ajoute un morceau en tête ; un morceau déjà présent est déplacé
    pub fn save_track(&self, track_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut list = self.read();
        list.retain(|t| t.track_id != track_id);
        let played_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        list.insert(
            0,
            PlayedTrack {
                track_id: track_id.to_string(),
                played_at,
            },
        );
        list.truncate(self.max_entries);

        let json = serde_json::to_vec_pretty(&list).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(track_id, entries = list.len(), "Saved to recently played");
        Ok(())
    }

    /// Callback à brancher sur la fin de morceau du streamer
    pub fn callback(self: &Arc<Self>) -> TrackCallback {
        let history = self.clone();
        Arc::new(move |track_id: &str| {
            if let Err(e) = history.save_track(track_id) {
                warn!(track_id, "Could not save recently played track: {}", e);
            }
        })
    }
}
