//! Pré-chargement du morceau suivant.
//!
//! Les premières secondes du prochain morceau sont décodées en tâche de fond
//! dans un emplacement mémoire unique. Quand le lecteur demande ce morceau,
//! ces octets sont servis immédiatement, sans attendre le démarrage du
//! décodeur.
//!
//! Le tampon est en coordonnées fichier : il commence par l'en-tête WAV.

use crate::decoder::{DecoderLauncher, DecoderSettings};
use crate::streamer::{AudioStreamer, DEFAULT_CHUNK_SIZE};
use crate::wav::BYTES_PER_SECOND;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use tracing::{debug, info, warn};

pub const PREBUFFER_SECONDS_MIN: u32 = 5;
pub const PREBUFFER_SECONDS_MAX: u32 = 30;
pub const PREBUFFER_SECONDS_DEFAULT: u32 = 15;

pub fn clamp_prebuffer_seconds(seconds: i64) -> u32 {
    seconds.clamp(PREBUFFER_SECONDS_MIN as i64, PREBUFFER_SECONDS_MAX as i64) as u32
}

struct Filling {
    track_id: String,
    generation: u64,
    streamer: AudioStreamer,
}

/// Tampon complet, avec la taille de fichier annoncée par son en-tête WAV
struct Ready {
    track_id: String,
    total_len: u64,
    data: Bytes,
}

#[derive(Default)]
struct PrebufferSlot {
    generation: u64,
    ready: Option<Ready>,
    filling: Option<Filling>,
}

impl PrebufferSlot {
    /// Invalide l'emplacement et rend le remplissage en cours.
    ///
    /// Le décodeur du remplissage doit être arrêté hors du verrou.
    #[must_use]
    fn reset(&mut self) -> Option<Filling> {
        self.generation = self.generation.wrapping_add(1);
        self.ready = None;
        self.filling.take()
    }
}

fn stop_filling(filling: Option<Filling>) {
    if let Some(filling) = filling {
        debug!(track_id = %filling.track_id, "Cancelling prebuffer fill");
        filling.streamer.terminate();
    }
}

fn lock_slot(slot: &Mutex<PrebufferSlot>) -> MutexGuard<'_, PrebufferSlot> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

/// Cache de pré-chargement à un seul emplacement
pub struct PrebufferManager {
    launcher: Arc<dyn DecoderLauncher>,
    settings: RwLock<DecoderSettings>,
    seconds: AtomicU32,
    chunk_size: AtomicUsize,
    slot: Arc<Mutex<PrebufferSlot>>,
}

impl PrebufferManager {
    pub fn new(launcher: Arc<dyn DecoderLauncher>, settings: DecoderSettings, seconds: u32) -> Self {
        Self {
            launcher,
            settings: RwLock::new(settings),
            seconds: AtomicU32::new(clamp_prebuffer_seconds(seconds as i64)),
            chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            slot: Arc::new(Mutex::new(PrebufferSlot::default())),
        }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// Taille visée pour un tampon complet
    pub fn target_len(&self) -> u64 {
        self.seconds() as u64 * BYTES_PER_SECOND
    }

    pub fn set_seconds(&self, seconds: i64) {
        self.seconds
            .store(clamp_prebuffer_seconds(seconds), Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: u8) {
        self.settings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .volume = volume.clamp(1, 100);
    }

    pub fn set_normalization(&self, enabled: bool) {
        self.settings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .normalization = enabled;
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.chunk_size.store(size, Ordering::Relaxed);
    }

    /// Lance le pré-chargement de `track_id` en tâche de fond.
    ///
    /// Sans effet si ce morceau est déjà en mémoire ou en cours de
    /// remplissage. Retourne `true` si un remplissage a été lancé.
    pub fn start_prebuffer(&self, track_id: &str, duration: f64) -> bool {
        let mut slot = lock_slot(&self.slot);

        let already_ready = slot.ready.as_ref().is_some_and(|r| r.track_id == track_id);
        let already_filling = slot
            .filling
            .as_ref()
            .is_some_and(|f| f.track_id == track_id);
        if already_ready || already_filling {
            debug!(track_id, "Prebuffer already present for track");
            return false;
        }

        let previous = slot.reset();
        let generation = slot.generation;

        let settings = *self.settings.read().unwrap_or_else(|p| p.into_inner());
        let streamer = AudioStreamer::new(self.launcher.clone(), settings);
        streamer.set_chunk_size(self.chunk_size.load(Ordering::Relaxed));
        streamer.set_track(track_id, duration);

        let target = self.target_len().min(streamer.total_len());
        slot.filling = Some(Filling {
            track_id: track_id.to_string(),
            generation,
            streamer: streamer.clone(),
        });
        drop(slot);
        stop_filling(previous);

        let slot = self.slot.clone();
        let id = track_id.to_string();
        let spawned = thread::Builder::new()
            .name("spotty-prebuffer".to_string())
            .spawn(move || fill(slot, streamer, id, generation, target));

        match spawned {
            Ok(_) => {
                debug!(track_id, target, "Prebuffer fill started");
                true
            }
            Err(e) => {
                warn!(track_id, error = %e, "Could not start prebuffer thread");
                let filling = lock_slot(&self.slot).reset();
                stop_filling(filling);
                false
            }
        }
    }

    /// Retourne et vide le tampon s'il correspond exactement à `track_id`.
    ///
    /// `total_len` est la taille du fichier servi pour la requête : un tampon
    /// dont l'en-tête WAV annonce une autre taille n'est pas utilisable et
    /// est abandonné.
    pub fn get_and_clear(&self, track_id: &str, total_len: u64) -> Option<Bytes> {
        let mut slot = lock_slot(&self.slot);
        if !slot.ready.as_ref().is_some_and(|r| r.track_id == track_id) {
            return None;
        }
        let ready = slot.ready.take()?;
        if ready.total_len != total_len {
            debug!(
                track_id,
                buffered = ready.total_len,
                requested = total_len,
                "Prebuffer built for another duration, dropped"
            );
            return None;
        }
        Some(ready.data)
    }

    /// Arrête le remplissage en cours et vide l'emplacement
    pub fn cancel(&self) {
        let filling = lock_slot(&self.slot).reset();
        stop_filling(filling);
    }

    pub fn is_ready(&self, track_id: &str) -> bool {
        lock_slot(&self.slot)
            .ready
            .as_ref()
            .is_some_and(|r| r.track_id == track_id)
    }

    pub fn is_filling(&self) -> bool {
        lock_slot(&self.slot).filling.is_some()
    }
}

fn fill(slot: Arc<Mutex<PrebufferSlot>>, streamer: AudioStreamer, track_id: String, generation: u64, target: u64) {
    let total_len = streamer.total_len();
    let is_current = || lock_slot(&slot).generation == generation;

    let stream = match streamer.stream_range(0, target) {
        Ok(s) => s,
        Err(e) => {
            warn!(track_id = %track_id, error = %e, "Prebuffer failed");
            clear_filling(&slot, generation);
            return;
        }
    };

    let mut collected = BytesMut::with_capacity(target as usize);
    for chunk in stream {
        if !is_current() {
            debug!(track_id = %track_id, "Prebuffer fill superseded");
            return;
        }
        match chunk {
            Ok(bytes) => collected.extend_from_slice(&bytes),
            Err(e) => {
                warn!(track_id = %track_id, error = %e, "Prebuffer failed");
                clear_filling(&slot, generation);
                return;
            }
        }
    }

    let mut guard = lock_slot(&slot);
    if guard.generation != generation {
        return;
    }
    guard.filling = None;
    if collected.is_empty() {
        return;
    }
    info!(
        track_id = %track_id,
        bytes = collected.len(),
        "⚡ Prebuffer ready"
    );
    guard.ready = Some(Ready {
        track_id,
        total_len,
        data: collected.freeze(),
    });
}

fn clear_filling(slot: &Mutex<PrebufferSlot>, generation: u64) {
    let mut guard = lock_slot(slot);
    if guard.generation == generation {
        guard.filling = None;
    }
}
