//! Streamer audio : projection d'une plage d'octets HTTP sur le flux PCM.
//!
//! Le fichier servi est `[en-tête WAV][PCM du décodeur]`. Une requête porte
//! sur une plage `(begin, len)` en coordonnées fichier :
//!
//! - la partie de la plage qui tombe dans l'en-tête est servie depuis
//!   l'en-tête synthétisé ;
//! - pour le reste, le décodeur est lancé à la seconde entière
//!   `pcm_target / 176400`, puis exactement `pcm_target % 176400` octets
//!   sont lus et jetés pour tomber pile sur l'octet demandé.
//!
//! Un seul flux est actif à la fois par streamer : ouvrir un nouveau flux
//! annule le précédent et arrête son décodeur.

use crate::decoder::{DecodeRequest, DecoderHandle, DecoderLauncher, DecoderProcess, DecoderSettings};
use crate::error::{Result, SpottyError};
use crate::wav::{BYTES_PER_SECOND, WavHeader};
use bytes::Bytes;
use pmoutils::Termination;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const MIN_CHUNK_SIZE: usize = 4 * 1024;
const PROGRESS_LOG_STEP: u64 = 10 * 1024 * 1024;

/// Callback appelé avec l'identifiant d'un morceau
pub type TrackCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Jeton d'annulation partagé entre un flux et son streamer
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Résultat de [`AudioStreamer::terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTermination {
    /// Un décodeur tournait et a été arrêté
    Terminated,
    /// Aucun décodeur actif
    AlreadyStopped,
    /// Le dernier flux n'avait pas pu lancer son décodeur
    SpawnFailed,
}

/// Morceau courant du streamer
#[derive(Debug, Clone)]
pub struct TrackSession {
    pub track_id: String,
    pub duration: f64,
    pub header: WavHeader,
    finished_notified: Arc<AtomicBool>,
}

impl TrackSession {
    pub fn new(track_id: impl Into<String>, duration: f64) -> Self {
        Self {
            track_id: track_id.into(),
            duration,
            header: WavHeader::for_duration(duration),
            finished_notified: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn total_len(&self) -> u64 {
        self.header.total_len()
    }
}

#[derive(Default)]
struct ActiveStream {
    stream_id: u64,
    cancel: Option<CancelToken>,
    decoder: Option<DecoderHandle>,
    last_spawn_failed: bool,
}

struct StreamerInner {
    launcher: Arc<dyn DecoderLauncher>,
    settings: RwLock<DecoderSettings>,
    chunk_size: AtomicUsize,
    track: RwLock<Option<TrackSession>>,
    active: Mutex<ActiveStream>,
    on_finished: RwLock<Option<TrackCallback>>,
}

impl StreamerInner {
    fn active(&self) -> MutexGuard<'_, ActiveStream> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn settings(&self) -> DecoderSettings {
        *self.settings.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// Streamer audio d'un morceau à la fois
#[derive(Clone)]
pub struct AudioStreamer {
    inner: Arc<StreamerInner>,
}

impl AudioStreamer {
    pub fn new(launcher: Arc<dyn DecoderLauncher>, settings: DecoderSettings) -> Self {
        Self {
            inner: Arc::new(StreamerInner {
                launcher,
                settings: RwLock::new(settings),
                chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
                track: RwLock::new(None),
                active: Mutex::new(ActiveStream::default()),
                on_finished: RwLock::new(None),
            }),
        }
    }

    pub fn launcher(&self) -> Arc<dyn DecoderLauncher> {
        self.inner.launcher.clone()
    }

    /// Change de morceau. La taille totale est figée pour toute la session.
    pub fn set_track(&self, track_id: &str, duration: f64) {
        let session = TrackSession::new(track_id, duration);
        debug!(
            track_id,
            duration,
            total_len = session.total_len(),
            "Streamer track set"
        );
        *self.inner.track.write().unwrap_or_else(|p| p.into_inner()) = Some(session);
    }

    pub fn track(&self) -> Option<TrackSession> {
        self.inner
            .track
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Taille totale du fichier courant (0 sans morceau)
    pub fn total_len(&self) -> u64 {
        self.track().map(|t| t.total_len()).unwrap_or(0)
    }

    pub fn settings(&self) -> DecoderSettings {
        self.inner.settings()
    }

    pub fn set_volume(&self, volume: u8) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .volume = volume.clamp(1, 100);
    }

    pub fn set_normalization(&self, enabled: bool) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .normalization = enabled;
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.inner
            .chunk_size
            .store(size.max(MIN_CHUNK_SIZE), Ordering::Relaxed);
    }

    pub fn set_on_track_finished(&self, callback: Option<TrackCallback>) {
        *self
            .inner
            .on_finished
            .write()
            .unwrap_or_else(|p| p.into_inner()) = callback;
    }

    /// Vrai si un décodeur est en cours pour le flux actif
    pub fn is_decoding(&self) -> bool {
        self.inner.active().decoder.is_some()
    }

    /// Annule le flux actif et arrête son décodeur
    pub fn terminate(&self) -> StreamTermination {
        let (decoder, spawn_failed) = {
            let mut active = self.inner.active();
            if let Some(token) = active.cancel.take() {
                token.cancel();
            }
            (active.decoder.take(), active.last_spawn_failed)
        };

        match decoder {
            Some(handle) => match handle.terminate() {
                Termination::Terminated => {
                    debug!(pid = ?handle.pid(), "Active decoder terminated");
                    StreamTermination::Terminated
                }
                Termination::AlreadyStopped => StreamTermination::AlreadyStopped,
            },
            None if spawn_failed => StreamTermination::SpawnFailed,
            None => StreamTermination::AlreadyStopped,
        }
    }

    /// Ouvre un flux pour la plage `[begin, begin + len)` du fichier courant.
    ///
    /// Le flux précédent est annulé et son décodeur arrêté avant le retour.
    pub fn stream_range(&self, begin: u64, len: u64) -> Result<RangeStream> {
        let session = self.track().ok_or(SpottyError::NoTrack)?;

        let total = session.total_len();
        let begin = begin.min(total);
        let len = len.min(total - begin);

        let (token, stream_id, previous) = {
            let mut active = self.inner.active();
            if let Some(old) = active.cancel.take() {
                old.cancel();
            }
            let previous = active.decoder.take();
            active.stream_id = active.stream_id.wrapping_add(1);
            active.last_spawn_failed = false;
            let token = CancelToken::new();
            active.cancel = Some(token.clone());
            (token, active.stream_id, previous)
        };

        if let Some(handle) = previous {
            debug!(pid = ?handle.pid(), "Terminating previous decoder before new stream");
            handle.terminate();
        }

        info!(
            track_id = %session.track_id,
            begin,
            len,
            total,
            "▶️ Opening range stream"
        );

        Ok(RangeStream {
            inner: self.inner.clone(),
            session,
            token,
            stream_id,
            begin,
            len,
            sent: 0,
            state: StreamState::Header,
            decoder: None,
            buffer: Vec::new(),
        })
    }
}

enum StreamState {
    Header,
    Spawn,
    Decoding,
    Done,
}

/// Flux bloquant d'une plage d'octets.
///
/// Produit exactement `len` octets si le décodeur en fournit assez. Le
/// décodeur est arrêté quand le flux est libéré.
pub struct RangeStream {
    inner: Arc<StreamerInner>,
    session: TrackSession,
    token: CancelToken,
    stream_id: u64,
    begin: u64,
    len: u64,
    sent: u64,
    state: StreamState,
    decoder: Option<DecoderProcess>,
    buffer: Vec<u8>,
}

impl RangeStream {
    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    fn header_chunk(&mut self) -> Option<Bytes> {
        let header = self.session.header.as_bytes();
        let header_len = header.len() as u64;
        if self.begin >= header_len || self.len == 0 {
            return None;
        }
        let end = header_len.min(self.begin + self.len);
        let chunk = header.slice(self.begin as usize..end as usize);
        self.sent += chunk.len() as u64;
        debug!(track_id = %self.session.track_id, bytes = chunk.len(), "Sending WAV header");
        Some(chunk)
    }

    fn spawn_decoder(&mut self) -> Result<()> {
        let header_len = self.session.header.len() as u64;
        let pcm_target = (self.begin + self.sent).saturating_sub(header_len);
        let start_second = pcm_target / BYTES_PER_SECOND;
        let skip = pcm_target % BYTES_PER_SECOND;

        let request = DecodeRequest::new(
            &self.session.track_id,
            start_second,
            self.inner.settings(),
        );

        let process = match self.inner.launcher.launch(&request) {
            Ok(p) => p,
            Err(e) => {
                let mut active = self.inner.active();
                if active.stream_id == self.stream_id {
                    active.last_spawn_failed = true;
                }
                return Err(e);
            }
        };

        {
            let mut active = self.inner.active();
            if self.token.is_cancelled() || active.stream_id != self.stream_id {
                drop(active);
                drop(process);
                return Err(SpottyError::Cancelled);
            }
            active.decoder = Some(process.handle());
        }
        self.decoder = Some(process);

        if skip > 0 {
            debug!(start_second, skip, "Discarding PCM to reach target offset");
            self.discard(skip)?;
        }
        Ok(())
    }

    fn discard(&mut self, mut remaining: u64) -> Result<()> {
        let chunk = self.inner.chunk_size.load(Ordering::Relaxed);
        while remaining > 0 {
            if self.token.is_cancelled() {
                return Err(SpottyError::Cancelled);
            }
            let want = chunk.min(remaining as usize);
            let got = self.read_some(want)?;
            if got == 0 {
                break;
            }
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Lit jusqu'à `want` octets dans le tampon, en s'arrêtant à la fin du flux.
    fn read_some(&mut self, want: usize) -> Result<usize> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(0);
        };
        self.buffer.resize(want, 0);
        let mut filled = 0;
        while filled < want {
            if self.token.is_cancelled() {
                break;
            }
            match decoder.read(&mut self.buffer[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn reaches_end_of_file(&self) -> bool {
        self.begin + self.len >= self.session.total_len()
    }

    fn notify_finished(&self) {
        if self.token.is_cancelled() {
            return;
        }
        if self.session.finished_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(track_id = %self.session.track_id, sent = self.sent, "✅ Track finished");
        let callback = self
            .inner
            .on_finished
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&self.session.track_id);
        }
    }

    fn release(&mut self) {
        if let Some(process) = self.decoder.take() {
            {
                let mut active = self.inner.active();
                if active.stream_id == self.stream_id {
                    active.decoder = None;
                }
            }
            drop(process);
        }
    }

    fn finish(&mut self, natural_end: bool) {
        self.state = StreamState::Done;
        self.release();
        if natural_end {
            self.notify_finished();
        }
        debug!(
            track_id = %self.session.track_id,
            begin = self.begin,
            sent = self.sent,
            "Range stream closed"
        );
    }

    fn log_progress(&self, before: u64) {
        if before / PROGRESS_LOG_STEP != self.sent / PROGRESS_LOG_STEP {
            debug!(
                track_id = %self.session.track_id,
                sent = self.sent,
                total = self.session.total_len(),
                "Continue sending"
            );
        }
    }
}

impl Iterator for RangeStream {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                StreamState::Header => {
                    self.state = StreamState::Spawn;
                    if let Some(chunk) = self.header_chunk() {
                        return Some(Ok(chunk));
                    }
                }
                StreamState::Spawn => {
                    if self.sent >= self.len {
                        let natural = self.reaches_end_of_file();
                        self.finish(natural);
                        return None;
                    }
                    if self.token.is_cancelled() {
                        self.finish(false);
                        return None;
                    }
                    match self.spawn_decoder() {
                        Ok(()) => self.state = StreamState::Decoding,
                        Err(SpottyError::Cancelled) => {
                            self.finish(false);
                            return None;
                        }
                        Err(e) => {
                            error!(track_id = %self.session.track_id, "❌ Decoder failed: {}", e);
                            self.finish(false);
                            return Some(Err(e));
                        }
                    }
                }
                StreamState::Decoding => {
                    if self.token.is_cancelled() {
                        self.finish(false);
                        return None;
                    }
                    let remaining = self.len - self.sent;
                    if remaining == 0 {
                        let natural = self.reaches_end_of_file();
                        self.finish(natural);
                        return None;
                    }

                    let chunk = self.inner.chunk_size.load(Ordering::Relaxed);
                    let want = chunk.min(remaining.min(usize::MAX as u64) as usize);
                    match self.read_some(want) {
                        Ok(0) => {
                            let natural = !self.token.is_cancelled();
                            if natural && self.sent < self.len {
                                warn!(
                                    track_id = %self.session.track_id,
                                    sent = self.sent,
                                    expected = self.len,
                                    "Decoder output ended before the requested range"
                                );
                            }
                            self.finish(natural);
                            return None;
                        }
                        Ok(n) => {
                            let before = self.sent;
                            self.sent += n as u64;
                            self.log_progress(before);
                            return Some(Ok(Bytes::copy_from_slice(&self.buffer[..n])));
                        }
                        Err(e) => {
                            if self.token.is_cancelled() {
                                self.finish(false);
                                return None;
                            }
                            error!(track_id = %self.session.track_id, "❌ Decoder read failed: {}", e);
                            self.finish(false);
                            return Some(Err(e));
                        }
                    }
                }
                StreamState::Done => return None,
            }
        }
    }
}

impl Drop for RangeStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use crate::wav::WAV_HEADER_LEN;

    fn streamer(launcher: &Arc<FakeLauncher>) -> AudioStreamer {
        let s = AudioStreamer::new(launcher.clone(), DecoderSettings::default());
        s.set_chunk_size(MIN_CHUNK_SIZE);
        s
    }

    fn collect(stream: RangeStream) -> Vec<u8> {
        stream.flat_map(|c| c.unwrap().to_vec()).collect()
    }

    #[test]
    fn test_no_track_is_an_error() {
        let launcher = Arc::new(FakeLauncher::new());
        assert!(matches!(
            streamer(&launcher).stream_range(0, 10),
            Err(SpottyError::NoTrack)
        ));
    }

    #[test]
    fn test_full_range_is_header_then_pcm() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_track("abc", 2.0);

        let total = s.total_len();
        let body = collect(s.stream_range(0, total).unwrap());

        assert_eq!(body.len() as u64, total);
        assert_eq!(&body[..WAV_HEADER_LEN], &s.track().unwrap().header.as_bytes()[..]);
        assert_eq!(&body[WAV_HEADER_LEN..], &FakeLauncher::pcm_range(0, total - 44)[..]);
        assert_eq!(launcher.requests()[0].start_second, 0);
    }

    #[test]
    fn test_seek_maps_to_start_second_and_skip() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_track("abc", 5.0);

        // Octet PCM 2.5 s après le début
        let pcm_target = 176_400 * 2 + 88_200;
        let begin = WAV_HEADER_LEN as u64 + pcm_target;
        let body = collect(s.stream_range(begin, 1000).unwrap());

        assert_eq!(body.len(), 1000);
        assert_eq!(body, FakeLauncher::pcm_range(pcm_target, 1000));
        assert_eq!(launcher.requests()[0].start_second, 2);
    }

    #[test]
    fn test_yielded_bytes_match_range_at_boundaries() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_chunk_size(64 * 1024);
        s.set_track("abc", 3.0);

        let total = s.total_len();
        let header = s.track().unwrap().header.as_bytes().clone();
        let expected = |begin: u64, end: u64| -> Vec<u8> {
            let split = end.min(44).max(begin);
            let mut bytes = header[begin.min(44) as usize..split.min(44) as usize].to_vec();
            let pcm_begin = begin.max(44);
            if end > pcm_begin {
                bytes.extend(FakeLauncher::pcm_range(pcm_begin - 44, end - pcm_begin));
            }
            bytes
        };

        let offsets = [0, 1, 43, 44, 45, 44 + 176_399, 44 + 176_400, total - 1, total];
        for begin in offsets {
            for end in [begin, (begin + 1_000).min(total), total] {
                let body = collect(s.stream_range(begin, end - begin).unwrap());
                assert_eq!(body.len() as u64, end - begin, "[{begin}, {end})");
                assert_eq!(body, expected(begin, end), "[{begin}, {end})");
            }
        }
    }

    #[test]
    fn test_range_inside_header() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_track("abc", 1.0);

        let body = collect(s.stream_range(4, 20).unwrap());
        assert_eq!(body, s.track().unwrap().header.as_bytes()[4..24].to_vec());
        // Plage satisfaite par l'en-tête seul : pas de décodeur
        assert_eq!(launcher.spawn_count(), 0);

        let body = collect(s.stream_range(40, 10).unwrap());
        assert_eq!(&body[..4], &s.track().unwrap().header.as_bytes()[40..44]);
        assert_eq!(&body[4..], &FakeLauncher::pcm_range(0, 6)[..]);
    }

    #[test]
    fn test_finished_fires_once_at_end_of_file() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        let finished = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = finished.clone();
        s.set_on_track_finished(Some(Arc::new(move |id: &str| {
            sink.lock().unwrap().push(id.to_string())
        })));
        s.set_track("abc", 1.0);
        let total = s.total_len();

        // Plage partielle en début de fichier : pas de fin de morceau
        collect(s.stream_range(0, 1000).unwrap());
        assert!(finished.lock().unwrap().is_empty());

        collect(s.stream_range(total - 500, 500).unwrap());
        collect(s.stream_range(0, total).unwrap());
        assert_eq!(*finished.lock().unwrap(), vec!["abc".to_string()]);
    }

    #[test]
    fn test_new_stream_cancels_previous() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_track("abc", 3.0);

        let mut first = s.stream_range(0, s.total_len()).unwrap();
        assert!(first.next().unwrap().is_ok()); // en-tête
        assert!(first.next().unwrap().is_ok()); // premier bloc PCM
        assert_eq!(launcher.live_count(), 1);

        let second = s.stream_range(1000, 100).unwrap();
        assert_eq!(launcher.terminate_count(), 1);
        assert!(first.next().is_none());

        assert_eq!(collect(second).len(), 100);
        assert_eq!(launcher.live_count(), 0);
    }

    #[test]
    fn test_terminate_outcomes() {
        let launcher = Arc::new(FakeLauncher::new());
        let s = streamer(&launcher);
        s.set_track("abc", 3.0);
        assert_eq!(s.terminate(), StreamTermination::AlreadyStopped);

        let mut stream = s.stream_range(0, s.total_len()).unwrap();
        stream.next();
        stream.next();
        assert!(s.is_decoding());
        assert_eq!(s.terminate(), StreamTermination::Terminated);
        assert!(stream.next().is_none());

        launcher.fail_spawns(true);
        let mut failing = s.stream_range(100, 10).unwrap();
        assert!(matches!(failing.next(), Some(Err(SpottyError::Spawn { .. }))));
        assert_eq!(s.terminate(), StreamTermination::SpawnFailed);
    }
}
