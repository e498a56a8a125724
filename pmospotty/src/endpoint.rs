//! Point d'entrée HTTP du streaming, indépendant du framework web.
//!
//! Pour chaque requête sur `/track/{track_id}/{duration}` :
//!
//! 1. la requête est classée : nouveau morceau, reprise, ou seek dans le
//!    morceau courant ;
//! 2. un nouveau morceau consomme le pré-chargement éventuel, arrête le flux
//!    précédent et initialise le streamer ;
//! 3. la plage demandée est servie depuis le pré-chargement puis depuis le
//!    décodeur.
//!
//! Les transitions de morceau et les seeks sont sérialisés par un seul
//! mutex ([`PlaybackSession`]).

use crate::error::{Result, SpottyError};
use crate::prebuffer::PrebufferManager;
use crate::range::{ByteRange, RangeRequest, parse_range};
use crate::streamer::{AudioStreamer, RangeStream, StreamTermination, TrackCallback};
use crate::wav::WavHeader;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TRACK_ROUTE: &str = "/track/{track_id}/{duration}";

/// Callback appelé au démarrage d'un morceau (`track_id`, durée en secondes)
pub type TrackStartedCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Valide le segment de durée de l'URL
pub fn parse_duration(raw: &str) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(d) if d.is_finite() && d >= 0.0 => Ok(d),
        _ => Err(SpottyError::InvalidDuration(raw.to_string())),
    }
}

#[derive(Debug, Default)]
struct PlaybackSession {
    is_streaming: bool,
    current_track: Option<String>,
}

/// Décision prise pour une requête, avant production du corps
#[derive(Debug, Clone)]
pub struct PreparedResponse {
    pub track_id: String,
    pub range: ByteRange,
    pub total: u64,
    pub partial: bool,
    pub is_new_track: bool,
    pub is_seek: bool,
    pub prebuffer: Option<Bytes>,
}

impl PreparedResponse {
    /// Code HTTP : 206 pour une plage partielle, 200 sinon
    pub fn status(&self) -> u16 {
        if self.partial { 206 } else { 200 }
    }

    pub fn content_length(&self) -> u64 {
        self.range.len()
    }

    pub fn content_range(&self) -> Option<String> {
        self.partial.then(|| self.range.content_range(self.total))
    }
}

/// Corps d'une réponse : tranche pré-chargée puis flux décodé
pub struct ResponseBody {
    prefix: Option<Bytes>,
    live: Option<RangeStream>,
}

impl ResponseBody {
    pub fn prefix_len(&self) -> usize {
        self.prefix.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn has_live_stream(&self) -> bool {
        self.live.is_some()
    }
}

impl Iterator for ResponseBody {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                return Some(Ok(prefix));
            }
        }
        self.live.as_mut()?.next()
    }
}

/// Endpoint de streaming d'un morceau à la fois
pub struct TrackStreamEndpoint {
    streamer: AudioStreamer,
    session: Mutex<PlaybackSession>,
    prebuffer: RwLock<Option<Arc<PrebufferManager>>>,
    gap: RwLock<Duration>,
    on_track_started: RwLock<Option<TrackStartedCallback>>,
}

impl TrackStreamEndpoint {
    pub fn new(streamer: AudioStreamer) -> Self {
        Self {
            streamer,
            session: Mutex::new(PlaybackSession::default()),
            prebuffer: RwLock::new(None),
            gap: RwLock::new(Duration::ZERO),
            on_track_started: RwLock::new(None),
        }
    }

    pub fn streamer(&self) -> &AudioStreamer {
        &self.streamer
    }

    fn session(&self) -> MutexGuard<'_, PlaybackSession> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_prebuffer(&self, manager: Option<Arc<PrebufferManager>>) {
        *self.prebuffer.write().unwrap_or_else(|p| p.into_inner()) = manager;
    }

    pub fn prebuffer(&self) -> Option<Arc<PrebufferManager>> {
        self.prebuffer
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_gap_between_tracks(&self, gap: Duration) {
        *self.gap.write().unwrap_or_else(|p| p.into_inner()) = gap;
    }

    pub fn set_volume(&self, volume: u8) {
        self.streamer.set_volume(volume);
    }

    pub fn set_normalization(&self, enabled: bool) {
        self.streamer.set_normalization(enabled);
    }

    pub fn set_on_track_started(&self, callback: Option<TrackStartedCallback>) {
        *self
            .on_track_started
            .write()
            .unwrap_or_else(|p| p.into_inner()) = callback;
    }

    pub fn set_on_track_finished(&self, callback: Option<TrackCallback>) {
        self.streamer.set_on_track_finished(callback);
    }

    /// Morceau actuellement servi
    pub fn current_track(&self) -> Option<String> {
        let session = self.session();
        if session.is_streaming {
            session.current_track.clone()
        } else {
            None
        }
    }

    /// Arrête le flux actif
    pub fn stop(&self) -> StreamTermination {
        let streaming = self.session().is_streaming;
        if !streaming {
            debug!("No running audio stream, nothing to stop");
            return StreamTermination::AlreadyStopped;
        }
        let outcome = self.streamer.terminate();
        info!(?outcome, "⏹️ Audio streaming stopped");
        outcome
    }

    /// Marque la fin du flux : la prochaine requête repartira de zéro
    pub fn set_stream_ended(&self) {
        let mut session = self.session();
        session.is_streaming = false;
        session.current_track = None;
    }

    /// Classe la requête et prépare l'état du streamer.
    ///
    /// Bloquant : peut arrêter un décodeur et attendre le délai entre
    /// morceaux.
    pub fn prepare(
        &self,
        track_id: &str,
        duration: &str,
        range_header: Option<&str>,
    ) -> Result<PreparedResponse> {
        let duration = parse_duration(duration)?;

        let (is_new_track, prebuffer) = {
            let mut session = self.session();
            let is_new_track =
                !session.is_streaming || session.current_track.as_deref() != Some(track_id);

            let mut prebuffer = None;
            if is_new_track {
                let total_len = WavHeader::for_duration(duration).total_len();
                prebuffer = self
                    .prebuffer()
                    .and_then(|manager| manager.get_and_clear(track_id, total_len));
                if let Some(buf) = &prebuffer {
                    debug!(track_id, bytes = buf.len(), "Prebuffer hit");
                }

                if session.is_streaming {
                    self.streamer.terminate();
                }
                session.is_streaming = true;
                session.current_track = Some(track_id.to_string());

                let gap = *self.gap.read().unwrap_or_else(|p| p.into_inner());
                if !gap.is_zero() {
                    info!("Delay {:?} before starting track", gap);
                    thread::sleep(gap);
                }

                self.streamer.set_track(track_id, duration);
                info!(
                    track_id,
                    total = self.streamer.total_len(),
                    "🎶 Start streaming track"
                );
            }
            (is_new_track, prebuffer)
        };

        if is_new_track {
            self.notify_track_started(track_id, duration);
        }

        let total = self.streamer.total_len();
        let request = parse_range(range_header, total);
        let range = request.range();
        let partial = matches!(request, RangeRequest::Partial(_));
        let is_seek = !is_new_track && range.begin > 0;

        debug!(
            track_id,
            range = ?range_header,
            begin = range.begin,
            end = range.end,
            total,
            is_new_track,
            is_seek,
            "Range request"
        );

        Ok(PreparedResponse {
            track_id: track_id.to_string(),
            range,
            total,
            partial,
            is_new_track,
            is_seek,
            prebuffer,
        })
    }

    fn notify_track_started(&self, track_id: &str, duration: f64) {
        let callback = self
            .on_track_started
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(callback) = callback else {
            return;
        };
        let id = track_id.to_string();
        let spawned = thread::Builder::new()
            .name("spotty-track-started".to_string())
            .spawn(move || callback(&id, duration));
        if let Err(e) = spawned {
            warn!(track_id, error = %e, "Could not notify track start");
        }
    }

    /// Ouvre le corps de la réponse pour une requête préparée
    pub fn open_body(&self, plan: &PreparedResponse) -> Result<ResponseBody> {
        if plan.is_seek {
            debug!(begin = plan.range.begin, "Seek, restarting decoder");
            self.streamer.terminate();
        }

        let ByteRange { begin, end } = plan.range;
        let mut live_begin = begin;

        let prefix = match &plan.prebuffer {
            Some(buf) if (begin as usize) < buf.len() => {
                let stop = (end as usize).min(buf.len());
                live_begin = stop as u64;
                Some(buf.slice(begin as usize..stop))
            }
            Some(buf) => {
                live_begin = begin.max(buf.len() as u64);
                None
            }
            None => None,
        };

        let live = if live_begin < end {
            Some(self.streamer.stream_range(live_begin, end - live_begin)?)
        } else {
            None
        };

        Ok(ResponseBody { prefix, live })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderSettings;
    use crate::testing::FakeLauncher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn endpoint(launcher: &Arc<FakeLauncher>) -> TrackStreamEndpoint {
        let streamer = AudioStreamer::new(launcher.clone(), DecoderSettings::default());
        streamer.set_chunk_size(64 * 1024);
        TrackStreamEndpoint::new(streamer)
    }

    fn body(endpoint: &TrackStreamEndpoint, plan: &PreparedResponse) -> Vec<u8> {
        endpoint
            .open_body(plan)
            .unwrap()
            .flat_map(|c| c.unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("178.795").unwrap(), 178.795);
        assert_eq!(parse_duration("200").unwrap(), 200.0);
        assert!(matches!(
            parse_duration("abc"),
            Err(SpottyError::InvalidDuration(_))
        ));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("inf").is_err());
    }

    #[test]
    fn test_classification_new_resume_seek() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);

        let first = ep.prepare("abc", "10", None).unwrap();
        assert!(first.is_new_track);
        assert!(!first.is_seek);
        assert_eq!(first.status(), 200);
        assert_eq!(ep.current_track().as_deref(), Some("abc"));

        let resume = ep.prepare("abc", "10", Some("bytes=0-")).unwrap();
        assert!(!resume.is_new_track);
        assert!(!resume.is_seek);

        let seek = ep.prepare("abc", "10", Some("bytes=500000-")).unwrap();
        assert!(!seek.is_new_track);
        assert!(seek.is_seek);
        assert_eq!(seek.status(), 206);

        let other = ep.prepare("def", "10", Some("bytes=500000-")).unwrap();
        assert!(other.is_new_track);
        assert!(!other.is_seek);
    }

    #[test]
    fn test_seek_terminates_one_and_spawns_one() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);

        let plan = ep.prepare("abc", "10", None).unwrap();
        let mut stream = ep.open_body(&plan).unwrap();
        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();
        assert_eq!(launcher.spawn_count(), 1);

        let begin = 44 + 3 * 176_400 + 100;
        let seek = ep
            .prepare("abc", "10", Some(&format!("bytes={}-", begin)))
            .unwrap();
        let mut seek_body = ep.open_body(&seek).unwrap();
        assert_eq!(launcher.terminate_count(), 1);

        let first = seek_body.next().unwrap().unwrap();
        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(launcher.requests()[1].start_second, 3);
        assert_eq!(&first[..10], &FakeLauncher::pcm_range(3 * 176_400 + 100, 10)[..]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_prebuffer_serves_leading_bytes() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);
        let manager = Arc::new(PrebufferManager::new(
            launcher.clone(),
            DecoderSettings::default(),
            15,
        ));
        ep.set_prebuffer(Some(manager.clone()));

        manager.start_prebuffer("x", 20.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !manager.is_ready("x") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.is_ready("x"));
        assert_eq!(launcher.spawn_count(), 1);

        let plan = ep.prepare("x", "20", None).unwrap();
        assert_eq!(plan.prebuffer.as_ref().unwrap().len(), 2_646_000);

        let mut body_iter = ep.open_body(&plan).unwrap();
        assert_eq!(body_iter.prefix_len(), 2_646_000);
        let head = body_iter.next().unwrap().unwrap();
        assert_eq!(head.len(), 2_646_000);
        // Le décodeur live n'a pas encore été sollicité
        assert_eq!(launcher.spawn_count(), 1);

        let rest: Vec<u8> = body_iter.flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(head.len() + rest.len(), plan.total as usize);
        assert_eq!(launcher.spawn_count(), 2);

        let live_request = &launcher.requests()[1];
        assert_eq!(live_request.start_second, (2_646_000 - 44) / 176_400);
        assert_eq!(&rest[..8], &FakeLauncher::pcm_range(2_646_000 - 44, 8)[..]);

        // Le tampon a été consommé
        assert!(manager.get_and_clear("x", plan.total).is_none());
    }

    #[test]
    fn test_prebuffer_for_other_duration_is_not_served() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);
        let manager = Arc::new(PrebufferManager::new(
            launcher.clone(),
            DecoderSettings::default(),
            15,
        ));
        ep.set_prebuffer(Some(manager.clone()));

        manager.start_prebuffer("x", 20.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !manager.is_ready("x") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.is_ready("x"));

        let plan = ep.prepare("x", "30", None).unwrap();
        assert!(plan.prebuffer.is_none());

        let bytes = body(&ep, &plan);
        let header = WavHeader::for_duration(30.0);
        assert_eq!(bytes.len() as u64, plan.content_length());
        assert_eq!(bytes.len() as u64, header.total_len());
        assert_eq!(&bytes[..44], &header.as_bytes()[..]);
        assert_eq!(&bytes[44..52], &FakeLauncher::pcm_range(0, 8)[..]);
    }

    #[test]
    fn test_track_started_fires_once_per_new_track() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        ep.set_on_track_started(Some(Arc::new(move |_id: &str, _d: f64| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        ep.prepare("abc", "10", None).unwrap();
        ep.prepare("abc", "10", Some("bytes=100-")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_and_stream_ended() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);
        assert_eq!(ep.stop(), StreamTermination::AlreadyStopped);

        let plan = ep.prepare("abc", "10", None).unwrap();
        let mut stream = ep.open_body(&plan).unwrap();
        stream.next();
        stream.next();
        assert_eq!(ep.stop(), StreamTermination::Terminated);

        ep.set_stream_ended();
        assert!(ep.current_track().is_none());
        assert!(ep.prepare("abc", "10", None).unwrap().is_new_track);
    }

    #[test]
    fn test_full_body_matches_total() {
        let launcher = Arc::new(FakeLauncher::new());
        let ep = endpoint(&launcher);
        let plan = ep.prepare("abc", "1.5", None).unwrap();
        let bytes = body(&ep, &plan);
        assert_eq!(bytes.len() as u64, plan.total);
        assert_eq!(&bytes[..4], b"RIFF");
    }
}
