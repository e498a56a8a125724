//! Liaison entre le récepteur et le lecteur hôte.
//!
//! [`ConnectPlayer`] réagit dans les deux sens :
//!
//! - événements du récepteur (changement de morceau, arrêt) : le lecteur
//!   hôte se met à lire l'URL du récepteur ou s'arrête ;
//! - événements du lecteur hôte (début et fin de lecture) : le récepteur est
//!   relancé, démarré ou arrêté (mode « ne pas déranger »).

use crate::events::{self, EventReceiver, PlayerEvent, TrackInfo};
use crate::supervisor::ReceiverSupervisor;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DISPATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Contrôle du récepteur vu par le lecteur
pub trait ReceiverControl: Send + Sync {
    fn start(&self) -> bool;
    fn stop(&self);
    fn restart(&self) -> bool;
    /// URL à lire côté hôte
    fn playback_url(&self) -> String;
    fn sink_start(&self);
    fn sink_end(&self);
}

impl ReceiverControl for ReceiverSupervisor {
    fn start(&self) -> bool {
        ReceiverSupervisor::start(self)
    }

    fn stop(&self) {
        ReceiverSupervisor::stop(self)
    }

    fn restart(&self) -> bool {
        ReceiverSupervisor::restart(self)
    }

    fn playback_url(&self) -> String {
        self.backend().playback_url()
    }

    fn sink_start(&self) {
        self.backend().sink_start()
    }

    fn sink_end(&self) {
        self.backend().sink_end()
    }
}

/// Lecteur hôte piloté par le récepteur
pub trait HostPlayer: Send + Sync {
    fn is_playing(&self) -> bool;

    /// URL en cours de lecture
    fn playing_url(&self) -> Option<String>;

    fn play(&self, url: &str, info: &TrackInfo);

    /// Met à jour les métadonnées affichées sans interrompre la lecture
    fn update_info(&self, info: &TrackInfo);

    fn stop(&self);
}

/// Lecteur hôte sans interface : garde l'état et le journalise
#[derive(Debug, Default)]
pub struct HeadlessHost {
    now_playing: Mutex<Option<(String, TrackInfo)>>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<(String, TrackInfo)>> {
        self.now_playing.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn now_playing(&self) -> Option<(String, TrackInfo)> {
        self.slot().clone()
    }
}

impl HostPlayer for HeadlessHost {
    fn is_playing(&self) -> bool {
        self.slot().is_some()
    }

    fn playing_url(&self) -> Option<String> {
        self.slot().as_ref().map(|(url, _)| url.clone())
    }

    fn play(&self, url: &str, info: &TrackInfo) {
        info!("▶️ Now playing {} - {} ({})", info.artist, info.title, url);
        *self.slot() = Some((url.to_string(), info.clone()));
    }

    fn update_info(&self, info: &TrackInfo) {
        info!("🎵 Track changed: {} - {}", info.artist, info.title);
        if let Some((_, current)) = self.slot().as_mut() {
            *current = info.clone();
        }
    }

    fn stop(&self) {
        if self.slot().take().is_some() {
            info!("⏹️ Playback stopped");
        }
    }
}

struct Dispatcher {
    handle: JoinHandle<()>,
    finished: Receiver<()>,
    port: u16,
}

pub struct ConnectPlayer {
    receiver: Arc<dyn ReceiverControl>,
    host: Arc<dyn HostPlayer>,
    dnd: bool,
    last_url: Mutex<Option<String>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl ConnectPlayer {
    /// Crée le lecteur et démarre le récepteur, sauf en mode « ne pas
    /// déranger » quand l'hôte joue déjà.
    pub fn new(receiver: Arc<dyn ReceiverControl>, host: Arc<dyn HostPlayer>, dnd: bool) -> Self {
        let player = Self {
            receiver,
            host,
            dnd,
            last_url: Mutex::new(None),
            dispatcher: Mutex::new(None),
        };
        if !(player.dnd && player.host.is_playing()) {
            player.receiver.start();
        } else {
            info!("Host is playing, receiver not started (do not disturb)");
        }
        player
    }

    fn last_url(&self) -> MutexGuard<'_, Option<String>> {
        self.last_url.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_receiver_url(&self, url: Option<&str>) -> bool {
        url.is_some_and(|u| u == self.receiver.playback_url())
    }

    fn host_plays_receiver(&self) -> bool {
        self.host.is_playing() && self.is_receiver_url(self.host.playing_url().as_deref())
    }

    /// Le lecteur hôte a commencé à lire `url`
    pub fn on_host_playback_started(&self, url: &str) {
        let mut last = self.last_url();
        if !self.is_receiver_url(Some(url)) {
            if self.dnd {
                debug!(url, "Host took over, stopping receiver");
                self.receiver.stop();
            } else if self.is_receiver_url(last.as_deref()) {
                debug!(url, "Host took over, restarting receiver");
                self.receiver.restart();
            }
        }
        *last = Some(url.to_string());
    }

    /// Le lecteur hôte s'est arrêté (fin, erreur ou arrêt manuel)
    pub fn on_host_playback_ended(&self) {
        let mut last = self.last_url();
        if self.is_receiver_url(last.as_deref()) {
            self.receiver.restart();
        } else {
            self.receiver.start();
        }
        *last = None;
    }

    fn on_track_changed(&self, info: &TrackInfo) {
        if self.host_plays_receiver() {
            self.host.update_info(info);
        } else {
            self.host.stop();
            self.receiver.sink_start();
            self.host.play(&self.receiver.playback_url(), info);
        }
    }

    fn on_stopped(&self) {
        self.receiver.sink_end();
        if self.host_plays_receiver() {
            *self.last_url() = None;
            self.host.stop();
        }
    }

    /// Applique un événement du récepteur
    pub fn dispatch(&self, event: &PlayerEvent) {
        match event {
            PlayerEvent::TrackChanged(info) => self.on_track_changed(info),
            PlayerEvent::Stopped => self.on_stopped(),
        }
    }

    /// Démarre le fil qui consomme les événements du récepteur
    pub fn spawn_dispatcher(self: &Arc<Self>, events: EventReceiver) -> std::io::Result<()> {
        let port = events.local_addr().map_err(std::io::Error::other)?.port();
        let (finished_tx, finished_rx) = mpsc::sync_channel(1);
        let player = self.clone();

        let handle = thread::Builder::new()
            .name("connect-events".to_string())
            .spawn(move || {
                info!("📨 Event dispatcher started on port {}", port);
                for event in events.events() {
                    debug!(?event, "Receiver event");
                    player.dispatch(&event);
                }
                info!("Event dispatcher stopped");
                let _ = finished_tx.send(());
            })?;

        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(Dispatcher {
            handle,
            finished: finished_rx,
            port,
        });
        Ok(())
    }

    /// Arrête le fil d'événements (attente bornée à 2 s) et libère l'hôte
    pub fn shutdown(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(dispatcher) = dispatcher {
            if let Err(e) = events::send_shutdown(dispatcher.port) {
                warn!("Could not signal event dispatcher: {}", e);
            }
            match dispatcher.finished.recv_timeout(DISPATCHER_JOIN_TIMEOUT) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if dispatcher.handle.join().is_err() {
                        error!("Event dispatcher panicked");
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!("Event dispatcher did not stop within {:?}", DISPATCHER_JOIN_TIMEOUT);
                }
            }
        }

        self.on_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const URL: &str = "rtp://127.0.0.1:24643";

    #[derive(Default)]
    struct RecordingReceiver {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingReceiver {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ReceiverControl for RecordingReceiver {
        fn start(&self) -> bool {
            self.record("start");
            true
        }
        fn stop(&self) {
            self.record("stop");
        }
        fn restart(&self) -> bool {
            self.record("restart");
            true
        }
        fn playback_url(&self) -> String {
            URL.to_string()
        }
        fn sink_start(&self) {
            self.record("sink_start");
        }
        fn sink_end(&self) {
            self.record("sink_end");
        }
    }

    fn setup(dnd: bool) -> (Arc<RecordingReceiver>, Arc<HeadlessHost>, Arc<ConnectPlayer>) {
        let receiver = Arc::new(RecordingReceiver::default());
        let host = Arc::new(HeadlessHost::new());
        let player = Arc::new(ConnectPlayer::new(receiver.clone(), host.clone(), dnd));
        (receiver, host, player)
    }

    fn info(title: &str) -> TrackInfo {
        TrackInfo {
            title: title.into(),
            ..TrackInfo::default()
        }
    }

    #[test]
    fn test_track_changed_starts_host_playback() {
        let (receiver, host, player) = setup(false);

        player.dispatch(&PlayerEvent::TrackChanged(info("One")));
        let (url, now) = host.now_playing().unwrap();
        assert_eq!(url, URL);
        assert_eq!(now.title, "One");

        // Déjà en lecture : simple mise à jour
        player.dispatch(&PlayerEvent::TrackChanged(info("Two")));
        assert_eq!(host.now_playing().unwrap().1.title, "Two");
        assert_eq!(receiver.calls(), vec!["start", "sink_start"]);

        player.dispatch(&PlayerEvent::Stopped);
        assert!(host.now_playing().is_none());
        assert_eq!(receiver.calls(), vec!["start", "sink_start", "sink_end"]);
    }

    #[test]
    fn test_host_takes_over_restarts_receiver() {
        let (receiver, _host, player) = setup(false);

        player.on_host_playback_started(URL);
        player.on_host_playback_started("http://localhost:52308/track/abc/200");
        player.on_host_playback_ended();
        assert_eq!(receiver.calls(), vec!["start", "restart", "start"]);
    }

    #[test]
    fn test_receiver_url_ended_restarts() {
        let (receiver, _host, player) = setup(false);
        player.on_host_playback_started(URL);
        player.on_host_playback_ended();
        assert_eq!(receiver.calls(), vec!["start", "restart"]);
    }

    #[test]
    fn test_do_not_disturb() {
        let receiver = Arc::new(RecordingReceiver::default());
        let host = Arc::new(HeadlessHost::new());
        host.play("http://localhost:52308/track/abc/200", &info("Local"));

        let player = ConnectPlayer::new(receiver.clone(), host.clone(), true);
        assert!(receiver.calls().is_empty());

        player.on_host_playback_started("http://localhost:52308/track/def/100");
        assert_eq!(receiver.calls(), vec!["stop"]);

        player.on_host_playback_ended();
        assert_eq!(receiver.calls(), vec!["stop", "start"]);
    }

    #[test]
    fn test_dispatcher_consumes_events_until_shutdown() {
        let (receiver, host, player) = setup(false);
        let events = EventReceiver::bind(0).unwrap();
        let port = events.local_addr().unwrap().port();
        player.spawn_dispatcher(events).unwrap();

        events::send_event(port, &PlayerEvent::TrackChanged(info("Remote"))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while host.now_playing().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(host.now_playing().unwrap().1.title, "Remote");

        player.shutdown();
        assert!(host.now_playing().is_none());
        assert_eq!(receiver.calls().last(), Some(&"sink_end"));
    }
}
