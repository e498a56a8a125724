//! # pmoconnect - Récepteur « haut-parleur distant » supervisé
//!
//! Un second mode du décodeur tourne en tâche de fond et s'annonce sur le
//! réseau comme un haut-parleur. Cette crate :
//!
//! - 🔁 supervise le processus récepteur avec un nombre borné de relances
//!   ([`ReceiverSupervisor`]) ;
//! - 🔊 configure sa sortie audio ([`backend`] : défaut, ALSA, PulseAudio RTP) ;
//! - 📨 écoute les événements envoyés par son hook sur UDP ([`events`]) ;
//! - ▶️ relaie ces événements au lecteur hôte ([`ConnectPlayer`]).
//!
//! ## Exemple
//!
//! ```rust,no_run
//! use pmoconnect::{ConnectReceiver, HeadlessHost};
//! use pmoconfig::get_config;
//! use std::sync::Arc;
//!
//! let config = get_config();
//! if let Some(receiver) = ConnectReceiver::from_config(&config, Arc::new(HeadlessHost::new()))? {
//!     // ...
//!     receiver.stop();
//! }
//! # Ok::<(), pmoconnect::ConnectError>(())
//! ```

pub mod backend;
pub mod config_ext;
pub mod error;
pub mod events;
pub mod player;
pub mod supervisor;

pub use backend::{AlsaBackend, BackendKind, DefaultBackend, PulseAudioRtpBackend, ReceiverBackend};
pub use config_ext::ConnectConfigExt;
pub use error::{ConnectError, Result};
pub use events::{EVENT_PORT, EventReceiver, PlayerEvent, TrackInfo};
pub use player::{ConnectPlayer, HeadlessHost, HostPlayer, ReceiverControl};
pub use supervisor::{ReceiverOptions, ReceiverSupervisor, SupervisorState};

use pmoconfig::Config;
use std::sync::Arc;
use tracing::info;

/// Construit le backend configuré
pub fn backend_from_config(config: &Config) -> Arc<dyn ReceiverBackend> {
    match config.get_connect_backend() {
        BackendKind::Default => Arc::new(DefaultBackend),
        BackendKind::Alsa => Arc::new(AlsaBackend::new(config.get_connect_alsa_device())),
        BackendKind::PulseAudioRtp => Arc::new(PulseAudioRtpBackend::new(
            config.get_connect_rtp_address(),
            config.get_connect_rtp_port(),
            config.get_connect_rtp_sink(),
        )),
    }
}

/// Récepteur en service : superviseur, lecteur et fil d'événements
pub struct ConnectReceiver {
    supervisor: Arc<ReceiverSupervisor>,
    player: Arc<ConnectPlayer>,
}

impl ConnectReceiver {
    /// Démarre le récepteur si `connect.enabled` est vrai
    pub fn from_config(config: &Config, host: Arc<dyn HostPlayer>) -> Result<Option<Self>> {
        if !config.get_connect_enabled() {
            info!("Connect receiver disabled");
            return Ok(None);
        }

        let backend = backend_from_config(config);
        let supervisor = Arc::new(ReceiverSupervisor::new(
            &config.get_receiver_options(),
            backend,
        ));
        let events = EventReceiver::bind(config.get_connect_event_port())?;
        Self::start(supervisor, events, host, config.get_connect_dnd()).map(Some)
    }

    /// Branche le lecteur et son fil d'événements sur un superviseur
    pub fn start(
        supervisor: Arc<ReceiverSupervisor>,
        events: EventReceiver,
        host: Arc<dyn HostPlayer>,
        dnd: bool,
    ) -> Result<Self> {
        let player = Arc::new(ConnectPlayer::new(supervisor.clone(), host, dnd));
        player.spawn_dispatcher(events)?;
        info!(
            "✅ Connect receiver started (backend={})",
            supervisor.backend().name()
        );
        Ok(Self { supervisor, player })
    }

    pub fn supervisor(&self) -> &Arc<ReceiverSupervisor> {
        &self.supervisor
    }

    pub fn player(&self) -> &Arc<ConnectPlayer> {
        &self.player
    }

    /// Arrête le fil d'événements puis le récepteur
    pub fn stop(&self) {
        self.player.shutdown();
        self.supervisor.stop();
        info!("Connect receiver stopped");
    }
}
