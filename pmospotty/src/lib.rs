//! # pmospotty - Streaming HTTP local de morceaux décodés par `spotty`
//!
//! Cette crate sert au lecteur multimédia local un fichier WAV « virtuel »
//! par morceau : un en-tête synthétisé à partir de la durée annoncée, suivi
//! du PCM produit à la volée par le décodeur externe.
//!
//! ## Fonctionnalités
//!
//! - 🎵 **Décodeur externe** : lancement, arrêt et récupération de `spotty`
//! - 📐 **Requêtes Range** : projection des plages HTTP sur le flux PCM, seek
//!   par relance du décodeur à la seconde près puis saut fin
//! - ⚡ **Pré-chargement** : les premières secondes du morceau suivant sont
//!   prêtes avant que le lecteur ne les demande
//! - 🌐 **Intégration pmoserver** : route `/track/{track_id}/{duration}` et
//!   file de lecture `/queue`
//!
//! ## Architecture
//!
//! - [`decoder`] : adaptateur du processus décodeur ([`DecoderLauncher`])
//! - [`wav`] : en-tête WAV et constantes PCM
//! - [`streamer`] : [`AudioStreamer`] et flux de plage ([`RangeStream`])
//! - [`range`] : analyse de l'en-tête `Range`
//! - [`prebuffer`] : cache de pré-chargement à un emplacement
//! - [`endpoint`] : classification des requêtes et corps de réponse
//! - [`pmoserver_ext`] : routes Axum
//! - [`playlist`] : file de lecture et planification du pré-chargement
//! - [`settings`] : relecture périodique de la configuration
//! - [`recently_played`] : historique des morceaux terminés
//!
//! ## Exemple
//!
//! ```rust,no_run
//! use pmospotty::{AudioStreamer, SpottyLauncher, SpottyStreamingExt, TrackStreamEndpoint};
//! use pmospotty::decoder::DecoderSettings;
//! use pmoserver::ServerBuilder;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let launcher = Arc::new(SpottyLauncher::new("/usr/bin/spotty"));
//! let streamer = AudioStreamer::new(launcher, DecoderSettings::default());
//! let endpoint = Arc::new(TrackStreamEndpoint::new(streamer));
//!
//! let mut server = ServerBuilder::new_configured().build();
//! server.init_spotty_streaming(endpoint).await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config_ext;
pub mod decoder;
pub mod endpoint;
pub mod error;
pub mod playlist;
pub mod pmoserver_ext;
pub mod prebuffer;
pub mod range;
pub mod recently_played;
pub mod settings;
pub mod streamer;
pub mod wav;

#[cfg(test)]
mod testing;

pub use config_ext::SpottyConfigExt;
pub use decoder::{DecodeRequest, DecoderLauncher, DecoderProcess, SpottyLauncher};
pub use endpoint::{PreparedResponse, TRACK_ROUTE, TrackStreamEndpoint};
pub use error::{Result, SpottyError};
pub use playlist::{
    PlaylistProvider, PrebufferScheduler, QueuedTrack, TrackQueue, parse_track_url, track_url,
};
pub use pmoserver_ext::{SpottyStreamingExt, history_router, queue_router, track_router};
pub use prebuffer::PrebufferManager;
pub use range::{ByteRange, RangeRequest, parse_range};
pub use recently_played::RecentlyPlayed;
pub use settings::SettingsPoller;
pub use streamer::{AudioStreamer, CancelToken, RangeStream, StreamTermination, TrackSession};
pub use wav::WavHeader;
