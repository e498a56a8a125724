//! Types d'erreurs pour pmospotty

use thiserror::Error;

/// Erreurs de la chaîne de streaming
#[derive(Debug, Error)]
pub enum SpottyError {
    /// Le binaire décodeur n'a pas pu être lancé
    #[error(
        "failed to spawn decoder '{binary}': {source}. \
         Check that the binary exists, is executable, and that `spotty.binary` points to it"
    )]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid track URL: {0}")]
    InvalidTrackUrl(String),

    /// Aucun morceau n'est configuré sur le streamer
    #[error("no track set on the streamer")]
    NoTrack,

    /// Le flux a été annulé par une requête plus récente
    #[error("stream cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

/// Type Result pour pmospotty
pub type Result<T> = std::result::Result<T, SpottyError>;
