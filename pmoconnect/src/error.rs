//! Types d'erreurs pour pmoconnect

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    /// Le binaire récepteur n'a pas pu être lancé
    #[error(
        "failed to spawn receiver '{binary}': {source}. \
         Install librespot or point `connect.binary` to it"
    )]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown receiver backend: {0}")]
    UnknownBackend(String),

    /// Datagramme d'événement illisible
    #[error("invalid player event: {0}")]
    InvalidEvent(String),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConnectError>;
