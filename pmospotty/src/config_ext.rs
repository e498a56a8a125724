//! Extension pour intégrer la configuration du streaming dans pmoconfig
//!
//! Ce module fournit le trait `SpottyConfigExt` qui ajoute à
//! `pmoconfig::Config` les réglages de la section `spotty` : binaire du
//! décodeur, volume, normalisation, pré-chargement, etc.
//!
//! Les valeurs absentes ou hors bornes sont remplacées par les valeurs par
//! défaut ou ramenées dans leur intervalle.

use crate::decoder::{DEFAULT_BITRATE, DEFAULT_VOLUME, DecoderSettings, clamp_volume};
use crate::prebuffer::{PREBUFFER_SECONDS_DEFAULT, clamp_prebuffer_seconds};
use crate::streamer::DEFAULT_CHUNK_SIZE;
use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::{Number, Value};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BINARY: &str = "spotty";
const DEFAULT_POLL_INTERVAL_SECS: i64 = 6;

/// Trait d'extension pour la section `spotty` de la configuration
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmospotty::SpottyConfigExt;
///
/// let config = get_config();
/// let volume = config.get_spotty_volume();
/// config.set_prebuffer_seconds(20)?;
/// ```
pub trait SpottyConfigExt {
    /// Chemin du binaire décodeur (`spotty.binary`)
    fn get_spotty_binary(&self) -> PathBuf;

    fn get_spotty_bitrate(&self) -> u32;

    /// Répertoire de cache du décodeur (`spotty.cache_dir`), si configuré
    fn get_spotty_cache_dir(&self) -> Option<PathBuf>;

    /// Volume initial, ramené dans `1..=100`
    fn get_spotty_volume(&self) -> u8;

    fn set_spotty_volume(&self, volume: u8) -> Result<()>;

    fn get_spotty_normalization(&self) -> bool;

    fn set_spotty_normalization(&self, enabled: bool) -> Result<()>;

    /// Réglages décodeur courants (volume + normalisation)
    fn get_decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            volume: self.get_spotty_volume(),
            normalization: self.get_spotty_normalization(),
        }
    }

    /// Taille des blocs lus sur la sortie du décodeur
    fn get_spotty_chunk_size(&self) -> usize;

    /// Pause entre deux morceaux
    fn get_gap_between_tracks(&self) -> Duration;

    fn get_prebuffer_enabled(&self) -> bool;

    fn set_prebuffer_enabled(&self, enabled: bool) -> Result<()>;

    /// Durée pré-chargée, ramenée dans `5..=30` secondes
    fn get_prebuffer_seconds(&self) -> u32;

    fn set_prebuffer_seconds(&self, seconds: u32) -> Result<()>;

    /// Période de relecture du fichier de configuration
    fn get_settings_poll_interval(&self) -> Duration;

    fn get_recently_played_enabled(&self) -> bool;
}

impl SpottyConfigExt for Config {
    fn get_spotty_binary(&self) -> PathBuf {
        PathBuf::from(self.get_string(&["spotty", "binary"], DEFAULT_BINARY))
    }

    fn get_spotty_bitrate(&self) -> u32 {
        match self.get_int(&["spotty", "bitrate"], DEFAULT_BITRATE as i64) {
            b @ 1..=1000 => b as u32,
            _ => DEFAULT_BITRATE,
        }
    }

    fn get_spotty_cache_dir(&self) -> Option<PathBuf> {
        let dir = self.get_string(&["spotty", "cache_dir"], "");
        if dir.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        }
    }

    fn get_spotty_volume(&self) -> u8 {
        clamp_volume(self.get_int(&["spotty", "volume"], DEFAULT_VOLUME as i64))
    }

    fn set_spotty_volume(&self, volume: u8) -> Result<()> {
        self.set_value(
            &["spotty", "volume"],
            Value::Number(Number::from(clamp_volume(volume as i64))),
        )
    }

    fn get_spotty_normalization(&self) -> bool {
        self.get_bool(&["spotty", "normalization"], true)
    }

    fn set_spotty_normalization(&self, enabled: bool) -> Result<()> {
        self.set_value(&["spotty", "normalization"], Value::Bool(enabled))
    }

    fn get_spotty_chunk_size(&self) -> usize {
        match self.get_int(&["spotty", "chunk_size"], DEFAULT_CHUNK_SIZE as i64) {
            n if n > 0 => n as usize,
            _ => DEFAULT_CHUNK_SIZE,
        }
    }

    fn get_gap_between_tracks(&self) -> Duration {
        let secs = self.get_int(&["spotty", "gap_between_tracks"], 0).max(0);
        Duration::from_secs(secs as u64)
    }

    fn get_prebuffer_enabled(&self) -> bool {
        self.get_bool(&["spotty", "prebuffer", "enabled"], true)
    }

    fn set_prebuffer_enabled(&self, enabled: bool) -> Result<()> {
        self.set_value(&["spotty", "prebuffer", "enabled"], Value::Bool(enabled))
    }

    fn get_prebuffer_seconds(&self) -> u32 {
        clamp_prebuffer_seconds(self.get_int(
            &["spotty", "prebuffer", "seconds"],
            PREBUFFER_SECONDS_DEFAULT as i64,
        ))
    }

    fn set_prebuffer_seconds(&self, seconds: u32) -> Result<()> {
        let seconds = clamp_prebuffer_seconds(seconds as i64);
        self.set_value(
            &["spotty", "prebuffer", "seconds"],
            Value::Number(Number::from(seconds)),
        )
    }

    fn get_settings_poll_interval(&self) -> Duration {
        let secs = self
            .get_int(&["spotty", "settings_poll_interval"], DEFAULT_POLL_INTERVAL_SECS)
            .max(1);
        Duration::from_secs(secs as u64)
    }

    fn get_recently_played_enabled(&self) -> bool {
        self.get_bool(&["spotty", "recently_played", "enabled"], true)
    }
}
