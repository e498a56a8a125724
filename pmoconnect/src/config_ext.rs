//! Extension pour intégrer la configuration du récepteur dans pmoconfig
//!
//! Ajoute à `pmoconfig::Config` les réglages de la section `connect`.

use crate::backend::{
    BackendKind, DEFAULT_ALSA_DEVICE, DEFAULT_RTP_ADDRESS, DEFAULT_RTP_PORT, DEFAULT_RTP_SINK,
};
use crate::events::EVENT_PORT;
use crate::supervisor::{DEFAULT_MAX_RETRIES, ReceiverOptions};
use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::warn;

/// Trait d'extension pour la section `connect` de la configuration
pub trait ConnectConfigExt {
    fn get_connect_enabled(&self) -> bool;

    fn set_connect_enabled(&self, enabled: bool) -> Result<()>;

    fn get_connect_binary(&self) -> PathBuf;

    /// Backend audio ; une valeur inconnue retombe sur PulseAudio RTP
    fn get_connect_backend(&self) -> BackendKind;

    fn get_connect_device_name(&self) -> String;

    fn get_connect_device_type(&self) -> String;

    fn get_connect_bitrate(&self) -> u32;

    fn get_connect_max_retries(&self) -> u32;

    fn get_connect_options(&self) -> String;

    /// Hook d'événements ; par défaut `pmospotty-onevent` à côté de
    /// l'exécutable courant
    fn get_connect_onevent(&self) -> Option<PathBuf>;

    fn get_connect_alsa_device(&self) -> String;

    /// Mode « ne pas déranger » : le récepteur s'efface devant l'hôte
    fn get_connect_dnd(&self) -> bool;

    fn get_connect_event_port(&self) -> u16;

    fn get_connect_rtp_address(&self) -> String;

    fn get_connect_rtp_port(&self) -> u16;

    fn get_connect_rtp_sink(&self) -> String;

    /// Options de la ligne de commande du récepteur
    fn get_receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            binary: self.get_connect_binary(),
            bitrate: self.get_connect_bitrate(),
            device_type: self.get_connect_device_type(),
            name: self.get_connect_device_name(),
            onevent: self.get_connect_onevent(),
            options: self.get_connect_options(),
            max_retries: self.get_connect_max_retries(),
        }
    }
}

fn port(config: &Config, path: &[&str], default: u16) -> u16 {
    u16::try_from(config.get_int(path, default as i64))
        .ok()
        .filter(|p| *p > 0)
        .unwrap_or(default)
}

impl ConnectConfigExt for Config {
    fn get_connect_enabled(&self) -> bool {
        self.get_bool(&["connect", "enabled"], false)
    }

    fn set_connect_enabled(&self, enabled: bool) -> Result<()> {
        self.set_value(&["connect", "enabled"], Value::Bool(enabled))
    }

    fn get_connect_binary(&self) -> PathBuf {
        PathBuf::from(self.get_string(&["connect", "binary"], "librespot"))
    }

    fn get_connect_backend(&self) -> BackendKind {
        let raw = self.get_string(&["connect", "backend"], "pulseaudio_rtp");
        raw.parse().unwrap_or_else(|e| {
            warn!("{}, using pulseaudio_rtp", e);
            BackendKind::PulseAudioRtp
        })
    }

    fn get_connect_device_name(&self) -> String {
        self.get_string(&["connect", "device_name"], "Spotify Connect@{}")
    }

    fn get_connect_device_type(&self) -> String {
        self.get_string(&["connect", "device_type"], "tv")
    }

    fn get_connect_bitrate(&self) -> u32 {
        match self.get_int(&["connect", "bitrate"], 320) {
            b @ (96 | 160 | 320) => b as u32,
            other => {
                warn!("Unsupported receiver bitrate {}, using 320", other);
                320
            }
        }
    }

    fn get_connect_max_retries(&self) -> u32 {
        match self.get_int(&["connect", "max_retries"], DEFAULT_MAX_RETRIES as i64) {
            n if n >= 1 => u32::try_from(n).unwrap_or(DEFAULT_MAX_RETRIES),
            _ => DEFAULT_MAX_RETRIES,
        }
    }

    fn get_connect_options(&self) -> String {
        self.get_string(&["connect", "options"], "")
    }

    fn get_connect_onevent(&self) -> Option<PathBuf> {
        let configured = self.get_string(&["connect", "onevent"], "");
        if !configured.trim().is_empty() {
            return Some(PathBuf::from(configured.trim()));
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("pmospotty-onevent")))
    }

    fn get_connect_alsa_device(&self) -> String {
        self.get_string(&["connect", "alsa_device"], DEFAULT_ALSA_DEVICE)
    }

    fn get_connect_dnd(&self) -> bool {
        self.get_bool(&["connect", "dnd"], false)
    }

    fn get_connect_event_port(&self) -> u16 {
        port(self, &["connect", "event_port"], EVENT_PORT)
    }

    fn get_connect_rtp_address(&self) -> String {
        self.get_string(&["connect", "rtp", "address"], DEFAULT_RTP_ADDRESS)
    }

    fn get_connect_rtp_port(&self) -> u16 {
        port(self, &["connect", "rtp", "port"], DEFAULT_RTP_PORT)
    }

    fn get_connect_rtp_sink(&self) -> String {
        self.get_string(&["connect", "rtp", "sink"], DEFAULT_RTP_SINK)
    }
}
