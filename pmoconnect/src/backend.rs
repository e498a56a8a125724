//! Sorties audio du récepteur.
//!
//! Chaque backend ajoute ses arguments à la ligne de commande du récepteur
//! et sait, le cas échéant, réveiller ou endormir le puits audio qu'il
//! alimente. Le backend PulseAudio RTP crée un puits nul dont le moniteur est
//! réémis en RTP ; le lecteur hôte lit alors `rtp://adresse:port`.

use crate::error::ConnectError;
use std::fmt;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_ALSA_DEVICE: &str = "hw:2,0";
pub const DEFAULT_RTP_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_RTP_PORT: u16 = 24643;
pub const DEFAULT_RTP_SINK: &str = "pmospotty_connect";

/// Sortie audio d'un récepteur
pub trait ReceiverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Arguments ajoutés à la ligne de commande du récepteur
    fn extra_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// URL que le lecteur hôte doit lire pour entendre le récepteur
    fn playback_url(&self) -> String {
        String::new()
    }

    /// Réveille le puits audio
    fn sink_start(&self) {}

    /// Endort le puits audio
    fn sink_end(&self) {}
}

/// Sortie par défaut du récepteur, sans argument supplémentaire
#[derive(Debug, Default)]
pub struct DefaultBackend;

impl ReceiverBackend for DefaultBackend {
    fn name(&self) -> &'static str {
        "default"
    }
}

#[derive(Debug)]
pub struct AlsaBackend {
    device: String,
}

impl AlsaBackend {
    pub fn new(device: impl Into<String>) -> Self {
        let device = device.into();
        let device = if device.trim().is_empty() {
            DEFAULT_ALSA_DEVICE.to_string()
        } else {
            device
        };
        Self { device }
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl ReceiverBackend for AlsaBackend {
    fn name(&self) -> &'static str {
        "alsa"
    }

    fn extra_args(&self) -> Vec<String> {
        vec![
            "--backend".to_string(),
            "alsa".to_string(),
            "--device".to_string(),
            self.device.clone(),
        ]
    }
}

/// Invocation de `pactl`
#[derive(Debug, Clone)]
pub struct Pactl {
    program: String,
    prefix: Vec<String>,
}

impl Default for Pactl {
    fn default() -> Self {
        Self {
            program: "pactl".to_string(),
            prefix: Vec::new(),
        }
    }
}

impl Pactl {
    /// `program prefix... <commande> <args>...`
    pub fn with_command(program: impl Into<String>, prefix: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix,
        }
    }

    /// Lance une commande et retourne sa sortie standard, sans le saut de
    /// ligne final.
    pub fn run(&self, command: &str, args: &[&str]) -> std::io::Result<String> {
        let output = Command::new(&self.program)
            .args(&self.prefix)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        let out = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!(command, ?args, out = %out, "pactl");
        Ok(out)
    }
}

/// Puits nul PulseAudio réémis en RTP
#[derive(Debug)]
pub struct PulseAudioRtpBackend {
    pactl: Pactl,
    address: String,
    port: u16,
    sink: String,
    modules: Mutex<Vec<String>>,
}

impl PulseAudioRtpBackend {
    pub fn new(address: impl Into<String>, port: u16, sink: impl Into<String>) -> Self {
        Self::with_pactl(Pactl::default(), address, port, sink)
    }

    /// Charge `module-null-sink` et `module-rtp-send` puis endort le puits.
    ///
    /// Un échec de `pactl` est journalisé : le récepteur peut tout de même
    /// démarrer.
    pub fn with_pactl(
        pactl: Pactl,
        address: impl Into<String>,
        port: u16,
        sink: impl Into<String>,
    ) -> Self {
        let address = address.into();
        let sink = sink.into();
        let sink = if sink.trim().is_empty() {
            DEFAULT_RTP_SINK.to_string()
        } else {
            sink
        };

        let modules: [Vec<String>; 2] = [
            vec!["module-null-sink".into(), format!("sink_name={}", sink)],
            vec![
                "module-rtp-send".into(),
                format!("destination_ip={}", address),
                "inhibit_auto_suspend=always".into(),
                format!("port={}", port),
                format!("source={}.monitor", sink),
            ],
        ];

        let mut loaded = Vec::new();
        for module in &modules {
            let args: Vec<&str> = module.iter().map(String::as_str).collect();
            match pactl.run("load-module", &args) {
                Ok(id) if !id.is_empty() => loaded.push(id),
                Ok(_) => warn!(module = %module[0], "pactl returned no module id"),
                Err(e) => warn!(module = %module[0], "Could not load PulseAudio module: {}", e),
            }
        }
        info!("🔊 PulseAudio RTP backend ready (modules: {:?})", loaded);

        let backend = Self {
            pactl,
            address,
            port,
            sink,
            modules: Mutex::new(loaded),
        };
        backend.sink_end();
        backend
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    fn suspend(&self, suspended: bool) {
        let flag = if suspended { "1" } else { "0" };
        if let Err(e) = self.pactl.run("suspend-sink", &[&self.sink, flag]) {
            debug!(sink = %self.sink, "suspend-sink failed: {}", e);
        }
    }
}

impl ReceiverBackend for PulseAudioRtpBackend {
    fn name(&self) -> &'static str {
        "pulseaudio_rtp"
    }

    fn extra_args(&self) -> Vec<String> {
        vec![
            "--backend".to_string(),
            "pulseaudio".to_string(),
            "--device".to_string(),
            self.sink.clone(),
        ]
    }

    fn playback_url(&self) -> String {
        format!("rtp://{}:{}", self.address, self.port)
    }

    fn sink_start(&self) {
        self.suspend(false);
    }

    fn sink_end(&self) {
        self.suspend(true);
    }
}

impl Drop for PulseAudioRtpBackend {
    fn drop(&mut self) {
        let modules = std::mem::take(
            &mut *self.modules.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for module in modules.iter().rev() {
            if let Err(e) = self.pactl.run("unload-module", &[module]) {
                debug!(module = %module, "unload-module failed: {}", e);
            }
        }
        info!("PulseAudio RTP backend stopped");
    }
}

/// Backend choisi dans la configuration (`connect.backend`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Default,
    Alsa,
    PulseAudioRtp,
}

impl FromStr for BackendKind {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Self::Default),
            "alsa" => Ok(Self::Alsa),
            "pulseaudio_rtp" | "pulseaudio" => Ok(Self::PulseAudioRtp),
            other => Err(ConnectError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Alsa => "alsa",
            Self::PulseAudioRtp => "pulseaudio_rtp",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("alsa".parse::<BackendKind>().unwrap(), BackendKind::Alsa);
        assert_eq!(
            " PulseAudio_RTP ".parse::<BackendKind>().unwrap(),
            BackendKind::PulseAudioRtp
        );
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::Default);
        assert!(matches!(
            "jack".parse::<BackendKind>(),
            Err(ConnectError::UnknownBackend(name)) if name == "jack"
        ));
        assert_eq!(BackendKind::PulseAudioRtp.to_string(), "pulseaudio_rtp");
    }

    #[test]
    fn test_alsa_args() {
        assert_eq!(
            AlsaBackend::new("").extra_args(),
            vec!["--backend", "alsa", "--device", "hw:2,0"]
        );
        assert!(DefaultBackend.extra_args().is_empty());
        assert!(DefaultBackend.playback_url().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_pulseaudio_modules_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("pactl.log");
        let script = dir.path().join("pactl.sh");
        std::fs::write(
            &script,
            format!(
                "echo \"$@\" >> '{}'\ncase \"$1\" in load-module) case \"$2\" in module-null-sink) echo 11;; *) echo 12;; esac;; esac\n",
                log.display()
            ),
        )
        .unwrap();

        let pactl = Pactl::with_command("sh", vec![script.display().to_string()]);
        let backend = PulseAudioRtpBackend::with_pactl(pactl, "127.0.0.1", 24643, "pmo_test");
        assert_eq!(backend.playback_url(), "rtp://127.0.0.1:24643");
        assert_eq!(
            backend.extra_args(),
            vec!["--backend", "pulseaudio", "--device", "pmo_test"]
        );
        backend.sink_start();
        drop(backend);

        let lines: Vec<String> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "load-module module-null-sink sink_name=pmo_test",
                "load-module module-rtp-send destination_ip=127.0.0.1 inhibit_auto_suspend=always port=24643 source=pmo_test.monitor",
                "suspend-sink pmo_test 1",
                "suspend-sink pmo_test 0",
                "unload-module 12",
                "unload-module 11",
            ]
        );
    }
}
