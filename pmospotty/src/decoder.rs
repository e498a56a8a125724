//! Adaptateur du processus décodeur (`spotty`).
//!
//! Le décodeur est un binaire externe qui écrit sur sa sortie standard le
//! PCM d'un seul morceau. Il ne sait démarrer qu'à une seconde entière
//! (`--start-position`) : le positionnement fin est fait par le streamer.
//!
//! Le lancement passe par le trait [`DecoderLauncher`] pour que les tests
//! puissent remplacer le sous-processus par une source PCM en mémoire.

use crate::error::{Result, SpottyError};
use pmoutils::process::{DEFAULT_TERMINATE_GRACE, Termination, terminate_child};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

pub const TRACK_URI_PREFIX: &str = "spotify:track:";

pub const DEFAULT_BITRATE: u32 = 320;
pub const DEFAULT_VOLUME: u8 = 35;

/// Ramène un volume dans l'intervalle accepté par `--initial-volume`
pub fn clamp_volume(value: i64) -> u8 {
    value.clamp(1, 100) as u8
}

/// URI complète d'un morceau (`spotify:track:<id>`)
pub fn track_uri(track_id: &str) -> String {
    if track_id.starts_with(TRACK_URI_PREFIX) {
        track_id.to_string()
    } else {
        format!("{}{}", TRACK_URI_PREFIX, track_id)
    }
}

/// Réglages transmis au décodeur à chaque lancement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderSettings {
    pub volume: u8,
    pub normalization: bool,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            normalization: true,
        }
    }
}

/// Une demande de décodage : un morceau, à partir d'une seconde donnée
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRequest {
    pub track_uri: String,
    pub start_second: u64,
    pub volume: u8,
    pub normalization: bool,
}

impl DecodeRequest {
    pub fn new(track_id: &str, start_second: u64, settings: DecoderSettings) -> Self {
        Self {
            track_uri: track_uri(track_id),
            start_second,
            volume: settings.volume,
            normalization: settings.normalization,
        }
    }
}

/// Contrôle d'un processus en cours, partageable entre threads
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Arrête le processus (idempotent)
    fn terminate(&self) -> Termination;
}

/// Lance un décodeur pour une [`DecodeRequest`]
pub trait DecoderLauncher: Send + Sync {
    fn launch(&self, request: &DecodeRequest) -> Result<DecoderProcess>;
}

/// Un décodeur lancé : un flux PCM lisible et son contrôle.
///
/// Le processus est arrêté et récupéré quand la valeur est libérée, quel
/// que soit le chemin de sortie.
pub struct DecoderProcess {
    reader: Box<dyn Read + Send>,
    control: Arc<dyn ProcessControl>,
}

impl DecoderProcess {
    pub fn new(reader: Box<dyn Read + Send>, control: Arc<dyn ProcessControl>) -> Self {
        Self { reader, control }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    /// Poignée permettant d'arrêter le processus depuis un autre thread
    pub fn handle(&self) -> DecoderHandle {
        DecoderHandle {
            control: self.control.clone(),
        }
    }

    pub fn terminate(&self) -> Termination {
        self.control.terminate()
    }
}

impl Read for DecoderProcess {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        self.control.terminate();
    }
}

impl std::fmt::Debug for DecoderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderProcess")
            .field("pid", &self.pid())
            .finish()
    }
}

/// Poignée clonable sur un décodeur en cours
#[derive(Clone)]
pub struct DecoderHandle {
    control: Arc<dyn ProcessControl>,
}

impl DecoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn terminate(&self) -> Termination {
        self.control.terminate()
    }
}

struct ChildControl {
    pid: u32,
    child: Mutex<Child>,
}

impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) -> Termination {
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        terminate_child(&mut child, DEFAULT_TERMINATE_GRACE)
    }
}

/// Lanceur du vrai binaire `spotty`
#[derive(Debug, Clone)]
pub struct SpottyLauncher {
    binary: PathBuf,
    bitrate: u32,
    cache_dir: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl SpottyLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            bitrate: DEFAULT_BITRATE,
            cache_dir: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_dir = dir;
        self
    }

    /// Arguments ajoutés avant `--single-track` (identifiants, etc.)
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Ligne de commande du décodeur pour une requête
    pub fn command_args(&self, request: &DecodeRequest) -> Vec<String> {
        let mut args = vec![
            "--bitrate".to_string(),
            self.bitrate.to_string(),
            "--disable-audio-cache".to_string(),
            "--disable-credential-cache".to_string(),
            "--disable-discovery".to_string(),
        ];

        if let Some(dir) = &self.cache_dir {
            args.push("--cache".to_string());
            args.push(dir.to_string_lossy().to_string());
        }

        args.push("--initial-volume".to_string());
        args.push(request.volume.clamp(1, 100).to_string());

        if request.normalization {
            args.extend(
                [
                    "--enable-volume-normalisation",
                    "--normalisation-gain-type",
                    "track",
                ]
                .map(String::from),
            );
        }

        args.extend(self.extra_args.iter().cloned());

        args.push("--single-track".to_string());
        args.push(request.track_uri.clone());

        if request.start_second > 0 {
            args.push("--start-position".to_string());
            args.push(request.start_second.to_string());
        }

        args
    }
}

impl DecoderLauncher for SpottyLauncher {
    fn launch(&self, request: &DecodeRequest) -> Result<DecoderProcess> {
        let args = self.command_args(request);
        debug!(binary = %self.binary.display(), ?args, "Spawning decoder");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpottyError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(pid, track = %request.track_uri, start = request.start_second, "🎵 Decoder started");

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(pid, stderr);
        }

        let stdout: ChildStdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = terminate_child(&mut child, DEFAULT_TERMINATE_GRACE);
                return Err(SpottyError::Io(std::io::Error::other(
                    "decoder stdout not captured",
                )));
            }
        };

        let control = Arc::new(ChildControl {
            pid,
            child: Mutex::new(child),
        });

        Ok(DecoderProcess::new(Box::new(stdout), control))
    }
}

fn forward_stderr<R: Read + Send + 'static>(pid: u32, stderr: R) {
    let spawned = thread::Builder::new()
        .name(format!("spotty-stderr-{}", pid))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => debug!(pid, "spotty: {}", line),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!(pid, error = %e, "Could not start stderr forwarder");
    }
}
