//! Supervision du processus récepteur.
//!
//! Le récepteur est un décodeur longue durée qui annonce un haut-parleur sur
//! le réseau. Une boucle dédiée le relance tant qu'on ne lui a pas demandé
//! de s'arrêter. Un code de retour `<= 0` remet le compteur d'échecs à zéro ;
//! un code `> 0` ou un échec de lancement l'incrémente. Au plafond, le
//! superviseur passe définitivement à l'état [`SupervisorState::Stopped`].

use crate::backend::ReceiverBackend;
use crate::error::ConnectError;
use pmoutils::process::{DEFAULT_TERMINATE_GRACE, return_code, terminate_child};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const STARTED_TIMEOUT: Duration = Duration::from_secs(2);
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Jamais lancé, ou arrêté à la demande
    Idle,
    Running,
    /// Sorti en erreur, va être relancé
    Retrying,
    /// Plafond d'échecs atteint, plus aucun lancement
    Stopped,
}

/// Paramètres de la ligne de commande du récepteur
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub binary: PathBuf,
    pub bitrate: u32,
    pub device_type: String,
    /// Nom annoncé, `{}` est remplacé par le nom d'hôte
    pub name: String,
    pub onevent: Option<PathBuf>,
    /// Options libres, séparées par des espaces
    pub options: String,
    pub max_retries: u32,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("librespot"),
            bitrate: 320,
            device_type: "tv".to_string(),
            name: "Spotify Connect@{}".to_string(),
            onevent: None,
            options: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ReceiverOptions {
    pub fn device_name(&self) -> String {
        self.name.replace("{}", &pmoutils::hostname())
    }

    /// Arguments du récepteur, dans l'ordre attendu
    pub fn command_args(&self, backend: &dyn ReceiverBackend) -> Vec<String> {
        let mut args = vec![
            "--bitrate".to_string(),
            self.bitrate.to_string(),
            "--device-type".to_string(),
            self.device_type.clone(),
            "--disable-audio-cache".to_string(),
            "--disable-credential-cache".to_string(),
            "--initial-volume".to_string(),
            "100".to_string(),
            "--name".to_string(),
            self.device_name(),
            "--quiet".to_string(),
        ];
        if let Some(hook) = &self.onevent {
            if hook.is_file() {
                args.push("--onevent".to_string());
                args.push(hook.display().to_string());
            } else {
                warn!(hook = %hook.display(), "Event hook not found, receiver events disabled");
            }
        }
        args.extend(backend.extra_args());
        args.extend(self.options.split_whitespace().map(str::to_string));
        args
    }
}

struct SupervisorInner {
    binary: PathBuf,
    args: Vec<String>,
    backend: Arc<dyn ReceiverBackend>,
    max_retries: u32,
    retries: AtomicU32,
    spawns: AtomicU32,
    stop_requested: AtomicBool,
    state: Mutex<SupervisorState>,
    child: Mutex<Option<Child>>,
}

impl SupervisorInner {
    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state() = state;
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn terminate_child(&self) -> bool {
        match self.child().as_mut() {
            Some(child) => {
                terminate_child(child, DEFAULT_TERMINATE_GRACE);
                true
            }
            None => false,
        }
    }

    /// Lance le processus s'il n'y a pas d'arrêt demandé
    fn spawn(&self) -> Option<Result<(u32, std::process::ChildStderr), ConnectError>> {
        let mut slot = self.child();
        if self.stop_requested.load(Ordering::SeqCst) {
            return None;
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let spawned = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        Some(match spawned {
            Ok(mut child) => {
                let pid = child.id();
                match child.stderr.take() {
                    Some(stderr) => {
                        *slot = Some(child);
                        Ok((pid, stderr))
                    }
                    None => {
                        terminate_child(&mut child, DEFAULT_TERMINATE_GRACE);
                        Err(ConnectError::Io(std::io::Error::other(
                            "receiver stderr not captured",
                        )))
                    }
                }
            }
            Err(source) => Err(ConnectError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            }),
        })
    }

    /// Attend la fin du processus courant et le retire de l'emplacement
    fn reap(&self) -> Option<i32> {
        loop {
            {
                let mut slot = self.child();
                let child = slot.as_mut()?;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.take();
                        return Some(return_code(&status));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Could not poll receiver status: {}", e);
                        slot.take();
                        return None;
                    }
                }
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn run(&self, started: SyncSender<()>) {
        info!("📡 Receiver loop started");

        while !self.stop_requested.load(Ordering::SeqCst) {
            let failed = match self.spawn() {
                None => break,
                Some(Ok((pid, stderr))) => {
                    self.set_state(SupervisorState::Running);
                    let _ = started.try_send(());
                    info!(pid, binary = %self.binary.display(), "🎧 Receiver running");

                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) if !line.trim().is_empty() => {
                                info!(pid, "librespot: {}", line.trim_end())
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }

                    match self.reap() {
                        Some(code) if code <= 0 => {
                            debug!(pid, code, "Receiver exited cleanly");
                            false
                        }
                        Some(code) => {
                            warn!(pid, code, "Receiver exited with an error (see librespot lines above)");
                            true
                        }
                        None => true,
                    }
                }
                Some(Err(e)) => {
                    error!("❌ {}", e);
                    true
                }
            };

            self.backend.sink_end();

            if !failed {
                self.retries.store(0, Ordering::SeqCst);
                continue;
            }

            let retries = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            if retries >= self.max_retries {
                error!(
                    "❌ Receiver failed {} times, giving up until the service restarts",
                    retries
                );
                self.set_state(SupervisorState::Stopped);
                info!("Receiver loop stopped");
                return;
            }
            warn!("Receiver failed {}/{}, retrying", retries, self.max_retries);
            self.set_state(SupervisorState::Retrying);
        }

        self.set_state(SupervisorState::Idle);
        info!("Receiver loop stopped");
    }
}

struct RunLoop {
    handle: JoinHandle<()>,
    finished: Receiver<()>,
}

/// Superviseur du processus récepteur
pub struct ReceiverSupervisor {
    inner: Arc<SupervisorInner>,
    run_loop: Mutex<Option<RunLoop>>,
}

impl ReceiverSupervisor {
    /// Superviseur pour le binaire `librespot` configuré par `options`
    pub fn new(options: &ReceiverOptions, backend: Arc<dyn ReceiverBackend>) -> Self {
        let args = options.command_args(backend.as_ref());
        Self::with_command(options.binary.clone(), args, backend, options.max_retries)
    }

    /// Superviseur pour une ligne de commande déjà construite
    pub fn with_command(
        binary: impl Into<PathBuf>,
        args: Vec<String>,
        backend: Arc<dyn ReceiverBackend>,
        max_retries: u32,
    ) -> Self {
        let binary = binary.into();
        info!(binary = %binary.display(), ?args, "Receiver command");
        Self {
            inner: Arc::new(SupervisorInner {
                binary,
                args,
                backend,
                max_retries: max_retries.max(1),
                retries: AtomicU32::new(0),
                spawns: AtomicU32::new(0),
                stop_requested: AtomicBool::new(false),
                state: Mutex::new(SupervisorState::Idle),
                child: Mutex::new(None),
            }),
            run_loop: Mutex::new(None),
        }
    }

    fn run_loop(&self) -> MutexGuard<'_, Option<RunLoop>> {
        self.run_loop.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn backend(&self) -> &Arc<dyn ReceiverBackend> {
        &self.inner.backend
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state()
    }

    pub fn retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Nombre de tentatives de lancement depuis la création
    pub fn spawn_count(&self) -> u32 {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.run_loop()
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    /// Démarre la boucle de supervision.
    ///
    /// Sans effet si elle tourne déjà. Refusé (retourne `false`) quand le
    /// plafond d'échecs est atteint.
    pub fn start(&self) -> bool {
        let mut run_loop = self.run_loop();
        if run_loop.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            return true;
        }
        if self.retries() >= self.inner.max_retries {
            warn!(
                "Receiver failed {} times, not starting it again",
                self.retries()
            );
            return false;
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let (finished_tx, finished_rx) = mpsc::sync_channel(1);
        let inner = self.inner.clone();

        let spawned = thread::Builder::new()
            .name("connect-receiver".to_string())
            .spawn(move || {
                inner.run(started_tx);
                let _ = finished_tx.send(());
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                error!("❌ Could not start receiver thread: {}", e);
                return false;
            }
        };
        *run_loop = Some(RunLoop {
            handle,
            finished: finished_rx,
        });
        drop(run_loop);

        if started_rx.recv_timeout(STARTED_TIMEOUT).is_err() {
            warn!("Receiver did not report started within {:?}", STARTED_TIMEOUT);
        }
        true
    }

    /// Relance le processus : la boucle le redémarre aussitôt. Si la boucle
    /// ne tourne pas, équivaut à [`start`](Self::start).
    pub fn restart(&self) -> bool {
        if self.is_running() && self.inner.terminate_child() {
            info!("🔄 Receiver restart requested");
            return true;
        }
        self.start()
    }

    /// Arrête la boucle et le processus, attente bornée à 5 s
    pub fn stop(&self) {
        let Some(run_loop) = self.run_loop().take() else {
            return;
        };

        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.terminate_child();

        match run_loop.finished.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if run_loop.handle.join().is_err() {
                    error!("Receiver thread panicked");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("Receiver thread did not stop within {:?}", JOIN_TIMEOUT);
            }
        }
    }
}

impl Drop for ReceiverSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
