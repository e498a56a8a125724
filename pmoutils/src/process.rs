//! Arrêt des sous-processus externes.
//!
//! Les décodeurs et récepteurs lancés par le workspace sont des binaires
//! externes. Ils doivent toujours être arrêtés puis récupérés (`wait`) pour
//! ne pas laisser de zombies, quel que soit le chemin d'erreur emprunté.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Délai laissé à un processus pour s'arrêter après SIGTERM
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Résultat d'une demande d'arrêt d'un processus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Le processus tournait et a été arrêté
    Terminated,
    /// Le processus s'était déjà arrêté de lui-même
    AlreadyStopped,
}

/// Envoie SIGTERM au processus `pid`.
///
/// Retourne `false` si le signal n'a pas pu être envoyé (processus disparu,
/// ou plateforme sans signaux).
pub fn send_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) ne touche à aucune mémoire du processus courant.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Arrête un processus enfant et le récupère.
///
/// Séquence : SIGTERM, attente bornée par `grace`, puis kill forcé. Le
/// processus est toujours `wait()`é avant de rendre la main.
pub fn terminate_child(child: &mut Child, grace: Duration) -> Termination {
    let pid = child.id();

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(pid, %status, "Process already exited");
            return Termination::AlreadyStopped;
        }
        Ok(None) => {}
        Err(e) => warn!(pid, error = %e, "Failed to poll process status"),
    }

    if send_terminate(pid) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid, %status, "Process terminated");
                    return Termination::Terminated;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        warn!(pid, "Process ignored SIGTERM, killing it");
    }

    if let Err(e) = child.kill() {
        debug!(pid, error = %e, "Kill failed (process probably gone)");
    }
    if let Err(e) = child.wait() {
        warn!(pid, error = %e, "Failed to reap process");
    }
    Termination::Terminated
}

/// Code de retour normalisé d'un processus terminé.
///
/// Un code `<= 0` signifie arrêt propre ou par signal (`-signal` sous Unix),
/// un code `> 0` une erreur applicative.
pub fn return_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_terminate_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let outcome = terminate_child(&mut child, Duration::from_secs(2));
        assert_eq!(outcome, Termination::Terminated);

        let status = child.try_wait().unwrap().expect("process reaped");
        assert!(return_code(&status) <= 0);
    }

    #[test]
    fn test_terminate_already_stopped() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        assert_eq!(
            terminate_child(&mut child, DEFAULT_TERMINATE_GRACE),
            Termination::AlreadyStopped
        );
    }

    #[test]
    fn test_return_code_application_error() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(return_code(&status), 3);
    }
}
