//! Utilitaires système partagés par les crates du workspace.
//!
//! # Modules
//!
//! - [`process`] : arrêt propre des sous-processus (SIGTERM, attente bornée,
//!   kill forcé, récupération du code de retour)
//! - [`ports`] : processus détenant un port déjà occupé
//!
//! # Examples
//!
//! ```no_run
//! use pmoutils::process::{terminate_child, DEFAULT_TERMINATE_GRACE};
//! use std::process::Command;
//!
//! let mut child = Command::new("sleep").arg("30").spawn().unwrap();
//! terminate_child(&mut child, DEFAULT_TERMINATE_GRACE);
//! ```
pub mod ports;
pub mod process;

pub use ports::{PortOwner, Transport, describe_port_conflict};
pub use process::{Termination, return_code, terminate_child};

/// Retourne le nom d'hôte de la machine.
///
/// Utilisé pour construire les noms de device annoncés sur le réseau
/// (ex: `"Spotify Connect@salon"`). Retourne `"localhost"` si le nom ne
/// peut pas être déterminé.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: le buffer est valide pour `buf.len()` octets et gethostname
        // n'écrit jamais au-delà.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_not_empty() {
        let name = hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('\0'));
    }
}
