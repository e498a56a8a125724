//! Diagnostic des ports déjà occupés.
//!
//! Quand le serveur HTTP ou le canal d'événements ne peut pas écouter sur son
//! port, on cherche quel processus le détient pour l'indiquer dans le
//! journal.

use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};
use std::fmt;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Processus qui écoute sur un port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
    pub user: String,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {}, user {})", self.name, self.pid, self.user)
    }
}

fn owning_pid(port: u16, transport: Transport) -> Option<u32> {
    let flags = match transport {
        Transport::Tcp => ProtocolFlags::TCP,
        Transport::Udp => ProtocolFlags::UDP,
    };
    let sockets =
        get_sockets_info(AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6, flags).ok()?;

    sockets.into_iter().find_map(|socket| {
        let local_port = match socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(ref tcp) if transport == Transport::Tcp => tcp.local_port,
            ProtocolSocketInfo::Udp(ref udp) if transport == Transport::Udp => udp.local_port,
            _ => return None,
        };
        if local_port == port {
            socket.associated_pids.first().copied()
        } else {
            None
        }
    })
}

/// Cherche le processus qui écoute sur `port`
pub fn port_owner(port: u16, transport: Transport) -> Option<PortOwner> {
    let pid = owning_pid(port, transport)?;

    let system = System::new_all();
    let process = system.process(Pid::from_u32(pid))?;
    let user = process
        .user_id()
        .and_then(|uid| users::get_user_by_uid(**uid))
        .map(|u| u.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());

    Some(PortOwner {
        pid,
        name: process.name().to_string(),
        user,
    })
}

/// Message d'erreur pour un port déjà utilisé
pub fn describe_port_conflict(port: u16, transport: Transport) -> String {
    let proto = match transport {
        Transport::Tcp => "TCP",
        Transport::Udp => "UDP",
    };
    match port_owner(port, transport) {
        Some(owner) => format!("{} port {} is already used by {}", proto, port, owner),
        None => format!("{} port {} is already in use", proto, port),
    }
}
