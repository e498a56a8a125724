//! Canal d'événements du récepteur.
//!
//! Le récepteur exécute un hook (`--onevent`) à chaque changement d'état.
//! Le hook envoie un datagramme UDP sur la boucle locale, port 36964 par
//! défaut :
//!
//! ```json
//! {"PLAYER_EVENT": "track_changed", "title": "...", "artist": "...", "album": "...", "art": "..."}
//! {"PLAYER_EVENT": "stopped"}
//! ```
//!
//! Un objet JSON vide (ou un datagramme vide) termine l'écoute.

use crate::error::{ConnectError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::{debug, warn};

pub const EVENT_PORT: u16 = 36964;
pub const MAX_DATAGRAM_SIZE: usize = 4096;

pub const KEY_PLAYER_EVENT: &str = "PLAYER_EVENT";
pub const KEY_NAME: &str = "NAME";
pub const KEY_ARTISTS: &str = "ARTISTS";
pub const KEY_ALBUM: &str = "ALBUM";
pub const KEY_COVERS: &str = "COVERS";
pub const KEY_ITEM_TYPE: &str = "ITEM_TYPE";
pub const KEY_SHOW_NAME: &str = "SHOW_NAME";

/// Métadonnées du morceau joué par le récepteur
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub art: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "PLAYER_EVENT", rename_all = "snake_case")]
pub enum PlayerEvent {
    TrackChanged(TrackInfo),
    Stopped,
}

/// Adresse d'écoute sur la boucle locale
pub fn event_address(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Décode un datagramme.
///
/// `Ok(None)` signale la sentinelle d'arrêt.
pub fn parse_datagram(data: &[u8]) -> Result<Option<PlayerEvent>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ConnectError::InvalidEvent(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ConnectError::InvalidEvent(e.to_string()))?;
    match &value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => return Ok(None),
        _ => {}
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ConnectError::InvalidEvent(e.to_string()))
}

/// Écoute des événements du récepteur
#[derive(Debug)]
pub struct EventReceiver {
    socket: UdpSocket,
}

impl EventReceiver {
    /// Écoute sur `127.0.0.1:port` (`0` pour un port libre)
    pub fn bind(port: u16) -> Result<Self> {
        let socket = match UdpSocket::bind(event_address(port)) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                let message = pmoutils::describe_port_conflict(port, pmoutils::Transport::Udp);
                warn!("{}", message);
                return Err(ConnectError::Io(std::io::Error::new(e.kind(), message)));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(addr = ?socket.local_addr().ok(), "Event receiver bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Itérateur bloquant sur les événements, jusqu'à la sentinelle d'arrêt.
    ///
    /// Les datagrammes illisibles sont journalisés et ignorés. L'itérateur
    /// consomme le récepteur : il ne peut pas être relancé.
    pub fn events(self) -> Events {
        Events {
            socket: self.socket,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            done: false,
        }
    }
}

pub struct Events {
    socket: UdpSocket,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for Events {
    type Item = PlayerEvent;

    fn next(&mut self) -> Option<PlayerEvent> {
        while !self.done {
            let len = match self.socket.recv_from(&mut self.buf) {
                Ok((len, _from)) => len,
                Err(e) => {
                    warn!("Event socket failed: {}", e);
                    self.done = true;
                    break;
                }
            };

            match parse_datagram(&self.buf[..len]) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {
                    debug!("Event receiver shutdown requested");
                    self.done = true;
                }
                Err(e) => warn!("Ignoring datagram: {}", e),
            }
        }
        None
    }
}

fn send_datagram(port: u16, data: &[u8]) -> Result<()> {
    let socket = UdpSocket::bind(event_address(0))?;
    socket.send_to(data, event_address(port))?;
    Ok(())
}

/// Envoie un événement au récepteur local
pub fn send_event(port: u16, event: &PlayerEvent) -> Result<()> {
    let data = serde_json::to_vec(event).map_err(|e| ConnectError::InvalidEvent(e.to_string()))?;
    send_datagram(port, &data)
}

/// Envoie la sentinelle d'arrêt
pub fn send_shutdown(port: u16) -> Result<()> {
    send_datagram(port, b"{}")
}

/// Construit l'événement à partir des variables fournies au hook.
///
/// Seuls `track_changed` et `stopped` sont relayés.
pub fn event_from_vars<F>(get: F) -> Option<PlayerEvent>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| get(key).unwrap_or_default();

    match get(KEY_PLAYER_EVENT)?.trim() {
        "stopped" => Some(PlayerEvent::Stopped),
        "track_changed" => {
            let artist = if var(KEY_ITEM_TYPE).trim() == "Episode" {
                var(KEY_SHOW_NAME)
            } else {
                var(KEY_ARTISTS)
                    .lines()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let art = var(KEY_COVERS)
                .lines()
                .map(str::trim)
                .find(|s| !s.is_empty())
                .unwrap_or_default()
                .to_string();

            Some(PlayerEvent::TrackChanged(TrackInfo {
                title: var(KEY_NAME),
                artist,
                album: var(KEY_ALBUM),
                art,
            }))
        }
        _ => None,
    }
}

/// [`event_from_vars`] sur l'environnement du processus
pub fn event_from_env() -> Option<PlayerEvent> {
    event_from_vars(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn test_wire_format() {
        let event = PlayerEvent::TrackChanged(TrackInfo {
            title: "Song".into(),
            artist: "Band".into(),
            album: "LP".into(),
            art: "http://img".into(),
        });
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["PLAYER_EVENT"], "track_changed");
        assert_eq!(json["title"], "Song");
        assert_eq!(json["art"], "http://img");

        assert_eq!(
            serde_json::to_string(&PlayerEvent::Stopped).unwrap(),
            r#"{"PLAYER_EVENT":"stopped"}"#
        );
    }

    #[test]
    fn test_parse_datagram() {
        assert_eq!(parse_datagram(b"").unwrap(), None);
        assert_eq!(parse_datagram(b"{}").unwrap(), None);
        assert_eq!(parse_datagram(b"null").unwrap(), None);
        assert_eq!(
            parse_datagram(br#"{"PLAYER_EVENT":"stopped","title":"x"}"#).unwrap(),
            Some(PlayerEvent::Stopped)
        );
        assert_eq!(
            parse_datagram(br#"{"PLAYER_EVENT":"track_changed","title":"T"}"#).unwrap(),
            Some(PlayerEvent::TrackChanged(TrackInfo {
                title: "T".into(),
                ..TrackInfo::default()
            }))
        );
        assert!(parse_datagram(br#"{"PLAYER_EVENT":"playing"}"#).is_err());
        assert!(parse_datagram(b"not json").is_err());
    }

    #[test]
    fn test_receive_until_shutdown() {
        let receiver = EventReceiver::bind(0).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let listener = thread::spawn(move || receiver.events().collect::<Vec<_>>());

        send_datagram(port, b"garbage").unwrap();
        send_event(port, &PlayerEvent::Stopped).unwrap();
        send_event(
            port,
            &PlayerEvent::TrackChanged(TrackInfo {
                title: "A".into(),
                ..TrackInfo::default()
            }),
        )
        .unwrap();
        send_shutdown(port).unwrap();

        let events = listener.join().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PlayerEvent::Stopped);
        assert!(matches!(&events[1], PlayerEvent::TrackChanged(info) if info.title == "A"));
    }

    #[test]
    fn test_event_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("PLAYER_EVENT", "track_changed"),
            ("ITEM_TYPE", "Track"),
            ("NAME", "Song"),
            ("ARTISTS", "One\nTwo"),
            ("ALBUM", "LP"),
            ("COVERS", "\nhttp://big\nhttp://small"),
        ]
        .into_iter()
        .collect();
        let event = event_from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(
            event,
            Some(PlayerEvent::TrackChanged(TrackInfo {
                title: "Song".into(),
                artist: "One, Two".into(),
                album: "LP".into(),
                art: "http://big".into(),
            }))
        );

        let episode: HashMap<&str, &str> = [
            ("PLAYER_EVENT", "track_changed"),
            ("ITEM_TYPE", "Episode"),
            ("NAME", "Ep. 1"),
            ("SHOW_NAME", "Podcast"),
        ]
        .into_iter()
        .collect();
        match event_from_vars(|k| episode.get(k).map(|v| v.to_string())) {
            Some(PlayerEvent::TrackChanged(info)) => assert_eq!(info.artist, "Podcast"),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            event_from_vars(|k| (k == "PLAYER_EVENT").then(|| "stopped".to_string())),
            Some(PlayerEvent::Stopped)
        );
        assert_eq!(
            event_from_vars(|k| (k == "PLAYER_EVENT").then(|| "volume_changed".to_string())),
            None
        );
        assert_eq!(event_from_vars(|_| None), None);
    }
}
