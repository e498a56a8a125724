//! Hook `--onevent` du récepteur.
//!
//! Le récepteur lance ce programme à chaque événement, avec les détails
//! dans l'environnement (`PLAYER_EVENT`, `NAME`, `ARTISTS`...). Les
//! changements de morceau et les arrêts sont relayés en UDP au service.

use pmoconfig::get_config;
use pmoconnect::ConnectConfigExt;
use pmoconnect::events::{event_from_env, send_event};

fn main() -> anyhow::Result<()> {
    let Some(event) = event_from_env() else {
        return Ok(());
    };
    let port = get_config().get_connect_event_port();
    send_event(port, &event)?;
    Ok(())
}
