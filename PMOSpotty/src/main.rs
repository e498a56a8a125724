use pmoconfig::get_config;
use pmoconnect::{ConnectReceiver, HeadlessHost};
use pmoserver::{LoggingOptions, ServerBuilder};
use pmospotty::{
    AudioStreamer, PrebufferManager, PrebufferScheduler, RecentlyPlayed, SettingsPoller,
    SpottyConfigExt, SpottyLauncher, SpottyStreamingExt, TrackQueue, TrackStreamEndpoint,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Infrastructure ==========

    let config = get_config();
    let mut server = ServerBuilder::new_configured().build();
    server.init_logging(LoggingOptions::from_config()).await;

    server
        .add_route("/info", || async {
            serde_json::json!({
                "name": "PMOSpotty",
                "version": env!("CARGO_PKG_VERSION"),
            })
        })
        .await;

    // ========== PHASE 2 : Chaîne de streaming ==========

    info!("🎵 Initializing track streaming...");
    let settings = config.get_decoder_settings();
    let launcher = Arc::new(
        SpottyLauncher::new(config.get_spotty_binary())
            .with_bitrate(config.get_spotty_bitrate())
            .with_cache_dir(config.get_spotty_cache_dir()),
    );

    let streamer = AudioStreamer::new(launcher.clone(), settings);
    streamer.set_chunk_size(config.get_spotty_chunk_size());
    let endpoint = Arc::new(TrackStreamEndpoint::new(streamer));
    endpoint.set_gap_between_tracks(config.get_gap_between_tracks());

    let prebuffer = Arc::new(PrebufferManager::new(
        launcher,
        settings,
        config.get_prebuffer_seconds(),
    ));
    prebuffer.set_chunk_size(config.get_spotty_chunk_size());
    endpoint.set_prebuffer(Some(prebuffer.clone()));

    let queue = Arc::new(TrackQueue::new());
    let scheduler = Arc::new(PrebufferScheduler::new(
        queue.clone(),
        prebuffer.clone(),
        config.get_prebuffer_enabled(),
    ));
    endpoint.set_on_track_started(Some(scheduler.callback()));

    let history = Arc::new(RecentlyPlayed::in_config_dir(&config));
    if config.get_recently_played_enabled() {
        endpoint.set_on_track_finished(Some(history.callback()));
    }

    server.init_spotty_streaming(endpoint.clone()).await?;
    server.init_spotty_queue(queue).await?;
    server.init_recently_played(history).await?;

    let poller = Arc::new(SettingsPoller::new(
        config.clone(),
        endpoint.clone(),
        prebuffer.clone(),
        scheduler,
    ));
    let poll_task = poller.spawn(config.get_settings_poll_interval());

    // ========== PHASE 3 : Récepteur distant ==========

    let receiver_config = config.clone();
    let receiver = match tokio::task::spawn_blocking(move || {
        ConnectReceiver::from_config(&receiver_config, Arc::new(HeadlessHost::new()))
    })
    .await?
    {
        Ok(receiver) => receiver,
        Err(e) => {
            warn!("⚠️ Failed to start Connect receiver: {}", e);
            None
        }
    };

    // ========== PHASE 4 : Démarrage du serveur ==========

    info!("🌐 Starting HTTP server...");
    let addr = server.start().await?;
    info!("✅ PMOSpotty is ready on http://{}", addr);
    info!("Press Ctrl+C to stop...");
    server.wait().await;

    // ========== PHASE 5 : Arrêt ==========

    info!("🛑 Shutting down...");
    poll_task.abort();
    tokio::task::spawn_blocking(move || {
        prebuffer.cancel();
        endpoint.stop();
        if let Some(receiver) = receiver {
            receiver.stop();
        }
    })
    .await?;
    info!("👋 Bye");

    Ok(())
}
