//! Extension pour intégrer le streaming PMOSpotty dans pmoserver
//!
//! Ce module fournit le trait [`SpottyStreamingExt`] qui enregistre sur un
//! [`pmoserver::Server`] la route `/track/{track_id}/{duration}`, la file de
//! lecture `/queue` et l'historique `/recently_played`.
//!
//! Le travail bloquant (arrêt de décodeur, délai entre morceaux, lecture du
//! pipe) tourne sur des threads `spawn_blocking`. Les blocs sont transmis au
//! corps HTTP via un canal borné : une connexion lente ne bloque jamais les
//! autres.

use crate::endpoint::{ResponseBody, TRACK_ROUTE, TrackStreamEndpoint};
use crate::error::SpottyError;
use crate::playlist::{QueueSnapshot, QueuedTrack, TrackQueue, parse_track_url};
use crate::recently_played::{PlayedTrack, RecentlyPlayed};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

const BODY_CHANNEL_CAPACITY: usize = 4;

/// Trait d'extension pour ajouter le streaming de morceaux à pmoserver
///
/// # Exemple
///
/// ```rust,ignore
/// use pmospotty::{SpottyStreamingExt, TrackStreamEndpoint};
///
/// let mut server = ServerBuilder::new_configured().build();
/// server.init_spotty_streaming(endpoint.clone()).await?;
/// server.start().await?;
/// ```
pub trait SpottyStreamingExt {
    /// Enregistre `GET|HEAD /track/{track_id}/{duration}`
    async fn init_spotty_streaming(
        &mut self,
        endpoint: Arc<TrackStreamEndpoint>,
    ) -> anyhow::Result<()>;

    /// Enregistre `GET|POST|DELETE /queue`
    async fn init_spotty_queue(&mut self, queue: Arc<TrackQueue>) -> anyhow::Result<()>;

    /// Enregistre `GET /recently_played`
    async fn init_recently_played(&mut self, history: Arc<RecentlyPlayed>) -> anyhow::Result<()>;
}

impl SpottyStreamingExt for pmoserver::Server {
    async fn init_spotty_streaming(
        &mut self,
        endpoint: Arc<TrackStreamEndpoint>,
    ) -> anyhow::Result<()> {
        self.add_router("/", track_router(endpoint)).await;
        Ok(())
    }

    async fn init_spotty_queue(&mut self, queue: Arc<TrackQueue>) -> anyhow::Result<()> {
        self.add_router("/", queue_router(queue)).await;
        Ok(())
    }

    async fn init_recently_played(&mut self, history: Arc<RecentlyPlayed>) -> anyhow::Result<()> {
        self.add_router("/", history_router(history)).await;
        Ok(())
    }
}

/// Router Axum de la route de streaming
pub fn track_router(endpoint: Arc<TrackStreamEndpoint>) -> Router {
    Router::new()
        .route(TRACK_ROUTE, get(stream_track))
        .with_state(endpoint)
}

async fn stream_track(
    State(endpoint): State<Arc<TrackStreamEndpoint>>,
    Path((track_id, duration)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let with_body = method == Method::GET;

    debug!(%method, track_id = %track_id, range = ?range, "Track request");

    let prepared = tokio::task::spawn_blocking(move || {
        let plan = endpoint.prepare(&track_id, &duration, range.as_deref())?;
        if !with_body {
            return Ok((plan, None));
        }
        let mut body = endpoint.open_body(&plan)?;
        // Un échec du décodeur avant le premier octet devient une erreur HTTP
        let first = match body.next() {
            Some(Err(e)) => return Err(e),
            other => other,
        };
        Ok::<_, SpottyError>((plan, Some((first, body))))
    })
    .await;

    let (plan, body) = match prepared {
        Ok(Ok(v)) => v,
        Ok(Err(SpottyError::InvalidDuration(raw))) => {
            warn!("Rejected track request with invalid duration '{}'", raw);
            return (StatusCode::BAD_REQUEST, format!("invalid duration: {}", raw))
                .into_response();
        }
        Ok(Err(e)) => {
            error!("❌ Streaming failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        Err(e) => {
            error!("❌ Streaming task panicked: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let body = match body {
        Some((first, rest)) => Body::from_stream(pump(first, rest)),
        None => Body::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(plan.status()).unwrap_or(StatusCode::OK);

    let h = response.headers_mut();
    h.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/x-wav"));
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(plan.content_length()));
    if let Some(content_range) = plan.content_range() {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            h.insert(header::CONTENT_RANGE, value);
        }
    }

    response
}

/// Nouvelle file : morceaux explicites ou URLs de streaming
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueUpdate {
    pub tracks: Vec<QueuedTrack>,
    pub urls: Vec<String>,
}

/// Router Axum de la file de lecture
pub fn queue_router(queue: Arc<TrackQueue>) -> Router {
    Router::new()
        .route(
            "/queue",
            get(get_queue).post(replace_queue).delete(clear_queue),
        )
        .with_state(queue)
}

async fn get_queue(State(queue): State<Arc<TrackQueue>>) -> Json<QueueSnapshot> {
    Json(queue.snapshot())
}

async fn replace_queue(
    State(queue): State<Arc<TrackQueue>>,
    Json(update): Json<QueueUpdate>,
) -> Response {
    let mut tracks = update.tracks;
    for url in &update.urls {
        match parse_track_url(url) {
            Ok(track) => tracks.push(track),
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    }
    queue.replace(tracks);
    Json(queue.snapshot()).into_response()
}

async fn clear_queue(State(queue): State<Arc<TrackQueue>>) -> StatusCode {
    queue.clear();
    StatusCode::NO_CONTENT
}

/// Router Axum de l'historique
pub fn history_router(history: Arc<RecentlyPlayed>) -> Router {
    Router::new()
        .route("/recently_played", get(get_history))
        .with_state(history)
}

async fn get_history(State(history): State<Arc<RecentlyPlayed>>) -> Response {
    match tokio::task::spawn_blocking(move || history.tracks()).await {
        Ok(tracks) => Json::<Vec<PlayedTrack>>(tracks).into_response(),
        Err(e) => {
            error!("❌ History task panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Transfère les blocs du corps vers un flux asynchrone
fn pump(
    first: Option<crate::error::Result<Bytes>>,
    rest: ResponseBody,
) -> ReceiverStream<std::io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        for chunk in first.into_iter().chain(rest) {
            let item = chunk.map_err(std::io::Error::other);
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() {
                debug!("Client went away, closing stream");
                break;
            }
            if failed {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}
