use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pmospotty::decoder::{DecoderSettings, ProcessControl};
use pmospotty::wav::BYTES_PER_SECOND;
use pmospotty::{
    AudioStreamer, DecodeRequest, DecoderLauncher, DecoderProcess, TrackStreamEndpoint,
    WavHeader, parse_range, track_router,
};
use pmoutils::Termination;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Décodeur en mémoire : l'octet PCM n vaut `n % 256`
#[derive(Default)]
struct PatternLauncher {
    starts: Mutex<Vec<u64>>,
}

struct NoProcess;

impl ProcessControl for NoProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&self) -> Termination {
        Termination::AlreadyStopped
    }
}

impl DecoderLauncher for PatternLauncher {
    fn launch(&self, request: &DecodeRequest) -> pmospotty::Result<DecoderProcess> {
        self.starts.lock().unwrap().push(request.start_second);
        let offset = request.start_second * BYTES_PER_SECOND;
        let pcm: Vec<u8> = (offset..offset + 4 * BYTES_PER_SECOND)
            .map(|n| (n % 256) as u8)
            .collect();
        Ok(DecoderProcess::new(
            Box::new(Cursor::new(pcm)),
            Arc::new(NoProcess),
        ))
    }
}

fn pattern(from: u64, len: u64) -> Vec<u8> {
    (from..from + len).map(|n| (n % 256) as u8).collect()
}

#[tokio::test]
async fn seek_serves_exact_bytes_from_restarted_decoder() {
    let launcher = Arc::new(PatternLauncher::default());
    let endpoint = Arc::new(TrackStreamEndpoint::new(AudioStreamer::new(
        launcher.clone(),
        DecoderSettings::default(),
    )));
    let router = track_router(endpoint);

    let total = WavHeader::for_duration(3.0).total_len();
    assert_eq!(total, 44 + 3 * BYTES_PER_SECOND);

    // Première requête : le morceau démarre
    let response = router
        .clone()
        .oneshot(
            Request::get("/track/pattern/3")
                .header(header::RANGE, "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), 99);
    assert_eq!(&body[..4], b"RIFF");
    assert_eq!(&body[44..], &pattern(0, 55)[..]);

    // Seek en milieu de seconde 2
    let begin = 44 + 2 * BYTES_PER_SECOND + 1000;
    let response = router
        .oneshot(
            Request::get("/track/pattern/3")
                .header(header::RANGE, format!("bytes={}-", begin))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok()),
        Some(format!("bytes {}-{}/{}", begin, total, total).as_str())
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len() as u64, total - begin);
    assert_eq!(&body[..], &pattern(begin - 44, total - begin)[..]);
    assert_eq!(launcher.starts.lock().unwrap().last(), Some(&2));
}

#[test]
fn malformed_ranges_fall_back_to_full_file() {
    for raw in ["", "bytes", "bytes=abc", "items=0-10", "bytes=x-10"] {
        let range = parse_range(Some(raw), 1000).range();
        assert_eq!((range.begin, range.end), (0, 1000), "{raw}");
    }
}
