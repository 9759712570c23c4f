// Integration test for the ProxyServer.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;

use ma_range_cache::config::CacheConfig;
use ma_range_cache::server::handler::ProxyServer;
use ma_range_cache::CacheEngine;

const CONTENT_SIZE: usize = 1024 * 1024; // 1 MB

/// Generate deterministic test content.
fn generate_content() -> Vec<u8> {
    (0..CONTENT_SIZE).map(|i| (i % 256) as u8).collect()
}

/// Fake upstream server that supports Range requests.
async fn fake_upstream_handler(req: Request) -> impl IntoResponse {
    let content = generate_content();
    let total = content.len() as u64;

    let range_header = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(range_val) = range_header {
        // Parse "bytes=start-end"
        if let Some(rest) = range_val.strip_prefix("bytes=") {
            let mut parts = rest.splitn(2, '-');
            let start: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let end_str = parts.next().unwrap_or("");
            let end: u64 = if end_str.is_empty() {
                total - 1
            } else {
                end_str.parse().unwrap_or(total - 1)
            };
            let end = end.min(total - 1);

            let slice = &content[start as usize..=end as usize];
            let content_range = format!("bytes {}-{}/{}", start, end, total);

            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                    (header::CONTENT_RANGE, content_range),
                    (header::CONTENT_LENGTH, slice.len().to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                slice.to_vec(),
            )
                .into_response()
        } else {
            (StatusCode::BAD_REQUEST, "bad range").into_response()
        }
    } else {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "audio/mpeg".to_string()),
                (header::CONTENT_LENGTH, total.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            content,
        )
            .into_response()
    }
}

async fn start_upstream() -> String {
    let upstream_app = Router::new().route("/song.mp3", get(fake_upstream_handler));
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(upstream_listener, upstream_app).await.ok();
    });
    format!("http://127.0.0.1:{}", upstream_port)
}

#[tokio::test]
async fn test_proxy_server() {
    // 1. Start fake upstream server.
    let upstream = start_upstream().await;
    let upstream_url = format!("{}/song.mp3", upstream);

    // 2. Start ProxyServer over a fresh cache directory.
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(CacheEngine::with_http(CacheConfig::with_cache_dir(tmp_dir.path())));
    let server = ProxyServer::start(Arc::clone(&engine)).await.unwrap();
    let stream_url = server.url_for(&upstream_url).unwrap();
    let expected = generate_content();
    let client = reqwest::Client::new();

    // 3. Range: bytes=0-1023.
    let resp = client
        .get(&stream_url)
        .header("Range", "bytes=0-1023")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()["content-range"],
        format!("bytes 0-1023/{}", CONTENT_SIZE).as_str()
    );
    assert_eq!(resp.headers()["content-type"], "audio/mpeg");
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &expected[0..1024]);

    // 4. Open-ended range up to the end.
    let resp = client
        .get(&stream_url)
        .header("Range", "bytes=1048000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &expected[1_048_000..]);

    // 5. Suffix range.
    let resp = client
        .get(&stream_url)
        .header("Range", "bytes=-100")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &expected[CONTENT_SIZE - 100..]);

    // 6. Whole resource without a Range header.
    let resp = client.get(&stream_url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), CONTENT_SIZE);
    assert_eq!(&body[..], &expected[..]);

    // Everything is on disk now.
    let record = engine.cached_record(&upstream_url).unwrap();
    assert!(record.is_complete());

    // 7. HEAD request.
    let head_resp = client.head(&stream_url).send().await.unwrap();
    assert_eq!(head_resp.status(), 200);
    assert!(head_resp.headers().contains_key("accept-ranges"));
    assert_eq!(
        head_resp.headers()["content-length"],
        CONTENT_SIZE.to_string().as_str()
    );

    // 8. Range past the end.
    let resp = client
        .get(&stream_url)
        .header("Range", "bytes=2000000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    // Cleanup.
    server.shutdown();
}

#[tokio::test]
async fn test_proxy_reports_upstream_failure() {
    let upstream = start_upstream().await;
    let missing = format!("{}/missing.mp3", upstream);

    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(CacheEngine::with_http(CacheConfig::with_cache_dir(tmp_dir.path())));
    let server = ProxyServer::start(engine).await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url_for(&missing).unwrap())
        .header("Range", "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    server.shutdown();
}
