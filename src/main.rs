use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use emby_tag_queue::{Cache, Config, EmbySource, Id3Parser, TagQueue, TagResult};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{info, warn};

// --- State ---

#[derive(Clone)]
struct AppState {
    queue: TagQueue,
}

#[derive(Deserialize, Debug)]
struct BatchRequest {
    #[serde(rename = "trackIds")]
    track_ids: Vec<String>,
}

// --- Implementation ---

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,emby_tag_queue=debug".into()),
        )
        .init();

    // 2. Load Config
    let config = Config::from_env()?;
    info!("Media server: {}", config.server_url);
    info!("Tag reads: up to {} at once", config.max_concurrent);

    // 3. Initialize HTTP Client and tag parser
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let source = EmbySource::new(client, &config.server_url, Arc::new(config.token.clone()))?;
    let queue = TagQueue::new(config.queue(), Arc::new(source), Arc::new(Id3Parser::new()))?;

    let state = AppState { queue };

    // 4. Setup Router
    let app = router(state);

    // 5. Start Server
    let addr = config.listen_addr();
    info!("Tag service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/tags", post(batch_tags))
        .route("/tags/:track_id", get(track_tags))
        .route("/images/:track_id", get(track_image))
        .route("/stats", get(stats))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// Tags for a single track; 404 when none could be read.
async fn track_tags(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> impl IntoResponse {
    match state.queue.request_tags(track_id).await {
        Some(tags) => Json(tags).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Reads a whole playlist worth of tracks through the queue.
/// Tracks without tags map to `null`.
async fn batch_tags(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> impl IntoResponse {
    let pending: Vec<_> = body
        .track_ids
        .iter()
        .map(|id| state.queue.request_tags(id.clone()))
        .collect();
    let results = futures::future::join_all(pending).await;

    let found = results.iter().filter(|r| r.is_some()).count();
    if found < results.len() {
        warn!("Batch: {} of {} tracks without tags", results.len() - found, results.len());
    }

    let body: HashMap<String, Option<TagResult>> = body.track_ids.into_iter().zip(results).collect();
    Json(body)
}

/// Cover art already extracted for a track, as a data URI.
async fn track_image(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> impl IntoResponse {
    match state.queue.image_cache().get(&track_id) {
        Some(uri) => ([(header::CONTENT_TYPE, "text/plain")], uri).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.queue.stats())
}
