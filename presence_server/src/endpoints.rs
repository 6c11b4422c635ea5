//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::{meter::METER, scene::Scene};

const INDEX_HTML: &str = r#"<html>
  <head>
    <title>Presence camera</title>
  </head>
  <body>
    <h1>Live feed</h1>
    <img src="/video_feed">
  </body>
</html>
"#;

/// State shared by all handlers.
pub struct AppState {
    pub scene: Arc<Scene>,
    /// Annotated frames as multipart items.
    pub feed_tx: broadcast::Sender<Bytes>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/healthcheck", get(healthcheck))
        .route("/presence", get(presence))
        .layer(Extension(state))
}

/// Page showing the annotated feed.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Endpoint of the annotated image stream.
pub async fn video_feed(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    log::info!(
        "Video feed requested, {} viewers",
        state.feed_tx.receiver_count() + 1
    );

    // Slow viewers skip frames instead of ending the stream
    let stream = BroadcastStream::new(state.feed_tx.subscribe()).filter_map(|item| async move {
        match item {
            Ok(data) => {
                METER.tick_streamed();
                Some(Ok::<_, std::io::Error>(data))
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                log::debug!("Viewer lagging, skipped {skipped} frames");
                None
            }
        }
    });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// Latest analysis results as JSON.
pub async fn presence(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scene.snapshot())
}
