//! Dashboard UI, embedded into the binary with `rust-embed`.
//!
//! The workspace enables `debug-embed`, so debug builds carry the `ui/`
//! files as well and behave like release builds.

use axum::{
    Router,
    extract::Path,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "ui/"]
struct UiAssets;

/// Router serving the dashboard page and its assets.
///
/// Merge it **after** `/ws` and `/health`; unknown paths fall back to
/// `index.html`.
pub fn ui_router() -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/{*path}", get(static_handler))
}

async fn index_handler() -> Response {
    asset_response("index.html").unwrap_or_else(not_found)
}

async fn static_handler(Path(path): Path<String>) -> Response {
    asset_response(&path)
        .or_else(|| asset_response("index.html"))
        .unwrap_or_else(not_found)
}

fn asset_response(path: &str) -> Option<Response> {
    let asset = UiAssets::get(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Some(
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime.as_ref()),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            asset.data.into_owned(),
        )
            .into_response(),
    )
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html("<h1>404</h1>")).into_response()
}
