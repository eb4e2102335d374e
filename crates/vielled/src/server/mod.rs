//! HTTP/JSON API and websocket endpoint.
//!
//! The server runs on a background tokio runtime; handlers talk to the
//! same state tree, signal bus and store as the dispatcher. Mutating
//! requests carry an optional `X-Client-Id` header that rides along on
//! emitted signals so the websocket fan-out can suppress echoes.

pub mod instrument;
pub mod mappings;
pub mod presets;
pub mod sounds;
pub mod websocket;

use std::io::Cursor;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::services::ServeDir;
use tracing::info;
use vielleconf::Settings;
use viellestore::{Store, StoreError};

use crate::engine::{DeviceError, StringEngine};
use crate::signals::Signals;
use crate::state::{StateError, StateHandle};
use crate::ui::Menu;

pub const PRODUCT_NAME: &str = "Vielle";

/// Shared handler context.
pub struct AppContext {
    pub state: StateHandle,
    pub store: Arc<Store>,
    pub signals: Signals,
    pub settings: Settings,
    pub engine: Arc<dyn StringEngine>,
    pub menu: Arc<Menu>,
    pub version: String,
}

pub type Ctx = Arc<AppContext>;

/// API error kinds mapped onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    /// Schema validation failed; the map goes into `{"errors": ...}`.
    Validation(serde_json::Map<String, Value>),
    /// Request-level problem with a human message.
    BadRequest(String),
    NotFound,
    Device(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Store(StoreError::NotFound(_)) => ApiError::NotFound,
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        ApiError::Device(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "errors": errors })),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": message })),
            )
                .into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Device(message) | ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": message })),
            )
                .into_response(),
        }
    }
}

/// Client id from the `X-Client-Id` request header.
pub fn client_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn router(ctx: Ctx) -> Router {
    let webroot = ctx.settings.server.webroot_dir.clone();
    Router::new()
        .route("/presets", get(presets::list).post(presets::create))
        .route(
            "/presets/{id}",
            get(presets::show)
                .put(presets::update)
                .delete(presets::delete),
        )
        .route("/presets/{id}/load", post(presets::load))
        .route("/presets/order", post(presets::order))
        .route(
            "/instrument",
            get(instrument::get_instrument)
                .put(instrument::put_instrument)
                .post(instrument::post_instrument),
        )
        .route(
            "/misc",
            get(instrument::get_misc)
                .put(instrument::put_misc)
                .post(instrument::post_misc),
        )
        .route("/config", get(instrument::export).post(instrument::import))
        .route("/sounds", get(sounds::list))
        .route("/sounds/{id}", get(sounds::show).delete(sounds::delete))
        .route("/upload/sound/{filename}", post(sounds::upload))
        .route("/mappings", get(mappings::list))
        .route(
            "/mappings/{name}",
            get(mappings::show)
                .put(mappings::update)
                .delete(mappings::reset),
        )
        .route(
            "/calibrate/keyboard",
            get(mappings::get_calibration)
                .put(mappings::put_calibration)
                .delete(mappings::delete_calibration),
        )
        .route("/info", get(sysinfo))
        .route("/screenshot", get(screenshot))
        .route("/ws", get(websocket::handler))
        .fallback_service(ServeDir::new(webroot))
        .with_state(ctx)
}

/// Run the server until the process exits. Called on the web runtime
/// thread.
pub async fn serve(ctx: Ctx) -> anyhow::Result<()> {
    let port = ctx.settings.server.http_port;
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("http server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn sysinfo(State(ctx): State<Ctx>) -> Json<Value> {
    Json(json!({
        "name": PRODUCT_NAME,
        "version": ctx.version,
    }))
}

#[derive(Deserialize)]
struct ScreenshotQuery {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default = "default_scale")]
    scale: u32,
}

fn default_format() -> String {
    "png".to_string()
}

fn default_scale() -> u32 {
    1
}

async fn screenshot(
    State(ctx): State<Ctx>,
    Query(query): Query<ScreenshotQuery>,
) -> Result<Response, ApiError> {
    let (width, height, pixels) = ctx.menu.screenshot();
    let scale = query.scale.clamp(1, 8);

    let mut img = image::GrayImage::new(width as u32, height as u32);
    for (idx, pixel) in pixels.iter().enumerate() {
        let x = idx as u32 % width as u32;
        let y = idx as u32 / width as u32;
        img.put_pixel(x, y, image::Luma([if *pixel != 0 { 255 } else { 0 }]));
    }
    let img = image::imageops::resize(
        &img,
        width as u32 * scale,
        height as u32 * scale,
        image::imageops::FilterType::Nearest,
    );

    let (format, mime) = match query.format.as_str() {
        "png" => (image::ImageFormat::Png, "image/png"),
        "gif" => (image::ImageFormat::Gif, "image/gif"),
        "jpg" | "jpeg" => (image::ImageFormat::Jpeg, "image/jpeg"),
        other => return Err(ApiError::BadRequest(format!("unknown format \"{}\"", other))),
    };

    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut buffer, format)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, mime)], buffer.into_inner()).into_response())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::engine::RecordingEngine;
    use crate::state::{PowerState, State};
    use crate::ui::MemoryDisplay;

    /// Build a full app context over temp dirs and recording fakes.
    pub fn test_ctx() -> (tempfile::TempDir, Ctx) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.core.sound_dir = dir.path().join("sounds");
        settings.core.upload_dir = dir.path().join("uploads");
        settings.core.config_dir = dir.path().join("config");
        settings.server.webroot_dir = dir.path().join("www");
        settings.create_dirs().unwrap();
        std::fs::create_dir_all(&settings.server.webroot_dir).unwrap();

        let signals = Signals::new();
        let power = PowerState::new(
            dir.path().join("ac"),
            dir.path().join("usb"),
            dir.path().join("bat"),
        );
        let state = StateHandle::new(
            signals.clone(),
            State::new(settings.core.sound_dir.clone(), power),
        );
        let store = Arc::new(Store::in_memory().unwrap());
        // the dispatcher queue has no consumer here; sends are ignored
        let (queue, _queue_rx) = crossbeam_channel::unbounded();
        std::mem::forget(_queue_rx);
        let menu = Menu::new(
            Box::new(MemoryDisplay::new(128, 32)),
            state.clone(),
            Arc::clone(&store),
            queue,
            signals.clone(),
        );
        menu.goto_named("home");

        let ctx = Arc::new(AppContext {
            state,
            store,
            signals,
            settings,
            engine: Arc::new(RecordingEngine::new()),
            menu,
            version: "1.0.0-test".to_string(),
        });
        (dir, ctx)
    }
}
