//! HTTP event router. Every UI action maps to one route; each route locks the
//! session it targets for its whole duration.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SamDemoError};
use crate::image_state::{ExampleId, ExampleRegistry, TaggedImage};
use crate::inference::{InferenceSettings, SamParameters};
use crate::point::PointStore;
use crate::session::{SessionId, SessionStore, Snapshot};
use crate::traits::PromptSegmentationModel;

const INDEX_HTML: &str = include_str!("../static/index.html");
const DEFAULT_UPLOAD_LIMIT: usize = 20 * 1024 * 1024;
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

pub struct AppState {
    pub sessions: SessionStore,
    pub registry: ExampleRegistry,
    pub model: Arc<dyn PromptSegmentationModel>,
    pub defaults: InferenceSettings,
    pub max_upload_bytes: usize,
    /// Sessions unused this long are dropped. `None` keeps them until DELETE.
    pub session_idle: Option<Duration>,
}

impl AppState {
    pub fn new(
        model: Arc<dyn PromptSegmentationModel>,
        registry: ExampleRegistry,
        defaults: InferenceSettings,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            registry,
            model,
            defaults,
            max_upload_bytes: DEFAULT_UPLOAD_LIMIT,
            session_idle: None,
        }
    }

    pub const fn with_upload_limit(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub const fn with_session_idle(mut self, session_idle: Option<Duration>) -> Self {
        self.session_idle = session_idle;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExampleInfo {
    pub id: ExampleId,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct DisplayResponse {
    /// Base64 PNG of the image with markers, absent when nothing is loaded.
    pub display_png: Option<String>,
    pub points: PointStore,
}

#[derive(Debug, Deserialize)]
pub struct ClickRequest {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub selector: String,
}

/// Submit body. Missing fields fall back to the server defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitRequest {
    pub device: Option<String>,
    pub model: Option<String>,
    pub params: Option<SamParameters>,
}

impl SubmitRequest {
    fn into_settings(self, defaults: &InferenceSettings) -> InferenceSettings {
        InferenceSettings {
            device: self.device.unwrap_or_else(|| defaults.device.clone()),
            model: self.model.unwrap_or_else(|| defaults.model.clone()),
            params: self.params.unwrap_or(defaults.params),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub overlay_png: String,
    pub mask_png: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for SamDemoError {
    fn into_response(self) -> Response {
        let status = if self.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let mut message = self.to_string();
        let mut source = std::error::Error::source(&self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        if status.is_server_error() {
            log::error!("{message}");
        } else {
            log::warn!("{message}");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn encode_png<P>(buffer: &image::ImageBuffer<P, Vec<u8>>, color: ExtendedColorType) -> Result<String>
where
    P: image::Pixel<Subpixel = u8>,
{
    let mut bytes = Vec::new();
    image::codecs::png::PngEncoder::new(Cursor::new(&mut bytes))
        .write_image(buffer.as_raw(), buffer.width(), buffer.height(), color)
        .map_err(|e| SamDemoError::rendering("PNGエンコード", e))?;
    Ok(STANDARD.encode(bytes))
}

fn display_response(snapshot: Snapshot) -> Result<Json<DisplayResponse>> {
    let display_png = snapshot
        .display
        .as_ref()
        .map(|img| encode_png(img, ExtendedColorType::Rgb8))
        .transpose()?;
    Ok(Json(DisplayResponse {
        display_png,
        points: snapshot.points,
    }))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn list_examples(State(state): State<Arc<AppState>>) -> Json<Vec<ExampleInfo>> {
    let examples = state
        .registry
        .iter()
        .map(|example| ExampleInfo {
            id: example.id,
            name: example
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
        .collect();
    Json(examples)
}

async fn create_session(State(state): State<Arc<AppState>>) -> Json<SessionCreated> {
    Json(SessionCreated {
        session_id: state.sessions.create(),
    })
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode> {
    state.sessions.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    body: Bytes,
) -> Result<Json<DisplayResponse>> {
    let session = state.sessions.get(id)?;
    let image = TaggedImage::decode(&body)?;
    let snapshot = session.lock().await.upload(image);
    display_response(snapshot)
}

async fn select_example(
    State(state): State<Arc<AppState>>,
    Path((id, example_id)): Path<(SessionId, usize)>,
) -> Result<Json<DisplayResponse>> {
    let session = state.sessions.get(id)?;
    let snapshot = session
        .lock()
        .await
        .select_example(ExampleId(example_id), &state.registry)?;
    display_response(snapshot)
}

async fn click(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(request): Json<ClickRequest>,
) -> Result<Json<DisplayResponse>> {
    let session = state.sessions.get(id)?;
    let snapshot = session
        .lock()
        .await
        .click([request.x, request.y], &request.selector)?;
    display_response(snapshot)
}

async fn undo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> Result<Json<DisplayResponse>> {
    let session = state.sessions.get(id)?;
    let snapshot = session.lock().await.undo(&state.registry)?;
    display_response(snapshot)
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    body: Option<Json<SubmitRequest>>,
) -> Result<Json<SubmitResponse>> {
    let settings = body
        .map(|Json(request)| request)
        .unwrap_or_default()
        .into_settings(&state.defaults);

    // ガードを推論タスクへ移し、終わるまで同じセッションの操作を待たせる
    let guard = state.sessions.get(id)?.lock_owned().await;
    let app = Arc::clone(&state);
    let output = tokio::task::spawn_blocking(move || {
        guard.submit(app.model.as_ref(), &app.registry, &settings)
    })
    .await
    .map_err(|e| SamDemoError::model("推論タスク", e.to_string()))??;

    Ok(Json(SubmitResponse {
        overlay_png: encode_png(&output.overlay, ExtendedColorType::Rgb8)?,
        mask_png: encode_png(&output.mask, ExtendedColorType::L8)?,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = state.max_upload_bytes;
    Router::new()
        .route("/", get(index))
        .route("/examples", get(list_examples))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", axum::routing::delete(close_session))
        .route(
            "/sessions/:id/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/sessions/:id/examples/:example_id", post(select_example))
        .route("/sessions/:id/click", post(click))
        .route("/sessions/:id/undo", post(undo))
        .route("/sessions/:id/submit", post(submit))
        .with_state(state)
}

/// Periodically drops idle sessions while the server runs.
pub fn spawn_session_sweeper(state: Arc<AppState>, max_idle: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD.min(max_idle).max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let evicted = state.sessions.evict_idle(max_idle);
            if evicted > 0 {
                log::info!("{evicted} idle session(s) dropped, {} active", state.sessions.len());
            }
        }
    })
}

pub async fn serve(state: Arc<AppState>, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    if let Some(max_idle) = state.session_idle {
        spawn_session_sweeper(Arc::clone(&state), max_idle);
    }
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
