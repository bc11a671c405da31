use crate::{
    app::{App, AppError},
    ingest::{IngestReport, IngestSource},
    lifecycle::{Deployment, LifecycleError},
    query::{SearchResult, DEFAULT_NEIGHBORS},
    records::Owner,
};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

pub fn router(app: Arc<App>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/ingest", post(ingest))
        .route("/api/deployment", get(deployment))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(app: App) -> anyhow::Result<()> {
    let listen = app.config().web.listen.clone();
    let app = router(Arc::new(app));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(app: App) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app).await })
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            err if err.is_client_error() => axum::http::StatusCode::BAD_REQUEST,
            AppError::Lifecycle(LifecycleError::NotInitialized) => {
                axum::http::StatusCode::NOT_FOUND
            }
            _ => {
                log::error!("{self:?}");
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Deserialize, Serialize)]
pub struct SearchRequest {
    pub image_b64: String,
    #[serde(default = "default_k")]
    pub k: usize,
    /// JSON list of restricts, passed to the index as is
    pub filter: Option<String>,
}

fn default_k() -> usize {
    DEFAULT_NEIGHBORS
}

impl Debug for SearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SearchRequest {{ image_b64: [REDUCTED], k: {}, filter: {:?} }}",
            self.k, self.filter
        )
    }
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<axum::Json<Vec<SearchResult>>, HttpError> {
    log::debug!("payload: {payload:?}");
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let image = STANDARD
            .decode(&payload.image_b64)
            .map_err(|err| AppError::BadRequest(format!("image_b64: {err}")))?;
        app.search_bytes(&image, payload.k, payload.filter.as_deref())
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IngestRequest {
    /// Server-side image files or directory, or gs:// uris
    pub sources: Vec<String>,
    pub user_id: Option<String>,
}

async fn ingest(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IngestRequest>,
) -> Result<axum::Json<IngestReport>, HttpError> {
    log::debug!("payload: {payload:?}");
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let owner = match payload.user_id {
            Some(id) => Owner::from_parts("user", Some(&id))
                .map_err(|err| AppError::BadRequest(err.to_string()))?,
            None => Owner::Admin,
        };

        let source = match payload.sources.as_slice() {
            [] => return Err(AppError::BadRequest("no sources given".to_string()).into()),
            [single] if std::path::Path::new(single).is_dir() => {
                IngestSource::Directory(single.into())
            }
            _ => IngestSource::Uris(payload.sources),
        };

        app.ingest(source, &owner).map(Into::into).map_err(Into::into)
    })
}

async fn deployment(
    State(state): State<Arc<SharedState>>,
) -> Result<axum::Json<Deployment>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || match app.saved_deployment()? {
        Some(deployment) => Ok(deployment.into()),
        None => Err(AppError::from(LifecycleError::NotInitialized).into()),
    })
}
