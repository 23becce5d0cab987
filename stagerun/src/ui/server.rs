//! Read-only HTTP interface over the latest [`PipelineSnapshot`].
//!
//! Every request must carry `Authorization: Bearer <token>`. Tokens are
//! compared as SHA-256 digests in constant time.

use super::snapshot::{PipelineSnapshot, SnapshotStore};
use crate::config::UiConfig;
use crate::errors::{AuthError, StagerunError};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    store: SnapshotStore,
    token_digest: Arc<[u8; 32]>,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AppState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;
        if constant_time_eq(&digest(token), &self.token_digest) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

enum ApiError {
    Auth(AuthError),
    NotReady,
    UnknownNode(String),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Auth(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            Self::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no snapshot published yet".to_string(),
            ),
            Self::UnknownNode(name) => (StatusCode::NOT_FOUND, format!("unknown node '{name}'")),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn latest(state: &AppState) -> Result<Arc<PipelineSnapshot>, ApiError> {
    state.store.latest().ok_or(ApiError::NotReady)
}

async fn handle_state(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let snapshot = latest(&state)?;
    Ok((StatusCode::OK, Json(PipelineSnapshot::clone(&snapshot))))
}

async fn handle_node(
    State(state): State<AppState>,
    Path(fqname): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let snapshot = latest(&state)?;
    let node = snapshot
        .node(&fqname)
        .cloned()
        .ok_or(ApiError::UnknownNode(fqname))?;
    Ok((StatusCode::OK, Json(node)))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(handle_state))
        .route("/api/node/:fqname", get(handle_node))
        .with_state(state)
}

/// A running interface server.
#[derive(Debug)]
pub struct UiServer {
    addr: SocketAddr,
    token: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl UiServer {
    /// Binds `config.bind` and starts serving `store`.
    ///
    /// Without a configured token a random one is generated and logged.
    pub async fn start(config: &UiConfig, store: SnapshotStore) -> Result<Self, StagerunError> {
        let token = config.token.clone().unwrap_or_else(|| {
            let bytes: [u8; 16] = rand::random();
            hex::encode(bytes)
        });
        let listener = TcpListener::bind(&config.bind).await?;
        let addr = listener.local_addr()?;
        let app = router(AppState {
            store,
            token_digest: Arc::new(digest(&token)),
        });

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "state interface stopped");
            }
        });
        info!(url = %format!("http://{addr}/api/state"), token = %token, "serving run state");
        Ok(Self {
            addr,
            token,
            shutdown: Some(tx),
            task,
        })
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bearer token clients must present.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stops accepting requests and waits for in-flight ones.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
