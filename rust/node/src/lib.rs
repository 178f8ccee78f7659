//! The query-node service.
//!
//! A node is a long-lived worker holding the trained codebooks and a subset
//! of the database's clusters. The coordinator drives it through four index
//! operations plus a two-step segment push (stream the bytes to a staged
//! upload id, then promote the upload to its canonical filename under the
//! database path).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use waggle_error::{ErrorCodes, WaggleError};
use waggle_index::{IndexError, IvfPqIndex};
use waggle_storage::UPLOAD_DIR;
use waggle_types::{
    ErrorResponse, InitIndexRequest, LoadSegmentsRequest, PromoteUploadRequest, RunQueriesRequest,
    RunQueriesResponse,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("node index is not initialized")]
    NotInitialized,
    #[error("invalid upload id `{0}`")]
    InvalidUploadId(String),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WaggleError for ServiceError {
    fn code(&self) -> ErrorCodes {
        match self {
            ServiceError::Index(err) => err.code(),
            ServiceError::NotInitialized => ErrorCodes::FailedPrecondition,
            ServiceError::InvalidUploadId(_) => ErrorCodes::InvalidArgument,
            ServiceError::InvalidFileName(_) => ErrorCodes::InvalidArgument,
            ServiceError::UploadNotFound(_) => ErrorCodes::NotFound,
            ServiceError::Io(err) => err.code(),
            ServiceError::Join(_) => ErrorCodes::Internal,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!("request failed: {:?}", self);
        let status: StatusCode = self.code().into();
        let body = ErrorResponse {
            error: self.code().name().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

struct NodeIndex {
    index: IvfPqIndex,
    index_path: PathBuf,
    db_path: PathBuf,
}

/// Shared service state: nothing before `init`, then the index plus its
/// configured paths. Handlers take the lock inside `spawn_blocking` because
/// every index operation is CPU- or disk-bound.
#[derive(Clone, Default)]
pub struct NodeState {
    inner: Arc<RwLock<Option<NodeIndex>>>,
}

pub fn router(state: NodeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/index/init", post(init_index))
        .route("/api/v1/index/codebook", post(load_codebook))
        .route("/api/v1/index/segments", post(load_segments))
        .route("/api/v1/queries", post(run_queries))
        .route("/api/v1/uploads/{upload_id}", put(upload_segment))
        .route("/api/v1/uploads/promote", post(promote_upload))
        // Query batches and segment uploads are far larger than the default
        // two-megabyte cap.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Binds and serves until the process is killed.
pub async fn serve(host: &str, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("query node listening on {}:{}", host, port);
    axum::serve(listener, router(NodeState::default())).await
}

async fn healthz() -> &'static str {
    "OK"
}

async fn init_index(
    State(state): State<NodeState>,
    Json(request): Json<InitIndexRequest>,
) -> Result<StatusCode, ServiceError> {
    let inner = state.inner.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ServiceError> {
        let index = IvfPqIndex::new(request.params)?;
        let db_path = PathBuf::from(&request.db_path);
        std::fs::create_dir_all(db_path.join(UPLOAD_DIR))?;
        tracing::info!(
            "index initialized: {} clusters, db path {}",
            request.params.kc,
            db_path.display()
        );
        *inner.write() = Some(NodeIndex {
            index,
            index_path: PathBuf::from(&request.index_path),
            db_path,
        });
        Ok(())
    })
    .await??;
    Ok(StatusCode::OK)
}

async fn load_codebook(State(state): State<NodeState>) -> Result<StatusCode, ServiceError> {
    let inner = state.inner.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ServiceError> {
        let mut guard = inner.write();
        let node = guard.as_mut().ok_or(ServiceError::NotInitialized)?;
        let index_path = node.index_path.clone();
        node.index.load_codebooks(&index_path)?;
        Ok(())
    })
    .await??;
    Ok(StatusCode::OK)
}

async fn load_segments(
    State(state): State<NodeState>,
    Json(request): Json<LoadSegmentsRequest>,
) -> Result<StatusCode, ServiceError> {
    let inner = state.inner.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ServiceError> {
        let mut guard = inner.write();
        let node = guard.as_mut().ok_or(ServiceError::NotInitialized)?;
        let db_path = node.db_path.clone();
        node.index.load_from_book(&request.clusters, &db_path)?;
        tracing::info!("{} segments resident", request.clusters.len());
        Ok(())
    })
    .await??;
    Ok(StatusCode::OK)
}

async fn run_queries(
    State(state): State<NodeState>,
    Json(request): Json<RunQueriesRequest>,
) -> Result<Json<RunQueriesResponse>, ServiceError> {
    let inner = state.inner.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<RunQueriesResponse, ServiceError> {
        let guard = inner.read();
        let node = guard.as_ref().ok_or(ServiceError::NotInitialized)?;
        let started = Instant::now();
        let (ids, dists) = node
            .index
            .top_k_ids(request.k, &request.queries, &request.probes)?;
        tracing::info!(
            "scanned {} queries in {:?}",
            request.queries.len(),
            started.elapsed()
        );
        Ok(RunQueriesResponse { ids, dists })
    })
    .await??;
    Ok(Json(response))
}

async fn upload_segment(
    State(state): State<NodeState>,
    UrlPath(upload_id): UrlPath<String>,
    request: axum::extract::Request,
) -> Result<StatusCode, ServiceError> {
    if upload_id.is_empty()
        || !upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ServiceError::InvalidUploadId(upload_id));
    }
    let staging = {
        let guard = state.inner.read();
        let node = guard.as_ref().ok_or(ServiceError::NotInitialized)?;
        node.db_path.join(UPLOAD_DIR).join(&upload_id)
    };

    let mut file = tokio::fs::File::create(&staging).await?;
    let mut stream = request.into_body().into_data_stream();
    let mut received = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        received += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    tracing::info!("staged upload {} ({} bytes)", upload_id, received);
    Ok(StatusCode::OK)
}

async fn promote_upload(
    State(state): State<NodeState>,
    Json(request): Json<PromoteUploadRequest>,
) -> Result<StatusCode, ServiceError> {
    let file_name = &request.file_name;
    if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.contains("..") {
        return Err(ServiceError::InvalidFileName(file_name.clone()));
    }
    let (staging, target) = {
        let guard = state.inner.read();
        let node = guard.as_ref().ok_or(ServiceError::NotInitialized)?;
        (
            node.db_path.join(UPLOAD_DIR).join(&request.upload_id),
            node.db_path.join(file_name),
        )
    };

    tokio::fs::rename(&staging, &target).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServiceError::UploadNotFound(request.upload_id.clone())
        } else {
            ServiceError::Io(err)
        }
    })?;
    tracing::info!("upload {} promoted to {}", request.upload_id, file_name);
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_types::IvfPqParams;

    /// Writes a trained two-cluster database to `dir` and returns its params.
    fn write_tiny_database(dir: &std::path::Path) -> IvfPqParams {
        let params = IvfPqParams::from_dataset(4, 4, 2, 2);
        let mut index = IvfPqIndex::new(params).unwrap();
        let product = (0..2)
            .map(|_| {
                let mut sub = vec![vec![0.5, 0.5], vec![9.5, 9.5]];
                for i in 2..256 {
                    sub.push(vec![1.0e6 + i as f32; 2]);
                }
                sub
            })
            .collect();
        index
            .set_codebooks(vec![vec![vec![0.5; 4], vec![9.5; 4]]], product)
            .unwrap();
        let data = vec![
            0.0, 0.0, 0.0, 0.0, //
            1.0, 1.0, 1.0, 1.0, //
            9.0, 9.0, 9.0, 9.0, //
            10.0, 10.0, 10.0, 10.0,
        ];
        index.populate(&data).unwrap();
        index.write_codebooks(dir).unwrap();
        index.write_database(dir).unwrap();
        params
    }

    async fn initialized_state(dir: &std::path::Path, params: IvfPqParams) -> NodeState {
        let state = NodeState::default();
        let request = InitIndexRequest {
            params,
            index_path: dir.display().to_string(),
            db_path: dir.display().to_string(),
        };
        init_index(State(state.clone()), Json(request))
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_full_query_flow() {
        let dir = tempfile::tempdir().unwrap();
        let params = write_tiny_database(dir.path());
        let state = initialized_state(dir.path(), params).await;

        load_codebook(State(state.clone())).await.unwrap();
        load_segments(
            State(state.clone()),
            Json(LoadSegmentsRequest {
                clusters: vec![0, 1],
            }),
        )
        .await
        .unwrap();

        let Json(response) = run_queries(
            State(state.clone()),
            Json(RunQueriesRequest {
                k: 1,
                queries: vec![vec![0.0; 4]],
                probes: vec![vec![0]],
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.ids, vec![vec![0]]);
        assert!((response.dists[0][0] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_calls_before_init_are_rejected() {
        let state = NodeState::default();
        let err = load_codebook(State(state.clone())).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotInitialized));
        assert_eq!(err.code(), ErrorCodes::FailedPrecondition);

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_bad_index_path_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let params = IvfPqParams::from_dataset(4, 4, 2, 2);
        // No codebook files exist under this path.
        let state = initialized_state(dir.path(), params).await;

        let err = load_codebook(State(state.clone())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCodes::NotFound);
    }

    #[tokio::test]
    async fn test_upload_then_promote() {
        let dir = tempfile::tempdir().unwrap();
        let params = write_tiny_database(dir.path());
        let state = initialized_state(dir.path(), params).await;

        let body = axum::body::Body::from(vec![1u8, 2, 3, 4]);
        let request = axum::http::Request::builder().body(body).unwrap();
        upload_segment(
            State(state.clone()),
            UrlPath("upload-42".to_string()),
            request,
        )
        .await
        .unwrap();

        promote_upload(
            State(state.clone()),
            Json(PromoteUploadRequest {
                upload_id: "upload-42".to_string(),
                file_name: "pqcode_9.ui8vecs".to_string(),
            }),
        )
        .await
        .unwrap();

        let promoted = std::fs::read(dir.path().join("pqcode_9.ui8vecs")).unwrap();
        assert_eq!(promoted, vec![1, 2, 3, 4]);
        assert!(!dir.path().join(UPLOAD_DIR).join("upload-42").exists());
    }

    #[tokio::test]
    async fn test_promote_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let params = write_tiny_database(dir.path());
        let state = initialized_state(dir.path(), params).await;

        let err = promote_upload(
            State(state.clone()),
            Json(PromoteUploadRequest {
                upload_id: "upload-1".to_string(),
                file_name: "../escape".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFileName(_)));
    }

    #[tokio::test]
    async fn test_promote_missing_upload_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let params = write_tiny_database(dir.path());
        let state = initialized_state(dir.path(), params).await;

        let err = promote_upload(
            State(state.clone()),
            Json(PromoteUploadRequest {
                upload_id: "nope".to_string(),
                file_name: "pqcode_0.ui8vecs".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::UploadNotFound(_)));
    }
}
