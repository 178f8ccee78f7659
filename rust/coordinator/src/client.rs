use std::path::{Path, PathBuf};

use futures::StreamExt;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use waggle_config::QueryNodeEndpoint;
use waggle_error::{ErrorCodes, WaggleError};
use waggle_types::{
    ClusterId, ErrorResponse, InitIndexRequest, LoadSegmentsRequest, PromoteUploadRequest,
    RunQueriesRequest, RunQueriesResponse,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} rejected {op}: {message}")]
    Rejected {
        endpoint: String,
        op: &'static str,
        code: ErrorCodes,
        message: String,
    },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl WaggleError for ClientError {
    fn code(&self) -> ErrorCodes {
        match self {
            ClientError::Transport { .. } => ErrorCodes::Unavailable,
            ClientError::Rejected { code, .. } => *code,
            ClientError::Io { source, .. } => source.code(),
        }
    }
}

/// Blocking-style HTTP client for one query node. Calls carry no timeout:
/// a query either completes or fails hard with a transport error, and the
/// coordinator treats either as terminal for the in-flight operation.
pub struct NodeClient {
    endpoint: QueryNodeEndpoint,
    base_url: String,
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new(endpoint: QueryNodeEndpoint) -> Self {
        let base_url = endpoint.base_url();
        NodeClient {
            endpoint,
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &QueryNodeEndpoint {
        &self.endpoint
    }

    fn transport(&self, source: reqwest::Error) -> ClientError {
        ClientError::Transport {
            endpoint: self.endpoint.to_string(),
            source,
        }
    }

    async fn check(
        &self,
        op: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => status.to_string(),
        };
        Err(ClientError::Rejected {
            endpoint: self.endpoint.to_string(),
            op,
            code: status.into(),
            message,
        })
    }

    pub async fn init_index(&self, request: &InitIndexRequest) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/index/init", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("indexInit", response).await?;
        Ok(())
    }

    pub async fn load_codebook(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/index/codebook", self.base_url))
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("loadCodeBook", response).await?;
        Ok(())
    }

    pub async fn load_segments(&self, clusters: &[ClusterId]) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/index/segments", self.base_url))
            .json(&LoadSegmentsRequest {
                clusters: clusters.to_vec(),
            })
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("loadSegments", response).await?;
        Ok(())
    }

    pub async fn run_queries(
        &self,
        request: &RunQueriesRequest,
    ) -> Result<RunQueriesResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/queries", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("runQueries", response)
            .await?
            .json()
            .await
            .map_err(|err| self.transport(err))
    }

    /// Streams a file to the node's staging area, logging decile progress.
    pub async fn upload_segment(&self, upload_id: &str, path: &Path) -> Result<(), ClientError> {
        let io_err = |source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let total = file.metadata().await.map_err(io_err)?.len();

        let endpoint = self.endpoint.to_string();
        let mut sent = 0u64;
        let mut next_decile = 1u64;
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                sent += bytes.len() as u64;
                if total > 0 {
                    let percent = sent * 100 / total;
                    while next_decile * 10 <= percent {
                        tracing::info!("upload segment to [{}] {}%", endpoint, next_decile * 10);
                        next_decile += 1;
                    }
                }
            }
        });

        let response = self
            .http
            .put(format!("{}/api/v1/uploads/{}", self.base_url, upload_id))
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("uploadSegment", response).await?;
        Ok(())
    }

    pub async fn promote_upload(&self, request: &PromoteUploadRequest) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/uploads/promote", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        self.check("addFile", response).await?;
        Ok(())
    }
}
