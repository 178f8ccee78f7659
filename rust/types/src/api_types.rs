use serde::{Deserialize, Serialize};

use crate::{AsymDist, ClusterId, IvfPqParams, VectorId};

/// One search hit: a database vector id and its asymmetric distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: VectorId,
    pub distance: AsymDist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitIndexRequest {
    pub params: IvfPqParams,
    pub index_path: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSegmentsRequest {
    pub clusters: Vec<ClusterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueriesRequest {
    pub k: usize,
    pub queries: Vec<Vec<f32>>,
    /// Per-query clusters to scan; every listed cluster must be resident on
    /// the receiving node.
    pub probes: Vec<Vec<ClusterId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueriesResponse {
    pub ids: Vec<Vec<VectorId>>,
    pub dists: Vec<Vec<AsymDist>>,
}

/// Promotes a staged upload to its canonical segment filename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteUploadRequest {
    pub upload_id: String,
    pub file_name: String,
}

/// Body of every non-2xx service response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
