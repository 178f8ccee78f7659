use serde::{Deserialize, Serialize};

/// Identifier of a vector in the original database, stable across clustering.
pub type VectorId = u32;
/// Index of a coarse cluster, in `[0, kc)`.
pub type ClusterId = u32;
/// One product-quantization code byte.
pub type PqCode = u8;
/// Asymmetric query-to-code distance.
pub type AsymDist = f32;
/// Accumulated probe count of a cluster.
pub type HistoryScore = u64;

pub const MAX_CLUSTER_NUM: usize = 10_000;
pub const MAX_QUERYNODE_NUM: usize = 100;
/// Product codebooks always hold 256 centroids so a code fits in one byte.
pub const PQ_CENTROIDS: usize = 256;

/// Placement of a cluster after a balance round.
///
/// Replaces the reserved numeric node ids of the wire protocol: a cluster is
/// either unassigned, owned by a remote query node, or pinned to the
/// coordinator's in-process cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    Unassigned,
    Node(u8),
    GlobalCache,
}

impl Assignment {
    pub fn is_unassigned(&self) -> bool {
        matches!(self, Assignment::Unassigned)
    }

    pub fn node_index(&self) -> Option<usize> {
        match self {
            Assignment::Node(i) => Some(*i as usize),
            _ => None,
        }
    }
}
