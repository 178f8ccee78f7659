use serde::{Deserialize, Serialize};
use thiserror::Error;
use waggle_error::{ErrorCodes, WaggleError};

use crate::{MAX_CLUSTER_NUM, PQ_CENTROIDS};

/// Shape of an IVFPQ index, fixed for the lifetime of the index.
///
/// `n` is the database size, `d` the vector dimensionality and `l` a
/// candidate-count hint used to presize scan buffers. The coarse quantizer
/// always has a single subspace covering the full vector (`mc = 1`,
/// `dc = d`); the product quantizer splits the vector into `mp` subspaces of
/// `dp = d / mp` dimensions with `kp = 256` centroids each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfPqParams {
    pub n: usize,
    pub d: usize,
    pub l: usize,
    pub kc: usize,
    pub kp: usize,
    pub mc: usize,
    pub mp: usize,
    pub dc: usize,
    pub dp: usize,
}

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("cluster count {0} exceeds the maximum of {MAX_CLUSTER_NUM}")]
    TooManyClusters(usize),
    #[error("dimension {d} is not divisible by the {mp} product subspaces")]
    IndivisibleDimension { d: usize, mp: usize },
    #[error("product codebook size must be {PQ_CENTROIDS}, got {0}")]
    ProductCodebookSize(usize),
    #[error("coarse quantizer must cover the full vector (mc = 1, dc = d)")]
    CoarseShape,
    #[error("product subspace dimension must be d / mp, got {0}")]
    ProductSubDimension(usize),
    #[error("parameter {0} must be non-zero")]
    Zero(&'static str),
}

impl WaggleError for ParamsError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

impl IvfPqParams {
    /// Derives the full parameter set from the dataset-level knobs.
    pub fn from_dataset(n: usize, d: usize, mp: usize, kc: usize) -> Self {
        IvfPqParams {
            n,
            d,
            l: n,
            kc,
            kp: PQ_CENTROIDS,
            mc: 1,
            mp,
            dc: d,
            dp: if mp == 0 { 0 } else { d / mp },
        }
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        for (name, value) in [
            ("d", self.d),
            ("kc", self.kc),
            ("mp", self.mp),
        ] {
            if value == 0 {
                return Err(ParamsError::Zero(name));
            }
        }
        if self.kc > MAX_CLUSTER_NUM {
            return Err(ParamsError::TooManyClusters(self.kc));
        }
        if self.kp != PQ_CENTROIDS {
            return Err(ParamsError::ProductCodebookSize(self.kp));
        }
        if self.mc != 1 || self.dc != self.d {
            return Err(ParamsError::CoarseShape);
        }
        if self.d % self.mp != 0 {
            return Err(ParamsError::IndivisibleDimension {
                d: self.d,
                mp: self.mp,
            });
        }
        if self.dp != self.d / self.mp {
            return Err(ParamsError::ProductSubDimension(self.dp));
        }
        Ok(())
    }
}

/// Policy the coordinator uses to spread clusters across query nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    #[default]
    Normal,
    BestFitSize,
    BestFitPop,
    BestFitHybrid,
}
