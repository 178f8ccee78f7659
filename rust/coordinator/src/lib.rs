//! The global node: owns the cluster-to-node table, the popularity counters
//! and the in-process index that serves the hot-cluster cache, and drives
//! the query-node fleet.

mod balance;
mod client;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{try_join, try_join_all};
use parking_lot::RwLock;
use rayon::prelude::*;
use thiserror::Error;
use waggle_config::{ConfigError, QueryNodeEndpoint, RootConfig};
use waggle_error::{ErrorCodes, WaggleError};
use waggle_index::{partial_sort_by_distance, IndexError, IvfPqIndex};
use waggle_storage::{segment_file_name, StorageError};
use waggle_types::{
    Assignment, BalanceMode, ClusterId, HistoryScore, InitIndexRequest, IvfPqParams, Neighbor,
    PromoteUploadRequest, RunQueriesRequest, VectorId,
};

pub use balance::{plan_assignment, BalancePlan};
pub use client::{ClientError, NodeClient};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no query nodes configured")]
    NoQueryNodes,
    #[error("posting list sizes are not loaded; call load_posting_list_sizes first")]
    SizesNotLoaded,
    #[error("cluster {0} is probed but unassigned; run load_balance first")]
    ClusterUnassigned(ClusterId),
    #[error("cluster {cluster} out of range for {kc} clusters")]
    ClusterOutOfRange { cluster: ClusterId, kc: usize },
    #[error("query node {index} out of range for {nodes} nodes")]
    NodeOutOfRange { index: usize, nodes: usize },
    #[error("vector file has dimension {actual}, expected {expected}")]
    VectorFileDimension { expected: usize, actual: usize },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WaggleError for CoordinatorError {
    fn code(&self) -> ErrorCodes {
        match self {
            CoordinatorError::Config(err) => err.code(),
            CoordinatorError::Index(err) => err.code(),
            CoordinatorError::Storage(err) => err.code(),
            CoordinatorError::Client(err) => err.code(),
            CoordinatorError::NoQueryNodes => ErrorCodes::FailedPrecondition,
            CoordinatorError::SizesNotLoaded => ErrorCodes::FailedPrecondition,
            CoordinatorError::ClusterUnassigned(_) => ErrorCodes::FailedPrecondition,
            CoordinatorError::ClusterOutOfRange { .. } => ErrorCodes::OutOfRange,
            CoordinatorError::NodeOutOfRange { .. } => ErrorCodes::OutOfRange,
            CoordinatorError::VectorFileDimension { .. } => ErrorCodes::InvalidArgument,
            CoordinatorError::Join(_) => ErrorCodes::Internal,
        }
    }
}

pub struct Coordinator {
    params: IvfPqParams,
    index_path: PathBuf,
    db_path: PathBuf,
    /// Serves the coarse probe and the global cache. Holds codebooks after
    /// `init` and only the pinned clusters' segments after a balance.
    index: Arc<RwLock<IvfPqIndex>>,
    clients: Vec<NodeClient>,
    querybook: Vec<Assignment>,
    // Written concurrently by the scatter phase; relaxed ordering is enough
    // for a monotonic hint read at the next balance.
    popularity: Vec<AtomicU64>,
    posting_list_sizes: Vec<u64>,
    global_caches: usize,
}

impl Coordinator {
    pub fn from_config(config: &RootConfig) -> Result<Self, CoordinatorError> {
        Coordinator::with_endpoints(
            config.params(),
            Path::new(&config.data.index_path),
            Path::new(&config.data.db_path),
            config.querynode.endpoints()?,
            config.task.global_caches,
        )
    }

    pub fn with_endpoints(
        params: IvfPqParams,
        index_path: &Path,
        db_path: &Path,
        endpoints: Vec<QueryNodeEndpoint>,
        global_caches: usize,
    ) -> Result<Self, CoordinatorError> {
        let index = IvfPqIndex::new(params)?;
        tracing::info!("coordinator configured with {} query nodes", endpoints.len());
        Ok(Coordinator {
            index: Arc::new(RwLock::new(index)),
            clients: endpoints.into_iter().map(NodeClient::new).collect(),
            querybook: vec![Assignment::Unassigned; params.kc],
            popularity: (0..params.kc).map(|_| AtomicU64::new(0)).collect(),
            posting_list_sizes: Vec::new(),
            global_caches,
            index_path: index_path.to_path_buf(),
            db_path: db_path.to_path_buf(),
            params,
        })
    }

    pub fn params(&self) -> &IvfPqParams {
        &self.params
    }

    pub fn querybook(&self) -> &[Assignment] {
        &self.querybook
    }

    pub fn popularity_snapshot(&self) -> Vec<HistoryScore> {
        self.popularity
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .collect()
    }

    pub fn set_global_caches(&mut self, caches: usize) {
        self.global_caches = caches;
        tracing::info!("global cache size set to {}", caches);
    }

    /// Initializes every query node (index object, then codebooks) while the
    /// local cache index loads its own codebooks; all in parallel.
    pub async fn init(&self) -> Result<(), CoordinatorError> {
        let request = InitIndexRequest {
            params: self.params,
            index_path: self.index_path.display().to_string(),
            db_path: self.db_path.display().to_string(),
        };

        let local = {
            let index = Arc::clone(&self.index);
            let index_path = self.index_path.clone();
            async move {
                tokio::task::spawn_blocking(move || index.write().load_codebooks(&index_path))
                    .await?
                    .map_err(CoordinatorError::from)
            }
        };
        let remote = try_join_all(self.clients.iter().map(|client| {
            let request = &request;
            async move {
                client.init_index(request).await?;
                client.load_codebook().await?;
                tracing::info!("{} initialized", client.endpoint());
                Ok::<(), CoordinatorError>(())
            }
        }));
        try_join(local, remote).await?;
        Ok(())
    }

    /// Reads the authoritative posting-list length vector; required before
    /// the first balance.
    pub fn load_posting_list_sizes(&mut self) -> Result<(), CoordinatorError> {
        self.posting_list_sizes =
            waggle_index::load_posting_list_sizes(&self.db_path, self.params.kc)?;
        tracing::info!("posting list sizes loaded");
        Ok(())
    }

    pub fn clear_history(&self) {
        for p in &self.popularity {
            p.store(0, Ordering::Relaxed);
        }
        tracing::info!("popularity history cleared");
    }

    /// Computes and records the next assignment without touching any node.
    ///
    /// Normal mode also seeds every cluster's popularity by one, so a
    /// popularity-weighted rebalance after a first Normal round starts from
    /// a uniform prior instead of an all-zero weight vector.
    pub fn plan_balance(&mut self, mode: BalanceMode) -> Result<BalancePlan, CoordinatorError> {
        if self.clients.is_empty() {
            return Err(CoordinatorError::NoQueryNodes);
        }
        if self.posting_list_sizes.is_empty() {
            return Err(CoordinatorError::SizesNotLoaded);
        }

        let popularity = self.popularity_snapshot();
        let plan = plan_assignment(
            mode,
            self.clients.len(),
            &self.posting_list_sizes,
            &popularity,
            self.global_caches,
        );
        if mode == BalanceMode::Normal {
            for p in &self.popularity {
                p.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.querybook = plan.querybook.clone();
        Ok(plan)
    }

    /// Full balance round: plan, then materialize every node's book and the
    /// global cache concurrently.
    pub async fn load_balance(&mut self, mode: BalanceMode) -> Result<(), CoordinatorError> {
        tracing::info!("load balance start ({:?})", mode);
        let plan = self.plan_balance(mode)?;

        let local = {
            let index = Arc::clone(&self.index);
            let db_path = self.db_path.clone();
            let book = plan.global_book.clone();
            async move {
                let count = book.len();
                tokio::task::spawn_blocking(move || index.write().load_from_book(&book, &db_path))
                    .await??;
                tracing::info!("{} segments loaded into the global cache", count);
                Ok::<(), CoordinatorError>(())
            }
        };
        let remote = try_join_all(self.clients.iter().zip(&plan.books).map(
            |(client, book)| async move {
                client.load_segments(book).await?;
                tracing::info!("{} segments loaded into {}", book.len(), client.endpoint());
                Ok::<(), CoordinatorError>(())
            },
        ));
        try_join(local, remote).await?;
        tracing::info!("load balance end");
        Ok(())
    }

    /// Routes each probed cluster to its owner and bumps its popularity.
    fn scatter(
        &self,
        probe_lists: &[Vec<ClusterId>],
    ) -> Result<(Vec<Vec<Vec<ClusterId>>>, Vec<Vec<ClusterId>>), CoordinatorError> {
        let nq = probe_lists.len();
        let mut per_node = vec![vec![Vec::new(); nq]; self.clients.len()];
        let mut global = vec![Vec::new(); nq];
        for (q, probe) in probe_lists.iter().enumerate() {
            for &cluster in probe {
                let assignment = self.querybook.get(cluster as usize).copied().ok_or(
                    CoordinatorError::ClusterOutOfRange {
                        cluster,
                        kc: self.params.kc,
                    },
                )?;
                match assignment {
                    Assignment::GlobalCache => global[q].push(cluster),
                    Assignment::Node(node) => per_node[node as usize][q].push(cluster),
                    Assignment::Unassigned => {
                        return Err(CoordinatorError::ClusterUnassigned(cluster))
                    }
                }
                self.popularity[cluster as usize].fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok((per_node, global))
    }

    /// Answers a query batch: local coarse probe, scatter by querybook,
    /// parallel fan-out to the nodes and the cache, then a per-query merge.
    /// Either every shard succeeds or the whole call fails.
    pub async fn run_queries(
        &self,
        k: usize,
        w: usize,
        queries: Vec<Vec<f32>>,
    ) -> Result<Vec<Vec<Neighbor>>, CoordinatorError> {
        let nq = queries.len();
        let queries = Arc::new(queries);

        let probe_lists = {
            let index = Arc::clone(&self.index);
            let queries = Arc::clone(&queries);
            tokio::task::spawn_blocking(move || index.read().top_w_ids(w, &queries)).await??
        };
        let (per_node, probe_global) = self.scatter(&probe_lists)?;

        let local = {
            let index = Arc::clone(&self.index);
            let queries = Arc::clone(&queries);
            async move {
                let started = Instant::now();
                let result = tokio::task::spawn_blocking(move || {
                    index.read().top_k_ids(k, &queries, &probe_global)
                })
                .await??;
                tracing::info!("global cache scan took {:?}", started.elapsed());
                Ok::<_, CoordinatorError>(result)
            }
        };
        let remote = try_join_all(self.clients.iter().zip(per_node).map(|(client, probes)| {
            let request = RunQueriesRequest {
                k,
                queries: (*queries).clone(),
                probes,
            };
            async move {
                let started = Instant::now();
                let response = client.run_queries(&request).await?;
                tracing::info!("{} answered in {:?}", client.endpoint(), started.elapsed());
                Ok::<_, CoordinatorError>((response.ids, response.dists))
            }
        }));
        let ((local_ids, local_dists), remote_results) = try_join(local, remote).await?;

        let mut scores: Vec<Vec<(VectorId, f32)>> = vec![Vec::new(); nq];
        for (ids, dists) in remote_results
            .into_iter()
            .chain(std::iter::once((local_ids, local_dists)))
        {
            for (q, (q_ids, q_dists)) in ids.into_iter().zip(dists).enumerate() {
                scores[q].extend(q_ids.into_iter().zip(q_dists));
            }
        }

        let merged = tokio::task::spawn_blocking(move || {
            scores
                .into_par_iter()
                .map(|mut pairs| {
                    partial_sort_by_distance(&mut pairs, k);
                    pairs
                        .into_iter()
                        .map(|(id, distance)| Neighbor { id, distance })
                        .collect()
                })
                .collect::<Vec<Vec<Neighbor>>>()
        })
        .await?;
        Ok(merged)
    }

    /// Pushes one segment file to a node and promotes it to its canonical
    /// name under the node's database path.
    pub async fn upload_segment_file(
        &self,
        node_index: usize,
        cluster: ClusterId,
    ) -> Result<(), CoordinatorError> {
        let client = self
            .clients
            .get(node_index)
            .ok_or(CoordinatorError::NodeOutOfRange {
                index: node_index,
                nodes: self.clients.len(),
            })?;
        if cluster as usize >= self.params.kc {
            return Err(CoordinatorError::ClusterOutOfRange {
                cluster,
                kc: self.params.kc,
            });
        }

        let file_name = segment_file_name(cluster);
        let upload_id = uuid::Uuid::new_v4().to_string();
        client
            .upload_segment(&upload_id, &self.db_path.join(&file_name))
            .await?;
        client
            .promote_upload(&PromoteUploadRequest {
                upload_id,
                file_name,
            })
            .await?;
        Ok(())
    }
}
