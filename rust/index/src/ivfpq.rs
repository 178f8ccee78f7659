use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;
use waggle_distance::l2_sqr;
use waggle_error::{ErrorCodes, WaggleError};
use waggle_storage::{
    posting_list_file_name, read_vecs, segment_file_name, write_vecs, StorageError,
    COARSE_CODEBOOK_FILE, POSTING_LIST_LENS_FILE, PRODUCT_CODEBOOK_FILE,
};
use waggle_types::{ClusterId, IvfPqParams, ParamsError, VectorId};

use crate::quantizer::{Quantizer, QuantizerError};
use crate::utils::partial_sort_by_distance;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Quantizer(#[from] QuantizerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("index is not trained")]
    NotTrained,
    #[error("query has {actual} dimensions, expected {d}")]
    QueryDimension { d: usize, actual: usize },
    #[error("database holds {actual} vectors, expected {n}")]
    DatabaseSize { n: usize, actual: usize },
    #[error("cluster {cluster} out of range for {kc} clusters")]
    ClusterOutOfRange { cluster: ClusterId, kc: usize },
    #[error("got {probes} probe lists for {queries} queries")]
    ProbeCount { queries: usize, probes: usize },
    #[error("cluster {cluster}: segment holds {codes} code bytes for {ids} posting entries of {mp} codes each")]
    SegmentCorrupt {
        cluster: ClusterId,
        codes: usize,
        ids: usize,
        mp: usize,
    },
    #[error("posting list sizes file holds {actual} entries, expected {kc}")]
    PostingListSizes { actual: usize, kc: usize },
}

impl WaggleError for IndexError {
    fn code(&self) -> ErrorCodes {
        match self {
            IndexError::Params(err) => err.code(),
            IndexError::Quantizer(err) => err.code(),
            IndexError::Storage(err) => err.code(),
            IndexError::NotTrained => ErrorCodes::FailedPrecondition,
            IndexError::QueryDimension { .. } => ErrorCodes::InvalidArgument,
            IndexError::DatabaseSize { .. } => ErrorCodes::InvalidArgument,
            IndexError::ClusterOutOfRange { .. } => ErrorCodes::OutOfRange,
            IndexError::ProbeCount { .. } => ErrorCodes::InvalidArgument,
            IndexError::SegmentCorrupt { .. } => ErrorCodes::DataLoss,
            IndexError::PostingListSizes { .. } => ErrorCodes::DataLoss,
        }
    }
}

/// Per-query lookup table of `mp x kp` precomputed subspace distances.
pub struct DistanceTable {
    kp: usize,
    data: Vec<f32>,
}

impl DistanceTable {
    fn new(mp: usize, kp: usize) -> Self {
        DistanceTable {
            kp,
            data: vec![0.0; mp * kp],
        }
    }

    #[inline]
    fn set(&mut self, m: usize, ks: usize, value: f32) {
        self.data[m * self.kp + ks] = value;
    }

    #[inline]
    pub fn get(&self, m: usize, ks: usize) -> f32 {
        self.data[m * self.kp + ks]
    }
}

/// Inverted-file index with product quantization.
///
/// Posting lists and segments are parallel arrays: the vector at position
/// `i` of cluster `c` has id `posting_lists[c][i]` and occupies code bytes
/// `[i * mp, (i + 1) * mp)` of `segments[c]`. Everything is immutable
/// between `load_from_book` calls.
pub struct IvfPqIndex {
    params: IvfPqParams,
    coarse: Quantizer,
    product: Quantizer,
    posting_lists: Vec<Vec<VectorId>>,
    segments: Vec<Vec<u8>>,
}

impl IvfPqIndex {
    pub fn new(params: IvfPqParams) -> Result<Self, IndexError> {
        params.validate()?;
        Ok(IvfPqIndex {
            coarse: Quantizer::new(params.d, params.mc, params.kc)?,
            product: Quantizer::new(params.d, params.mp, params.kp)?,
            posting_lists: vec![Vec::new(); params.kc],
            segments: vec![Vec::new(); params.kc],
            params,
        })
    }

    pub fn params(&self) -> &IvfPqParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.coarse.is_trained() && self.product.is_trained()
    }

    /// Installs externally trained codebooks instead of running `train`.
    pub fn set_codebooks(
        &mut self,
        coarse: Vec<Vec<Vec<f32>>>,
        product: Vec<Vec<Vec<f32>>>,
    ) -> Result<(), IndexError> {
        self.coarse.set_centroids(coarse)?;
        self.product.set_centroids(product)?;
        Ok(())
    }

    /// Trains both quantizers on a sample of `data` drawn without
    /// replacement. `nsamples = 0` uses the whole input.
    pub fn train(&mut self, data: &[f32], seed: u64, nsamples: usize) -> Result<(), IndexError> {
        let d = self.params.d;
        if data.len() % d != 0 {
            return Err(QuantizerError::DataShape {
                d,
                len: data.len(),
            }
            .into());
        }
        let available = data.len() / d;
        let nsamples = if nsamples == 0 {
            available
        } else {
            nsamples.min(available)
        };

        let mut ids: Vec<usize> = (0..available).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);

        let mut train_data = Vec::with_capacity(nsamples * d);
        for &id in &ids[..nsamples] {
            train_data.extend_from_slice(&data[id * d..(id + 1) * d]);
        }
        tracing::info!("training index with {} samples", nsamples);

        self.coarse.fit(&train_data, 12, seed)?;
        self.product.fit(&train_data, 6, seed)?;
        Ok(())
    }

    /// Builds posting lists and segments from the raw database.
    ///
    /// Phase one assigns vectors to clusters in parallel, appending under a
    /// per-cluster lock; phase two walks each posting list in order and
    /// gathers the precomputed PQ codes, which is what keeps the two arrays
    /// parallel.
    pub fn populate(&mut self, data: &[f32]) -> Result<(), IndexError> {
        if !self.is_trained() {
            return Err(IndexError::NotTrained);
        }
        let (n, d, kc, mp) = (self.params.n, self.params.d, self.params.kc, self.params.mp);
        if data.len() != n * d {
            return Err(IndexError::DatabaseSize {
                n,
                actual: data.len() / d,
            });
        }

        // One pass of PQ encoding for the whole database; re-encoding per
        // cluster would multiply the work by kc.
        let codes = self.product.encode(data)?;

        let reserve = n / kc + 1;
        let lists: Vec<Mutex<Vec<VectorId>>> = (0..kc)
            .map(|_| Mutex::new(Vec::with_capacity(reserve)))
            .collect();
        let coarse = &self.coarse;
        (0..n).into_par_iter().for_each(|i| {
            let cluster = coarse.assign_one(&data[i * d..(i + 1) * d], 0) as usize;
            lists[cluster].lock().push(i as VectorId);
        });
        self.posting_lists = lists.into_iter().map(|list| list.into_inner()).collect();

        self.segments = self
            .posting_lists
            .par_iter()
            .map(|list| {
                let mut segment = Vec::with_capacity(list.len() * mp);
                for &id in list {
                    for sub_codes in &codes {
                        segment.push(sub_codes[id as usize]);
                    }
                }
                segment
            })
            .collect();

        tracing::info!("{} vectors inserted into {} clusters", n, kc);
        Ok(())
    }

    pub fn write_codebooks(&self, index_path: &Path) -> Result<(), IndexError> {
        self.coarse
            .write_centroids(index_path.join(COARSE_CODEBOOK_FILE))?;
        self.product
            .write_centroids(index_path.join(PRODUCT_CODEBOOK_FILE))?;
        Ok(())
    }

    pub fn load_codebooks(&mut self, index_path: &Path) -> Result<(), IndexError> {
        self.coarse
            .load_centroids(index_path.join(COARSE_CODEBOOK_FILE))?;
        self.product
            .load_centroids(index_path.join(PRODUCT_CODEBOOK_FILE))?;
        tracing::info!("codebooks loaded from {}", index_path.display());
        Ok(())
    }

    /// Persists every cluster's segment and posting list plus the
    /// posting-list length vector the coordinator balances with.
    pub fn write_database(&self, db_path: &Path) -> Result<(), IndexError> {
        let (kc, mp) = (self.params.kc, self.params.mp);
        let mut lens = Vec::with_capacity(kc);
        for c in 0..kc {
            let list = &self.posting_lists[c];
            write_vecs(
                db_path.join(segment_file_name(c as ClusterId)),
                &self.segments[c],
                list.len(),
                mp,
            )?;
            write_vecs(
                db_path.join(posting_list_file_name(c as ClusterId)),
                list,
                1,
                list.len(),
            )?;
            lens.push(list.len() as u64);
        }
        write_vecs(db_path.join(POSTING_LIST_LENS_FILE), &lens, 1, kc)?;
        Ok(())
    }

    /// Materializes exactly the clusters in `book`: residents not listed are
    /// freed, listed clusters already resident are kept, the rest are read
    /// from disk.
    pub fn load_from_book(&mut self, book: &[ClusterId], db_path: &Path) -> Result<(), IndexError> {
        let (kc, mp) = (self.params.kc, self.params.mp);
        for &cluster in book {
            if cluster as usize >= kc {
                return Err(IndexError::ClusterOutOfRange { cluster, kc });
            }
        }

        let wanted: HashSet<ClusterId> = book.iter().copied().collect();
        for c in 0..kc {
            if !wanted.contains(&(c as ClusterId)) && !self.posting_lists[c].is_empty() {
                self.posting_lists[c] = Vec::new();
                self.segments[c] = Vec::new();
            }
        }

        let mut loaded = 0usize;
        let mut seen = HashSet::new();
        for &cluster in book {
            if !seen.insert(cluster) {
                continue;
            }
            let c = cluster as usize;
            if !self.posting_lists[c].is_empty() {
                continue;
            }
            let ids = read_vecs::<u32>(db_path.join(posting_list_file_name(cluster)))?;
            let codes = read_vecs::<u8>(db_path.join(segment_file_name(cluster)))?;
            if codes.data.len() != ids.data.len() * mp || (codes.records > 0 && codes.dim != mp) {
                return Err(IndexError::SegmentCorrupt {
                    cluster,
                    codes: codes.data.len(),
                    ids: ids.data.len(),
                    mp,
                });
            }
            self.posting_lists[c] = ids.data;
            self.segments[c] = codes.data;
            loaded += 1;
        }
        tracing::debug!("{} clusters read, {} requested", loaded, wanted.len());
        Ok(())
    }

    /// Clusters currently holding at least one vector.
    pub fn resident_clusters(&self) -> Vec<ClusterId> {
        (0..self.params.kc)
            .filter(|&c| !self.posting_lists[c].is_empty())
            .map(|c| c as ClusterId)
            .collect()
    }

    pub fn posting_list_sizes(&self) -> Vec<u64> {
        self.posting_lists
            .iter()
            .map(|list| list.len() as u64)
            .collect()
    }

    /// Top-`w` coarse clusters per query by centroid distance, ascending.
    /// `w` is clamped to `kc`; `w = 0` yields empty probe lists.
    pub fn top_w_ids(
        &self,
        w: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<Vec<ClusterId>>, IndexError> {
        if !self.coarse.is_trained() {
            return Err(IndexError::NotTrained);
        }
        self.check_query_dims(queries)?;

        let kc = self.params.kc;
        let w = w.min(kc);
        let coarse = &self.coarse;
        Ok(queries
            .par_iter()
            .map(|query| {
                let mut scores: Vec<(ClusterId, f32)> = (0..kc)
                    .map(|c| (c as ClusterId, l2_sqr(query, coarse.centroid(0, c))))
                    .collect();
                partial_sort_by_distance(&mut scores, w);
                scores.into_iter().map(|(c, _)| c).collect()
            })
            .collect())
    }

    /// Top-`k` asymmetric scan of each query's probe list, restricted to
    /// resident clusters. Returns parallel id and distance vectors, each at
    /// most `k` long and sorted by ascending distance.
    pub fn top_k_ids(
        &self,
        k: usize,
        queries: &[Vec<f32>],
        probes: &[Vec<ClusterId>],
    ) -> Result<(Vec<Vec<VectorId>>, Vec<Vec<f32>>), IndexError> {
        if !self.is_trained() {
            return Err(IndexError::NotTrained);
        }
        self.check_query_dims(queries)?;
        if probes.len() != queries.len() {
            return Err(IndexError::ProbeCount {
                queries: queries.len(),
                probes: probes.len(),
            });
        }
        let kc = self.params.kc;
        for probe in probes {
            for &cluster in probe {
                if cluster as usize >= kc {
                    return Err(IndexError::ClusterOutOfRange { cluster, kc });
                }
            }
        }

        let searched_clusters = AtomicUsize::new(0);
        let searched_vectors = AtomicUsize::new(0);
        let per_query: Vec<Vec<(VectorId, f32)>> = queries
            .par_iter()
            .zip(probes.par_iter())
            .map(|(query, probe)| {
                let table = self.distance_table(query);
                let mut scores = Vec::new();
                for &cluster in probe {
                    let c = cluster as usize;
                    let list = &self.posting_lists[c];
                    searched_clusters.fetch_add(1, Ordering::Relaxed);
                    searched_vectors.fetch_add(list.len(), Ordering::Relaxed);
                    for (offset, &id) in list.iter().enumerate() {
                        scores.push((id, self.asym_distance(&table, c, offset)));
                    }
                }
                partial_sort_by_distance(&mut scores, k);
                scores
            })
            .collect();
        tracing::debug!(
            "scanned {} vectors across {} cluster probes",
            searched_vectors.load(Ordering::Relaxed),
            searched_clusters.load(Ordering::Relaxed),
        );

        let mut ids = Vec::with_capacity(per_query.len());
        let mut dists = Vec::with_capacity(per_query.len());
        for scores in per_query {
            let (q_ids, q_dists) = scores.into_iter().unzip();
            ids.push(q_ids);
            dists.push(q_dists);
        }
        Ok((ids, dists))
    }

    /// Precomputes the query's distance to every product centroid.
    pub fn distance_table(&self, query: &[f32]) -> DistanceTable {
        let (mp, kp, dp) = (self.params.mp, self.params.kp, self.params.dp);
        let mut table = DistanceTable::new(mp, kp);
        for m in 0..mp {
            let sub = &query[m * dp..(m + 1) * dp];
            for ks in 0..kp {
                table.set(m, ks, l2_sqr(sub, self.product.centroid(m, ks)));
            }
        }
        table
    }

    // Inner loop of the whole system; unrolled by eight table lookups.
    #[inline]
    fn asym_distance(&self, table: &DistanceTable, cluster: usize, offset: usize) -> f32 {
        let mp = self.params.mp;
        let code = &self.segments[cluster][offset * mp..(offset + 1) * mp];
        let mut dist = 0.0f32;
        let mut m = 0;
        while m + 8 <= mp {
            dist += table.get(m, code[m] as usize)
                + table.get(m + 1, code[m + 1] as usize)
                + table.get(m + 2, code[m + 2] as usize)
                + table.get(m + 3, code[m + 3] as usize)
                + table.get(m + 4, code[m + 4] as usize)
                + table.get(m + 5, code[m + 5] as usize)
                + table.get(m + 6, code[m + 6] as usize)
                + table.get(m + 7, code[m + 7] as usize);
            m += 8;
        }
        while m < mp {
            dist += table.get(m, code[m] as usize);
            m += 1;
        }
        dist
    }

    fn check_query_dims(&self, queries: &[Vec<f32>]) -> Result<(), IndexError> {
        for query in queries {
            if query.len() != self.params.d {
                return Err(IndexError::QueryDimension {
                    d: self.params.d,
                    actual: query.len(),
                });
            }
        }
        Ok(())
    }
}

/// Reads the coordinator-authoritative posting-list length vector.
pub fn load_posting_list_sizes(db_path: &Path, kc: usize) -> Result<Vec<u64>, IndexError> {
    let loaded = read_vecs::<u64>(db_path.join(POSTING_LIST_LENS_FILE))?;
    if loaded.data.len() != kc {
        return Err(IndexError::PostingListSizes {
            actual: loaded.data.len(),
            kc,
        });
    }
    Ok(loaded.data)
}
