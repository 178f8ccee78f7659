use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use thiserror::Error;
use waggle_distance::l2_sqr;
use waggle_error::{ErrorCodes, WaggleError};
use waggle_storage::{read_vecs, write_vecs, StorageError};

#[derive(Error, Debug)]
pub enum QuantizerError {
    #[error("dimension {d} is not divisible by {m} subspaces")]
    IndivisibleDimension { d: usize, m: usize },
    #[error("quantizer must have at least one subspace and one centroid")]
    EmptyShape,
    #[error("codebook with {0} centroids cannot emit single-byte codes")]
    CodeOverflow(usize),
    #[error("data length {len} is not a multiple of dimension {d}")]
    DataShape { d: usize, len: usize },
    #[error("cannot fit {k} centroids on {actual} vectors")]
    NotEnoughVectors { k: usize, actual: usize },
    #[error("centroid table has the wrong shape for a {m}x{k}x{ds} quantizer")]
    CentroidShape { m: usize, k: usize, ds: usize },
    #[error("codebook file holds {records} records of {dim} floats, expected {expected_records} of {expected_dim}")]
    CodebookFileShape {
        records: usize,
        dim: usize,
        expected_records: usize,
        expected_dim: usize,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WaggleError for QuantizerError {
    fn code(&self) -> ErrorCodes {
        match self {
            QuantizerError::Storage(err) => err.code(),
            QuantizerError::CodebookFileShape { .. } => ErrorCodes::DataLoss,
            _ => ErrorCodes::InvalidArgument,
        }
    }
}

/// A bank of `m` codebooks over disjoint subspaces of a `d`-dimensional
/// vector, each holding `k` centroids of `d / m` floats.
///
/// The coarse quantizer of an IVFPQ index is the `m = 1` case (assignment
/// yields a cluster id); the product quantizer uses `m` subspaces with
/// `k = 256` so assignments fit in one byte.
#[derive(Debug, Clone)]
pub struct Quantizer {
    d: usize,
    m: usize,
    k: usize,
    ds: usize,
    // Shape m x k x ds once trained, empty before.
    centroids: Vec<Vec<Vec<f32>>>,
}

impl Quantizer {
    pub fn new(d: usize, m: usize, k: usize) -> Result<Self, QuantizerError> {
        if d == 0 || m == 0 || k == 0 {
            return Err(QuantizerError::EmptyShape);
        }
        if d % m != 0 {
            return Err(QuantizerError::IndivisibleDimension { d, m });
        }
        Ok(Quantizer {
            d,
            m,
            k,
            ds: d / m,
            centroids: Vec::new(),
        })
    }

    pub fn num_subspaces(&self) -> usize {
        self.m
    }

    pub fn num_centroids(&self) -> usize {
        self.k
    }

    pub fn sub_dimension(&self) -> usize {
        self.ds
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Centroid `ks` of subspace `m`. Must be trained.
    pub fn centroid(&self, m: usize, ks: usize) -> &[f32] {
        &self.centroids[m][ks]
    }

    /// Installs an externally trained centroid table.
    pub fn set_centroids(&mut self, centroids: Vec<Vec<Vec<f32>>>) -> Result<(), QuantizerError> {
        let shape_ok = centroids.len() == self.m
            && centroids
                .iter()
                .all(|sub| sub.len() == self.k && sub.iter().all(|c| c.len() == self.ds));
        if !shape_ok {
            return Err(QuantizerError::CentroidShape {
                m: self.m,
                k: self.k,
                ds: self.ds,
            });
        }
        self.centroids = centroids;
        Ok(())
    }

    /// Index of the nearest centroid of `subspace` to the matching slice of
    /// the full vector `x`. Ties go to the smallest index. Must be trained.
    #[inline]
    pub fn assign_one(&self, x: &[f32], subspace: usize) -> u32 {
        let sub = &x[subspace * self.ds..(subspace + 1) * self.ds];
        let mut best = 0u32;
        let mut best_dist = f32::INFINITY;
        for (ks, centroid) in self.centroids[subspace].iter().enumerate() {
            let dist = l2_sqr(sub, centroid);
            if dist < best_dist {
                best_dist = dist;
                best = ks as u32;
            }
        }
        best
    }

    /// Encodes `n` packed vectors into one byte stream per subspace
    /// (sub-quantizer-major: `codes[m][i]` is vector `i`'s code in
    /// subspace `m`).
    pub fn encode(&self, data: &[f32]) -> Result<Vec<Vec<u8>>, QuantizerError> {
        if self.k > 256 {
            return Err(QuantizerError::CodeOverflow(self.k));
        }
        if data.len() % self.d != 0 {
            return Err(QuantizerError::DataShape {
                d: self.d,
                len: data.len(),
            });
        }
        let n = data.len() / self.d;
        let codes = (0..self.m)
            .map(|m| {
                (0..n)
                    .into_par_iter()
                    .map(|i| self.assign_one(&data[i * self.d..(i + 1) * self.d], m) as u8)
                    .collect()
            })
            .collect();
        Ok(codes)
    }

    /// Trains every subspace codebook with Lloyd iterations over `data`.
    ///
    /// Initial centroids are sampled without replacement; a cluster that
    /// empties out is re-seeded from the point currently farthest from its
    /// assigned centroid.
    pub fn fit(&mut self, data: &[f32], iters: usize, seed: u64) -> Result<(), QuantizerError> {
        if data.len() % self.d != 0 {
            return Err(QuantizerError::DataShape {
                d: self.d,
                len: data.len(),
            });
        }
        let n = data.len() / self.d;
        if n < self.k {
            return Err(QuantizerError::NotEnoughVectors {
                k: self.k,
                actual: n,
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let subvector =
                |i: usize| &data[i * self.d + sub * self.ds..i * self.d + (sub + 1) * self.ds];

            let mut ids: Vec<usize> = (0..n).collect();
            ids.shuffle(&mut rng);
            let mut centers: Vec<Vec<f32>> =
                ids[..self.k].iter().map(|&i| subvector(i).to_vec()).collect();

            for _ in 0..iters {
                let assignments: Vec<(usize, f32)> = (0..n)
                    .into_par_iter()
                    .map(|i| nearest_center(subvector(i), &centers))
                    .collect();

                let mut sums = vec![vec![0.0f32; self.ds]; self.k];
                let mut counts = vec![0usize; self.k];
                for (i, &(ks, _)) in assignments.iter().enumerate() {
                    counts[ks] += 1;
                    for (acc, &value) in sums[ks].iter_mut().zip(subvector(i)) {
                        *acc += value;
                    }
                }
                for ks in 0..self.k {
                    if counts[ks] > 0 {
                        for (center, acc) in centers[ks].iter_mut().zip(&sums[ks]) {
                            *center = acc / counts[ks] as f32;
                        }
                    } else {
                        let farthest = assignments
                            .iter()
                            .enumerate()
                            .max_by(|(_, a), (_, b)| a.1.total_cmp(&b.1))
                            .map(|(i, _)| i)
                            .unwrap_or(0);
                        centers[ks] = subvector(farthest).to_vec();
                    }
                }
            }
            centroids.push(centers);
        }
        self.centroids = centroids;
        Ok(())
    }

    /// Writes the centroid table as `m * k` framed records of `ds` floats.
    pub fn write_centroids(&self, path: impl AsRef<Path>) -> Result<(), QuantizerError> {
        let mut flat = Vec::with_capacity(self.m * self.k * self.ds);
        for sub in &self.centroids {
            for center in sub {
                flat.extend_from_slice(center);
            }
        }
        write_vecs(path, &flat, self.m * self.k, self.ds)?;
        Ok(())
    }

    pub fn load_centroids(&mut self, path: impl AsRef<Path>) -> Result<(), QuantizerError> {
        let loaded = read_vecs::<f32>(path)?;
        if loaded.records != self.m * self.k || loaded.dim != self.ds {
            return Err(QuantizerError::CodebookFileShape {
                records: loaded.records,
                dim: loaded.dim,
                expected_records: self.m * self.k,
                expected_dim: self.ds,
            });
        }
        self.centroids = (0..self.m)
            .map(|m| {
                (0..self.k)
                    .map(|ks| {
                        let start = (m * self.k + ks) * self.ds;
                        loaded.data[start..start + self.ds].to_vec()
                    })
                    .collect()
            })
            .collect();
        Ok(())
    }
}

#[inline]
fn nearest_center(sub: &[f32], centers: &[Vec<f32>]) -> (usize, f32) {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (ks, center) in centers.iter().enumerate() {
        let dist = l2_sqr(sub, center);
        if dist < best_dist {
            best_dist = dist;
            best = ks;
        }
    }
    (best, best_dist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_indivisible() {
        assert!(matches!(
            Quantizer::new(10, 3, 4),
            Err(QuantizerError::IndivisibleDimension { d: 10, m: 3 })
        ));
    }

    #[test]
    fn test_assign_one_tie_breaks_to_smallest_index() {
        let mut q = Quantizer::new(2, 1, 3).unwrap();
        q.set_centroids(vec![vec![
            vec![1.0, 1.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ]])
        .unwrap();
        // Centroids 0 and 1 are identical; the smaller index wins.
        assert_eq!(q.assign_one(&[1.0, 1.0], 0), 0);
        assert_eq!(q.assign_one(&[0.1, 0.0], 0), 2);
    }

    #[test]
    fn test_encode_is_subspace_major() {
        let mut q = Quantizer::new(4, 2, 2).unwrap();
        q.set_centroids(vec![
            vec![vec![0.0, 0.0], vec![10.0, 10.0]],
            vec![vec![0.0, 0.0], vec![10.0, 10.0]],
        ])
        .unwrap();

        // Vector 0 is near centroid 0 in both subspaces, vector 1 near
        // centroid 1 in the first and centroid 0 in the second.
        let data = [0.1, 0.1, 0.2, 0.0, 9.0, 9.5, 1.0, 1.0];
        let codes = q.encode(&data).unwrap();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0], vec![0, 1]);
        assert_eq!(codes[1], vec![0, 0]);
    }

    #[test]
    fn test_encode_rejects_large_codebooks() {
        let q = Quantizer::new(4, 1, 300).unwrap();
        assert!(matches!(
            q.encode(&[0.0; 4]),
            Err(QuantizerError::CodeOverflow(300))
        ));
    }

    #[test]
    fn test_fit_separates_obvious_clusters() {
        // Two tight groups far apart; two centroids must land on them.
        let mut data = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f32 * 0.01;
            if i < 10 {
                data.extend_from_slice(&[jitter, jitter]);
            } else {
                data.extend_from_slice(&[50.0 + jitter, 50.0 + jitter]);
            }
        }
        let mut q = Quantizer::new(2, 1, 2).unwrap();
        q.fit(&data, 10, 42).unwrap();

        let low = q.assign_one(&[0.0, 0.0], 0);
        let high = q.assign_one(&[50.0, 50.0], 0);
        assert_ne!(low, high);
        assert!(l2_sqr(q.centroid(0, low as usize), &[0.02, 0.02]) < 1.0);
        assert!(l2_sqr(q.centroid(0, high as usize), &[50.02, 50.02]) < 1.0);
    }

    #[test]
    fn test_fit_requires_enough_vectors() {
        let mut q = Quantizer::new(2, 1, 8).unwrap();
        assert!(matches!(
            q.fit(&[0.0, 0.0, 1.0, 1.0], 5, 0),
            Err(QuantizerError::NotEnoughVectors { k: 8, actual: 2 })
        ));
    }

    #[test]
    fn test_centroids_round_trip_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pq_centers");

        let mut data = Vec::new();
        for i in 0..64 {
            data.extend_from_slice(&[i as f32 * 0.37, (i as f32).sin(), 2.0 - i as f32, 0.125]);
        }
        let mut q = Quantizer::new(4, 2, 8).unwrap();
        q.fit(&data, 6, 7).unwrap();
        q.write_centroids(&path).unwrap();

        let mut reloaded = Quantizer::new(4, 2, 8).unwrap();
        reloaded.load_centroids(&path).unwrap();
        for m in 0..2 {
            for ks in 0..8 {
                let a = q.centroid(m, ks);
                let b = reloaded.centroid(m, ks);
                assert_eq!(
                    a.iter().map(|f| f.to_bits()).collect::<Vec<_>>(),
                    b.iter().map(|f| f.to_bits()).collect::<Vec<_>>(),
                );
            }
        }
    }

    #[test]
    fn test_load_centroids_rejects_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cq_centers");

        let q_small = {
            let mut q = Quantizer::new(2, 1, 2).unwrap();
            q.set_centroids(vec![vec![vec![0.0, 0.0], vec![1.0, 1.0]]])
                .unwrap();
            q
        };
        q_small.write_centroids(&path).unwrap();

        let mut q_large = Quantizer::new(2, 1, 4).unwrap();
        assert!(matches!(
            q_large.load_centroids(&path),
            Err(QuantizerError::CodebookFileShape { records: 2, .. })
        ));
    }
}
