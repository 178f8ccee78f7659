//! Framed little-endian vector files.
//!
//! Every database file shares one layout: a sequence of records, each a
//! 4-byte little-endian dimension separator followed by that many elements.
//! The record count is derived from the file size, so readers verify that
//! the size is a whole number of records and that every separator repeats
//! the leading dimension.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use waggle_error::{ErrorCodes, WaggleError};

/// Coarse codebook: `kc` records of `d` floats.
pub const COARSE_CODEBOOK_FILE: &str = "cq_centers";
/// Product codebook: `mp * kp` records of `dp` floats.
pub const PRODUCT_CODEBOOK_FILE: &str = "pq_centers";
/// Coordinator-authoritative posting-list sizes: one record of `kc` u64s.
pub const POSTING_LIST_LENS_FILE: &str = "posting_lists_lens.ulvecs";
pub const QUERY_FILE: &str = "query.fvecs";
pub const GROUND_TRUTH_FILE: &str = "query_groundtruth.ivecs";
/// Staging directory for pushed segment files, under the database path.
pub const UPLOAD_DIR: &str = "uploads";

/// Segment of a cluster: `n_c` records of `mp` code bytes.
pub fn segment_file_name(cluster: u32) -> String {
    format!("pqcode_{}.ui8vecs", cluster)
}

/// Posting list of a cluster: one record of `n_c` vector ids.
pub fn posting_list_file_name(cluster: u32) -> String {
    format!("id_{}.uivecs", cluster)
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} size {len} is not a whole number of {record}-byte records")]
    TruncatedFile {
        path: PathBuf,
        len: u64,
        record: usize,
    },
    #[error("{path}: record {record} has separator {found}, expected dimension {expected}")]
    SeparatorMismatch {
        path: PathBuf,
        record: usize,
        found: u32,
        expected: u32,
    },
    #[error("buffer holds {actual} elements, expected {records} records of {dim}")]
    WrongShape {
        records: usize,
        dim: usize,
        actual: usize,
    },
}

impl WaggleError for StorageError {
    fn code(&self) -> ErrorCodes {
        match self {
            StorageError::Open { source, .. } => source.code(),
            StorageError::Io { .. } => ErrorCodes::Internal,
            StorageError::TruncatedFile { .. } => ErrorCodes::DataLoss,
            StorageError::SeparatorMismatch { .. } => ErrorCodes::DataLoss,
            StorageError::WrongShape { .. } => ErrorCodes::InvalidArgument,
        }
    }
}

/// Fixed-width element of a vector file.
pub trait Element: Copy + Default {
    const SIZE: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(impl Element for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn from_le_slice(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes.try_into().expect("slice length checked by caller"))
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_element!(f32, u32, u64, i32);

impl Element for u8 {
    const SIZE: usize = 1;

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

/// A loaded vector file: `records * dim` elements in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct VecsData<T> {
    pub data: Vec<T>,
    pub dim: usize,
    pub records: usize,
}

/// Reads a whole framed vector file.
///
/// A zero-length file is a valid encoding of zero records (an empty cluster
/// writes no record at all, so there is no separator to carry a dimension).
pub fn read_vecs<T: Element>(path: impl AsRef<Path>) -> Result<VecsData<T>, StorageError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let len = file
        .metadata()
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if len == 0 {
        return Ok(VecsData {
            data: Vec::new(),
            dim: 0,
            records: 0,
        });
    }

    let mut reader = BufReader::new(file);
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut sep = [0u8; 4];
    reader.read_exact(&mut sep).map_err(io_err)?;
    let dim = u32::from_le_bytes(sep) as usize;

    let record_size = 4 + dim * T::SIZE;
    if len % record_size as u64 != 0 {
        return Err(StorageError::TruncatedFile {
            path: path.to_path_buf(),
            len,
            record: record_size,
        });
    }
    let records = (len / record_size as u64) as usize;

    let mut data = Vec::with_capacity(records * dim);
    let mut payload = vec![0u8; dim * T::SIZE];
    for record in 0..records {
        if record > 0 {
            reader.read_exact(&mut sep).map_err(io_err)?;
            let found = u32::from_le_bytes(sep);
            if found as usize != dim {
                return Err(StorageError::SeparatorMismatch {
                    path: path.to_path_buf(),
                    record,
                    found,
                    expected: dim as u32,
                });
            }
        }
        reader.read_exact(&mut payload).map_err(io_err)?;
        for chunk in payload.chunks_exact(T::SIZE) {
            data.push(T::from_le_slice(chunk));
        }
    }

    Ok(VecsData { data, dim, records })
}

/// Writes `records` records of `dim` elements with the shared framing.
pub fn write_vecs<T: Element>(
    path: impl AsRef<Path>,
    data: &[T],
    records: usize,
    dim: usize,
) -> Result<(), StorageError> {
    let path = path.as_ref();
    if data.len() != records * dim {
        return Err(StorageError::WrongShape {
            records,
            dim,
            actual: data.len(),
        });
    }

    let file = File::create(path).map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    let mut record_buf = Vec::with_capacity(4 + dim * T::SIZE);
    for record in data.chunks_exact(dim.max(1)).take(records) {
        record_buf.clear();
        record_buf.extend_from_slice(&(dim as u32).to_le_bytes());
        for &value in record {
            value.write_le(&mut record_buf);
        }
        writer.write_all(&record_buf).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    // A dim-0 record still carries its separator.
    if dim == 0 {
        for _ in 0..records {
            writer
                .write_all(&0u32.to_le_bytes())
                .map_err(|source| StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }
    writer.flush().map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centers.fvecs");
        let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();

        write_vecs(&path, &data, 3, 4).unwrap();
        let loaded = read_vecs::<f32>(&path).unwrap();
        assert_eq!(loaded.dim, 4);
        assert_eq!(loaded.records, 3);
        assert_eq!(loaded.data, data);
    }

    #[test]
    fn test_round_trip_u8_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(7));
        let data: Vec<u8> = (0..30).map(|i| (i * 3) as u8).collect();

        write_vecs(&path, &data, 10, 3).unwrap();
        let loaded = read_vecs::<u8>(&path).unwrap();
        assert_eq!(loaded.records, 10);
        assert_eq!(loaded.data, data);
    }

    #[test]
    fn test_single_record_u64_lens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(POSTING_LIST_LENS_FILE);
        let lens: Vec<u64> = vec![5, 0, 12, 7];

        write_vecs(&path, &lens, 1, 4).unwrap();
        let loaded = read_vecs::<u64>(&path).unwrap();
        assert_eq!(loaded.records, 1);
        assert_eq!(loaded.data, lens);
    }

    #[test]
    fn test_empty_cluster_files() {
        let dir = tempfile::tempdir().unwrap();

        // No vectors: the segment file has no records at all.
        let segment = dir.path().join(segment_file_name(0));
        write_vecs::<u8>(&segment, &[], 0, 3).unwrap();
        let loaded = read_vecs::<u8>(&segment).unwrap();
        assert_eq!(loaded.records, 0);
        assert!(loaded.data.is_empty());

        // The posting list is one record of dimension zero.
        let ids = dir.path().join(posting_list_file_name(0));
        write_vecs::<u32>(&ids, &[], 1, 0).unwrap();
        let loaded = read_vecs::<u32>(&ids).unwrap();
        assert_eq!(loaded.records, 1);
        assert_eq!(loaded.dim, 0);
        assert!(loaded.data.is_empty());
    }

    #[test]
    fn test_separator_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.uivecs");

        // Two records of dim 1 whose second separator disagrees, crafted so
        // the total size still divides evenly.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&42u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&43u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = read_vecs::<u32>(&path).unwrap_err();
        assert!(matches!(
            err,
            StorageError::SeparatorMismatch {
                record: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.fvecs");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = read_vecs::<f32>(&path).unwrap_err();
        assert!(matches!(err, StorageError::TruncatedFile { .. }));
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shape.fvecs");
        let err = write_vecs::<f32>(&path, &[1.0, 2.0, 3.0], 2, 2).unwrap_err();
        assert!(matches!(err, StorageError::WrongShape { actual: 3, .. }));
    }
}
