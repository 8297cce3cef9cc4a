//! On-disk container for spilled sketch matrices.
//!
//! Each spilled batch is written as one file per matrix kind. A file holds a
//! 32-byte header followed by a Postcard-encoded payload.
//!
//! # Format Structure
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Header (32 bytes)                        │
//! ├────────────────────────────────────────────────────────────┤
//! │                    Payload (variable)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only round-trip fidelity is guaranteed; the layout is not a compatibility
//! surface across crate versions.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sketch::{MatrixKind, Sketch};

// ============================================================================
// Constants
// ============================================================================

/// Magic bytes identifying a spilled sketch matrix.
pub const MAGIC: &[u8; 4] = b"SKBT";

/// Current format version (major).
pub const CURRENT_VERSION_MAJOR: u8 = 1;

/// Current format version (minor).
pub const CURRENT_VERSION_MINOR: u8 = 0;

/// Size of the format header in bytes.
pub const HEADER_SIZE: usize = 32;

/// File extension of spilled matrices.
pub const EXTENSION: &str = "skb";

// ============================================================================
// Header
// ============================================================================

/// 32-byte header of a spilled matrix.
///
/// # Layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     Magic ("SKBT")
/// 4       1     Version major
/// 5       1     Version minor
/// 6       1     Matrix kind
/// 7       1     Reserved
/// 8       4     Batch id
/// 12      4     Payload size (bytes)
/// 16      4     CRC32 checksum of payload
/// 20      4     Rows (domain size)
/// 24      4     Columns
/// 28      4     Reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub kind: MatrixKind,
    pub batch_id: u32,
    pub payload_size: u32,
    pub checksum: u32,
    pub rows: u32,
    pub cols: u32,
}

impl SpillHeader {
    /// Create a header with the current version and an empty payload.
    pub fn new(kind: MatrixKind, batch_id: u32, rows: u32, cols: u32) -> Self {
        Self {
            version_major: CURRENT_VERSION_MAJOR,
            version_minor: CURRENT_VERSION_MINOR,
            kind,
            batch_id,
            payload_size: 0,
            checksum: 0,
            rows,
            cols,
        }
    }

    /// Serialize header to 32 bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version_major;
        buf[5] = self.version_minor;
        buf[6] = self.kind as u8;
        buf[8..12].copy_from_slice(&self.batch_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf[20..24].copy_from_slice(&self.rows.to_le_bytes());
        buf[24..28].copy_from_slice(&self.cols.to_le_bytes());
        buf
    }

    /// Parse header from 32 bytes.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, SpillError> {
        if &buf[0..4] != MAGIC {
            return Err(SpillError::NotASpillFile);
        }

        let version_major = buf[4];
        let version_minor = buf[5];
        if version_major > CURRENT_VERSION_MAJOR {
            return Err(SpillError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let kind = MatrixKind::from_u8(buf[6])
            .ok_or_else(|| SpillError::CorruptPayload("invalid matrix kind".into()))?;

        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        Ok(Self {
            version_major,
            version_minor,
            kind,
            batch_id: word(8),
            payload_size: word(12),
            checksum: word(16),
            rows: word(20),
            cols: word(24),
        })
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while spilling or reloading matrices.
#[derive(Debug, Error)]
pub enum SpillError {
    /// I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Postcard encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    /// Postcard decoding error.
    #[error("decoding error: {0}")]
    Decoding(postcard::Error),

    /// File is not a spilled sketch matrix (wrong magic).
    #[error("not a spilled sketch file")]
    NotASpillFile,

    /// File was written by a newer format version.
    #[error("spill file requires format {major}.{minor} or later")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// Payload checksum doesn't match.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// File was truncated or incomplete.
    #[error("file truncated: expected {expected} bytes")]
    Truncated { expected: usize },

    /// Payload is corrupt or malformed.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// File holds a different matrix or batch than requested.
    #[error("expected {expected:?} of batch {batch_id}, found {actual:?} of batch {actual_batch}")]
    Mismatch {
        expected: MatrixKind,
        batch_id: u32,
        actual: MatrixKind,
        actual_batch: u32,
    },
}

/// Compute CRC32 checksum of data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Serialize, Deserialize)]
struct MatrixPayload {
    rows: u32,
    cols: u32,
    data: Vec<f64>,
}

/// Codec for single matrices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpillCodec;

impl SpillCodec {
    /// Encode a matrix with its header.
    pub fn encode(
        &self,
        kind: MatrixKind,
        batch_id: u32,
        matrix: ArrayView2<'_, f64>,
    ) -> Result<Vec<u8>, SpillError> {
        let (rows, cols) = (matrix.nrows() as u32, matrix.ncols() as u32);
        let payload = MatrixPayload {
            rows,
            cols,
            data: matrix.iter().copied().collect(),
        };
        let payload_bytes = postcard::to_allocvec(&payload)?;

        let mut header = SpillHeader::new(kind, batch_id, rows, cols);
        header.payload_size = payload_bytes.len() as u32;
        header.checksum = compute_checksum(&payload_bytes);

        let mut out = Vec::with_capacity(HEADER_SIZE + payload_bytes.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload_bytes);
        Ok(out)
    }

    /// Decode a matrix, verifying its checksum and shape.
    pub fn decode<R: Read>(&self, reader: &mut R) -> Result<(SpillHeader, Array2<f64>), SpillError> {
        let truncated = |expected: usize| {
            move |e: std::io::Error| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    SpillError::Truncated { expected }
                } else {
                    SpillError::Io {
                        path: PathBuf::new(),
                        source: e,
                    }
                }
            }
        };

        let mut header_buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut header_buf)
            .map_err(truncated(HEADER_SIZE))?;
        let header = SpillHeader::from_bytes(&header_buf)?;

        let mut payload = vec![0u8; header.payload_size as usize];
        reader
            .read_exact(&mut payload)
            .map_err(truncated(header.payload_size as usize))?;

        let actual = compute_checksum(&payload);
        if actual != header.checksum {
            return Err(SpillError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let decoded: MatrixPayload = postcard::from_bytes(&payload).map_err(SpillError::Decoding)?;
        if decoded.rows != header.rows || decoded.cols != header.cols {
            return Err(SpillError::CorruptPayload(format!(
                "payload shape {}x{} disagrees with header {}x{}",
                decoded.rows, decoded.cols, header.rows, header.cols
            )));
        }
        let matrix = Array2::from_shape_vec((decoded.rows as usize, decoded.cols as usize), decoded.data)
            .map_err(|e| SpillError::CorruptPayload(e.to_string()))?;
        Ok((header, matrix))
    }
}

// ============================================================================
// Spill directory
// ============================================================================

/// Files holding one spilled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledBatch {
    pub batch_id: u32,
    pub paths: Vec<(MatrixKind, PathBuf)>,
}

/// Directory that spilled batches are written to.
///
/// File names are derived from the batch id and matrix kind only, so a batch
/// spilled twice overwrites its previous files.
#[derive(Debug, Clone)]
pub struct SpillDir {
    root: PathBuf,
    codec: SpillCodec,
}

impl SpillDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            codec: SpillCodec,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path of one matrix of a batch.
    pub fn path_for(&self, batch_id: u32, kind: MatrixKind) -> PathBuf {
        self.root
            .join(format!("batch_{batch_id:06}_{}.{EXTENSION}", kind.file_stem()))
    }

    /// Write every matrix of `sketch` under this directory.
    pub fn write_batch(&self, batch_id: u32, sketch: &Sketch) -> Result<SpilledBatch, SpillError> {
        fs::create_dir_all(&self.root).map_err(|source| SpillError::Io {
            path: self.root.clone(),
            source,
        })?;

        let kinds = MatrixKind::CORE
            .iter()
            .copied()
            .chain(sketch.sum_xy().is_some().then_some(MatrixKind::SumXY));

        let mut paths = Vec::with_capacity(4);
        for kind in kinds {
            let Some(matrix) = sketch.matrix(kind) else {
                continue;
            };
            let path = self.path_for(batch_id, kind);
            if let Err(err) = self.write_matrix(&path, kind, batch_id, matrix) {
                // Leave no partial batch behind.
                let written = SpilledBatch { batch_id, paths };
                if let Err(cleanup) = self.remove(&written) {
                    tracing::warn!(batch_id, error = %cleanup, "failed to remove partial spill");
                }
                return Err(err);
            }
            paths.push((kind, path));
        }

        tracing::debug!(batch_id, dir = %self.root.display(), "spilled batch");
        Ok(SpilledBatch { batch_id, paths })
    }

    fn write_matrix(
        &self,
        path: &Path,
        kind: MatrixKind,
        batch_id: u32,
        matrix: ArrayView2<'_, f64>,
    ) -> Result<(), SpillError> {
        let bytes = self.codec.encode(kind, batch_id, matrix)?;
        let io_err = |source: std::io::Error| SpillError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        writer.write_all(&bytes).map_err(io_err)?;
        writer.flush().map_err(io_err)
    }

    /// Reload a spilled batch.
    pub fn read_batch(&self, spilled: &SpilledBatch) -> Result<Sketch, SpillError> {
        let mut ones = None;
        let mut sum_x = None;
        let mut sum_xx = None;
        let mut sum_xy = None;

        for (kind, path) in &spilled.paths {
            let file = File::open(path).map_err(|source| SpillError::Io {
                path: path.clone(),
                source,
            })?;
            let (header, matrix) = self.codec.decode(&mut BufReader::new(file))?;
            if header.kind != *kind || header.batch_id != spilled.batch_id {
                return Err(SpillError::Mismatch {
                    expected: *kind,
                    batch_id: spilled.batch_id,
                    actual: header.kind,
                    actual_batch: header.batch_id,
                });
            }
            match kind {
                MatrixKind::Ones => ones = Some(matrix),
                MatrixKind::SumX => sum_x = Some(matrix),
                MatrixKind::SumXX => sum_xx = Some(matrix),
                MatrixKind::SumXY => sum_xy = Some(matrix),
            }
        }

        match (ones, sum_x, sum_xx) {
            (Some(ones), Some(sum_x), Some(sum_xx)) => {
                if ones.dim() != sum_x.dim() || ones.dim() != sum_xx.dim() {
                    return Err(SpillError::CorruptPayload(format!(
                        "matrix shapes of batch {} disagree",
                        spilled.batch_id
                    )));
                }
                Ok(Sketch::new(ones, sum_x, sum_xx, sum_xy))
            }
            _ => Err(SpillError::CorruptPayload(format!(
                "batch {} is missing a core matrix",
                spilled.batch_id
            ))),
        }
    }

    /// Delete the files of a spilled batch. Missing files are ignored.
    pub fn remove(&self, spilled: &SpilledBatch) -> Result<(), SpillError> {
        for (_, path) in &spilled.paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SpillError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
