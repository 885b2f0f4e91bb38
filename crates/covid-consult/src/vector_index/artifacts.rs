//! On-disk form of a [`FlatIndex`]: a bincode vector matrix and a JSON
//! metadata file. Both carry the same build id; a pair whose ids, row counts
//! or sizes disagree is rejected as corrupt.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::IndexError;
use crate::vector_index::flat_index::{Document, FlatIndex};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const METADATA_FILE: &str = "metadata.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct VectorMatrix {
    format_version: u32,
    build_id: String,
    dimension: u64,
    rows: u64,
    data: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    format_version: u32,
    build_id: String,
    documents: Vec<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    /// Exactly one of the two files exists.
    Partial,
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifacts {
    pub vectors_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl IndexArtifacts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors_path: dir.join(VECTORS_FILE),
            metadata_path: dir.join(METADATA_FILE),
        }
    }

    pub fn state(&self) -> ArtifactState {
        match (self.vectors_path.exists(), self.metadata_path.exists()) {
            (true, true) => ArtifactState::Present,
            (false, false) => ArtifactState::Missing,
            _ => ArtifactState::Partial,
        }
    }

    fn dir(&self) -> PathBuf {
        self.vectors_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Write both files under temporary names, then rename them into place.
    pub fn persist(&self, index: &FlatIndex) -> Result<(), IndexError> {
        if let Some(parent) = self.vectors_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.metadata_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let build_id = uuid::Uuid::new_v4().to_string();
        let matrix = VectorMatrix {
            format_version: FORMAT_VERSION,
            build_id: build_id.clone(),
            dimension: index.dimension() as u64,
            rows: index.len() as u64,
            data: index.vectors().to_vec(),
        };
        let metadata = MetadataFile {
            format_version: FORMAT_VERSION,
            build_id,
            documents: index.documents().to_vec(),
        };

        let matrix_bytes = bincode::serialize(&matrix)
            .map_err(|e| IndexError::Corrupt(format!("cannot encode vector matrix: {}", e)))?;
        let metadata_bytes = serde_json::to_vec(&metadata)
            .map_err(|e| IndexError::Corrupt(format!("cannot encode metadata: {}", e)))?;

        let vectors_tmp = tmp_path(&self.vectors_path);
        let metadata_tmp = tmp_path(&self.metadata_path);
        fs::write(&vectors_tmp, matrix_bytes)?;
        fs::write(&metadata_tmp, metadata_bytes)?;
        fs::rename(&vectors_tmp, &self.vectors_path)?;
        fs::rename(&metadata_tmp, &self.metadata_path)?;

        info!(
            "Index saved to {} and metadata saved to {} ({} documents)",
            self.vectors_path.display(),
            self.metadata_path.display(),
            index.len()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<FlatIndex, IndexError> {
        match self.state() {
            ArtifactState::Missing => return Err(IndexError::NotFound(self.dir())),
            ArtifactState::Partial => {
                return Err(IndexError::Corrupt(format!(
                    "only one of {} and {} exists",
                    self.vectors_path.display(),
                    self.metadata_path.display()
                )))
            }
            ArtifactState::Present => {}
        }

        let matrix_bytes = fs::read(&self.vectors_path)?;
        let matrix: VectorMatrix = bincode::deserialize(&matrix_bytes)
            .map_err(|e| IndexError::Corrupt(format!("unreadable vector matrix: {}", e)))?;
        let metadata_bytes = fs::read(&self.metadata_path)?;
        let metadata: MetadataFile = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| IndexError::Corrupt(format!("unreadable metadata: {}", e)))?;

        if matrix.format_version != FORMAT_VERSION || metadata.format_version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version (vectors {}, metadata {})",
                matrix.format_version, metadata.format_version
            )));
        }
        if matrix.build_id != metadata.build_id {
            return Err(IndexError::Corrupt(format!(
                "artifacts belong to different builds ({} vs {})",
                matrix.build_id, metadata.build_id
            )));
        }
        let dimension = usize::try_from(matrix.dimension)
            .map_err(|_| IndexError::Corrupt(format!("dimension {} does not fit in memory", matrix.dimension)))?;
        let rows = usize::try_from(matrix.rows)
            .map_err(|_| IndexError::Corrupt(format!("row count {} does not fit in memory", matrix.rows)))?;
        if rows != metadata.documents.len() {
            return Err(IndexError::Corrupt(format!(
                "{} vectors but {} metadata entries",
                matrix.rows,
                metadata.documents.len()
            )));
        }

        let index = FlatIndex::from_parts(dimension, matrix.data, metadata.documents)?;
        debug!("Loaded index build {} ({} documents)", matrix.build_id, index.len());
        Ok(index)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
