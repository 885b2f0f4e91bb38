//! Loads the consultation corpus: a directory of JSON files, each an array of
//! `{ "user": ..., "assistant": ... }` exchanges.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::IndexError;
use crate::vector_index::flat_index::Document;

#[derive(Debug, Clone, Deserialize)]
pub struct QaPair {
    pub user: String,
    pub assistant: String,
}

impl QaPair {
    pub fn combined_text(&self) -> String {
        format!("User: {}\nAssistant: {}", self.user, self.assistant)
    }
}

/// Read every `*.json` file directly under `dir`, in file-name order.
/// Each exchange becomes one document with source `<file>#<position>`.
pub fn load_corpus(dir: &Path) -> Result<Vec<Document>, IndexError> {
    let corpus_err = |message: String| IndexError::Corpus { path: dir.to_path_buf(), message };

    let entries = fs::read_dir(dir).map_err(|e| corpus_err(format!("cannot read directory: {}", e)))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut documents = Vec::new();
    for path in &files {
        let raw = fs::read_to_string(path)?;
        let pairs: Vec<QaPair> = serde_json::from_str(&raw).map_err(|e| IndexError::Corpus {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("{}: {} exchanges", file_name, pairs.len());
        documents.extend(
            pairs
                .iter()
                .enumerate()
                .map(|(i, pair)| Document::new(pair.combined_text(), format!("{}#{}", file_name, i))),
        );
    }

    info!("Loaded {} documents from {} corpus file(s) in {}", documents.len(), files.len(), dir.display());
    Ok(documents)
}
