//! Compiled artifacts.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::compile::TargetFormat;

/// One compiled configuration document.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub format: TargetFormat,
    pub content: String,
    /// sha256 hex of `content`.
    pub hash: String,
    /// Model version the artifact was compiled from.
    pub snapshot_version: u64,
    /// Unix seconds; metadata only, never part of `content`.
    pub generated_at: u64,
    /// Matchers or nodes the format could not express.
    pub dropped: Vec<String>,
}

impl Artifact {
    pub fn new(format: TargetFormat, content: String, snapshot_version: u64, dropped: Vec<String>) -> Self {
        let hash = content_hash(&content);
        Self {
            format,
            content,
            hash,
            snapshot_version,
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            dropped,
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// sha256 hex digest used for push skipping.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
