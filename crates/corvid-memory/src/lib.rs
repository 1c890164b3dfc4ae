// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod gate;
pub mod profile;
mod end_summary;
mod historian;
mod job;
mod queue;
mod service;
mod vector;

use std::path::Path;

use thiserror::Error;

pub use end_summary::{EndSummaryLocation, EndSummaryRecord, EndSummaryStorage};
pub use historian::{HistorianHandle, HistorianWorker};
pub use job::{CognitiveJob, ProfileTarget};
pub use profile::{ProfileFrontmatter, ProfileStorage};
pub use queue::CognitiveJobQueue;
pub use service::{CognitiveService, EnqueueContext, EventSearchFilters};
pub use vector::{Embedder, HashingEmbedder, HttpEmbedder, VectorHit, VectorStore};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("model error: {0}")]
    Model(#[from] corvid_model::ModelError),

    /// Historian tool-call shape wrong; triggers requeue until
    /// `job_max_retries`, then fail.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),
}

impl MemoryError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
