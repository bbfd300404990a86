//! Fetch-layer contract + REST and snapshot implementations.
//!
//! Every source returns whole [`Table`]s per record type. An empty result is
//! a valid answer and never an error.

use std::path::PathBuf;

use async_trait::async_trait;
use sps_core::{Gameweek, RecordKind, Table, TableError};
use sps_storage::{CsvError, FetchError};
use thiserror::Error;

mod rest;
mod snapshot;

pub use rest::{postgrest_in_filter, RestSource, RestSourceConfig};
pub use snapshot::SnapshotSource;

pub const CRATE_NAME: &str = "sps-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0} has no gameweek column to window on")]
    Unwindowed(RecordKind),
    #[error("fetching {table}: {source}")]
    Fetch {
        table: String,
        #[source]
        source: FetchError,
    },
    #[error("{table}: expected a JSON array of objects")]
    Shape { table: String },
    #[error("decoding {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: TableError,
    },
    #[error("reading snapshot {}: {source}", .path.display())]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {}: {message}", .path.display())]
    SnapshotParse { path: PathBuf, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    fn snapshot_csv(path: PathBuf, err: CsvError) -> Self {
        SourceError::SnapshotParse {
            path,
            message: err.to_string(),
        }
    }
}

/// The upstream record store, treated as opaque by the sync engine.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Complete snapshot of a record type.
    async fn fetch_all(&self, kind: RecordKind) -> Result<Table, SourceError>;

    /// Rows whose gameweek column is at least `gameweek`.
    async fn fetch_since(&self, kind: RecordKind, gameweek: Gameweek)
        -> Result<Table, SourceError>;

    /// Rows whose `parent_key` column matches one of `ids`.
    async fn fetch_by_parent_ids(
        &self,
        kind: RecordKind,
        parent_key: &str,
        ids: &[String],
    ) -> Result<Table, SourceError>;
}

fn windowed_column(kind: RecordKind) -> Result<&'static str, SourceError> {
    match kind {
        // PlayerMatchStat only carries a gameweek after the match join.
        RecordKind::PlayerMatchStat => Err(SourceError::Unwindowed(kind)),
        _ => kind
            .gameweek_column()
            .ok_or(SourceError::Unwindowed(kind)),
    }
}
