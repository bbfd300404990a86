//! Partition file storage (schema reconciliation, keyed upsert, atomic CSV
//! writes) + HTTP fetch utilities for SPS.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sps_core::{RecordKind, Table};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod csv_io;
mod http;
mod merge;
mod reconcile;

pub use csv_io::{parse_table, render_table, CsvError};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use merge::{merge_keep_last, MergeError};
pub use reconcile::reconcile_schemas;

pub const CRATE_NAME: &str = "sps-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// The file did not exist and was written.
    Created,
    /// The file existed and its content changed.
    Updated,
    /// The merged content equals the bytes already on disk; nothing written.
    Unchanged,
    /// Empty batch without a schema; the file was neither read nor written.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PartitionWrite {
    pub relative_path: PathBuf,
    pub outcome: WriteOutcome,
    pub rows: usize,
    pub columns: usize,
    pub content_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unparseable partition file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: CsvError,
    },
    #[error("merging into {}: {source}", .path.display())]
    Merge {
        path: PathBuf,
        #[source]
        source: MergeError,
    },
    #[error("rendering {}: {source}", .path.display())]
    Render {
        path: PathBuf,
        #[source]
        source: CsvError,
    },
    #[error("writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PartitionError {
    pub fn path(&self) -> &Path {
        match self {
            PartitionError::Read { path, .. }
            | PartitionError::Parse { path, .. }
            | PartitionError::Merge { path, .. }
            | PartitionError::Render { path, .. }
            | PartitionError::Write { path, .. } => path,
        }
    }
}

/// Root of one season's partition trees. Every write goes through
/// [`PartitionStore::upsert`].
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Reads a partition file. A missing file is `Ok(None)`.
    pub async fn read(&self, relative_path: &Path) -> Result<Option<Table>, PartitionError> {
        let path = self.root.join(relative_path);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        parse_table(&bytes)
            .map(Some)
            .map_err(|source| PartitionError::Parse { path, source })
    }

    /// Upserts `batch` into `<dir>/<kind file name>` keyed on the record
    /// type's business key.
    pub async fn upsert(
        &self,
        dir: &Path,
        kind: RecordKind,
        batch: &Table,
    ) -> Result<PartitionWrite, PartitionError> {
        self.upsert_file(&dir.join(kind.file_name()), kind.key_columns(), batch)
            .await
    }

    /// Reconciles the on-disk table with `batch`, keeps the last row per key
    /// and writes the result back when it differs from what is stored.
    pub async fn upsert_file(
        &self,
        relative_path: &Path,
        key_columns: &[&str],
        batch: &Table,
    ) -> Result<PartitionWrite, PartitionError> {
        let path = self.root.join(relative_path);

        if batch.width() == 0 && batch.is_empty() {
            debug!(path = %path.display(), "empty batch without schema; skipping");
            return Ok(PartitionWrite {
                relative_path: relative_path.to_path_buf(),
                outcome: WriteOutcome::Skipped,
                rows: 0,
                columns: 0,
                content_hash: None,
            });
        }

        let existing_bytes = read_optional(&path).await?;
        let existing = match &existing_bytes {
            Some(bytes) => Some(parse_table(bytes).map_err(|source| PartitionError::Parse {
                path: path.clone(),
                source,
            })?),
            None => None,
        };

        let (existing, incoming) = reconcile_schemas(existing, batch.clone());
        let merged = if existing.is_empty() && incoming.is_empty() {
            existing
        } else {
            merge_keep_last(existing, incoming, key_columns).map_err(|source| {
                PartitionError::Merge {
                    path: path.clone(),
                    source,
                }
            })?
        };

        let rendered = render_table(&merged).map_err(|source| PartitionError::Render {
            path: path.clone(),
            source,
        })?;
        let content_hash = Self::sha256_hex(&rendered);

        let outcome = match existing_bytes {
            Some(current) if current == rendered => WriteOutcome::Unchanged,
            Some(_) => {
                write_atomically(&path, &rendered).await?;
                WriteOutcome::Updated
            }
            None => {
                write_atomically(&path, &rendered).await?;
                WriteOutcome::Created
            }
        };

        debug!(
            path = %path.display(),
            rows = merged.len(),
            ?outcome,
            "partition upserted"
        );

        Ok(PartitionWrite {
            relative_path: relative_path.to_path_buf(),
            outcome,
            rows: merged.len(),
            columns: merged.width(),
            content_hash: Some(content_hash),
        })
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PartitionError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PartitionError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes through a temp file in the target directory and renames it into
/// place, so readers never observe a half-written partition.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PartitionError> {
    let write_err = |source| PartitionError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(write_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    if let Err(source) = write_new_file(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(source));
    }

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(write_err(source));
    }
    Ok(())
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        Table::with_rows(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| {
                    r.iter()
                        .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                        .collect()
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn hashing_is_stable() {
        let hash = PartitionStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_then_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let gw = Path::new("By Gameweek").join("GW4");

        let first = table(&["player_id", "match_id", "goals"], &[&["p1", "m1", "1"]]);
        let created = store
            .upsert(&gw, RecordKind::PlayerMatchStat, &first)
            .await
            .unwrap();
        assert_eq!(created.outcome, WriteOutcome::Created);

        let second = table(
            &["player_id", "match_id", "goals"],
            &[&["p1", "m1", "2"], &["p2", "m1", "0"]],
        );
        let updated = store
            .upsert(&gw, RecordKind::PlayerMatchStat, &second)
            .await
            .unwrap();
        assert_eq!(updated.outcome, WriteOutcome::Updated);
        assert_eq!(updated.rows, 2);

        let bytes_before = fs::read(dir.path().join(&gw).join("playermatchstats.csv")).unwrap();
        let again = store
            .upsert(&gw, RecordKind::PlayerMatchStat, &second)
            .await
            .unwrap();
        assert_eq!(again.outcome, WriteOutcome::Unchanged);
        let bytes_after = fs::read(dir.path().join(&gw).join("playermatchstats.csv")).unwrap();
        assert_eq!(bytes_before, bytes_after);
        assert_eq!(
            String::from_utf8(bytes_after).unwrap(),
            "player_id,match_id,goals\np1,m1,2\np2,m1,0\n"
        );
    }

    #[tokio::test]
    async fn schema_only_grows_across_upserts() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = Path::new("players.csv");

        store
            .upsert_file(path, &["player_id"], &table(&["player_id", "web_name", "form"], &[&["1", "Saka", "6.1"]]))
            .await
            .unwrap();
        store
            .upsert_file(path, &["player_id"], &table(&["player_id", "web_name"], &[&["2", "Rice"]]))
            .await
            .unwrap();

        let stored = store.read(path).await.unwrap().unwrap();
        assert_eq!(stored.columns(), &["player_id", "web_name", "form"]);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.value(0, "form"), Some("6.1"));
        assert_eq!(stored.value(1, "form"), None);
    }

    #[tokio::test]
    async fn empty_batch_without_columns_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let write = store
            .upsert(Path::new("GW1"), RecordKind::Match, &Table::default())
            .await
            .unwrap();
        assert_eq!(write.outcome, WriteOutcome::Skipped);
        assert!(!dir.path().join("GW1").exists());
    }

    #[tokio::test]
    async fn empty_batch_with_columns_writes_header_only_file() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let write = store
            .upsert(Path::new("GW1"), RecordKind::Fixture, &Table::new(["match_id", "gameweek"]))
            .await
            .unwrap();
        assert_eq!(write.outcome, WriteOutcome::Created);
        assert_eq!(
            fs::read_to_string(dir.path().join("GW1").join("fixtures.csv")).unwrap(),
            "match_id,gameweek\n"
        );
    }

    #[tokio::test]
    async fn corrupt_partition_aborts_that_upsert_only() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let bad = dir.path().join("GW2");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("matches.csv"), "match_id,gameweek\nm1,2,oops\n").unwrap();

        let batch = table(&["match_id", "gameweek"], &[&["m2", "2"]]);
        let err = store
            .upsert(Path::new("GW2"), RecordKind::Match, &batch)
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::Parse { .. }));
        assert_eq!(
            fs::read_to_string(bad.join("matches.csv")).unwrap(),
            "match_id,gameweek\nm1,2,oops\n"
        );

        let ok = store
            .upsert(Path::new("GW3"), RecordKind::Match, &batch)
            .await
            .unwrap();
        assert_eq!(ok.outcome, WriteOutcome::Created);
    }

    #[tokio::test]
    async fn missing_key_column_is_a_merge_error() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let err = store
            .upsert(Path::new("GW1"), RecordKind::Match, &table(&["gameweek"], &[&["1"]]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Merge {
                source: MergeError::MissingKeyColumn(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        store
            .upsert(Path::new("GW5"), RecordKind::Team, &table(&["id", "name"], &[&["1", "Arsenal"]]))
            .await
            .unwrap();
        let names: Vec<_> = fs::read_dir(dir.path().join("GW5"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["teams.csv".to_string()]);
    }
}
