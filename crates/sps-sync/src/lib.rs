//! Sync orchestration: configuration, partition routing, the incremental
//! window and the match-level resplit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sps_adapters::{RecordSource, RestSource, RestSourceConfig, SnapshotSource};
use sps_core::{Gameweek, RecordKind, Table};
use sps_storage::{HttpClientConfig, HttpFetcher, PartitionError, PartitionStore, PartitionWrite, WriteOutcome};
use tracing::{info, warn};
use uuid::Uuid;

mod pipeline;
mod router;
mod split;
mod window;

pub use pipeline::SyncPipeline;
pub use router::{
    directory_safe, gameweek_dir_name, route_by_gameweek, route_by_match, route_by_tournament,
    route_rows, tournament_code, tournament_names, Partition, Routed, TournamentMap, BY_GAMEWEEK,
    BY_TOURNAMENT,
};
pub use split::{MatchViewSplitter, SplitSummary};
pub use window::{latest_finished_gameweek, WindowPolicy};

pub const CRATE_NAME: &str = "sps-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch the window from the watermark onward; seal older gameweeks.
    #[default]
    Incremental,
    /// Fetch the whole match history; nothing is sealed.
    Full,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_root: PathBuf,
    pub season: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub page_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub tournaments_file: PathBuf,
    pub match_view: bool,
    pub snapshot_dir: Option<PathBuf>,
    pub mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            season: "2025-2026".to_string(),
            api_url: None,
            api_key: None,
            page_size: 1000,
            http_timeout_secs: 20,
            user_agent: "sps-bot/0.1".to_string(),
            tournaments_file: PathBuf::from("tournaments.yaml"),
            match_view: false,
            snapshot_dir: None,
            mode: SyncMode::Incremental,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: std::env::var("SPS_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            season: std::env::var("SPS_SEASON").unwrap_or(defaults.season),
            api_url: non_empty_var("SPS_API_URL"),
            api_key: non_empty_var("SPS_API_KEY"),
            page_size: std::env::var("SPS_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            http_timeout_secs: std::env::var("SPS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("SPS_USER_AGENT").unwrap_or(defaults.user_agent),
            tournaments_file: std::env::var("SPS_TOURNAMENTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tournaments_file),
            match_view: std::env::var("SPS_MATCH_VIEW")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            snapshot_dir: non_empty_var("SPS_SNAPSHOT_DIR").map(PathBuf::from),
            mode: SyncMode::Incremental,
        }
    }

    /// `<data_root>/<season>`, the root of every partition tree.
    pub fn season_root(&self) -> PathBuf {
        self.data_root.join(&self.season)
    }

    pub fn load_tournaments(&self) -> Result<TournamentMap> {
        TournamentMap::load_layered(&self.tournaments_file)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Builds the fetch layer: a local snapshot directory when configured,
/// otherwise the REST service at `api_url`.
pub fn build_source(config: &SyncConfig) -> Result<Box<dyn RecordSource>> {
    if let Some(dir) = &config.snapshot_dir {
        let source = SnapshotSource::from_dir(dir)
            .with_context(|| format!("loading snapshot {}", dir.display()))?;
        return Ok(Box::new(source));
    }

    let Some(base_url) = &config.api_url else {
        bail!("SPS_API_URL is not set and no snapshot directory was given");
    };
    let mut headers = Vec::new();
    if let Some(key) = &config.api_key {
        headers.push(("apikey".to_string(), key.clone()));
        headers.push(("Authorization".to_string(), format!("Bearer {key}")));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        headers,
        ..Default::default()
    })?;
    let source = RestSource::new(
        http,
        RestSourceConfig {
            base_url: base_url.clone(),
            page_size: config.page_size,
            ..Default::default()
        },
    )?;
    Ok(Box::new(source))
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionWriteRecord {
    pub path: String,
    pub kind: RecordKind,
    pub outcome: WriteOutcome,
    pub rows: usize,
    pub columns: usize,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPartition {
    pub path: String,
    pub kind: RecordKind,
    pub error: String,
}

/// Every upsert attempted during a run, successful or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteLedger {
    pub writes: Vec<PartitionWriteRecord>,
    pub failed_partitions: Vec<FailedPartition>,
}

impl WriteLedger {
    pub fn record(&mut self, kind: RecordKind, write: PartitionWrite) {
        self.writes.push(PartitionWriteRecord {
            path: display_path(&write.relative_path),
            kind,
            outcome: write.outcome,
            rows: write.rows,
            columns: write.columns,
            content_hash: write.content_hash,
        });
    }

    pub fn record_failure(&mut self, kind: RecordKind, err: &PartitionError, relative: &Path) {
        self.failed_partitions.push(FailedPartition {
            path: display_path(relative),
            kind,
            error: err.to_string(),
        });
    }

    pub fn count(&self, outcome: WriteOutcome) -> usize {
        self.writes.iter().filter(|w| w.outcome == outcome).count()
    }

    pub fn outcome_of(&self, relative: &str) -> Option<WriteOutcome> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.path == relative)
            .map(|w| w.outcome)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_partitions.is_empty()
    }
}

fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Upserts one batch into one partition. Failures are logged and recorded,
/// never propagated.
pub(crate) async fn upsert_partition(
    store: &PartitionStore,
    ledger: &mut WriteLedger,
    partition: &Partition,
    kind: RecordKind,
    batch: &Table,
) {
    let dir = partition.dir(kind);
    match store.upsert(&dir, kind, batch).await {
        Ok(write) => ledger.record(kind, write),
        Err(err) => {
            warn!(
                path = %err.path().display(),
                error = %err,
                "partition update aborted"
            );
            ledger.record_failure(kind, &err, &dir.join(kind.file_name()));
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub season: String,
    pub mode: SyncMode,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: Option<Gameweek>,
    pub window_matches: usize,
    pub finished_matches: usize,
    pub fixtures: usize,
    pub player_match_stats: usize,
    pub gameweeks: Vec<Gameweek>,
    pub sealed_gameweeks: Vec<Gameweek>,
    pub excluded_rows: usize,
    #[serde(flatten)]
    pub ledger: WriteLedger,
}

impl SyncRunSummary {
    pub fn has_failures(&self) -> bool {
        self.ledger.has_failures()
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let tournaments = config.load_tournaments()?;
    let source = build_source(&config)?;
    let pipeline = SyncPipeline::new(config, source, tournaments);
    pipeline.run_once().await
}

pub async fn run_split(config: &SyncConfig) -> Result<SplitSummary> {
    let store = PartitionStore::new(config.season_root());
    info!(root = %store.root().display(), "resplitting match view");
    MatchViewSplitter::new(store).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_root_joins_data_root_and_season() {
        let config = SyncConfig {
            data_root: PathBuf::from("/tmp/data"),
            season: "2024-2025".into(),
            ..Default::default()
        };
        assert_eq!(config.season_root(), PathBuf::from("/tmp/data/2024-2025"));
    }

    #[test]
    fn rest_source_requires_an_api_url() {
        let err = build_source(&SyncConfig::default()).err().expect("error");
        assert!(err.to_string().contains("SPS_API_URL"));
    }

    #[test]
    fn rest_source_builds_with_key_headers() {
        let config = SyncConfig {
            api_url: Some("https://example.test".into()),
            api_key: Some("secret".into()),
            ..Default::default()
        };
        let source = build_source(&config).expect("source");
        assert_eq!(source.source_id(), "https://example.test/");
    }

    #[test]
    fn ledger_paths_use_forward_slashes() {
        let mut ledger = WriteLedger::default();
        ledger.record(
            RecordKind::Match,
            PartitionWrite {
                relative_path: Path::new("By Gameweek").join("GW4").join("matches.csv"),
                outcome: WriteOutcome::Created,
                rows: 1,
                columns: 3,
                content_hash: None,
            },
        );
        assert_eq!(
            ledger.outcome_of("By Gameweek/GW4/matches.csv"),
            Some(WriteOutcome::Created)
        );
        assert_eq!(ledger.count(WriteOutcome::Created), 1);
        assert!(!ledger.has_failures());
    }
}
