//! Rebuilds the match-level view from the local master files.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use sps_core::{
    normalize_key_cell, parse_gameweek, Cell, Gameweek, RecordKind, Table, GAMEWEEK, MATCH_ID,
    PLAYER_STAT_GW,
};
use sps_storage::PartitionStore;
use tracing::{info, warn};

use crate::pipeline::write_match_view_stats;
use crate::router::{route_by_gameweek, Partition};
use crate::window::WindowPolicy;
use crate::{upsert_partition, WriteLedger};

#[derive(Debug, Clone, Serialize)]
pub struct SplitSummary {
    pub root: String,
    pub watermark: Option<Gameweek>,
    pub gameweeks: Vec<Gameweek>,
    pub sealed_gameweeks: Vec<Gameweek>,
    pub excluded_rows: usize,
    #[serde(flatten)]
    pub ledger: WriteLedger,
}

impl SplitSummary {
    pub fn has_failures(&self) -> bool {
        self.ledger.has_failures()
    }
}

/// Splits `matches/matches.csv`, `playermatchstats/playermatchstats.csv` and
/// `playerstats/playerstats.csv` into `<table>/gameweeks/GW<n>/` partitions.
/// Gameweeks below the watermark are left alone for every record type.
pub struct MatchViewSplitter {
    store: PartitionStore,
}

impl MatchViewSplitter {
    pub fn new(store: PartitionStore) -> Self {
        Self { store }
    }

    pub fn master_path(kind: RecordKind) -> PathBuf {
        PathBuf::from(kind.source_table()).join(kind.file_name())
    }

    async fn read_master(&self, kind: RecordKind) -> Result<Option<Table>> {
        let path = Self::master_path(kind);
        let table = self
            .store
            .read(&path)
            .await
            .with_context(|| format!("reading master {}", path.display()))?;
        if table.is_none() {
            warn!(path = %path.display(), "master file not found; skipping");
        }
        Ok(table)
    }

    pub async fn run(&self) -> Result<SplitSummary> {
        let matches = self.read_master(RecordKind::Match).await?;
        let player_match_stats = self.read_master(RecordKind::PlayerMatchStat).await?;
        let player_stats = self.read_master(RecordKind::PlayerStat).await?;

        let policy = matches
            .as_ref()
            .map(WindowPolicy::from_matches)
            .unwrap_or_default();
        info!(watermark = ?policy.watermark(), "match view watermark");

        let mut summary = SplitSummary {
            root: self.store.root().display().to_string(),
            watermark: policy.watermark(),
            gameweeks: Vec::new(),
            sealed_gameweeks: Vec::new(),
            excluded_rows: 0,
            ledger: WriteLedger::default(),
        };

        let empty = Table::default();
        let matches_by_gw = route_by_gameweek(matches.as_ref().unwrap_or(&empty), GAMEWEEK);
        summary.excluded_rows += matches_by_gw.excluded;

        // Stats rows only gain a gameweek through their match.
        let pms = match (&player_match_stats, &matches) {
            (Some(pms), Some(matches)) => Some(with_match_gameweek(pms, matches)?),
            (Some(_), None) => {
                warn!("player match stats need matches/matches.csv for their gameweek; skipping");
                None
            }
            _ => None,
        };
        let pms_by_gw = route_by_gameweek(pms.as_ref().unwrap_or(&empty), GAMEWEEK);
        let stats_by_gw = route_by_gameweek(player_stats.as_ref().unwrap_or(&empty), PLAYER_STAT_GW);
        summary.excluded_rows += pms_by_gw.excluded + stats_by_gw.excluded;

        let mut gameweeks: Vec<Gameweek> = matches_by_gw
            .keys()
            .chain(pms_by_gw.keys())
            .chain(stats_by_gw.keys())
            .copied()
            .collect();
        gameweeks.sort_unstable();
        gameweeks.dedup();

        for gameweek in gameweeks {
            if policy.is_sealed(gameweek) {
                info!(gameweek, "gameweek is sealed; skipping");
                summary.sealed_gameweeks.push(gameweek);
                continue;
            }
            summary.gameweeks.push(gameweek);

            if matches_by_gw.contains(&gameweek) {
                upsert_partition(
                    &self.store,
                    &mut summary.ledger,
                    &Partition::MatchViewGameweek(gameweek),
                    RecordKind::Match,
                    &matches_by_gw.slice(&gameweek),
                )
                .await;
            }
            write_match_view_stats(
                &self.store,
                &mut summary.ledger,
                gameweek,
                &pms_by_gw.slice(&gameweek).drop_columns(&[GAMEWEEK]),
                &stats_by_gw.slice(&gameweek),
            )
            .await;
        }

        info!(
            writes = summary.ledger.writes.len(),
            failed = summary.ledger.failed_partitions.len(),
            "match view split finished"
        );
        Ok(summary)
    }
}

/// Copy of `player_match_stats` with the `gameweek` of each row's match.
fn with_match_gameweek(player_match_stats: &Table, matches: &Table) -> Result<Table> {
    let by_match: HashMap<String, Gameweek> = matches
        .iter_rows()
        .filter_map(|row| {
            Some((
                normalize_key_cell(row.get(MATCH_ID))?,
                parse_gameweek(row.get(GAMEWEEK))?,
            ))
        })
        .collect();
    let gameweeks: Vec<Cell> = player_match_stats
        .iter_rows()
        .map(|row| {
            normalize_key_cell(row.get(MATCH_ID))
                .and_then(|key| by_match.get(&key))
                .map(|gw| gw.to_string())
        })
        .collect();
    let mut out = player_match_stats.clone();
    out.set_column(GAMEWEEK, gameweeks)
        .context("attaching gameweek to player match stats")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &std::path::Path, kind: RecordKind, body: &str) {
        let path = root.join(MatchViewSplitter::master_path(kind));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn splits_from_the_watermark_onward() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            RecordKind::Match,
            "match_id,gameweek,finished\nm1,1,True\nm2,2,True\nm3,3,False\n",
        );
        write(
            dir.path(),
            RecordKind::PlayerMatchStat,
            "player_id,match_id,goals\np1,m1,1\np1,m2,2\np2,m2,0\n",
        );
        write(
            dir.path(),
            RecordKind::PlayerStat,
            "id,gw,total_points\np1,1,2\np1,2,9\np1,3,\n",
        );

        let summary = MatchViewSplitter::new(PartitionStore::new(dir.path()))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.watermark, Some(2));
        assert_eq!(summary.sealed_gameweeks, vec![1]);
        assert_eq!(summary.gameweeks, vec![2, 3]);
        assert!(!summary.has_failures());

        let root = dir.path();
        assert!(!root.join("matches/gameweeks/GW1").exists());
        assert_eq!(
            fs::read_to_string(root.join("matches/gameweeks/GW2/matches.csv")).unwrap(),
            "match_id,gameweek,finished\nm2,2,True\n"
        );
        assert_eq!(
            fs::read_to_string(root.join("playermatchstats/gameweeks/GW2/playermatchstats.csv"))
                .unwrap(),
            "player_id,match_id,goals\np1,m2,2\np2,m2,0\n"
        );
        assert!(root
            .join("playermatchstats/gameweeks/GW2/matches/m2/playermatchstats.csv")
            .exists());
        assert_eq!(
            fs::read_to_string(root.join("playerstats/gameweeks/GW3/playerstats.csv")).unwrap(),
            "id,gw,total_points\np1,3,\n"
        );
    }

    #[tokio::test]
    async fn missing_masters_are_skipped() {
        let dir = tempdir().unwrap();
        write(dir.path(), RecordKind::PlayerStat, "id,gw\np1,5\n");
        let summary = MatchViewSplitter::new(PartitionStore::new(dir.path()))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.watermark, None);
        assert_eq!(summary.gameweeks, vec![5]);
        assert!(dir
            .path()
            .join("playerstats/gameweeks/GW5/playerstats.csv")
            .exists());
        assert!(!dir.path().join("matches/gameweeks").exists());
    }
}
