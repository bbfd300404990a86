use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use sps_adapters::RecordSource;
use sps_core::{
    normalize_key_cell, parse_flag, parse_gameweek, Cell, Gameweek, RecordKind, Table, FINISHED,
    GAMEWEEK, MATCH_ID, PLAYER_ID, PLAYER_STAT_GW, PLAYER_STAT_ID, TOURNAMENT,
};
use sps_storage::PartitionStore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::router::{
    route_by_gameweek, route_by_match, route_by_tournament, tournament_names, Partition, Routed,
    TournamentMap,
};
use crate::window::WindowPolicy;
use crate::{upsert_partition, SyncConfig, SyncMode, SyncRunSummary, WriteLedger};

/// Master snapshots fetched in full on every run.
struct Masters {
    players: Table,
    teams: Table,
    player_stats: Table,
}

/// The fetched match window split into its routed pieces.
struct WindowBatches {
    finished: Table,
    fixtures: Table,
    player_match_stats: Table,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn RecordSource>,
    store: PartitionStore,
    tournaments: TournamentMap,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn RecordSource>, tournaments: TournamentMap) -> Self {
        let store = PartitionStore::new(config.season_root());
        Self {
            config,
            source,
            store,
            tournaments,
        }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, season = %self.config.season);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        info!(
            source = self.source.source_id(),
            root = %self.store.root().display(),
            mode = ?self.config.mode,
            "sync run started"
        );

        let masters = Masters {
            players: self.fetch_all(RecordKind::Player).await?,
            teams: self.fetch_all(RecordKind::Team).await?,
            player_stats: self.fetch_all(RecordKind::PlayerStat).await?,
        };

        let history = self.fetch_all(RecordKind::Match).await?;
        let (policy, mut window) = match self.config.mode {
            SyncMode::Full => (WindowPolicy::open(), history),
            SyncMode::Incremental => {
                let policy = WindowPolicy::from_matches(&history);
                let window = match policy.watermark() {
                    Some(watermark) => self
                        .source
                        .fetch_since(RecordKind::Match, watermark)
                        .await
                        .with_context(|| format!("fetching matches since gameweek {watermark}"))?,
                    None => history,
                };
                (policy, window)
            }
        };
        info!(
            watermark = ?policy.watermark(),
            matches = window.len(),
            "match window selected"
        );

        let mut summary = SyncRunSummary {
            run_id,
            season: self.config.season.clone(),
            mode: self.config.mode,
            source: self.source.source_id().to_string(),
            started_at,
            finished_at: started_at,
            watermark: policy.watermark(),
            window_matches: window.len(),
            finished_matches: 0,
            fixtures: 0,
            player_match_stats: 0,
            gameweeks: Vec::new(),
            sealed_gameweeks: Vec::new(),
            excluded_rows: 0,
            ledger: WriteLedger::default(),
        };

        if window.is_empty() {
            info!("match window is empty; updating master files only");
            self.write_masters(&mut summary.ledger, &masters).await;
            return Ok(finish(summary));
        }

        let names = tournament_names(&window, &self.tournaments);
        window
            .set_column(TOURNAMENT, names)
            .context("tagging matches with their tournament")?;

        let finished = window.filter_rows(|row| parse_flag(row.get(FINISHED)) == Some(true));
        let fixtures = window.filter_rows(|row| parse_flag(row.get(FINISHED)) == Some(false));
        let unflagged = window.len() - finished.len() - fixtures.len();
        if unflagged > 0 {
            warn!(rows = unflagged, "matches without a usable finished flag left out");
            summary.excluded_rows += unflagged;
        }

        let finished_ids = distinct_ids(&finished, MATCH_ID);
        let mut player_match_stats = if finished_ids.is_empty() {
            Table::default()
        } else {
            self.source
                .fetch_by_parent_ids(RecordKind::PlayerMatchStat, MATCH_ID, &finished_ids)
                .await
                .context("fetching player match stats for finished matches")?
        };
        if !player_match_stats.is_empty() {
            attach_match_columns(&mut player_match_stats, &finished)?;
        }

        summary.finished_matches = finished.len();
        summary.fixtures = fixtures.len();
        summary.player_match_stats = player_match_stats.len();
        info!(
            finished = finished.len(),
            fixtures = fixtures.len(),
            player_match_stats = player_match_stats.len(),
            "window fetched"
        );

        let batches = WindowBatches {
            finished,
            fixtures,
            player_match_stats,
        };
        self.write_gameweek_tree(&mut summary, &policy, &batches, &masters)
            .await;
        self.write_tournament_tree(&mut summary, &policy, &batches, &masters)
            .await;
        if self.config.match_view {
            self.write_match_view(&mut summary, &policy, &batches, &masters)
                .await;
        }
        self.write_masters(&mut summary.ledger, &masters).await;

        Ok(finish(summary))
    }

    async fn fetch_all(&self, kind: RecordKind) -> Result<Table> {
        let table = self
            .source
            .fetch_all(kind)
            .await
            .with_context(|| format!("fetching {kind}"))?;
        info!(kind = %kind, rows = table.len(), "fetched full snapshot");
        Ok(table)
    }

    async fn upsert(&self, ledger: &mut WriteLedger, partition: &Partition, kind: RecordKind, batch: &Table) {
        upsert_partition(&self.store, ledger, partition, kind, batch).await;
    }

    async fn write_masters(&self, ledger: &mut WriteLedger, masters: &Masters) {
        let root = Partition::Master;
        self.upsert(ledger, &root, RecordKind::Player, &masters.players).await;
        self.upsert(ledger, &root, RecordKind::Team, &masters.teams).await;
        self.upsert(ledger, &root, RecordKind::PlayerStat, &masters.player_stats)
            .await;
    }

    async fn write_replicas(&self, ledger: &mut WriteLedger, partition: &Partition, masters: &Masters) {
        self.upsert(ledger, partition, RecordKind::Player, &masters.players).await;
        self.upsert(ledger, partition, RecordKind::Team, &masters.teams).await;
    }

    async fn write_gameweek_tree(
        &self,
        summary: &mut SyncRunSummary,
        policy: &WindowPolicy,
        batches: &WindowBatches,
        masters: &Masters,
    ) {
        let finished = route_by_gameweek(&batches.finished, GAMEWEEK);
        let fixtures = route_by_gameweek(&batches.fixtures, GAMEWEEK);
        let pms = route_by_gameweek(&batches.player_match_stats, GAMEWEEK);
        let stats = route_by_gameweek(&masters.player_stats, PLAYER_STAT_GW);
        summary.excluded_rows +=
            finished.excluded + fixtures.excluded + pms.excluded + stats.excluded;

        let gameweeks: BTreeSet<Gameweek> = finished.keys().chain(fixtures.keys()).copied().collect();
        summary.gameweeks = gameweeks.iter().copied().collect();

        for &gameweek in &gameweeks {
            let partition = Partition::Gameweek(gameweek);
            let ledger = &mut summary.ledger;
            self.upsert(
                ledger,
                &partition,
                RecordKind::Match,
                &finished.slice(&gameweek).drop_columns(&[TOURNAMENT]),
            )
            .await;
            self.upsert(
                ledger,
                &partition,
                RecordKind::Fixture,
                &fixtures.slice(&gameweek).drop_columns(&[TOURNAMENT]),
            )
            .await;
            if policy.is_sealed(gameweek) {
                info!(gameweek, "gameweek is sealed; stats partitions left untouched");
                if !summary.sealed_gameweeks.contains(&gameweek) {
                    summary.sealed_gameweeks.push(gameweek);
                }
            } else {
                let ledger = &mut summary.ledger;
                self.upsert(
                    ledger,
                    &partition,
                    RecordKind::PlayerMatchStat,
                    &pms.slice(&gameweek).drop_columns(&[GAMEWEEK, TOURNAMENT]),
                )
                .await;
                self.upsert(ledger, &partition, RecordKind::PlayerStat, &stats.slice(&gameweek))
                    .await;
            }
            self.write_replicas(&mut summary.ledger, &partition, masters).await;
        }
    }

    async fn write_tournament_tree(
        &self,
        summary: &mut SyncRunSummary,
        policy: &WindowPolicy,
        batches: &WindowBatches,
        masters: &Masters,
    ) {
        let finished = route_by_tournament(&batches.finished, GAMEWEEK, TOURNAMENT);
        let fixtures = route_by_tournament(&batches.fixtures, GAMEWEEK, TOURNAMENT);
        let pms_by_match = route_by_match(&batches.player_match_stats);
        let stats = route_by_gameweek(&masters.player_stats, PLAYER_STAT_GW);
        summary.excluded_rows += finished.excluded + fixtures.excluded;

        let groups: BTreeSet<(Gameweek, String)> =
            finished.keys().chain(fixtures.keys()).cloned().collect();

        for group in &groups {
            let (gameweek, tournament) = group;
            let partition = Partition::Tournament {
                tournament: tournament.clone(),
                gameweek: *gameweek,
            };
            let group_finished = finished.slice(group);
            let ledger = &mut summary.ledger;
            self.upsert(
                ledger,
                &partition,
                RecordKind::Match,
                &group_finished.drop_columns(&[TOURNAMENT]),
            )
            .await;
            self.upsert(
                ledger,
                &partition,
                RecordKind::Fixture,
                &fixtures.slice(group).drop_columns(&[TOURNAMENT]),
            )
            .await;

            if policy.is_sealed(*gameweek) {
                if !summary.sealed_gameweeks.contains(gameweek) {
                    summary.sealed_gameweeks.push(*gameweek);
                }
            } else {
                let group_pms = concat_slices(&pms_by_match, &distinct_ids(&group_finished, MATCH_ID));
                let players: HashSet<String> = group_pms
                    .iter_rows()
                    .filter_map(|row| normalize_key_cell(row.get(PLAYER_ID)))
                    .collect();
                let group_stats = stats.slice(gameweek).filter_rows(|row| {
                    normalize_key_cell(row.get(PLAYER_STAT_ID)).is_some_and(|id| players.contains(&id))
                });
                let ledger = &mut summary.ledger;
                self.upsert(
                    ledger,
                    &partition,
                    RecordKind::PlayerMatchStat,
                    &group_pms.drop_columns(&[GAMEWEEK, TOURNAMENT]),
                )
                .await;
                self.upsert(ledger, &partition, RecordKind::PlayerStat, &group_stats).await;
            }
            self.write_replicas(&mut summary.ledger, &partition, masters).await;
        }
    }

    async fn write_match_view(
        &self,
        summary: &mut SyncRunSummary,
        policy: &WindowPolicy,
        batches: &WindowBatches,
        masters: &Masters,
    ) {
        let all_matches = batches.finished.appended(&batches.fixtures);
        let matches = route_by_gameweek(&all_matches, GAMEWEEK);
        let pms = route_by_gameweek(&batches.player_match_stats, GAMEWEEK);
        let stats = route_by_gameweek(&masters.player_stats, PLAYER_STAT_GW);

        for &gameweek in matches.keys() {
            let ledger = &mut summary.ledger;
            upsert_partition(
                &self.store,
                ledger,
                &Partition::MatchViewGameweek(gameweek),
                RecordKind::Match,
                &matches.slice(&gameweek).drop_columns(&[TOURNAMENT]),
            )
            .await;
            if policy.is_sealed(gameweek) {
                continue;
            }
            write_match_view_stats(
                &self.store,
                ledger,
                gameweek,
                &pms.slice(&gameweek).drop_columns(&[GAMEWEEK, TOURNAMENT]),
                &stats.slice(&gameweek),
            )
            .await;
        }
    }
}

/// Writes the PlayerMatchStat (per gameweek and per match) and PlayerStat
/// files of one gameweek of the match-level view.
pub(crate) async fn write_match_view_stats(
    store: &PartitionStore,
    ledger: &mut WriteLedger,
    gameweek: Gameweek,
    player_match_stats: &Table,
    player_stats: &Table,
) {
    let gameweek_partition = Partition::MatchViewGameweek(gameweek);
    upsert_partition(
        store,
        ledger,
        &gameweek_partition,
        RecordKind::PlayerMatchStat,
        player_match_stats,
    )
    .await;
    let by_match = route_by_match(player_match_stats);
    for match_id in by_match.keys() {
        upsert_partition(
            store,
            ledger,
            &Partition::MatchViewMatch {
                gameweek,
                match_id: match_id.clone(),
            },
            RecordKind::PlayerMatchStat,
            &by_match.slice(match_id),
        )
        .await;
    }
    upsert_partition(
        store,
        ledger,
        &gameweek_partition,
        RecordKind::PlayerStat,
        player_stats,
    )
    .await;
}

fn finish(mut summary: SyncRunSummary) -> SyncRunSummary {
    summary.finished_at = Utc::now();
    summary.sealed_gameweeks.sort_unstable();
    info!(
        writes = summary.ledger.writes.len(),
        failed = summary.ledger.failed_partitions.len(),
        excluded = summary.excluded_rows,
        "sync run finished"
    );
    summary
}

/// Distinct non-null values of `column`, in first-seen order.
fn distinct_ids(table: &Table, column: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    table
        .iter_rows()
        .filter_map(|row| row.get(column))
        .filter(|raw| {
            normalize_key_cell(Some(*raw)).is_some_and(|key| seen.insert(key))
        })
        .map(str::to_string)
        .collect()
}

/// Joins `gameweek` and `tournament` from the finished matches onto the
/// PlayerMatchStat rows by `match_id`.
fn attach_match_columns(player_match_stats: &mut Table, finished: &Table) -> Result<()> {
    let by_match: HashMap<String, (Cell, Cell)> = finished
        .iter_rows()
        .filter_map(|row| {
            let key = normalize_key_cell(row.get(MATCH_ID))?;
            let gameweek = parse_gameweek(row.get(GAMEWEEK)).map(|gw| gw.to_string());
            let tournament = row.get(TOURNAMENT).map(str::to_string);
            Some((key, (gameweek, tournament)))
        })
        .collect();

    let (gameweeks, tournaments): (Vec<Cell>, Vec<Cell>) = player_match_stats
        .iter_rows()
        .map(|row| {
            normalize_key_cell(row.get(MATCH_ID))
                .and_then(|key| by_match.get(&key).cloned())
                .unwrap_or((None, None))
        })
        .unzip();

    player_match_stats
        .set_column(GAMEWEEK, gameweeks)
        .context("attaching gameweek to player match stats")?;
    player_match_stats
        .set_column(TOURNAMENT, tournaments)
        .context("attaching tournament to player match stats")?;
    Ok(())
}

/// Rows routed to each of `ids`, in the order of `ids`.
fn concat_slices(routed: &Routed<String>, ids: &[String]) -> Table {
    let keys: Vec<String> = ids
        .iter()
        .filter_map(|id| normalize_key_cell(Some(id.as_str())))
        .collect();
    routed.slice_many(&keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn player_match_stats_pick_up_gameweek_and_tournament() {
        let finished = Table::from_json_rows(&[
            json!({"match_id": "2526-4-epl-1", "gameweek": 4.0, "tournament": "English Premier League"}),
        ])
        .unwrap();
        let mut pms = Table::from_json_rows(&[
            json!({"player_id": 1, "match_id": "2526-4-epl-1", "goals": 2}),
            json!({"player_id": 2, "match_id": "orphan", "goals": 0}),
        ])
        .unwrap();
        attach_match_columns(&mut pms, &finished).unwrap();
        assert_eq!(pms.value(0, GAMEWEEK), Some("4"));
        assert_eq!(pms.value(0, TOURNAMENT), Some("English Premier League"));
        assert_eq!(pms.value(1, GAMEWEEK), None);
    }

    #[test]
    fn distinct_ids_keep_first_seen_order() {
        let table = Table::from_json_rows(&[
            json!({"match_id": "b"}),
            json!({"match_id": "a"}),
            json!({"match_id": "b"}),
            json!({"match_id": null}),
        ])
        .unwrap();
        assert_eq!(distinct_ids(&table, MATCH_ID), vec!["b", "a"]);
    }

    #[test]
    fn concat_slices_follow_requested_ids() {
        let pms = Table::from_json_rows(&[
            json!({"player_id": 1, "match_id": "m1"}),
            json!({"player_id": 2, "match_id": "m2"}),
            json!({"player_id": 3, "match_id": "m1"}),
        ])
        .unwrap();
        let routed = route_by_match(&pms);
        let out = concat_slices(&routed, &["m2".to_string(), "m1".to_string(), "m9".to_string()]);
        let players: Vec<_> = out.iter_rows().filter_map(|r| r.get(PLAYER_ID)).collect();
        assert_eq!(players, vec!["2", "1", "3"]);
        assert_eq!(out.columns(), pms.columns());
    }
}
