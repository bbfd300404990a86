use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sps_core::{normalize_key_cell, parse_gameweek, Gameweek, RecordKind, Table};
use sps_storage::parse_table;
use tracing::{debug, info};

use crate::{windowed_column, RecordSource, SourceError};

/// Fixture-first source serving fixed tables, either built in memory or
/// loaded from a directory holding `<table>.json` (array of objects) or
/// `<table>.csv` per upstream table. Tables that are absent fetch as empty.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSource {
    label: String,
    tables: HashMap<&'static str, Table>,
}

impl SnapshotSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tables: HashMap::new(),
        }
    }

    pub fn with_table(mut self, kind: RecordKind, table: Table) -> Self {
        self.insert(kind, table);
        self
    }

    pub fn insert(&mut self, kind: RecordKind, table: Table) {
        self.tables.insert(kind.source_table(), table);
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let mut source = Self::new(dir.display().to_string());
        for kind in RecordKind::ALL {
            let name = kind.source_table();
            if source.tables.contains_key(name) {
                continue;
            }
            if let Some(table) = load_snapshot_table(dir, name)? {
                debug!(table = name, rows = table.len(), "loaded snapshot table");
                source.tables.insert(name, table);
            }
        }
        info!(dir = %dir.display(), tables = source.tables.len(), "snapshot source ready");
        Ok(source)
    }

    fn table(&self, kind: RecordKind) -> Table {
        self.tables
            .get(kind.source_table())
            .cloned()
            .unwrap_or_default()
    }
}

fn load_snapshot_table(dir: &Path, name: &str) -> Result<Option<Table>, SourceError> {
    let json_path = dir.join(format!("{name}.json"));
    if let Some(text) = read_if_exists(&json_path)? {
        let value: JsonValue =
            serde_json::from_str(&text).map_err(|err| SourceError::SnapshotParse {
                path: json_path.clone(),
                message: err.to_string(),
            })?;
        let JsonValue::Array(rows) = value else {
            return Err(SourceError::SnapshotParse {
                path: json_path,
                message: "expected a JSON array".to_string(),
            });
        };
        return Table::from_json_rows(&rows)
            .map(Some)
            .map_err(|err| SourceError::SnapshotParse {
                path: json_path,
                message: err.to_string(),
            });
    }

    let csv_path = dir.join(format!("{name}.csv"));
    if let Some(text) = read_if_exists(&csv_path)? {
        return parse_table(text.as_bytes())
            .map(Some)
            .map_err(|err| SourceError::snapshot_csv(csv_path, err));
    }
    Ok(None)
}

fn read_if_exists(path: &Path) -> Result<Option<String>, SourceError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SourceError::SnapshotIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl RecordSource for SnapshotSource {
    fn source_id(&self) -> &str {
        &self.label
    }

    async fn fetch_all(&self, kind: RecordKind) -> Result<Table, SourceError> {
        Ok(self.table(kind))
    }

    async fn fetch_since(
        &self,
        kind: RecordKind,
        gameweek: Gameweek,
    ) -> Result<Table, SourceError> {
        let column = windowed_column(kind)?;
        Ok(self
            .table(kind)
            .filter_rows(|row| parse_gameweek(row.get(column)).is_some_and(|gw| gw >= gameweek)))
    }

    async fn fetch_by_parent_ids(
        &self,
        kind: RecordKind,
        parent_key: &str,
        ids: &[String],
    ) -> Result<Table, SourceError> {
        let wanted: HashSet<String> = ids
            .iter()
            .filter_map(|id| normalize_key_cell(Some(id.as_str())))
            .collect();
        Ok(self.table(kind).filter_rows(|row| {
            normalize_key_cell(row.get(parent_key)).is_some_and(|id| wanted.contains(&id))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches() -> Table {
        Table::from_json_rows(&[
            json!({"match_id": "2526-1-epl-1", "gameweek": 1, "finished": true}),
            json!({"match_id": "2526-2-epl-2", "gameweek": 2, "finished": true}),
            json!({"match_id": "2526-3-epl-3", "gameweek": 3, "finished": false}),
            json!({"match_id": "2526-x-epl-4", "gameweek": null, "finished": false}),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn window_filters_on_gameweek_and_drops_missing() {
        let source = SnapshotSource::new("mem").with_table(RecordKind::Match, matches());
        let window = source.fetch_since(RecordKind::Match, 2).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.value(0, "match_id"), Some("2526-2-epl-2"));
        assert_eq!(window.value(1, "match_id"), Some("2526-3-epl-3"));
    }

    #[tokio::test]
    async fn fixtures_share_the_match_table() {
        let source = SnapshotSource::new("mem").with_table(RecordKind::Match, matches());
        let fixtures = source.fetch_all(RecordKind::Fixture).await.unwrap();
        assert_eq!(fixtures.len(), 4);
    }

    #[tokio::test]
    async fn absent_tables_fetch_empty() {
        let source = SnapshotSource::new("mem");
        let players = source.fetch_all(RecordKind::Player).await.unwrap();
        assert!(players.is_empty());
        assert_eq!(players.width(), 0);
        let pms = source
            .fetch_by_parent_ids(RecordKind::PlayerMatchStat, "match_id", &["m1".to_string()])
            .await
            .unwrap();
        assert!(pms.is_empty());
    }
}
