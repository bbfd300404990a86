//! Partition Router: maps record batches onto the season's partition trees.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use sps_core::{normalize_key_cell, parse_gameweek, Gameweek, RecordKind, Table, MATCH_ID};
use tracing::warn;

pub const BY_GAMEWEEK: &str = "By Gameweek";
pub const BY_TOURNAMENT: &str = "By Tournament";
pub const MATCH_VIEW_GAMEWEEKS: &str = "gameweeks";

/// Immutable tournament code -> display name mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TournamentMap {
    names: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TournamentsFile {
    #[serde(default)]
    tournaments: BTreeMap<String, String>,
}

impl Default for TournamentMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TournamentMap {
    pub fn builtin() -> Self {
        Self::empty().with("epl", "English Premier League")
    }

    pub fn empty() -> Self {
        Self {
            names: BTreeMap::new(),
        }
    }

    pub fn with(mut self, code: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(code.into(), name.into());
        self
    }

    /// Parses `{ tournaments: { <code>: <name> } }`.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TournamentsFile =
            serde_yaml::from_str(text).context("parsing tournaments yaml")?;
        Ok(Self { names: file.tournaments })
    }

    /// Built-in map overlaid with the entries of `path`. A missing file
    /// leaves the built-in map as is.
    pub fn load_layered(path: &Path) -> Result<Self> {
        let mut map = Self::builtin();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let file = Self::from_yaml_str(&text)
                    .with_context(|| format!("loading {}", path.display()))?;
                map.names.extend(file.names);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        }
        Ok(map)
    }

    pub fn get(&self, code: &str) -> Option<&str> {
        self.names.get(code).map(String::as_str)
    }

    /// Display name for `code`, falling back to the raw code.
    pub fn display_name<'a>(&'a self, code: &'a str) -> &'a str {
        self.get(code).unwrap_or(code)
    }
}

/// `2526-12-epl-7` -> `epl`.
pub fn tournament_code(match_id: &str) -> Option<&str> {
    match_id
        .trim()
        .split('-')
        .nth(2)
        .filter(|code| !code.is_empty())
}

/// Makes a display name usable as a single directory component. Names that
/// would resolve to the parent or current directory get a `_` prefix.
pub fn directory_safe(name: &str) -> String {
    let cleaned = name.trim().replace(['/', '\\'], "-");
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

pub fn gameweek_dir_name(gameweek: Gameweek) -> String {
    format!("GW{gameweek}")
}

/// A directory within the season root that holds one file per record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// The season root itself.
    Master,
    Gameweek(Gameweek),
    Tournament { tournament: String, gameweek: Gameweek },
    /// `<table>/gameweeks/GW<n>` of the match-level view.
    MatchViewGameweek(Gameweek),
    /// `playermatchstats/gameweeks/GW<n>/matches/<match_id>`.
    MatchViewMatch { gameweek: Gameweek, match_id: String },
}

impl Partition {
    /// Directory, relative to the season root, holding `kind`'s file.
    pub fn dir(&self, kind: RecordKind) -> PathBuf {
        match self {
            Partition::Master => PathBuf::new(),
            Partition::Gameweek(gw) => Path::new(BY_GAMEWEEK).join(gameweek_dir_name(*gw)),
            Partition::Tournament {
                tournament,
                gameweek,
            } => Path::new(BY_TOURNAMENT)
                .join(directory_safe(tournament))
                .join(gameweek_dir_name(*gameweek)),
            Partition::MatchViewGameweek(gw) => Path::new(kind.source_table())
                .join(MATCH_VIEW_GAMEWEEKS)
                .join(gameweek_dir_name(*gw)),
            Partition::MatchViewMatch { gameweek, match_id } => {
                Path::new(RecordKind::PlayerMatchStat.source_table())
                    .join(MATCH_VIEW_GAMEWEEKS)
                    .join(gameweek_dir_name(*gameweek))
                    .join("matches")
                    .join(directory_safe(match_id))
            }
        }
    }

    pub fn file(&self, kind: RecordKind) -> PathBuf {
        self.dir(kind).join(kind.file_name())
    }
}

/// Row groups of one table keyed by partition, plus the number of rows that
/// could not be routed.
#[derive(Debug, Clone)]
pub struct Routed<K: Ord> {
    template: Table,
    groups: BTreeMap<K, Vec<usize>>,
    source: Table,
    pub excluded: usize,
}

impl<K: Ord> Routed<K> {
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.groups.keys()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.groups.contains_key(key)
    }

    /// Empty table with the source columns.
    pub fn empty(&self) -> Table {
        self.template.clone()
    }

    /// Rows routed to each of `keys`, in the order of `keys`.
    pub fn slice_many<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Table
    where
        K: 'a,
    {
        let indices: Vec<usize> = keys
            .into_iter()
            .filter_map(|key| self.groups.get(key))
            .flatten()
            .copied()
            .collect();
        self.source.select_rows(&indices)
    }

    /// Rows routed to `key`; an absent key yields an empty table that keeps
    /// the source columns.
    pub fn slice(&self, key: &K) -> Table {
        match self.groups.get(key) {
            Some(indices) => self.source.select_rows(indices),
            None => self.empty(),
        }
    }
}

/// Groups rows by an arbitrary routing function; rows for which it returns
/// `None` are counted as excluded.
pub fn route_rows<K: Ord>(
    table: &Table,
    mut key_of: impl FnMut(&sps_core::RowRef<'_>) -> Option<K>,
) -> Routed<K> {
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    let mut excluded = 0usize;
    for (idx, row) in table.iter_rows().enumerate() {
        match key_of(&row) {
            Some(key) => groups.entry(key).or_default().push(idx),
            None => excluded += 1,
        }
    }
    Routed {
        template: Table::new(table.columns().iter().cloned()),
        groups,
        source: table.clone(),
        excluded,
    }
}

/// Routes by the coerced integer value of `column`.
pub fn route_by_gameweek(table: &Table, column: &str) -> Routed<Gameweek> {
    let routed = route_rows(table, |row| parse_gameweek(row.get(column)));
    if routed.excluded > 0 {
        warn!(
            column,
            excluded = routed.excluded,
            "rows without a usable gameweek left out of gameweek partitions"
        );
    }
    routed
}

/// Routes rows carrying both a gameweek and a tournament helper value.
pub fn route_by_tournament(
    table: &Table,
    gameweek_column: &str,
    tournament_column: &str,
) -> Routed<(Gameweek, String)> {
    let routed = route_rows(table, |row| {
        let gameweek = parse_gameweek(row.get(gameweek_column))?;
        let tournament = row.get(tournament_column)?.trim();
        (!tournament.is_empty()).then(|| (gameweek, tournament.to_string()))
    });
    if routed.excluded > 0 {
        warn!(
            excluded = routed.excluded,
            "rows without gameweek or tournament left out of tournament partitions"
        );
    }
    routed
}

/// Routes rows by their normalized `match_id`.
pub fn route_by_match(table: &Table) -> Routed<String> {
    route_rows(table, |row| normalize_key_cell(row.get(MATCH_ID)))
}

/// Resolves the tournament directory name for every match row. Unresolvable
/// ids yield `None`.
pub fn tournament_names(matches: &Table, tournaments: &TournamentMap) -> Vec<Option<String>> {
    let mut unmapped: HashMap<String, usize> = HashMap::new();
    let mut missing = 0usize;
    let names = matches
        .iter_rows()
        .map(|row| {
            let Some(code) = row.get(MATCH_ID).and_then(tournament_code) else {
                missing += 1;
                return None;
            };
            if tournaments.get(code).is_none() {
                *unmapped.entry(code.to_string()).or_default() += 1;
            }
            Some(directory_safe(tournaments.display_name(code)))
        })
        .collect();
    if missing > 0 {
        warn!(rows = missing, "match ids without a tournament code");
    }
    for (code, rows) in unmapped {
        warn!(code = %code, rows, "unmapped tournament code; using it as the name");
    }
    names
}
