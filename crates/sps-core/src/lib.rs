//! Core record catalog, tabular model and value coercions for SPS.

use serde::{Deserialize, Serialize};

mod table;

pub use table::{Cell, RowRef, Table, TableError};

pub const CRATE_NAME: &str = "sps-core";

pub const MATCH_ID: &str = "match_id";
pub const PLAYER_ID: &str = "player_id";
pub const GAMEWEEK: &str = "gameweek";
pub const FINISHED: &str = "finished";
pub const TOURNAMENT: &str = "tournament";
pub const PLAYER_STAT_ID: &str = "id";
pub const PLAYER_STAT_GW: &str = "gw";
pub const TEAM_ID: &str = "id";

/// Gameweek number as used in partition paths (`GW<n>`).
pub type Gameweek = u32;

/// Every record type the sync engine persists.
///
/// `Fixture` is not an upstream table of its own: it is the unfinished slice
/// of the match table, persisted to its own file next to `matches.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Player,
    Team,
    PlayerStat,
    Match,
    Fixture,
    PlayerMatchStat,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Player,
        RecordKind::Team,
        RecordKind::PlayerStat,
        RecordKind::Match,
        RecordKind::Fixture,
        RecordKind::PlayerMatchStat,
    ];

    /// File name used for this record type in every partition directory.
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Player => "players.csv",
            RecordKind::Team => "teams.csv",
            RecordKind::PlayerStat => "playerstats.csv",
            RecordKind::Match => "matches.csv",
            RecordKind::Fixture => "fixtures.csv",
            RecordKind::PlayerMatchStat => "playermatchstats.csv",
        }
    }

    /// Business key; rows of one partition file are unique on these columns.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            RecordKind::Player => &[PLAYER_ID],
            RecordKind::Team => &[TEAM_ID],
            RecordKind::PlayerStat => &[PLAYER_STAT_ID, PLAYER_STAT_GW],
            RecordKind::Match | RecordKind::Fixture => &[MATCH_ID],
            RecordKind::PlayerMatchStat => &[PLAYER_ID, MATCH_ID],
        }
    }

    /// Upstream table the fetch layer reads this record type from.
    pub fn source_table(self) -> &'static str {
        match self {
            RecordKind::Player => "players",
            RecordKind::Team => "teams",
            RecordKind::PlayerStat => "playerstats",
            RecordKind::Match | RecordKind::Fixture => "matches",
            RecordKind::PlayerMatchStat => "playermatchstats",
        }
    }

    /// Column carrying the gameweek, if the record type has one of its own.
    /// PlayerMatchStat rows only get `gameweek` once joined against matches.
    pub fn gameweek_column(self) -> Option<&'static str> {
        match self {
            RecordKind::Player | RecordKind::Team => None,
            RecordKind::PlayerStat => Some(PLAYER_STAT_GW),
            RecordKind::Match | RecordKind::Fixture | RecordKind::PlayerMatchStat => Some(GAMEWEEK),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RecordKind::Player => "players",
            RecordKind::Team => "teams",
            RecordKind::PlayerStat => "playerstats",
            RecordKind::Match => "matches",
            RecordKind::Fixture => "fixtures",
            RecordKind::PlayerMatchStat => "playermatchstats",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Parses an integral number written either as `4` or `4.0`.
fn parse_integral(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(v);
    }
    let v = trimmed.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Some(v as i64)
    } else {
        None
    }
}

/// Coerces a gameweek cell. Missing, negative, fractional or non-numeric
/// values yield `None`.
pub fn parse_gameweek(raw: Option<&str>) -> Option<Gameweek> {
    parse_integral(raw?).and_then(|v| Gameweek::try_from(v).ok())
}

/// Coerces a boolean flag cell (`True`, `false`, `1`, `0`, ...).
pub fn parse_flag(raw: Option<&str>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" | "t" | "yes" => Some(true),
        "false" | "0" | "0.0" | "f" | "no" => Some(false),
        _ => None,
    }
}

/// Canonical form of a key cell used for deduplication.
///
/// Whitespace is trimmed, empty cells are null and integral numerics compare
/// equal regardless of a trailing `.0`.
pub fn normalize_key_cell(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    match parse_integral(trimmed) {
        Some(v) => Some(v.to_string()),
        None => Some(trimmed.to_string()),
    }
}
