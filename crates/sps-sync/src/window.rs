//! Incremental Window Selector.

use serde::Serialize;
use sps_core::{parse_flag, parse_gameweek, Gameweek, Table, FINISHED, GAMEWEEK};

/// Latest gameweek holding at least one finished match.
pub fn latest_finished_gameweek(matches: &Table) -> Option<Gameweek> {
    matches
        .iter_rows()
        .filter(|row| parse_flag(row.get(FINISHED)) == Some(true))
        .filter_map(|row| parse_gameweek(row.get(GAMEWEEK)))
        .max()
}

/// Decides which gameweek partitions a run may touch. Gameweeks strictly
/// below the watermark are sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WindowPolicy {
    watermark: Option<Gameweek>,
    sealing: bool,
}

impl WindowPolicy {
    pub fn from_matches(matches: &Table) -> Self {
        Self::with_watermark(latest_finished_gameweek(matches))
    }

    pub fn with_watermark(watermark: Option<Gameweek>) -> Self {
        Self {
            watermark,
            sealing: true,
        }
    }

    /// Nothing is sealed; used for full rebuilds.
    pub fn open() -> Self {
        Self {
            watermark: None,
            sealing: false,
        }
    }

    pub fn watermark(&self) -> Option<Gameweek> {
        self.watermark
    }

    pub fn is_sealed(&self, gameweek: Gameweek) -> bool {
        self.sealing && self.watermark.is_some_and(|wm| gameweek < wm)
    }
}
