use std::collections::HashMap;

use sps_core::{normalize_key_cell, Table};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("no key columns given")]
    EmptyKey,
    #[error("key column {0:?} missing after reconciliation")]
    MissingKeyColumn(String),
    #[error("existing and incoming tables were not reconciled to one schema")]
    SchemaMismatch,
}

/// Appends `incoming` after `existing` and keeps, for every key, only the
/// last row in that order.
///
/// Survivors stay at the position of their last occurrence, so re-applying
/// the same batch to the result reproduces it exactly. A duplicate key
/// inside the batch resolves to its last occurrence. The surviving row
/// replaces the earlier one whole; nulls are not back-filled.
pub fn merge_keep_last(existing: Table, incoming: Table, key: &[&str]) -> Result<Table, MergeError> {
    if key.is_empty() {
        return Err(MergeError::EmptyKey);
    }
    if existing.columns() != incoming.columns() {
        return Err(MergeError::SchemaMismatch);
    }
    let key_idx = key
        .iter()
        .map(|column| {
            existing
                .column_index(column)
                .ok_or_else(|| MergeError::MissingKeyColumn(column.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let columns = existing.columns().to_vec();
    let rows: Vec<_> = existing
        .into_rows()
        .into_iter()
        .chain(incoming.into_rows())
        .collect();

    let mut last_seen: HashMap<Vec<Option<String>>, usize> = HashMap::with_capacity(rows.len());
    for (pos, row) in rows.iter().enumerate() {
        let key = key_idx
            .iter()
            .map(|&idx| normalize_key_cell(row[idx].as_deref()))
            .collect();
        last_seen.insert(key, pos);
    }

    let mut survivors: Vec<usize> = last_seen.into_values().collect();
    survivors.sort_unstable();

    let mut rows: Vec<Option<_>> = rows.into_iter().map(Some).collect();
    let kept = survivors
        .into_iter()
        .filter_map(|pos| rows[pos].take())
        .collect();

    Table::with_rows(columns, kept).map_err(|_| MergeError::SchemaMismatch)
}
