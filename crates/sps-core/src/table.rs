use std::collections::HashSet;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// A single cell. `None` is a null (an empty field on disk).
pub type Cell = Option<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("row {row} has {actual} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column {0:?}")]
    DuplicateColumn(String),
    #[error("row {0} is not a JSON object")]
    NotAnObject(usize),
    #[error("column has {actual} values, table has {expected} rows")]
    ColumnLength { expected: usize, actual: usize },
}

/// Row-major table of string cells with an ordered, duplicate-free header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// Borrowed view of one row, addressable by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    cells: &'a [Cell],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        let cells: &'a [Cell] = self.cells;
        cells[idx].as_deref()
    }
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        let mut table = Self::default();
        for column in columns {
            table.add_column(column, None);
        }
        table
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn(column.clone()));
            }
        }
        let mut table = Self {
            columns,
            rows: Vec::with_capacity(rows.len()),
        };
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Builds a table from JSON objects. Columns appear in first-seen order;
    /// keys absent from an object become nulls.
    pub fn from_json_rows(values: &[JsonValue]) -> Result<Self, TableError> {
        let mut table = Self::default();
        for (idx, value) in values.iter().enumerate() {
            let object = value.as_object().ok_or(TableError::NotAnObject(idx))?;
            for key in object.keys() {
                table.add_column(key.as_str(), None);
            }
            let row = table
                .columns
                .iter()
                .map(|column| object.get(column).and_then(json_cell))
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Cell>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|cells| RowRef {
            columns: &self.columns,
            cells: cells.as_slice(),
        })
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RaggedRow {
                row: self.rows.len(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Appends `column` filled with `fill` for every existing row. A column
    /// that already exists is left untouched.
    pub fn add_column(&mut self, column: impl Into<String>, fill: Cell) {
        let column = column.into();
        if self.has_column(&column) {
            return;
        }
        self.columns.push(column);
        for row in &mut self.rows {
            row.push(fill.clone());
        }
    }

    /// Adds or replaces `column` with one value per row.
    pub fn set_column(&mut self, column: &str, values: Vec<Cell>) -> Result<(), TableError> {
        if values.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        let idx = match self.column_index(column) {
            Some(idx) => idx,
            None => {
                self.add_column(column, None);
                self.columns.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
        Ok(())
    }

    /// Removes the named columns; names that are not present are ignored.
    pub fn drop_columns(&self, drop: &[&str]) -> Table {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !drop.contains(&c.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        Table {
            columns: keep.iter().map(|&idx| self.columns[idx].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|&idx| row[idx].clone()).collect())
                .collect(),
        }
    }

    pub fn filter_rows(&self, mut keep: impl FnMut(RowRef<'_>) -> bool) -> Table {
        let rows = self
            .rows
            .iter()
            .filter(|cells| {
                keep(RowRef {
                    columns: &self.columns,
                    cells: cells.as_slice(),
                })
            })
            .cloned()
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&idx| self.rows.get(idx).cloned())
                .collect(),
        }
    }

    /// Copy with exactly `columns`, in that order. Columns this table lacks
    /// are null; columns not listed are left out.
    pub fn aligned_to(&self, columns: &[String]) -> Table {
        let sources: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        Table {
            columns: columns.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| {
                    sources
                        .iter()
                        .map(|source| source.and_then(|idx| row[idx].clone()))
                        .collect()
                })
                .collect(),
        }
    }

    /// Rows of `self` followed by the rows of `other` realigned to this
    /// table's columns.
    pub fn appended(&self, other: &Table) -> Table {
        let mut out = self.clone();
        out.rows.extend(other.aligned_to(&self.columns).rows);
        out
    }
}

fn json_cell(value: &JsonValue) -> Cell {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(true) => Some("True".to_string()),
        JsonValue::Bool(false) => Some("False".to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cells(values: &[Option<&str>]) -> Vec<Cell> {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn json_rows_keep_first_seen_column_order() {
        let table = Table::from_json_rows(&[
            json!({"match_id": "a-b-epl-1", "gameweek": 4, "finished": true}),
            json!({"match_id": "a-b-epl-2", "finished": false, "kickoff": null, "venue": "Home"}),
        ])
        .unwrap();

        assert_eq!(
            table.columns(),
            &["match_id", "gameweek", "finished", "kickoff", "venue"]
        );
        assert_eq!(table.value(0, "gameweek"), Some("4"));
        assert_eq!(table.value(0, "finished"), Some("True"));
        assert_eq!(table.value(0, "venue"), None);
        assert_eq!(table.value(1, "gameweek"), None);
        assert_eq!(table.value(1, "finished"), Some("False"));
        assert_eq!(table.rows()[0].len(), 5);
    }

    #[test]
    fn non_object_json_rows_are_rejected() {
        let err = Table::from_json_rows(&[json!({"a": 1}), json!([1, 2])]).unwrap_err();
        assert_eq!(err, TableError::NotAnObject(1));
    }

    #[test]
    fn ragged_rows_and_duplicate_columns_are_rejected() {
        let err = Table::with_rows(
            vec!["a".into(), "b".into()],
            vec![cells(&[Some("1"), Some("2")]), cells(&[Some("1")])],
        )
        .unwrap_err();
        assert!(matches!(err, TableError::RaggedRow { row: 1, expected: 2, actual: 1 }));

        let err = Table::with_rows(vec!["a".into(), "a".into()], vec![]).unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn("a".into()));
    }

    #[test]
    fn set_drop_and_filter_columns() {
        let mut table = Table::with_rows(
            vec!["id".into(), "gw".into()],
            vec![cells(&[Some("1"), Some("3")]), cells(&[Some("2"), Some("4")])],
        )
        .unwrap();
        table
            .set_column("tournament", cells(&[Some("Cup"), None]))
            .unwrap();
        assert_eq!(table.columns(), &["id", "gw", "tournament"]);

        let cup = table.filter_rows(|row| row.get("tournament") == Some("Cup"));
        assert_eq!(cup.len(), 1);
        assert_eq!(cup.value(0, "id"), Some("1"));

        let dropped = table.drop_columns(&["tournament", "missing"]);
        assert_eq!(dropped.columns(), &["id", "gw"]);
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn appended_rows_follow_the_first_table_columns() {
        let finished = Table::with_rows(
            vec!["match_id".into(), "score".into()],
            vec![cells(&[Some("m1"), Some("2-1")])],
        )
        .unwrap();
        let fixtures = Table::with_rows(
            vec!["kickoff".into(), "match_id".into()],
            vec![cells(&[Some("15:00"), Some("m2")])],
        )
        .unwrap();

        let all = finished.appended(&fixtures);
        assert_eq!(all.columns(), &["match_id", "score"]);
        assert_eq!(all.len(), 2);
        assert_eq!(all.value(1, "match_id"), Some("m2"));
        assert_eq!(all.value(1, "score"), None);
    }
}
