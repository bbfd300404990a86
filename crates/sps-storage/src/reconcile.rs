use sps_core::Table;

/// Brings an existing partition table and an incoming batch onto one schema.
///
/// Both outputs carry the union of the input columns: existing columns first
/// in their stored order, then columns only the batch has, in batch order.
/// Missing cells are null. Rows keep their count and order, and no column is
/// ever dropped. An absent existing table reconciles as an empty table with
/// the batch's own columns.
pub fn reconcile_schemas(existing: Option<Table>, incoming: Table) -> (Table, Table) {
    let Some(mut existing) = existing else {
        let empty = Table::new(incoming.columns().iter().cloned());
        return (empty, incoming);
    };

    for column in incoming.columns() {
        existing.add_column(column.as_str(), None);
    }

    if existing.columns() == incoming.columns() {
        return (existing, incoming);
    }

    let aligned = incoming.aligned_to(existing.columns());
    (existing, aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: &[&[Option<&str>]]) -> Table {
        Table::with_rows(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn absent_existing_is_a_no_op() {
        let incoming = table(&["match_id", "gameweek"], &[&[Some("m1"), Some("4")]]);
        let (a, b) = reconcile_schemas(None, incoming.clone());
        assert!(a.is_empty());
        assert_eq!(a.columns(), incoming.columns());
        assert_eq!(b, incoming);
    }

    #[test]
    fn union_of_columns_with_nulls_and_stable_rows() {
        let existing = table(
            &["player_id", "match_id", "goals"],
            &[
                &[Some("p1"), Some("m1"), Some("1")],
                &[Some("p2"), Some("m1"), Some("0")],
            ],
        );
        let incoming = table(
            &["match_id", "player_id", "xg"],
            &[&[Some("m2"), Some("p1"), Some("0.4")]],
        );

        let (a, b) = reconcile_schemas(Some(existing), incoming);

        assert_eq!(a.columns(), &["player_id", "match_id", "goals", "xg"]);
        assert_eq!(b.columns(), a.columns());
        assert_eq!(a.len(), 2);
        assert_eq!(a.value(0, "goals"), Some("1"));
        assert_eq!(a.value(1, "xg"), None);
        assert_eq!(b.len(), 1);
        assert_eq!(b.value(0, "player_id"), Some("p1"));
        assert_eq!(b.value(0, "match_id"), Some("m2"));
        assert_eq!(b.value(0, "goals"), None);
        assert_eq!(b.value(0, "xg"), Some("0.4"));
    }

    #[test]
    fn narrower_batch_never_shrinks_existing_schema() {
        let existing = table(&["id", "gw", "form"], &[&[Some("1"), Some("3"), Some("5.5")]]);
        let incoming = table(&["id", "gw"], &[&[Some("1"), Some("4")]]);

        let (a, b) = reconcile_schemas(Some(existing), incoming);

        assert_eq!(a.columns(), &["id", "gw", "form"]);
        assert_eq!(b.columns(), &["id", "gw", "form"]);
        assert_eq!(b.value(0, "form"), None);
    }
}
