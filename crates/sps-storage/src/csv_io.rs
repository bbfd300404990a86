use sps_core::{Table, TableError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CsvError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("flushing csv buffer: {0}")]
    Flush(String),
}

/// Parses delimited text with one header row. Empty fields are nulls and a
/// zero-byte input is an empty table without columns.
pub fn parse_table(bytes: &[u8]) -> Result<Table, CsvError> {
    if bytes.is_empty() {
        return Ok(Table::default());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let columns = reader
        .headers()?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| (!field.is_empty()).then(|| field.to_string()))
                .collect(),
        );
    }
    Ok(Table::with_rows(columns, rows)?)
}

/// Renders a table with a header row, `\n` terminators and nulls as empty
/// fields.
pub fn render_table(table: &Table) -> Result<Vec<u8>, CsvError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
    }
    writer
        .into_inner()
        .map_err(|err| CsvError::Flush(err.error().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_read_as_nulls() {
        let table = parse_table(b"id,gw,form\n1,3,\n2,,4.5\n").unwrap();
        assert_eq!(table.columns(), &["id", "gw", "form"]);
        assert_eq!(table.value(0, "form"), None);
        assert_eq!(table.value(1, "gw"), None);
        assert_eq!(table.value(1, "form"), Some("4.5"));
    }

    #[test]
    fn zero_byte_input_is_an_empty_table() {
        let table = parse_table(b"").unwrap();
        assert_eq!(table.width(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn ragged_content_is_a_parse_error() {
        let err = parse_table(b"id,gw\n1,3,extra\n").unwrap_err();
        assert!(matches!(err, CsvError::Csv(_)));
    }

    #[test]
    fn duplicate_header_is_a_parse_error() {
        let err = parse_table(b"id,id\n1,2\n").unwrap_err();
        assert!(matches!(err, CsvError::Table(TableError::DuplicateColumn(_))));
    }

    #[test]
    fn rendering_quotes_and_reparses() {
        let source = b"match_id,venue,finished\nm1,\"Stadium, North\",True\nm2,,False\n";
        let table = parse_table(source).unwrap();
        let rendered = render_table(&table).unwrap();
        assert_eq!(rendered, source.to_vec());
        assert_eq!(parse_table(&rendered).unwrap(), table);
    }
}
