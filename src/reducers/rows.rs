//! CSV row batches carried in message payloads.
//!
//! Payloads are comma separated, `"`-quoted, one row per line, no header.
//! Rows may have different lengths.

use crate::runtime::ReducerError;
use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};

/// Parses every row of a payload.
///
/// # Errors
///
/// [`ReducerError::Csv`] when the payload is not valid CSV.
pub fn parse_rows(payload: &str) -> Result<Vec<StringRecord>, ReducerError> {
  let mut reader = ReaderBuilder::new()
    .has_headers(false)
    .flexible(true)
    .from_reader(payload.as_bytes());
  let mut rows = Vec::new();
  for record in reader.records() {
    rows.push(record?);
  }
  Ok(rows)
}

/// Returns column `index` of `row`.
///
/// # Errors
///
/// [`ReducerError::MissingColumn`] when the row is too short.
pub fn column(row: &StringRecord, index: usize) -> Result<&str, ReducerError> {
  row.get(index).ok_or_else(|| ReducerError::MissingColumn {
    index,
    row: join(row),
  })
}

/// The row joined back with commas, for error messages.
pub fn join(row: &StringRecord) -> String {
  row.iter().collect::<Vec<_>>().join(",")
}

/// Writes rows into payloads of at most `batch_size` rows each.
///
/// A `batch_size` of zero is treated as one.
///
/// # Errors
///
/// Any CSV writer failure.
pub fn into_batches<I, R, F>(rows: I, batch_size: usize) -> Result<Vec<String>, ReducerError>
where
  I: IntoIterator<Item = R>,
  R: IntoIterator<Item = F>,
  F: AsRef<[u8]>,
{
  let batch_size = batch_size.max(1);
  let mut batches = Vec::new();
  let mut writer = new_writer();
  let mut in_batch = 0;

  for row in rows {
    writer.write_record(row)?;
    in_batch += 1;
    if in_batch == batch_size {
      batches.push(finish(writer)?);
      writer = new_writer();
      in_batch = 0;
    }
  }
  if in_batch > 0 {
    batches.push(finish(writer)?);
  }
  Ok(batches)
}

/// Writes all rows into a single payload.
///
/// # Errors
///
/// Any CSV writer failure.
pub fn to_payload<I, R, F>(rows: I) -> Result<String, ReducerError>
where
  I: IntoIterator<Item = R>,
  R: IntoIterator<Item = F>,
  F: AsRef<[u8]>,
{
  let mut writer = new_writer();
  for row in rows {
    writer.write_record(row)?;
  }
  finish(writer)
}

fn new_writer() -> csv::Writer<Vec<u8>> {
  WriterBuilder::new()
    .has_headers(false)
    .flexible(true)
    .terminator(Terminator::Any(b'\n'))
    .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, ReducerError> {
  let bytes = writer
    .into_inner()
    .map_err(|e| csv::Error::from(e.into_error()))?;
  String::from_utf8(bytes).map_err(|e| ReducerError::MalformedRow {
    row: String::from_utf8_lossy(e.as_bytes()).into_owned(),
    reason: "output is not valid UTF-8".to_string(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_quoted_fields_and_ragged_rows() {
    let rows = parse_rows("Book A,\"['x', 'y']\",5\nBook B,3\n").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(column(&rows[0], 1).unwrap(), "['x', 'y']");
    assert_eq!(rows[1].len(), 2);
  }

  #[test]
  fn empty_payload_has_no_rows() {
    assert!(parse_rows("").unwrap().is_empty());
  }

  #[test]
  fn missing_column_names_the_row() {
    let rows = parse_rows("only,two").unwrap();
    let err = column(&rows[0], 4).unwrap_err();
    assert!(matches!(
      err,
      ReducerError::MissingColumn { index: 4, ref row } if row == "only,two"
    ));
  }

  #[test]
  fn batches_split_at_batch_size() {
    let rows = vec![vec!["a", "1"], vec!["b", "2"], vec!["c", "3"]];
    let batches = into_batches(rows, 2).unwrap();
    assert_eq!(batches, vec!["a,1\nb,2\n", "c,3\n"]);
    assert!(into_batches(Vec::<Vec<&str>>::new(), 2).unwrap().is_empty());
  }

  #[test]
  fn fields_with_commas_are_quoted() {
    let payload = to_payload(vec![vec!["Book A", "['5', '3']", "2"]]).unwrap();
    assert_eq!(payload, "Book A,\"['5', '3']\",2\n");
    let back = parse_rows(&payload).unwrap();
    assert_eq!(column(&back[0], 1).unwrap(), "['5', '3']");
  }
}
