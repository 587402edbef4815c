use chrono::{NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Value};

use dynmap_core::diagnostics::ProcessingError;
use dynmap_core::mapping::{ColumnType, CsvFormat, Mapping};
use dynmap_core::path::number_from_str;

use super::{Decoded, PayloadNormalizer};

/// Delimited text with a fixed column layout.
///
/// The first line carries the device identifier when
/// `csvFormat.deviceIdInFirstLine` is set. Every other non-empty line is a
/// row; a row that does not fit the layout is skipped on its own and
/// reported as a warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvNormalizer;

impl PayloadNormalizer for CsvNormalizer {
    fn decode(&self, payload: &[u8], mapping: &Mapping) -> Result<Decoded, String> {
        let format = mapping
            .csv_format
            .as_ref()
            .ok_or_else(|| "mapping has no csvFormat".to_string())?;
        if !format.delimiter.is_ascii() {
            return Err(format!("delimiter '{}' is not an ASCII character", format.delimiter));
        }
        let text = std::str::from_utf8(payload).map_err(|e| format!("payload is not UTF-8: {}", e))?;

        let mut root = Map::new();
        let (body, first_body_line) = if format.device_id_in_first_line {
            let (line_no, device_id, rest) =
                split_first_line(text).ok_or_else(|| "empty CSV payload".to_string())?;
            root.insert("deviceId".to_string(), Value::String(device_id.to_string()));
            (rest, line_no)
        } else {
            (text, 0)
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(format.delimiter as u8)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());

        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        for record in reader.records() {
            let (line, outcome) = match record {
                Ok(record) if record.iter().all(str::is_empty) => continue,
                Ok(record) => (record.position().map(csv::Position::line), parse_row(&record, format)),
                Err(e) => (e.position().map(csv::Position::line), Err(e.to_string())),
            };
            match outcome {
                Ok(row) => rows.push(Value::Object(row)),
                Err(reason) => {
                    let line_no = first_body_line as u64 + line.unwrap_or(0);
                    warnings.push(ProcessingError::resolution(
                        format!("line {}", line_no),
                        format!("row skipped: {}", reason),
                    ))
                }
            }
        }

        root.insert("rows".to_string(), Value::Array(rows));
        root.insert("skipped".to_string(), json!(warnings.len()));
        Ok(Decoded {
            root: Value::Object(root),
            warnings,
        })
    }
}

/// First non-blank line, trimmed, with its 1-based number and the text after it.
fn split_first_line(text: &str) -> Option<(usize, &str, &str)> {
    let mut consumed = 0;
    for (i, line) in text.split_inclusive('\n').enumerate() {
        consumed += line.len();
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Some((i + 1, trimmed, &text[consumed..]));
        }
    }
    None
}

fn parse_row(record: &csv::StringRecord, format: &CsvFormat) -> Result<Map<String, Value>, String> {
    if record.len() != format.columns.len() {
        return Err(format!(
            "expected {} fields, found {}",
            format.columns.len(),
            record.len()
        ));
    }

    let mut row = Map::new();
    for (column, field) in format.columns.iter().zip(record.iter()) {
        let value = match column.column_type {
            ColumnType::Text => Value::String(field.to_string()),
            ColumnType::Number => number_from_str(field)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' in column '{}' is not a number", field, column.name))?,
            ColumnType::Timestamp => {
                let naive = NaiveDateTime::parse_from_str(field, &format.timestamp_format)
                    .map_err(|e| format!("'{}' in column '{}': {}", field, column.name, e))?;
                Value::String(
                    Utc.from_utc_datetime(&naive)
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                )
            }
        };
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}
