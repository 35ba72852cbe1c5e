//! Projection of merged rows onto the sink schema, with per-column coercion and
//! row-level filtering.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use cordis_core::{
    normalize_identifier, unique_join, CanonicalColumn, CellValue, ColumnKind, ProjectRecord,
    Table, PRESENCE_COLUMNS,
};
use tracing::{debug, info};

pub const MAX_TEXT_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "...";

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Counters for one normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub input_rows: usize,
    pub dropped_empty: usize,
    pub dropped_without_id: usize,
    pub dropped_duplicates: usize,
}

impl NormalizeStats {
    pub fn output_rows(&self) -> usize {
        self.input_rows - self.dropped_empty - self.dropped_without_id - self.dropped_duplicates
    }
}

pub fn parse_date(value: &CellValue) -> Option<NaiveDate> {
    match value {
        CellValue::Date(date) => Some(*date),
        CellValue::Text(raw) => parse_date_str(raw),
        _ => None,
    }
}

pub fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    {
        return Some(date);
    }
    if let Some(dt) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(dt.date());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Float coercion for monetary columns; accepts a comma decimal separator.
pub fn parse_money(value: &CellValue) -> Option<f64> {
    let parsed = match value {
        CellValue::Int(i) => Some(*i as f64),
        CellValue::Float(f) => Some(*f),
        CellValue::Text(raw) => {
            let raw = raw.trim();
            raw.parse::<f64>()
                .ok()
                .or_else(|| raw.replace(',', ".").parse::<f64>().ok())
        }
        CellValue::Null | CellValue::Date(_) => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Integer coercion for count-like identifier columns such as `rcn`.
pub fn parse_count(value: &CellValue) -> Option<i64> {
    normalize_identifier(value)?.parse().ok()
}

/// Final cell cleanup before emission.
pub fn sanitize_cell(value: CellValue) -> CellValue {
    match value {
        CellValue::Null => CellValue::Null,
        CellValue::Int(i) => CellValue::Int(i),
        CellValue::Float(f) if f.is_finite() => CellValue::Float(f),
        CellValue::Float(_) => CellValue::Null,
        CellValue::Date(d) => CellValue::Date(d),
        CellValue::Text(text) => sanitize_text(&text).map(CellValue::Text).unwrap_or_default(),
    }
}

pub fn sanitize_text(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace('\0', "")
        .replace("\r\n", " ")
        .replace(['\r', '\n', '\t'], " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().count() > MAX_TEXT_CHARS {
        let keep = MAX_TEXT_CHARS - TRUNCATION_MARKER.len();
        let mut truncated: String = cleaned.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_MARKER);
        return Some(truncated);
    }
    Some(cleaned.to_string())
}

fn coerce(column: CanonicalColumn, value: &CellValue) -> CellValue {
    match column.kind() {
        ColumnKind::Identifier => normalize_identifier(value)
            .map(CellValue::Text)
            .unwrap_or_default(),
        ColumnKind::Date => parse_date(value).map(CellValue::Date).unwrap_or_default(),
        ColumnKind::Money => parse_money(value).map(CellValue::Float).unwrap_or_default(),
        ColumnKind::Count => parse_count(value).map(CellValue::Int).unwrap_or_default(),
        ColumnKind::Composite => match value.as_str() {
            Some(text) => CellValue::Text(unique_join([text])),
            None if value.is_null() => CellValue::Null,
            None => value.clone(),
        },
        ColumnKind::Text | ColumnKind::Provenance => {
            if value.is_null() {
                CellValue::Null
            } else {
                value.clone()
            }
        }
    }
}

/// Project one merged row onto the canonical columns, in canonical order.
pub fn normalize_row(row: &cordis_core::Record) -> ProjectRecord {
    CanonicalColumn::ALL
        .iter()
        .map(|column| {
            let raw = row.get(column.as_str()).cloned().unwrap_or_default();
            (
                column.as_str().to_string(),
                sanitize_cell(coerce(*column, &raw)),
            )
        })
        .collect()
}

pub fn normalize_table(table: &Table) -> (Vec<ProjectRecord>, NormalizeStats) {
    let mut stats = NormalizeStats {
        input_rows: table.len(),
        ..Default::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(table.len());

    for row in &table.rows {
        let record = normalize_row(row);

        let has_content = PRESENCE_COLUMNS
            .iter()
            .any(|column| record.get(column.as_str()).is_some_and(|v| !v.is_null()));
        if !has_content {
            stats.dropped_empty += 1;
            continue;
        }

        let Some(id) = record
            .get(CanonicalColumn::Id.as_str())
            .and_then(CellValue::as_str)
            .map(str::to_string)
        else {
            stats.dropped_without_id += 1;
            continue;
        };

        if !seen.insert(id.clone()) {
            debug!(%id, "dropping duplicate project");
            stats.dropped_duplicates += 1;
            continue;
        }
        out.push(record);
    }

    info!(
        input = stats.input_rows,
        output = out.len(),
        dropped_empty = stats.dropped_empty,
        dropped_without_id = stats.dropped_without_id,
        dropped_duplicates = stats.dropped_duplicates,
        "normalized projects"
    );
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordis_core::Record;

    fn row(pairs: &[(&str, CellValue)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn permissive_dates() {
        assert_eq!(parse_date_str("2021-03-01"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("2021-03-01 00:00:00"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("2021-03-01T10:15:00"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("2021-03-01T10:15:00+02:00"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("01/03/2021"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("01.03.2021"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("2021-03-01 garbage"), Some(d(2021, 3, 1)));
        assert_eq!(parse_date_str("not a date"), None);
        assert_eq!(parse_date_str(""), None);
        assert_eq!(parse_date(&CellValue::Int(20210301)), None);
    }

    #[test]
    fn money_and_counts() {
        assert_eq!(parse_money(&CellValue::text("1500,5")), Some(1500.5));
        assert_eq!(parse_money(&CellValue::text(" 2000.25 ")), Some(2000.25));
        assert_eq!(parse_money(&CellValue::Int(7)), Some(7.0));
        assert_eq!(parse_money(&CellValue::text("n/a")), None);
        assert_eq!(parse_money(&CellValue::Float(f64::INFINITY)), None);
        assert_eq!(parse_count(&CellValue::text("12345.0")), Some(12345));
        assert_eq!(parse_count(&CellValue::text("abc")), None);
    }

    #[test]
    fn text_sanitization() {
        assert_eq!(sanitize_text("  a\r\nb\tc\nd\0 ").as_deref(), Some("a b c d"));
        assert_eq!(sanitize_text(" \n\t "), None);
        let long = "x".repeat(MAX_TEXT_CHARS + 5);
        let cut = sanitize_text(&long).expect("text");
        assert_eq!(cut.chars().count(), MAX_TEXT_CHARS);
        assert!(cut.ends_with("..."));
        let exact = "y".repeat(MAX_TEXT_CHARS);
        assert_eq!(sanitize_text(&exact).as_deref(), Some(exact.as_str()));
    }

    #[test]
    fn sanitize_cell_unifies_null_like_values() {
        assert_eq!(sanitize_cell(CellValue::Float(f64::NAN)), CellValue::Null);
        assert_eq!(sanitize_cell(CellValue::text("   ")), CellValue::Null);
        assert_eq!(sanitize_cell(CellValue::Int(4)), CellValue::Int(4));
    }

    #[test]
    fn composite_cells_stay_unique_after_whitespace_cleanup() {
        let record = normalize_row(&row(&[
            ("id", CellValue::text("1")),
            ("org_names", CellValue::text("Org\tA | Org A | Org\r\nB")),
            ("cities", CellValue::text(" \t | ")),
        ]));
        assert_eq!(record["org_names"], CellValue::text("Org A | Org B"));
        assert_eq!(record["cities"], CellValue::Null);
    }

    #[test]
    fn rows_are_projected_in_canonical_order() {
        let record = normalize_row(&row(&[
            ("zzz_extra", CellValue::text("dropped")),
            ("rcn", CellValue::text("991.0")),
            ("title", CellValue::text(" Alpha ")),
            ("id", CellValue::text("42.0")),
            ("startdate", CellValue::text("2020-01-01 00:00:00")),
            ("totalcost", CellValue::text("bad")),
        ]));
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        let expected: Vec<_> = CanonicalColumn::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(keys, expected);
        assert_eq!(record["id"], CellValue::text("42"));
        assert_eq!(record["rcn"], CellValue::Int(991));
        assert_eq!(record["title"], CellValue::text("Alpha"));
        assert_eq!(record["startdate"], CellValue::Date(d(2020, 1, 1)));
        assert_eq!(record["totalcost"], CellValue::Null);
        assert_eq!(record["status"], CellValue::Null);
    }

    #[test]
    fn filtering_and_dedup() {
        let table = Table::from_rows(vec![
            row(&[("id", CellValue::text("1")), ("title", CellValue::text("First"))]),
            row(&[("id", CellValue::text("1.0")), ("title", CellValue::text("Second"))]),
            row(&[("id", CellValue::text("2")), ("status", CellValue::text("SIGNED"))]),
            row(&[("id", CellValue::Null), ("acronym", CellValue::text("NOID"))]),
            row(&[("id", CellValue::text("3")), ("objective", CellValue::text("\n"))]),
            row(&[("id", CellValue::text("4")), ("objective", CellValue::text("Text"))]),
        ]);
        let (records, stats) = normalize_table(&table);
        let ids: Vec<_> = records
            .iter()
            .map(|r| r["id"].as_str().map(str::to_string))
            .collect();
        assert_eq!(ids, vec![Some("1".to_string()), Some("4".to_string())]);
        assert_eq!(records[0]["title"], CellValue::text("First"));
        assert_eq!(stats.dropped_empty, 2);
        assert_eq!(stats.dropped_without_id, 1);
        assert_eq!(stats.dropped_duplicates, 1);
        assert_eq!(stats.output_rows(), 2);
    }
}
