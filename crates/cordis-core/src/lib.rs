//! Core domain model for the CORDIS project harvester.

use std::fmt;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cordis-core";

/// Separator used for every composite (one-to-many) attribute.
pub const COMPOSITE_SEPARATOR: &str = " | ";

/// A single table cell. Serializes to plain JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Null, NaN and infinities are all treated as missing.
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float(f) => !f.is_finite(),
            _ => false,
        }
    }

    /// Null-like or a text value with nothing but whitespace.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            other => other.is_null(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// String form of a present value; `None` for null-like cells.
    pub fn to_text(&self) -> Option<String> {
        if self.is_null() {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Lifts a parsed JSON scalar into a cell. Nested values keep their JSON text.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Text(b.to_string()),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One row keyed by column name, in insertion order.
pub type Record = IndexMap<String, CellValue>;

/// Raw member rows as they come out of an archive, before reconciliation.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// Row-oriented table with a stable column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table whose columns are the union of row keys in first-seen order.
    pub fn from_rows(rows: Vec<Record>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn push_row(&mut self, row: Record) {
        for key in row.keys() {
            if !self.has_column(key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Appends a column filled with nulls if it does not exist yet.
    pub fn ensure_column(&mut self, name: &str) {
        if self.has_column(name) {
            return;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.entry(name.to_string()).or_insert(CellValue::Null);
        }
    }

    /// Sets `name` to `value` on every row.
    pub fn fill_column(&mut self, name: &str, value: CellValue) {
        self.ensure_column(name);
        for row in &mut self.rows {
            row.insert(name.to_string(), value.clone());
        }
    }

    /// Row-wise concatenation; column union keeps `self` first.
    pub fn append(&mut self, other: Table) {
        for column in &other.columns {
            if !self.has_column(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.extend(other.rows);
    }
}

/// Canonical integer-string form of an identifier.
///
/// `"105617.0"`, `105617.0` and `105617` all become `"105617"`. Null, NaN and
/// infinities yield `None`. Non-numeric text passes through trimmed.
pub fn normalize_identifier(value: &CellValue) -> Option<String> {
    match value {
        CellValue::Null => None,
        CellValue::Int(i) => Some(i.to_string()),
        CellValue::Float(f) => float_to_integer_string(*f),
        CellValue::Text(s) => normalize_identifier_str(s),
        CellValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
    }
}

pub fn normalize_identifier_str(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(i.to_string());
    }
    match trimmed.parse::<f64>() {
        Ok(f) => float_to_integer_string(f),
        Err(_) => Some(trimmed.to_string()),
    }
}

fn float_to_integer_string(f: f64) -> Option<String> {
    if !f.is_finite() {
        return None;
    }
    let truncated = f.trunc();
    if truncated.abs() < i64::MAX as f64 {
        Some((truncated as i64).to_string())
    } else {
        Some(format!("{truncated:.0}"))
    }
}

/// Joins values into a composite attribute: trimmed, non-empty, first-seen
/// order, exact-match deduplicated. Values already holding the separator are
/// split first so that re-joining a composite string is a no-op.
pub fn unique_join<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    unique_values(values).join(COMPOSITE_SEPARATOR)
}

pub fn unique_values<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let flat = value.as_ref().replace("\r\n", " ").replace(['\r', '\n', '\t'], " ");
        for part in flat.split(COMPOSITE_SEPARATOR) {
            let part = part.trim();
            if !part.is_empty() && !out.iter().any(|seen| seen == part) {
                out.push(part.to_string());
            }
        }
    }
    out
}

/// How the normalizer coerces a canonical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Identifier,
    Text,
    Date,
    Money,
    Count,
    Composite,
    Provenance,
}

macro_rules! canonical_columns {
    ($($variant:ident => ($name:literal, $kind:ident)),+ $(,)?) => {
        /// Output columns accepted by the sink's storage schema, in output order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CanonicalColumn {
            $($variant),+
        }

        impl CanonicalColumn {
            pub const ALL: &'static [CanonicalColumn] = &[$(CanonicalColumn::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(CanonicalColumn::$variant => $name),+
                }
            }

            pub fn kind(self) -> ColumnKind {
                match self {
                    $(CanonicalColumn::$variant => ColumnKind::$kind),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(CanonicalColumn::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

canonical_columns! {
    Id => ("id", Identifier),
    Acronym => ("acronym", Text),
    Status => ("status", Text),
    Title => ("title", Text),
    Objective => ("objective", Text),
    StartDate => ("startdate", Date),
    EndDate => ("enddate", Date),
    FrameworkProgramme => ("frameworkprogramme", Text),
    LegalBasis => ("legalbasis", Text),
    MasterCall => ("mastercall", Text),
    SubCall => ("subcall", Text),
    FundingScheme => ("fundingscheme", Text),
    EcMaxContribution => ("ecmaxcontribution", Money),
    TotalCost => ("totalcost", Money),
    OrgNames => ("org_names", Composite),
    Roles => ("roles", Composite),
    OrgCountries => ("org_countries", Composite),
    OrgCountryNames => ("org_country_names", Composite),
    OrganizationUrls => ("organization_urls", Composite),
    ContactForms => ("contact_forms", Composite),
    Cities => ("cities", Composite),
    TopicsCodes => ("topics_codes", Composite),
    TopicsDesc => ("topics_desc", Composite),
    EuroSciVocLabels => ("euroscivoc_labels", Composite),
    EuroSciVocCodes => ("euroscivoc_codes", Composite),
    ProjectUrls => ("project_urls", Composite),
    ContentUpdateDate => ("contentupdatedate", Date),
    Rcn => ("rcn", Count),
    GrantDoi => ("grantdoi", Text),
    ProgrammeSource => ("programmesource", Provenance),
}

impl fmt::Display for CanonicalColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row must carry at least one of these to be worth emitting.
pub const PRESENCE_COLUMNS: [CanonicalColumn; 3] = [
    CanonicalColumn::Title,
    CanonicalColumn::Acronym,
    CanonicalColumn::Objective,
];

/// Flat, sink-ready record whose keys follow [`CanonicalColumn::ALL`].
pub type ProjectRecord = Record;

/// Display name for a two-letter country code; unknown codes come back as given.
pub fn country_display_name(code: &str) -> String {
    let code = code.trim();
    let name = match code.to_ascii_uppercase().as_str() {
        "AT" => "Austria",
        "BE" => "Belgium",
        "BG" => "Bulgaria",
        "HR" => "Croatia",
        "CY" => "Cyprus",
        "CZ" => "Czech Republic",
        "DK" => "Denmark",
        "EE" => "Estonia",
        "FI" => "Finland",
        "FR" => "France",
        "DE" => "Germany",
        "GR" | "EL" => "Greece",
        "HU" => "Hungary",
        "IE" => "Ireland",
        "IT" => "Italy",
        "LV" => "Latvia",
        "LT" => "Lithuania",
        "LU" => "Luxembourg",
        "MT" => "Malta",
        "NL" => "Netherlands",
        "PL" => "Poland",
        "PT" => "Portugal",
        "RO" => "Romania",
        "SK" => "Slovakia",
        "SI" => "Slovenia",
        "ES" => "Spain",
        "SE" => "Sweden",
        "NO" => "Norway",
        "CH" => "Switzerland",
        "UK" | "GB" => "United Kingdom",
        "IS" => "Iceland",
        "LI" => "Liechtenstein",
        "TR" => "Turkey",
        "UA" => "Ukraine",
        "MD" => "Moldova",
        "ME" => "Montenegro",
        "MK" => "North Macedonia",
        "AL" => "Albania",
        "RS" => "Serbia",
        "BA" => "Bosnia and Herzegovina",
        "XK" => "Kosovo",
        "GE" => "Georgia",
        "AM" => "Armenia",
        "TN" => "Tunisia",
        "MA" => "Morocco",
        "IL" => "Israel",
        "FO" => "Faroe Islands",
        "US" => "United States",
        "CA" => "Canada",
        "AU" => "Australia",
        "JP" => "Japan",
        "KR" => "South Korea",
        "CN" => "China",
        "IN" => "India",
        "BR" => "Brazil",
        "RU" => "Russia",
        "ZA" => "South Africa",
        "NZ" => "New Zealand",
        "SG" => "Singapore",
        "HK" => "Hong Kong",
        "TW" => "Taiwan",
        "TH" => "Thailand",
        "MY" => "Malaysia",
        "MX" => "Mexico",
        "AR" => "Argentina",
        "CL" => "Chile",
        "CO" => "Colombia",
        "PE" => "Peru",
        "EG" => "Egypt",
        "SA" => "Saudi Arabia",
        "AE" => "United Arab Emirates",
        "QA" => "Qatar",
        "KW" => "Kuwait",
        "JO" => "Jordan",
        "LB" => "Lebanon",
        "PK" => "Pakistan",
        "BD" => "Bangladesh",
        "LK" => "Sri Lanka",
        "NP" => "Nepal",
        "MM" => "Myanmar",
        "VN" => "Vietnam",
        "ID" => "Indonesia",
        "PH" => "Philippines",
        "KE" => "Kenya",
        "NG" => "Nigeria",
        "GH" => "Ghana",
        "ET" => "Ethiopia",
        "TZ" => "Tanzania",
        "UG" => "Uganda",
        "RW" => "Rwanda",
        "SN" => "Senegal",
        "CI" => "Côte d'Ivoire",
        "BF" => "Burkina Faso",
        "ML" => "Mali",
        "NE" => "Niger",
        "TD" => "Chad",
        "CM" => "Cameroon",
        "CF" => "Central African Republic",
        "CD" => "Democratic Republic of Congo",
        "CG" => "Republic of Congo",
        "GA" => "Gabon",
        "GQ" => "Equatorial Guinea",
        "ST" => "São Tomé and Príncipe",
        "AO" => "Angola",
        "NA" => "Namibia",
        "BW" => "Botswana",
        "ZW" => "Zimbabwe",
        "ZM" => "Zambia",
        "MW" => "Malawi",
        "MZ" => "Mozambique",
        "MG" => "Madagascar",
        "MU" => "Mauritius",
        "SC" => "Seychelles",
        "KM" => "Comoros",
        "DJ" => "Djibouti",
        "SO" => "Somalia",
        "ER" => "Eritrea",
        "SS" => "South Sudan",
        "SD" => "Sudan",
        "LY" => "Libya",
        "DZ" => "Algeria",
        "MR" => "Mauritania",
        "GM" => "Gambia",
        "GW" => "Guinea-Bissau",
        "GN" => "Guinea",
        "SL" => "Sierra Leone",
        "LR" => "Liberia",
        "BJ" => "Benin",
        "TG" => "Togo",
        _ => return code.to_string(),
    };
    name.to_string()
}
