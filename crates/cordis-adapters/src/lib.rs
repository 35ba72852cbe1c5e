//! Archive fetching, member parsing, field reconciliation and child-collection
//! aggregation for CORDIS dataset generations.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use anyhow::Result;
use async_trait::async_trait;
use cordis_core::{
    country_display_name, normalize_identifier, unique_join, CanonicalColumn, CellValue,
    RawRecord, Record, Table,
};
use cordis_storage::{FetchError, HttpClientConfig, HttpFetcher};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::result::ZipError;
use zip::ZipArchive;

pub const CRATE_NAME: &str = "cordis-adapters";

/// Foreign key carried by every child collection.
pub const PROJECT_FOREIGN_KEY: &str = "projectID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Json,
    Csv,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    pub fn matches(self, member_name: &str) -> bool {
        member_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.eq_ignore_ascii_case(self.extension()))
            .unwrap_or(false)
    }
}

/// One dataset generation and where its archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSource {
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub format: ArchiveFormat,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The three programme generations published on the CORDIS open data portal.
pub fn cordis_sources(format: ArchiveFormat) -> Vec<DatasetSource> {
    let ext = format.extension();
    ["HORIZONprojects", "h2020projects", "fp7projects"]
        .into_iter()
        .map(|label| DatasetSource {
            label: label.to_string(),
            url: format!("https://cordis.europa.eu/data/cordis-{label}-{ext}.zip"),
            format,
            enabled: true,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMember {
    Rows(Vec<RawRecord>),
    Object(RawRecord),
}

impl ParsedMember {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Object(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_rows(self) -> Vec<RawRecord> {
        match self {
            Self::Rows(rows) => rows,
            Self::Object(obj) => vec![obj],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedMember {
    pub name: String,
    pub reason: String,
}

/// Parsed members of one archive, keyed by bare file name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveContents {
    pub members: BTreeMap<String, ParsedMember>,
    pub skipped: Vec<SkippedMember>,
}

#[derive(Debug, Error)]
pub enum MemberError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("unexpected top-level json {0}")]
    Shape(&'static str),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {locator}: {source}")]
    Fetch {
        locator: String,
        #[source]
        source: FetchError,
    },
    #[error("reading archive from {locator}: {source}")]
    Archive {
        locator: String,
        #[source]
        source: ZipError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// Retrieves one generation's archive and hands back its parsed members.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        source: &DatasetSource,
    ) -> Result<ArchiveContents, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HttpArchiveFetcher {
    http: HttpFetcher,
}

impl HttpArchiveFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
        })
    }

    pub fn from_fetcher(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        source: &DatasetSource,
    ) -> Result<ArchiveContents, AdapterError> {
        info!(generation = %source.label, url = %source.url, "downloading archive");
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &source.label, &source.url)
            .await
            .map_err(|source_err| AdapterError::Fetch {
                locator: source.url.clone(),
                source: source_err,
            })?;
        info!(
            generation = %source.label,
            bytes = response.body.len(),
            "archive downloaded"
        );
        read_archive(&response.body, source.format).map_err(|err| AdapterError::Archive {
            locator: source.url.clone(),
            source: err,
        })
    }
}

/// Bare file name of an archive member (`"json/project.json"` -> `"project.json"`).
pub fn member_file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Read every member of `format` from a zip archive. Members that fail to parse
/// are recorded as skipped instead of failing the archive.
pub fn read_archive(bytes: &[u8], format: ArchiveFormat) -> Result<ArchiveContents, ZipError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut contents = ArchiveContents::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !format.matches(entry.name()) {
            continue;
        }
        let name = member_file_name(entry.name()).to_string();

        let mut buf = Vec::new();
        if let Err(err) = entry.read_to_end(&mut buf) {
            warn!(member = %name, error = %err, "skipping unreadable archive member");
            contents.skipped.push(SkippedMember {
                name,
                reason: err.to_string(),
            });
            continue;
        }

        match parse_member(&buf, format) {
            Ok(member) => {
                info!(member = %name, records = member.len(), "parsed archive member");
                contents.members.insert(name, member);
            }
            Err(err) => {
                warn!(member = %name, error = %err, "skipping malformed archive member");
                contents.skipped.push(SkippedMember {
                    name,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(contents)
}

pub fn parse_member(bytes: &[u8], format: ArchiveFormat) -> Result<ParsedMember, MemberError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match format {
        ArchiveFormat::Json => parse_json_member(bytes),
        ArchiveFormat::Csv => parse_csv_member(bytes).map(ParsedMember::Rows),
    }
}

/// Arrays become rows; `{"projects": [...]}`/`{"project": [...]}` wrappers are unwrapped.
pub fn parse_json_member(bytes: &[u8]) -> Result<ParsedMember, MemberError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    match value {
        JsonValue::Array(items) => Ok(ParsedMember::Rows(object_rows(items))),
        JsonValue::Object(mut obj) => {
            for wrapper in ["projects", "project"] {
                if let Some(JsonValue::Array(items)) = obj.get_mut(wrapper) {
                    return Ok(ParsedMember::Rows(object_rows(std::mem::take(items))));
                }
            }
            Ok(ParsedMember::Object(obj))
        }
        JsonValue::Null => Err(MemberError::Shape("null")),
        JsonValue::Bool(_) => Err(MemberError::Shape("boolean")),
        JsonValue::Number(_) => Err(MemberError::Shape("number")),
        JsonValue::String(_) => Err(MemberError::Shape("string")),
    }
}

fn object_rows(items: Vec<JsonValue>) -> Vec<RawRecord> {
    items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(obj) => Some(obj),
            _ => None,
        })
        .collect()
}

/// Semicolon-separated table; empty cells are null and unreadable lines are skipped.
pub fn parse_csv_member(bytes: &[u8]) -> Result<Vec<RawRecord>, MemberError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .quote(b'"')
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| {
            String::from_utf8_lossy(h)
                .trim_start_matches('\u{feff}')
                .trim()
                .to_string()
        })
        .collect();

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in reader.byte_records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                skipped += 1;
                debug!(error = %err, "skipping bad csv line");
                continue;
            }
        };
        let mut row = RawRecord::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            let text = String::from_utf8_lossy(field);
            let value = if text.trim().is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(text.into_owned())
            };
            row.insert(header.clone(), value);
        }
        rows.push(row);
    }
    if skipped > 0 {
        warn!(skipped, "skipped malformed csv lines");
    }
    Ok(rows)
}

/// Known member files of a CORDIS archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CollectionKind {
    Project,
    Organization,
    Topic,
    Vocabulary,
    WebLink,
    LegalBasis,
    PolicyPriority,
    WebItem,
}

/// Fixed order in which aggregated child collections join the main table.
pub const MERGE_ORDER: [CollectionKind; 5] = [
    CollectionKind::Organization,
    CollectionKind::Topic,
    CollectionKind::Vocabulary,
    CollectionKind::WebLink,
    CollectionKind::LegalBasis,
];

impl CollectionKind {
    pub fn from_member_name(name: &str) -> Option<Self> {
        let file = member_file_name(name);
        let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
        match stem.to_ascii_lowercase().as_str() {
            "project" | "projects" => Some(Self::Project),
            "organization" | "organizations" => Some(Self::Organization),
            "topics" | "topic" => Some(Self::Topic),
            "euroscivoc" => Some(Self::Vocabulary),
            "weblink" | "weblinks" => Some(Self::WebLink),
            "legalbasis" => Some(Self::LegalBasis),
            "policypriorities" => Some(Self::PolicyPriority),
            "webitem" | "webitems" => Some(Self::WebItem),
            _ => None,
        }
    }

    /// Composite keys nested inside a project record that fold like their collection.
    pub fn from_nested_key(key: &str) -> Option<Self> {
        match key {
            "organizations" => Some(Self::Organization),
            "topics" => Some(Self::Topic),
            "euroSciVoc" => Some(Self::Vocabulary),
            "webLinks" => Some(Self::WebLink),
            _ => None,
        }
    }

    /// Collections with no canonical column mapping; never merged.
    pub fn is_excluded(self) -> bool {
        matches!(self, Self::PolicyPriority | Self::WebItem)
    }

    pub fn fold_rules(self) -> &'static [FoldRule] {
        match self {
            Self::Organization => ORGANIZATION_RULES,
            Self::Topic => TOPIC_RULES,
            Self::Vocabulary => VOCABULARY_RULES,
            Self::WebLink => WEBLINK_RULES,
            Self::LegalBasis => LEGAL_BASIS_RULES,
            Self::Project | Self::PolicyPriority | Self::WebItem => &[],
        }
    }

    /// Columns an aggregation of this kind produces, in output order.
    pub fn output_columns(self) -> Vec<CanonicalColumn> {
        let mut columns = Vec::new();
        for rule in self.fold_rules() {
            columns.push(rule.column);
            if rule.column == CanonicalColumn::OrgCountries {
                columns.push(CanonicalColumn::OrgCountryNames);
            }
        }
        columns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// Unique, ordered, pipe-joined composite.
    Join,
    /// First present value wins.
    First,
}

/// Source fields tried per element, in order, for one output column.
#[derive(Debug, Clone, Copy)]
pub struct FoldRule {
    pub column: CanonicalColumn,
    pub sources: &'static [&'static str],
    pub fold: Fold,
}

impl FoldRule {
    const fn join(column: CanonicalColumn, sources: &'static [&'static str]) -> Self {
        Self {
            column,
            sources,
            fold: Fold::Join,
        }
    }

    const fn first(column: CanonicalColumn, sources: &'static [&'static str]) -> Self {
        Self {
            column,
            sources,
            fold: Fold::First,
        }
    }
}

const ORGANIZATION_RULES: &[FoldRule] = &[
    FoldRule::join(CanonicalColumn::OrgNames, &["name"]),
    FoldRule::join(CanonicalColumn::Roles, &["role"]),
    FoldRule::join(CanonicalColumn::OrgCountries, &["country"]),
    FoldRule::join(CanonicalColumn::OrganizationUrls, &["organizationURL"]),
    FoldRule::join(CanonicalColumn::ContactForms, &["contactForm"]),
    FoldRule::join(CanonicalColumn::Cities, &["city"]),
];

const TOPIC_RULES: &[FoldRule] = &[
    FoldRule::join(CanonicalColumn::TopicsCodes, &["topic", "code"]),
    FoldRule::join(CanonicalColumn::TopicsDesc, &["title", "description"]),
];

const VOCABULARY_RULES: &[FoldRule] = &[
    FoldRule::join(
        CanonicalColumn::EuroSciVocCodes,
        &["euroSciVocCode", "code", "euroSciVoc"],
    ),
    FoldRule::join(
        CanonicalColumn::EuroSciVocLabels,
        &["euroSciVocTitle", "title", "label", "euroSciVocLabel"],
    ),
];

const WEBLINK_RULES: &[FoldRule] = &[FoldRule::join(CanonicalColumn::ProjectUrls, &["physUrl", "url"])];

const LEGAL_BASIS_RULES: &[FoldRule] = &[FoldRule::first(CanonicalColumn::LegalBasis, &["legalBasis"])];

fn first_present(item: &RawRecord, sources: &[&str]) -> Option<String> {
    sources.iter().find_map(|field| {
        let text = CellValue::from_json(item.get(*field)?).to_text()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    })
}

fn composite_cell(values: &[String]) -> CellValue {
    let joined = unique_join(values);
    if joined.is_empty() {
        CellValue::Null
    } else {
        CellValue::Text(joined)
    }
}

/// Fold a group of child records (one project's worth) into composite cells.
///
/// Country codes also yield a parallel display-name composite with one entry per
/// code occurrence; unknown codes stand in for their own name.
pub fn fold_group<'a, I>(kind: CollectionKind, items: I) -> Vec<(CanonicalColumn, CellValue)>
where
    I: IntoIterator<Item = &'a RawRecord>,
{
    let rules = kind.fold_rules();
    let mut collected: Vec<Vec<String>> = vec![Vec::new(); rules.len()];
    let mut country_names = Vec::new();

    for item in items {
        for (rule, values) in rules.iter().zip(collected.iter_mut()) {
            if rule.fold == Fold::First && !values.is_empty() {
                continue;
            }
            if let Some(value) = first_present(item, rule.sources) {
                if rule.column == CanonicalColumn::OrgCountries {
                    country_names.push(country_display_name(&value));
                }
                values.push(value);
            }
        }
    }

    let mut out = Vec::with_capacity(rules.len() + 1);
    for (rule, values) in rules.iter().zip(collected) {
        out.push((rule.column, composite_cell(&values)));
        if rule.column == CanonicalColumn::OrgCountries {
            out.push((CanonicalColumn::OrgCountryNames, composite_cell(&country_names)));
        }
    }
    out
}

/// One child collection folded to a row per normalized foreign key.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedCollection {
    pub kind: CollectionKind,
    pub columns: Vec<CanonicalColumn>,
    pub rows: IndexMap<String, Record>,
}

impl AggregatedCollection {
    pub fn empty(kind: CollectionKind) -> Self {
        Self {
            kind,
            columns: kind.output_columns(),
            rows: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.rows.get(id)
    }
}

pub fn aggregate_collection(
    kind: CollectionKind,
    rows: &[RawRecord],
    foreign_key: &str,
) -> AggregatedCollection {
    let mut groups: IndexMap<String, Vec<&RawRecord>> = IndexMap::new();
    let mut without_key = 0usize;

    for row in rows {
        let key = row
            .get(foreign_key)
            .map(CellValue::from_json)
            .and_then(|cell| normalize_identifier(&cell));
        match key {
            Some(key) => groups.entry(key).or_default().push(row),
            None => without_key += 1,
        }
    }

    if without_key > 0 {
        debug!(?kind, without_key, foreign_key, "child records without foreign key");
    }

    let mut aggregated = AggregatedCollection::empty(kind);
    for (key, items) in groups {
        let record: Record = fold_group(kind, items)
            .into_iter()
            .map(|(column, value)| (column.as_str().to_string(), value))
            .collect();
        aggregated.rows.insert(key, record);
    }
    aggregated
}

/// Raw project field name -> canonical column, covering every generation's spelling.
const FIELD_MAPPINGS: &[(&str, CanonicalColumn)] = &[
    ("projectID", CanonicalColumn::Id),
    ("id", CanonicalColumn::Id),
    ("acronym", CanonicalColumn::Acronym),
    ("status", CanonicalColumn::Status),
    ("title", CanonicalColumn::Title),
    ("objective", CanonicalColumn::Objective),
    ("startDate", CanonicalColumn::StartDate),
    ("endDate", CanonicalColumn::EndDate),
    ("contentUpdateDate", CanonicalColumn::ContentUpdateDate),
    ("frameworkProgramme", CanonicalColumn::FrameworkProgramme),
    ("programme", CanonicalColumn::FrameworkProgramme),
    ("legalBasis", CanonicalColumn::LegalBasis),
    ("masterCall", CanonicalColumn::MasterCall),
    ("call", CanonicalColumn::MasterCall),
    ("subCall", CanonicalColumn::SubCall),
    ("fundingScheme", CanonicalColumn::FundingScheme),
    ("ecMaxContribution", CanonicalColumn::EcMaxContribution),
    ("maxContribution", CanonicalColumn::EcMaxContribution),
    ("totalCost", CanonicalColumn::TotalCost),
    ("budget", CanonicalColumn::TotalCost),
    ("rcn", CanonicalColumn::Rcn),
    ("grantDoi", CanonicalColumn::GrantDoi),
    ("doi", CanonicalColumn::GrantDoi),
];

/// Canonical column -> flattened names adopted when the column is still empty.
const FIELD_ALTERNATIVES: &[(CanonicalColumn, &[&str])] = &[
    (CanonicalColumn::Id, &["projectid"]),
    (CanonicalColumn::FrameworkProgramme, &["programme", "framework"]),
    (CanonicalColumn::LegalBasis, &["legal_basis"]),
    (
        CanonicalColumn::EcMaxContribution,
        &["maxcontribution", "ec_max_contribution"],
    ),
    (CanonicalColumn::TotalCost, &["total_cost", "budget", "totalbudget"]),
    (CanonicalColumn::StartDate, &["start_date"]),
    (CanonicalColumn::EndDate, &["end_date"]),
    (CanonicalColumn::ContentUpdateDate, &["content_update_date"]),
    (CanonicalColumn::GrantDoi, &["grant_doi", "doi"]),
    (CanonicalColumn::TopicsCodes, &["topics"]),
];

/// Preference order when a generic nested list holds records.
const LIST_VALUE_KEYS: &[&str] = &["name", "title", "label", "description", "value"];

/// Column name for a raw field, optionally nested under `prefix`.
pub fn canonical_field_name(raw: &str, prefix: Option<&str>) -> String {
    let lookup = |name: &str| {
        FIELD_MAPPINGS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, column)| column.as_str().to_string())
    };
    match prefix {
        None => lookup(raw).unwrap_or_else(|| raw.to_lowercase()),
        Some(prefix) => {
            let full = format!("{prefix}_{raw}");
            lookup(&full).unwrap_or_else(|| full.to_lowercase())
        }
    }
}

/// Map one raw project record onto the canonical vocabulary.
///
/// Every canonical column is present in the result (null when unknown) and
/// comes first, in canonical order; unmapped fields follow under their
/// lower-cased names. The identifier is stored in canonical integer form.
pub fn reconcile_project(raw: &RawRecord) -> Record {
    let mut out: Record = CanonicalColumn::ALL
        .iter()
        .map(|column| (column.as_str().to_string(), CellValue::Null))
        .collect();

    flatten_into(raw, None, &mut out);

    for (column, alternatives) in FIELD_ALTERNATIVES {
        let name = column.as_str();
        if !out.get(name).map(CellValue::is_blank).unwrap_or(true) {
            continue;
        }
        let adopted = alternatives
            .iter()
            .filter_map(|alt| out.get(*alt))
            .find(|value| !value.is_blank())
            .cloned();
        if let Some(value) = adopted {
            out.insert(name.to_string(), value);
        }
    }

    let id = out
        .get(CanonicalColumn::Id.as_str())
        .and_then(normalize_identifier)
        .map(CellValue::Text)
        .unwrap_or_default();
    out.insert(CanonicalColumn::Id.as_str().to_string(), id);
    out
}

pub fn reconcile_projects(rows: &[RawRecord]) -> Table {
    Table::from_rows(rows.iter().map(reconcile_project).collect())
}

fn flatten_into(obj: &RawRecord, prefix: Option<&str>, out: &mut Record) {
    for (key, value) in obj {
        if let Some(kind) = CollectionKind::from_nested_key(key) {
            let items: Vec<&RawRecord> = match value {
                JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_object).collect(),
                JsonValue::Object(obj) => vec![obj],
                _ => Vec::new(),
            };
            if matches!(value, JsonValue::Array(_) | JsonValue::Object(_)) {
                for (column, cell) in fold_group(kind, items) {
                    assign(out, column.as_str(), cell);
                }
                continue;
            }
        }

        let name = canonical_field_name(key, prefix);
        match value {
            JsonValue::Object(child) => flatten_into(child, Some(name.as_str()), out),
            JsonValue::Array(items) => assign(out, &name, list_cell(items)),
            scalar => assign(out, &name, CellValue::from_json(scalar)),
        }
    }
}

/// First non-blank value for a column wins.
fn assign(out: &mut Record, name: &str, value: CellValue) {
    match out.get(name) {
        Some(existing) if !existing.is_blank() => {}
        _ => {
            out.insert(name.to_string(), value);
        }
    }
}

fn list_cell(items: &[JsonValue]) -> CellValue {
    let values: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            JsonValue::Object(obj) => first_present(obj, LIST_VALUE_KEYS),
            scalar => CellValue::from_json(scalar).to_text(),
        })
        .collect();
    composite_cell(&values)
}

/// Members of one archive sorted into the main table and its child collections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationCollections {
    pub projects: Option<Vec<RawRecord>>,
    pub children: BTreeMap<CollectionKind, Vec<RawRecord>>,
    pub ignored: Vec<String>,
}

pub fn split_collections(contents: ArchiveContents) -> GenerationCollections {
    let mut out = GenerationCollections::default();
    for (name, member) in contents.members {
        match CollectionKind::from_member_name(&name) {
            Some(CollectionKind::Project) => out
                .projects
                .get_or_insert_with(Vec::new)
                .extend(member.into_rows()),
            Some(kind) if !kind.is_excluded() => {
                out.children.entry(kind).or_default().extend(member.into_rows())
            }
            _ => {
                debug!(member = %name, "ignoring archive member");
                out.ignored.push(name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().expect("object")
    }

    fn text(record: &Record, column: &str) -> Option<String> {
        record.get(column).and_then(CellValue::to_text)
    }

    fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(body).expect("write member");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn reconciler_maps_generation_specific_names() {
        let record = reconcile_project(&raw(json!({
            "projectID": "105617.0",
            "programme": "H2020",
            "acronym": "ALPHA",
            "maxContribution": "1500,5",
            "ecSignatureDate": "2020-01-01"
        })));
        assert_eq!(text(&record, "id").as_deref(), Some("105617"));
        assert_eq!(text(&record, "frameworkprogramme").as_deref(), Some("H2020"));
        assert_eq!(text(&record, "ecmaxcontribution").as_deref(), Some("1500,5"));
        assert_eq!(text(&record, "ecsignaturedate").as_deref(), Some("2020-01-01"));
        assert_eq!(record.get("title"), Some(&CellValue::Null));
    }

    #[test]
    fn reconciler_output_starts_with_every_canonical_column() {
        let record = reconcile_project(&raw(json!({"zeta": 1, "id": 3})));
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        let canonical: Vec<_> = CanonicalColumn::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(&keys[..canonical.len()], canonical.as_slice());
        assert_eq!(keys.last(), Some(&"zeta"));
    }

    #[test]
    fn first_non_empty_spelling_wins() {
        let record = reconcile_project(&raw(json!({
            "id": 1,
            "frameworkProgramme": "",
            "programme": "FP7",
            "doi": "10.3030/1"
        })));
        assert_eq!(text(&record, "frameworkprogramme").as_deref(), Some("FP7"));
        assert_eq!(text(&record, "grantdoi").as_deref(), Some("10.3030/1"));
    }

    #[test]
    fn alternates_fill_empty_canonical_columns() {
        let record = reconcile_project(&raw(json!({
            "projectId": 77,
            "framework": "HORIZON",
            "total_cost": "1000",
            "start_date": "2022-01-01",
            "topics": "HORIZON-CL5-2021-D3-03-02"
        })));
        assert_eq!(text(&record, "id").as_deref(), Some("77"));
        assert_eq!(text(&record, "frameworkprogramme").as_deref(), Some("HORIZON"));
        assert_eq!(text(&record, "totalcost").as_deref(), Some("1000"));
        assert_eq!(text(&record, "startdate").as_deref(), Some("2022-01-01"));
        assert_eq!(
            text(&record, "topics_codes").as_deref(),
            Some("HORIZON-CL5-2021-D3-03-02")
        );
    }

    #[test]
    fn nested_objects_flatten_with_prefix_without_clobbering_scalars() {
        let record = reconcile_project(&raw(json!({
            "id": 5,
            "coordinator": {"name": "Uni", "title": "Coordinator title"},
            "title": "Project title"
        })));
        assert_eq!(text(&record, "coordinator_name").as_deref(), Some("Uni"));
        assert_eq!(
            text(&record, "coordinator_title").as_deref(),
            Some("Coordinator title")
        );
        assert_eq!(text(&record, "title").as_deref(), Some("Project title"));
    }

    #[test]
    fn nested_composites_fold_like_their_collections() {
        let record = reconcile_project(&raw(json!({
            "id": 42,
            "organizations": [
                {"name": "Org A", "country": "DE", "role": "coordinator"},
                {"name": "Org A", "country": "FR"},
                {"name": "Org B", "country": "DE", "city": "Berlin"}
            ],
            "euroSciVoc": [{"code": "/23/45", "label": "physics"}],
            "webLinks": [{"url": "https://a"}, {"physUrl": "https://b"}, {"url": "https://a"}]
        })));
        assert_eq!(text(&record, "org_names").as_deref(), Some("Org A | Org B"));
        assert_eq!(text(&record, "org_countries").as_deref(), Some("DE | FR"));
        assert_eq!(
            text(&record, "org_country_names").as_deref(),
            Some("Germany | France")
        );
        assert_eq!(text(&record, "roles").as_deref(), Some("coordinator"));
        assert_eq!(text(&record, "cities").as_deref(), Some("Berlin"));
        assert_eq!(text(&record, "euroscivoc_codes").as_deref(), Some("/23/45"));
        assert_eq!(text(&record, "euroscivoc_labels").as_deref(), Some("physics"));
        assert_eq!(
            text(&record, "project_urls").as_deref(),
            Some("https://a | https://b")
        );
        assert!(!record.contains_key("organizations"));
    }

    #[test]
    fn generic_lists_extract_preferred_fields() {
        let record = reconcile_project(&raw(json!({
            "id": 1,
            "keywords": [{"label": "x"}, {"name": "y", "label": "z"}, {"name": "x"}],
            "tags": ["a", "b", "a", ""],
            "empty": []
        })));
        assert_eq!(text(&record, "keywords").as_deref(), Some("x | y"));
        assert_eq!(text(&record, "tags").as_deref(), Some("a | b"));
        assert_eq!(record.get("empty"), Some(&CellValue::Null));
    }

    #[test]
    fn aggregation_groups_numeric_and_string_keys_together() {
        let rows: Vec<RawRecord> = vec![
            raw(json!({"projectID": 42, "name": "Org A", "country": "DE"})),
            raw(json!({"projectID": "42.0", "name": "Org A", "country": "FR"})),
            raw(json!({"projectID": "42", "name": "Org B", "country": "DE"})),
            raw(json!({"projectID": 7, "name": "Org C", "country": "ZZ"})),
            raw(json!({"name": "orphan"})),
        ];
        let agg = aggregate_collection(CollectionKind::Organization, &rows, PROJECT_FOREIGN_KEY);
        assert_eq!(agg.len(), 2);
        let row = agg.get("42").expect("42");
        assert_eq!(text(row, "org_names").as_deref(), Some("Org A | Org B"));
        assert_eq!(text(row, "org_countries").as_deref(), Some("DE | FR"));
        assert_eq!(text(row, "org_country_names").as_deref(), Some("Germany | France"));
        assert_eq!(row.get("roles"), Some(&CellValue::Null));
        let unknown = agg.get("7").expect("7");
        assert_eq!(text(unknown, "org_country_names").as_deref(), Some("ZZ"));
    }

    #[test]
    fn vocabulary_tries_legacy_field_names_per_element() {
        let rows = vec![
            raw(json!({"projectID": 1, "euroSciVocCode": "/a", "euroSciVocTitle": "alpha"})),
            raw(json!({"projectID": 1, "code": "/b", "label": "beta"})),
            raw(json!({"projectID": 1, "euroSciVoc": "/c", "euroSciVocLabel": "gamma"})),
        ];
        let agg = aggregate_collection(CollectionKind::Vocabulary, &rows, PROJECT_FOREIGN_KEY);
        let row = agg.get("1").expect("1");
        assert_eq!(text(row, "euroscivoc_codes").as_deref(), Some("/a | /b | /c"));
        assert_eq!(
            text(row, "euroscivoc_labels").as_deref(),
            Some("alpha | beta | gamma")
        );
    }

    #[test]
    fn topics_and_legal_basis_fold_rules() {
        let topics = vec![
            raw(json!({"projectID": 3, "topic": "T-1", "title": "First"})),
            raw(json!({"projectID": 3, "code": "T-2", "description": "Second"})),
        ];
        let agg = aggregate_collection(CollectionKind::Topic, &topics, PROJECT_FOREIGN_KEY);
        let row = agg.get("3").expect("3");
        assert_eq!(text(row, "topics_codes").as_deref(), Some("T-1 | T-2"));
        assert_eq!(text(row, "topics_desc").as_deref(), Some("First | Second"));

        let legal = vec![
            raw(json!({"projectID": 3, "legalBasis": null})),
            raw(json!({"projectID": 3, "legalBasis": "HORIZON.2.5"})),
            raw(json!({"projectID": 3, "legalBasis": "HORIZON.1.1"})),
        ];
        let agg = aggregate_collection(CollectionKind::LegalBasis, &legal, PROJECT_FOREIGN_KEY);
        assert_eq!(
            text(agg.get("3").expect("3"), "legalbasis").as_deref(),
            Some("HORIZON.2.5")
        );
    }

    #[test]
    fn empty_or_keyless_collections_aggregate_to_nothing() {
        let agg = aggregate_collection(CollectionKind::WebLink, &[], PROJECT_FOREIGN_KEY);
        assert!(agg.is_empty());
        assert_eq!(agg.columns, vec![CanonicalColumn::ProjectUrls]);

        let rows = vec![raw(json!({"physUrl": "https://x"}))];
        let agg = aggregate_collection(CollectionKind::WebLink, &rows, PROJECT_FOREIGN_KEY);
        assert!(agg.is_empty());
    }

    #[test]
    fn csv_members_use_semicolons_and_null_empty_cells() {
        let body = "\u{feff}id;title;objective;totalCost\n\"1\";\"Alpha; the first\";;\"100,5\"\n2;Beta;Text\n";
        let rows = parse_csv_member(body.as_bytes()).expect("csv");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!("1"));
        assert_eq!(rows[0]["title"], json!("Alpha; the first"));
        assert_eq!(rows[0]["objective"], JsonValue::Null);
        assert_eq!(rows[0]["totalCost"], json!("100,5"));
        assert!(!rows[1].contains_key("totalCost"));
    }

    #[test]
    fn json_members_unwrap_known_wrappers() {
        let rows = parse_json_member(br#"{"projects": [{"id": 1}, 5, {"id": 2}]}"#).expect("json");
        assert_eq!(rows.len(), 2);
        let single = parse_json_member(br#"{"id": 1, "title": "x"}"#).expect("json");
        assert!(matches!(single, ParsedMember::Object(_)));
        assert!(matches!(
            parse_json_member(b"42"),
            Err(MemberError::Shape("number"))
        ));
    }

    #[test]
    fn archive_reading_skips_malformed_members() {
        let bytes = zip_bytes(&[
            ("json/project.json", br#"[{"id": 1, "title": "A"}]"#),
            ("json/organization.json", br#"[{"projectID": 1, "name": "Org"}]"#),
            ("json/topics.json", b"{not json"),
            ("README.txt", b"ignored"),
        ]);
        let contents = read_archive(&bytes, ArchiveFormat::Json).expect("archive");
        assert_eq!(
            contents.members.keys().cloned().collect::<Vec<_>>(),
            vec!["organization.json".to_string(), "project.json".to_string()]
        );
        assert_eq!(contents.skipped.len(), 1);
        assert_eq!(contents.skipped[0].name, "topics.json");
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        assert!(read_archive(b"definitely not a zip", ArchiveFormat::Csv).is_err());
    }

    #[test]
    fn split_collections_excludes_low_value_members() {
        let mut contents = ArchiveContents::default();
        for name in [
            "project.json",
            "organization.json",
            "policyPriorities.json",
            "webItem.json",
            "webLink.json",
            "mystery.json",
        ] {
            contents
                .members
                .insert(name.to_string(), ParsedMember::Rows(vec![raw(json!({"projectID": 1}))]));
        }
        let split = split_collections(contents);
        assert_eq!(split.projects.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            split.children.keys().copied().collect::<Vec<_>>(),
            vec![CollectionKind::Organization, CollectionKind::WebLink]
        );
        assert_eq!(split.ignored.len(), 3);
    }

    #[test]
    fn builtin_sources_cover_three_generations() {
        let sources = cordis_sources(ArchiveFormat::Csv);
        assert_eq!(sources.len(), 3);
        assert_eq!(
            sources[1].url,
            "https://cordis.europa.eu/data/cordis-h2020projects-csv.zip"
        );
        assert!(sources.iter().all(|s| s.enabled && s.format == ArchiveFormat::Csv));
    }

    #[derive(Default)]
    struct StaticFetcher;

    #[async_trait]
    impl ArchiveFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _ctx: &FetchContext,
            source: &DatasetSource,
        ) -> Result<ArchiveContents, AdapterError> {
            let bytes = zip_bytes(&[("project.json", br#"[{"id": "9.0", "title": "T"}]"#)]);
            read_archive(&bytes, source.format).map_err(|err| AdapterError::Archive {
                locator: source.url.clone(),
                source: err,
            })
        }
    }

    #[tokio::test]
    async fn fetcher_trait_objects_yield_parsed_members() {
        let fetcher: Box<dyn ArchiveFetcher> = Box::new(StaticFetcher);
        let source = cordis_sources(ArchiveFormat::Json).remove(0);
        let contents = fetcher
            .fetch(&FetchContext { run_id: Uuid::new_v4() }, &source)
            .await
            .expect("fetch");
        let split = split_collections(contents);
        let table = reconcile_projects(&split.projects.expect("projects"));
        assert_eq!(table.len(), 1);
        assert_eq!(text(&table.rows[0], "id").as_deref(), Some("9"));
    }
}
