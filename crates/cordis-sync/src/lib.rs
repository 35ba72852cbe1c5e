//! Harvest pipeline orchestration: fetch each dataset generation, merge and
//! normalize it, cache the combined batch and upload it to the sink.

pub mod merge;
pub mod normalize;
pub mod sink;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cordis_adapters::{
    aggregate_collection, cordis_sources, reconcile_projects, split_collections, ArchiveContents,
    ArchiveFetcher, ArchiveFormat, DatasetSource, FetchContext, HttpArchiveFetcher,
    PROJECT_FOREIGN_KEY,
};
use cordis_core::ProjectRecord;
use cordis_storage::{BatchCache, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use merge::{coalesce, merge_collection, merge_generation};
pub use normalize::{normalize_table, NormalizeStats};
pub use sink::{upload_records, PostgrestSink, ProjectSink, SinkError, SinkMode, UploadSummary};

pub const CRATE_NAME: &str = "cordis-sync";

pub const DEFAULT_TABLE: &str = "cordis_projects";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_TEST_ROWS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<DatasetSource>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub table: String,
    pub format: ArchiveFormat,
    pub mode: SinkMode,
    pub cache_dir: PathBuf,
    pub batch_size: usize,
    pub upload_limit: Option<usize>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let upload_limit = if flag(lookup("TEST_MODE")) {
            Some(
                lookup("TEST_ROWS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_TEST_ROWS),
            )
        } else {
            None
        };

        Self {
            supabase_url: non_empty("SUPABASE_URL"),
            supabase_key: non_empty("SUPABASE_SERVICE_ROLE_KEY"),
            table: non_empty("SUPABASE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            format: match lookup("CORDIS_FORMAT").as_deref().map(str::trim) {
                Some(v) if v.eq_ignore_ascii_case("csv") => ArchiveFormat::Csv,
                _ => ArchiveFormat::Json,
            },
            mode: lookup("CORDIS_MODE")
                .as_deref()
                .and_then(SinkMode::parse)
                .unwrap_or_default(),
            cache_dir: non_empty("CORDIS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            batch_size: lookup("CORDIS_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            upload_limit,
            user_agent: non_empty("CORDIS_USER_AGENT")
                .unwrap_or_else(|| format!("cordis-harvester/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: lookup("CORDIS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(120),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Sink URL and key, or an error naming whichever is missing.
    pub fn sink_credentials(&self) -> Result<(&str, &str)> {
        match (self.supabase_url.as_deref(), self.supabase_key.as_deref()) {
            (Some(url), Some(key)) => Ok((url, key)),
            (None, _) => bail!("SUPABASE_URL is not set; cannot upload"),
            (_, None) => bail!("SUPABASE_SERVICE_ROLE_KEY is not set; cannot upload"),
        }
    }
}

/// `sources.yaml` under `root` when present, otherwise the three built-in generations.
pub async fn load_source_registry(root: &Path, format: ArchiveFormat) -> Result<Vec<DatasetSource>> {
    let path = root.join("sources.yaml");
    if !fs::try_exists(&path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(cordis_sources(format));
    }
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), sources = registry.sources.len(), "loaded source registry");
    Ok(registry.sources)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GenerationOutcome {
    Ok {
        projects_in: usize,
        records_out: usize,
        collections: usize,
        members_skipped: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationReport {
    pub label: String,
    pub url: String,
    pub outcome: GenerationOutcome,
}

impl GenerationReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, GenerationOutcome::Ok { .. })
    }
}

/// Result of running one generation's archive through reconcile, aggregate,
/// merge and normalize.
#[derive(Debug, Clone)]
pub struct ProcessedGeneration {
    pub records: Vec<ProjectRecord>,
    pub projects_in: usize,
    pub collections: usize,
    pub members_skipped: usize,
    pub stats: NormalizeStats,
}

pub fn process_generation(contents: ArchiveContents, label: &str) -> Result<ProcessedGeneration> {
    let members_skipped = contents.skipped.len();
    let split = split_collections(contents);
    let Some(projects) = split.projects else {
        bail!("archive for {label} has no project member");
    };

    let main = reconcile_projects(&projects);
    let children: BTreeMap<_, _> = split
        .children
        .iter()
        .map(|(kind, rows)| (*kind, aggregate_collection(*kind, rows, PROJECT_FOREIGN_KEY)))
        .collect();
    for (kind, aggregated) in &children {
        info!(?kind, projects = aggregated.len(), "aggregated child collection");
    }

    let merged = merge_generation(main, &children, label);
    let (records, stats) = normalize_table(&merged);
    if records.is_empty() {
        bail!(
            "no data extracted for {label}: {} project rows, none survived normalization",
            projects.len()
        );
    }
    Ok(ProcessedGeneration {
        records,
        projects_in: projects.len(),
        collections: children.len(),
        members_skipped,
        stats,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub generations: Vec<GenerationReport>,
    pub records: usize,
    pub cache_dir: String,
    pub upload: Option<UploadSummary>,
}

impl RunSummary {
    /// Human-readable report, one line per generation plus totals.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("run {} ({} records)", self.run_id, self.records)];
        for generation in &self.generations {
            let line = match &generation.outcome {
                GenerationOutcome::Ok {
                    projects_in,
                    records_out,
                    collections,
                    members_skipped,
                } => format!(
                    "  {}: {projects_in} projects -> {records_out} records ({collections} child collections, {members_skipped} members skipped)",
                    generation.label
                ),
                GenerationOutcome::Failed { error } => {
                    format!("  {}: FAILED {error}", generation.label)
                }
            };
            lines.push(line);
        }
        lines.push(format!("  cache: {}", self.cache_dir));
        if let Some(upload) = &self.upload {
            lines.push(render_upload(upload));
        }
        lines.join("\n")
    }
}

pub fn render_upload(upload: &UploadSummary) -> String {
    let mut out = format!(
        "  upload: {}/{} records ok, {} failed, batches {} ok / {} failed, success rate {:.1}%",
        upload.records_ok,
        upload.attempted,
        upload.records_failed,
        upload.batches_ok,
        upload.batches_failed,
        upload.success_rate()
    );
    for failure in &upload.failures {
        out.push_str(&format!(
            "\n    id={} {}",
            failure.id.as_deref().unwrap_or("<none>"),
            failure.reason
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    pub upload: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    sources: Vec<DatasetSource>,
    cache: BatchCache,
    fetcher: Box<dyn ArchiveFetcher>,
    sink: Option<Box<dyn ProjectSink>>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let sink: Option<Box<dyn ProjectSink>> = match config.sink_credentials() {
            Ok((url, key)) => Some(Box::new(PostgrestSink::new(
                http.client().clone(),
                url,
                &config.table,
                key,
                config.mode,
            ))),
            Err(_) => None,
        };
        let sources = load_source_registry(&config.workspace_root, config.format).await?;
        Ok(Self {
            cache: BatchCache::new(config.cache_dir.clone()),
            fetcher: Box::new(HttpArchiveFetcher::from_fetcher(http)),
            sources,
            sink,
            config,
        })
    }

    /// Pipeline over explicit collaborators, no network or registry lookup.
    pub fn with_parts(
        config: SyncConfig,
        sources: Vec<DatasetSource>,
        fetcher: Box<dyn ArchiveFetcher>,
        sink: Option<Box<dyn ProjectSink>>,
    ) -> Self {
        Self {
            cache: BatchCache::new(config.cache_dir.clone()),
            config,
            sources,
            fetcher,
            sink,
        }
    }

    pub fn sources(&self) -> &[DatasetSource] {
        &self.sources
    }

    fn require_sink(&self) -> Result<&dyn ProjectSink> {
        match &self.sink {
            Some(sink) => Ok(sink.as_ref()),
            None => {
                self.config.sink_credentials()?;
                bail!("no sink configured");
            }
        }
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<RunSummary> {
        if options.upload {
            self.require_sink()?;
        }

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = FetchContext { run_id };
        let enabled: Vec<&DatasetSource> = self.sources.iter().filter(|s| s.enabled).collect();
        info!(%run_id, generations = enabled.len(), "starting harvest");

        let mut reports = Vec::with_capacity(enabled.len());
        let mut all_records: Vec<ProjectRecord> = Vec::new();

        for source in enabled {
            let span = info_span!("generation", generation = %source.label, %run_id);
            let result: Result<ProcessedGeneration> = async {
                let contents = self.fetcher.fetch(&ctx, source).await?;
                process_generation(contents, &source.label)
            }
            .instrument(span)
            .await;

            let outcome = match result {
                Ok(processed) => {
                    info!(
                        generation = %source.label,
                        records = processed.records.len(),
                        "generation processed"
                    );
                    let outcome = GenerationOutcome::Ok {
                        projects_in: processed.projects_in,
                        records_out: processed.records.len(),
                        collections: processed.collections,
                        members_skipped: processed.members_skipped,
                    };
                    all_records.extend(processed.records);
                    outcome
                }
                Err(err) => {
                    warn!(generation = %source.label, error = %format!("{err:#}"), "generation failed");
                    GenerationOutcome::Failed {
                        error: format!("{err:#}"),
                    }
                }
            };
            reports.push(GenerationReport {
                label: source.label.clone(),
                url: source.url.clone(),
                outcome,
            });
        }

        if all_records.is_empty() || !reports.iter().any(GenerationReport::succeeded) {
            bail!("no dataset generation produced data");
        }

        let stored = self
            .cache
            .store_batch(run_id, Utc::now(), &all_records)
            .await
            .context("caching normalized batch")?;
        info!(path = %stored.batch_path.display(), records = all_records.len(), "cached normalized batch");

        let upload = if options.upload {
            let sink = self.require_sink()?;
            Some(
                upload_records(
                    sink,
                    &all_records,
                    self.config.batch_size,
                    self.config.upload_limit,
                )
                .await,
            )
        } else {
            None
        };

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            generations: reports,
            records: all_records.len(),
            cache_dir: stored.batch_dir.display().to_string(),
            upload,
        })
    }

    /// Re-upload a cached batch; `None` picks the most recent run.
    pub async fn upload_from_cache(&self, batch_dir: Option<PathBuf>) -> Result<UploadSummary> {
        let sink = self.require_sink()?;
        let batch_dir = match batch_dir {
            Some(dir) => dir,
            None => self
                .cache
                .latest_batch()
                .await?
                .with_context(|| format!("no cached batch under {}", self.cache.root().display()))?,
        };
        let (manifest, records): (_, Vec<ProjectRecord>) = self.cache.load_batch(&batch_dir).await?;
        info!(run_id = %manifest.run_id, records = records.len(), "uploading cached batch");
        Ok(upload_records(
            sink,
            &records,
            self.config.batch_size,
            self.config.upload_limit,
        )
        .await)
    }
}

pub async fn run_sync_once_from_env(options: RunOptions) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    if options.upload {
        config.sink_credentials()?;
    }
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once(options).await
}

pub async fn upload_cache_from_env(batch_dir: Option<PathBuf>) -> Result<UploadSummary> {
    let config = SyncConfig::from_env();
    config.sink_credentials()?;
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.upload_from_cache(batch_dir).await
}
