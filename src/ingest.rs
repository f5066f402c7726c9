//! Ingest orchestration.
//!
//! Owns the archive queue and drives the full per-archive pipeline across
//! a pool of workers:
//!
//! ```text
//! discover ─▶ checksum ─▶ journal? ──skip──▶ done
//!                │
//!                ▼ (spawn_blocking)
//!          read + decode ─▶ department ─▶ transform ─▶ insert ─▶ journal
//! ```
//!
//! # Scheduling
//!
//! `min(--jobs, host CPUs)` archives run concurrently; each worker takes
//! one archive through decode, transform and insert serially — within one
//! sheet there is nothing worth parallelizing, the data is small and
//! cache-warm. Decode is CPU-bound and runs on the blocking pool; inserts
//! share the connection pool. There is no ordering across archives.
//!
//! # Incremental runs
//!
//! The content checksum (SHA-256) of every archive is compared against the
//! `ingest_journal` table *before* decompression; matches skip the archive
//! entirely. New checksums are published by workers over a channel and
//! written by a single collector task, never by the workers themselves.
//!
//! # Failure isolation
//!
//! An archive failure is logged with its path and reason and costs only
//! that archive. A lost database connection (after the sink's single
//! retry) additionally stops dispatching new archives, as does Ctrl-C:
//! in-flight archives finish, nothing new starts, and the run exits
//! non-zero if anything failed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use geo::{BoundingRect, Rect};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive;
use crate::config::{Config, TableKind};
use crate::db::{self, DbConfig};
use crate::decoder::{self, DecodedSheet, KindFilter};
use crate::department::{self, DepartmentIndex, DepartmentPolicy};
use crate::progress::Progress;
use crate::reproject::Reprojector;
use crate::sink::{InsertStats, Sink};
use crate::transform::{self, ArchiveContext};

/// Everything the `ingest` command needs beyond the connection settings.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Directory tree or single `.tar.bz2` archive.
    pub source: PathBuf,
    /// Millésime as `YYYY-MM`.
    pub date: String,
    pub schema: String,
    /// Preset name or config file path.
    pub config_spec: String,
    pub target_epsg: u32,
    /// Coordinate precision override; defaults per target CRS.
    pub precision: Option<u8>,
    pub jobs: Option<usize>,
    /// Department policy: `auto`, `fromFile` or a literal code.
    pub dep: String,
    /// Department boundary GeoJSON, required by the `auto` policy.
    pub departments: Option<PathBuf>,
    pub drop_schema: bool,
    pub drop_table: bool,
    pub verbosity: u8,
}

/// End-of-run accounting.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub archives: usize,
    pub loaded: usize,
    pub skipped_unchanged: usize,
    pub not_dispatched: usize,
    pub failed: usize,
    pub decode_errors: usize,
    pub row_errors: usize,
    pub skipped_kinds: usize,
    pub stats: InsertStats,
}

impl IngestReport {
    /// Full success: every discovered archive either loaded or was
    /// journalled as unchanged.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_dispatched == 0
    }

    pub fn print_summary(&self, date: &str) {
        println!("ingest {}", date);
        println!("  archives: {}", self.archives);
        println!("  loaded: {}", self.loaded);
        if self.skipped_unchanged > 0 {
            println!("  skipped (unchanged): {}", self.skipped_unchanged);
        }
        if self.not_dispatched > 0 {
            println!("  not dispatched (stop requested): {}", self.not_dispatched);
        }
        if self.failed > 0 {
            println!("  failed: {}", self.failed);
        }
        println!("  rows inserted: {}", self.stats.total());
        let mut tables: Vec<_> = self.stats.rows_by_table.iter().collect();
        tables.sort();
        for (table, rows) in tables {
            println!("    {}: {}", table, rows);
        }
        if self.decode_errors > 0 {
            println!("  decode errors (features dropped): {}", self.decode_errors);
        }
        if self.row_errors > 0 {
            println!("  row errors (coercion/reprojection): {}", self.row_errors);
        }
        if self.skipped_kinds > 0 {
            println!("  features of unconfigured kinds: {}", self.skipped_kinds);
        }
        println!("{}", if self.is_success() { "ok" } else { "failed" });
    }
}

/// Runs the DDL phase only (`cadingest init`).
pub async fn run_init(
    db_config: &DbConfig,
    schema: &str,
    config_spec: &str,
    target_epsg: u32,
    drop_schema: bool,
    drop_table: bool,
) -> Result<()> {
    let config = Config::load(config_spec)?;
    let pool = db::connect(db_config).await?;
    let sink = Sink::new(pool, schema);
    sink.prepare(&config, target_epsg, drop_schema, drop_table)
        .await?;
    println!("schema {} ready ({} tables)", schema, config.tables.len());
    Ok(())
}

/// Runs the full ingest pipeline.
pub async fn run_ingest(options: &IngestOptions, db_config: &DbConfig) -> Result<IngestReport> {
    let millesime = transform::millesime_year(&options.date)?;
    let policy = DepartmentPolicy::parse(&options.dep)?;
    let config = Arc::new(Config::load(&options.config_spec)?);
    let precision = options
        .precision
        .unwrap_or_else(|| transform::default_precision(options.target_epsg));

    // The decoder keeps only the kinds some table wants, plus COMMUNE and
    // SECTION which feed the per-archive constants and the spatial lookup.
    let mut wanted: HashSet<String> = config.wanted_kinds();
    wanted.insert("COMMUNE_ID".to_string());
    wanted.insert("SECTION_ID".to_string());
    let wanted: Arc<KindFilter> = Arc::new(Some(wanted));

    let boundary_index: Option<&'static DepartmentIndex> = match (&policy, &options.departments) {
        (DepartmentPolicy::Spatial, Some(path)) => Some(DepartmentIndex::global(path)?),
        (DepartmentPolicy::Spatial, None) => {
            bail!("department policy 'auto' requires --departments <geojson>")
        }
        _ => None,
    };

    let archives = discover_archives(&options.source)?;
    if archives.is_empty() {
        bail!(
            "no EDIGEO archives (*.tar.bz2) found in {}",
            options.source.display()
        );
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let jobs = options.jobs.map(|j| j.clamp(1, cpus)).unwrap_or(cpus);

    info!(
        source = %options.source.display(),
        archives = archives.len(),
        jobs,
        schema = options.schema.as_str(),
        config = options.config_spec.as_str(),
        target_epsg = options.target_epsg,
        "starting ingest"
    );

    let pool = db::connect(db_config).await?;
    let sink = Arc::new(Sink::new(pool, options.schema.clone()));
    sink.prepare(
        &config,
        options.target_epsg,
        options.drop_schema,
        options.drop_table,
    )
    .await?;

    let progress = Arc::new(Progress::new(archives.len() as u64, options.verbosity));
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("stop requested, finishing in-flight archives");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    // Workers publish (archive, checksum) pairs; one collector owns all
    // journal writes.
    let (journal_tx, mut journal_rx) = mpsc::unbounded_channel::<(String, String)>();
    let journal_task = {
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            while let Some((archive, checksum)) = journal_rx.recv().await {
                if let Err(e) = sink.record_checksum(&archive, &checksum).await {
                    warn!(archive = archive.as_str(), "journal write failed: {:#}", e);
                }
            }
        })
    };

    let loaded = Arc::new(AtomicUsize::new(0));
    let skipped_unchanged = Arc::new(AtomicUsize::new(0));
    let not_dispatched = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let decode_errors = Arc::new(AtomicUsize::new(0));
    let row_errors = Arc::new(AtomicUsize::new(0));
    let skipped_kinds = Arc::new(AtomicUsize::new(0));
    let stats = Arc::new(Mutex::new(InsertStats::default()));

    let archive_count = archives.len();

    stream::iter(archives.into_iter())
        .for_each_concurrent(jobs, |path| {
            let config = Arc::clone(&config);
            let wanted = Arc::clone(&wanted);
            let sink = Arc::clone(&sink);
            let progress = Arc::clone(&progress);
            let stop = Arc::clone(&stop);
            let journal_tx = journal_tx.clone();
            let loaded = Arc::clone(&loaded);
            let skipped_unchanged = Arc::clone(&skipped_unchanged);
            let not_dispatched = Arc::clone(&not_dispatched);
            let failed = Arc::clone(&failed);
            let decode_errors = Arc::clone(&decode_errors);
            let row_errors = Arc::clone(&row_errors);
            let skipped_kinds = Arc::clone(&skipped_kinds);
            let stats = Arc::clone(&stats);
            let policy = policy.clone();

            async move {
                let name = archive_basename(&path);
                if stop.load(Ordering::SeqCst) {
                    not_dispatched.fetch_add(1, Ordering::Relaxed);
                    progress.archive_done(&name);
                    return;
                }

                let worker = Worker {
                    config: config.as_ref(),
                    wanted: wanted.as_ref(),
                    sink: sink.as_ref(),
                    policy: &policy,
                    boundary_index,
                    millesime,
                    target_epsg: options.target_epsg,
                    precision,
                    decode_errors: decode_errors.as_ref(),
                    row_errors: row_errors.as_ref(),
                    skipped_kinds: skipped_kinds.as_ref(),
                };

                match worker.process(&path, &name).await {
                    Ok(Outcome::Skipped) => {
                        skipped_unchanged.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Outcome::Loaded { stats: local, checksum }) => {
                        if let Ok(mut all) = stats.lock() {
                            all.merge(&local);
                        }
                        if let Some(checksum) = checksum {
                            let _ = journal_tx.send((name.clone(), checksum));
                        }
                        loaded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(archive = %path.display(), "archive failed: {:#}", e);
                        failed.fetch_add(1, Ordering::Relaxed);
                        if crate::sink::is_connection_failure(&e) {
                            warn!("database connection lost, stopping dispatch");
                            stop.store(true, Ordering::SeqCst);
                        }
                    }
                }
                progress.archive_done(&name);
            }
        })
        .await;

    drop(journal_tx);
    let _ = journal_task.await;

    // Deferred foreign keys run strictly after all loads.
    sink.apply_deferred_constraints(&config)
        .await
        .context("deferred foreign-key constraints failed")?;

    let report = IngestReport {
        archives: archive_count,
        loaded: loaded.load(Ordering::Relaxed),
        skipped_unchanged: skipped_unchanged.load(Ordering::Relaxed),
        not_dispatched: not_dispatched.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        decode_errors: decode_errors.load(Ordering::Relaxed),
        row_errors: row_errors.load(Ordering::Relaxed),
        skipped_kinds: skipped_kinds.load(Ordering::Relaxed),
        stats: stats.lock().map(|s| s.clone()).unwrap_or_default(),
    };

    info!(
        loaded = report.loaded,
        skipped = report.skipped_unchanged,
        failed = report.failed,
        rows = report.stats.total(),
        "ingest complete"
    );

    Ok(report)
}

enum Outcome {
    /// Journal says the archive is unchanged.
    Skipped,
    Loaded {
        stats: InsertStats,
        checksum: Option<String>,
    },
}

/// Borrowed per-archive pipeline state.
struct Worker<'a> {
    config: &'a Config,
    wanted: &'a KindFilter,
    sink: &'a Sink,
    policy: &'a DepartmentPolicy,
    boundary_index: Option<&'static DepartmentIndex>,
    millesime: i16,
    target_epsg: u32,
    precision: u8,
    decode_errors: &'a AtomicUsize,
    row_errors: &'a AtomicUsize,
    skipped_kinds: &'a AtomicUsize,
}

impl Worker<'_> {
    async fn process(&self, path: &Path, name: &str) -> Result<Outcome> {
        // Checksum first: an unchanged archive must be skipped before any
        // decompression happens.
        let checksum = {
            let path = path.to_path_buf();
            match tokio::task::spawn_blocking(move || file_checksum(&path)).await {
                Ok(Ok(checksum)) => Some(checksum),
                Ok(Err(e)) => {
                    warn!(archive = name, "checksum failed, ingesting anyway: {:#}", e);
                    None
                }
                Err(e) => {
                    warn!(archive = name, "checksum task failed: {}", e);
                    None
                }
            }
        };

        if let Some(current) = &checksum {
            match self.sink.journal_checksum(name).await {
                Ok(Some(previous)) if &previous == current => {
                    debug!(archive = name, "unchanged, skipping");
                    return Ok(Outcome::Skipped);
                }
                Ok(_) => {}
                Err(e) => warn!(archive = name, "journal lookup failed: {:#}", e),
            }
        }

        let sheet = {
            let path = path.to_path_buf();
            let wanted = self.wanted.clone();
            tokio::task::spawn_blocking(move || -> Result<DecodedSheet> {
                let bundle = archive::read_sheet(&path)?;
                Ok(decoder::decode_sheet(&bundle, &wanted)?)
            })
            .await
            .context("decode task panicked")??
        };

        for error in &sheet.errors {
            debug!(archive = name, "feature dropped: {}", error);
        }
        self.decode_errors
            .fetch_add(sheet.errors.len(), Ordering::Relaxed);
        self.skipped_kinds
            .fetch_add(sheet.skipped_kinds, Ordering::Relaxed);

        let dep = self.resolve_department(path, &sheet)?;
        let reprojector = Reprojector::new(sheet.crs.epsg, self.target_epsg)?;

        let context = ArchiveContext {
            dep,
            millesime: self.millesime,
            commune_id: sheet.first_idu("COMMUNE_ID").unwrap_or_default().to_string(),
            section_id: sheet.first_idu("SECTION_ID").unwrap_or_default().to_string(),
        };

        let mut stats = InsertStats::default();
        for (kind_key, table) in self.config.ordered_tables() {
            let rows = match table.kind {
                TableKind::FeatureCollection => {
                    let kind = kind_key.to_uppercase();
                    let Some(features) = sheet.features.get(&kind) else {
                        continue;
                    };
                    let mut rows = Vec::with_capacity(features.len());
                    for feature in features {
                        match transform::feature_row(
                            table,
                            feature,
                            &context,
                            &reprojector,
                            self.precision,
                        ) {
                            Ok(row) => rows.push(row),
                            Err(e) => {
                                debug!(archive = name, feature = feature.id.as_str(), "{}", e);
                                self.row_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    rows
                }
                TableKind::Relation => {
                    let mut rows = Vec::new();
                    for pair in &sheet.relations {
                        match transform::relation_row(table, pair, &context) {
                            Ok(Some(row)) => rows.push(row),
                            Ok(None) => {}
                            Err(e) => {
                                debug!(archive = name, relation = pair.name.as_str(), "{}", e);
                                self.row_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    rows
                }
            };

            if rows.is_empty() {
                continue;
            }
            let inserted = self.sink.insert_rows(table, &rows).await?;
            stats.add(&table.table, inserted);
        }

        Ok(Outcome::Loaded { stats, checksum })
    }

    fn resolve_department(&self, path: &Path, sheet: &DecodedSheet) -> Result<String> {
        match self.policy {
            DepartmentPolicy::Explicit(code) => Ok(code.clone()),
            DepartmentPolicy::FromFilename => department::from_filename(path).with_context(|| {
                format!("cannot derive department from filename: {}", path.display())
            }),
            DepartmentPolicy::Spatial => {
                let index = self
                    .boundary_index
                    .context("spatial department policy without a boundary index")?;
                let Some(bbox) = self.section_bbox_wgs84(sheet)? else {
                    warn!("sheet has no SECTION geometry, using department 00");
                    return Ok("00".to_string());
                };
                Ok(index.resolve(bbox))
            }
        }
    }

    /// Bounding box of the sheet's SECTION feature, reprojected to the
    /// boundary set's WGS84 frame.
    fn section_bbox_wgs84(&self, sheet: &DecodedSheet) -> Result<Option<Rect>> {
        let Some(bbox) = sheet
            .features
            .get("SECTION_ID")
            .and_then(|sections| sections.first())
            .and_then(|section| section.geometry.bounding_rect())
        else {
            return Ok(None);
        };

        let to_wgs84 = Reprojector::new(sheet.crs.epsg, 4326)?;
        let (min_x, min_y) = to_wgs84.transform_point(bbox.min().x, bbox.min().y)?;
        let (max_x, max_y) = to_wgs84.transform_point(bbox.max().x, bbox.max().y)?;
        Ok(Some(Rect::new(
            geo::Coord { x: min_x, y: min_y },
            geo::Coord { x: max_x, y: max_y },
        )))
    }
}

/// Walks `source` for `*.tar.bz2` archives (or accepts a single archive
/// path), sorted for deterministic dispatch order.
pub fn discover_archives(source: &Path) -> Result<Vec<PathBuf>> {
    let is_archive =
        |name: &str| name.ends_with(".tar.bz2") || name.ends_with(".TAR.BZ2");

    if source.is_file() {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !is_archive(name) {
            bail!("{} is not a .tar.bz2 archive", source.display());
        }
        return Ok(vec![source.to_path_buf()]);
    }

    let mut archives = Vec::new();
    for entry in WalkDir::new(source) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .map(is_archive)
            .unwrap_or(false)
        {
            archives.push(entry.into_path());
        }
    }
    archives.sort();
    Ok(archives)
}

/// Archive basename without the `.tar.bz2` suffix — the journal key.
pub fn archive_basename(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    name.strip_suffix(".tar.bz2")
        .or_else(|| name.strip_suffix(".TAR.BZ2"))
        .unwrap_or(name)
        .to_string()
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn file_checksum(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
