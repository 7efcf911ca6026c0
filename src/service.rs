//! Audit service facade consumed by the HTTP layer.
//!
//! Owns the site registry, one pool per opened site and the dashboard cache.
//! Mutations invalidate the cache before returning and say so in their
//! result; the caller decides when to re-query. Long operations come back
//! as [`TaskHandle`]s.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::{CacheKey, DashboardCache};
use crate::collapse::{collapse_range, DayOutcomes};
use crate::config::Config;
use crate::error::{AuditError, ExportError};
use crate::export::{self, ExportFormat};
use crate::import::{self, ImportSummary};
use crate::metrics::{daily_series, DailyAggregate};
use crate::models::{DateRange, EquipmentNote, NewNote, TestEvent};
use crate::pivot::{DashboardMatrix, DashboardTable};
use crate::registry::SiteRegistry;
use crate::reports::{
    common_failures, consolidate_rankings, consolidated_trend, failure_day_ranking,
    interval_counts, site_report, CommonFailures, ConsolidatedFailureRow, DatabaseStats,
    IntervalCount, SiteDailyAggregate, SiteFailureRow,
};
use crate::store::SiteStore;
use crate::tasks::{spawn_task, TaskContext, TaskHandle};

// ---

pub const COMMON_FAILURES_LIMIT: usize = 10;

/// Result of a mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mutation {
    // ---
    pub rows_affected: u64,
    /// Always true: the dashboard cache was cleared, re-query when ready.
    pub cache_invalidated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    // ---
    pub name: String,
    pub database: String,
    pub exists: bool,
}

/// A dashboard matrix together with the presentation-side notes flag.
#[derive(Debug, Clone)]
pub struct Dashboard {
    // ---
    pub site: String,
    pub range: DateRange,
    pub matrix: Arc<DashboardMatrix>,
    pub noted: HashSet<String>,
    pub from_cache: bool,
}

impl Dashboard {
    pub fn table(&self) -> DashboardTable {
        self.matrix.to_table(&self.noted)
    }
}

/// What the multi-site fail-count export wrote.
#[derive(Debug, Clone, Serialize)]
pub struct FailCountExport {
    // ---
    pub path: PathBuf,
    pub sites: Vec<String>,
    pub skipped: Vec<String>,
    pub daily: BTreeMap<NaiveDate, BTreeMap<String, usize>>,
}

/// One site's events and collapsed days for a cross-site report.
struct SiteData {
    // ---
    site: String,
    events: Vec<TestEvent>,
    days: DayOutcomes,
}

struct Inner {
    // ---
    config: Config,
    registry: RwLock<SiteRegistry>,
    cache: DashboardCache,
    stores: Mutex<HashMap<String, SiteStore>>,
}

#[derive(Clone)]
pub struct AuditService {
    inner: Arc<Inner>,
}

/// Clears a site's cached dashboard when dropped.
struct InvalidateOnDrop {
    // ---
    service: AuditService,
    site: String,
}

impl Drop for InvalidateOnDrop {
    fn drop(&mut self) {
        self.service.inner.cache.invalidate_site(&self.site);
    }
}

impl AuditService {
    // ---
    pub async fn new(config: Config) -> Self {
        // ---
        let registry = SiteRegistry::load(&config.data_dir).await;
        AuditService {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(registry),
                cache: DashboardCache::new(),
                stores: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The configured window ending today.
    pub fn default_range(&self) -> DateRange {
        DateRange::last_days(self.inner.config.default_range_days)
    }

    fn mutated(&self, site: &str, rows_affected: u64) -> Mutation {
        // ---
        self.inner.cache.invalidate_site(site);
        Mutation {
            rows_affected,
            cache_invalidated: true,
        }
    }

    /// Explicit cache reset for callers that changed data out of band.
    pub fn invalidate_cache(&self) -> bool {
        self.inner.cache.invalidate()
    }

    /// Open (or reuse) the store of a registered site.
    async fn store(&self, site: &str) -> Result<(String, SiteStore), AuditError> {
        // ---
        let (site, path) = self.inner.registry.read().await.resolve(Some(site))?;

        let mut stores = self.inner.stores.lock().await;
        if let Some(store) = stores.get(&site) {
            return Ok((site, store.clone()));
        }
        let store = SiteStore::open(&path, &self.inner.config.store_options()).await?;
        stores.insert(site.clone(), store.clone());
        Ok((site, store))
    }

    // --- sites

    pub async fn sites(&self) -> Vec<SiteInfo> {
        // ---
        let listed: Vec<(String, String)> = {
            let registry = self.inner.registry.read().await;
            registry
                .sites()
                .iter()
                .map(|(name, file)| (name.clone(), file.clone()))
                .collect()
        };

        let mut sites = Vec::with_capacity(listed.len());
        for (name, database) in listed {
            let path = self.inner.config.data_dir.join(&database);
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            sites.push(SiteInfo {
                name,
                database,
                exists,
            });
        }
        sites
    }

    pub async fn add_site(&self, name: &str) -> Result<SiteInfo, AuditError> {
        // ---
        let (name, path) = self.inner.registry.write().await.add_site(name).await?;
        let store = SiteStore::open(&path, &self.inner.config.store_options()).await?;
        self.inner.stores.lock().await.insert(name.clone(), store);

        Ok(SiteInfo {
            database: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            exists: true,
            name,
        })
    }

    pub async fn remove_site(&self, name: &str, delete_data: bool) -> Result<Mutation, AuditError> {
        // ---
        if let Some(store) = self.inner.stores.lock().await.remove(name) {
            store.close().await;
        }
        self.inner
            .registry
            .write()
            .await
            .remove_site(name, delete_data)
            .await?;
        Ok(self.mutated(name, 1))
    }

    // --- single-site views

    /// Dashboard matrix for one site, served from the cache when allowed.
    pub async fn dashboard(
        &self,
        site: &str,
        range: DateRange,
        use_cache: bool,
    ) -> Result<Dashboard, AuditError> {
        // ---
        let (site, store) = self.store(site).await?;
        let key = CacheKey::new(&site, &range);
        let noted = store.equipment_with_notes().await?;

        if use_cache {
            if let Some(matrix) = self.inner.cache.get(&key) {
                return Ok(Dashboard {
                    site,
                    range,
                    matrix,
                    noted,
                    from_cache: true,
                });
            }
        }

        let generation = self.inner.cache.generation();
        let events = store.events_between(&range).await?;
        let (_, days) = collapse_range(&events, &range);
        let matrix = Arc::new(DashboardMatrix::build(&days));
        self.inner.cache.put(key, Arc::clone(&matrix), generation);

        info!(
            "Dashboard for {} ({}): {} equipment x {} dates",
            site,
            range,
            matrix.rows.len(),
            matrix.dates.len()
        );
        Ok(Dashboard {
            site,
            range,
            matrix,
            noted,
            from_cache: false,
        })
    }

    async fn site_days(
        &self,
        site: &str,
        range: &DateRange,
    ) -> Result<(Vec<TestEvent>, DayOutcomes), AuditError> {
        // ---
        let (_, store) = self.store(site).await?;
        let events = store.events_between(range).await?;
        let (_, days) = collapse_range(&events, range);
        Ok((events, days))
    }

    pub async fn daily_series(
        &self,
        site: &str,
        range: DateRange,
    ) -> Result<Vec<DailyAggregate>, AuditError> {
        let (_, days) = self.site_days(site, &range).await?;
        Ok(daily_series(&days))
    }

    pub async fn common_failures(
        &self,
        site: &str,
        range: DateRange,
    ) -> Result<CommonFailures, AuditError> {
        let (events, days) = self.site_days(site, &range).await?;
        Ok(common_failures(&events, &days, COMMON_FAILURES_LIMIT))
    }

    pub async fn interval_counts(
        &self,
        site: &str,
        range: DateRange,
    ) -> Result<Vec<IntervalCount>, AuditError> {
        // ---
        let (_, store) = self.store(site).await?;
        let events = store.events_between(&range).await?;
        Ok(interval_counts(&events))
    }

    pub async fn site_failure_ranking(
        &self,
        site: &str,
        range: DateRange,
    ) -> Result<Vec<SiteFailureRow>, AuditError> {
        let (events, days) = self.site_days(site, &range).await?;
        Ok(failure_day_ranking(&events, &days))
    }

    pub async fn database_stats(&self, site: &str) -> Result<DatabaseStats, AuditError> {
        let (site, store) = self.store(site).await?;
        Ok(store.database_stats(&site).await?)
    }

    // --- notes and mutations

    pub async fn notes(&self, site: &str, equipment_id: &str) -> Result<Vec<EquipmentNote>, AuditError> {
        let (_, store) = self.store(site).await?;
        Ok(store.notes_for(equipment_id).await?)
    }

    pub async fn add_note(&self, site: &str, note: &NewNote) -> Result<Mutation, AuditError> {
        // ---
        let (site, store) = self.store(site).await?;
        store.add_note(note).await?;
        Ok(self.mutated(&site, 1))
    }

    /// Delete the most recent note with exactly this text; no match is a no-op.
    pub async fn delete_note(
        &self,
        site: &str,
        equipment_id: &str,
        note_text: &str,
    ) -> Result<Mutation, AuditError> {
        // ---
        let (site, store) = self.store(site).await?;
        let affected = store.delete_note(equipment_id, note_text).await?;
        Ok(self.mutated(&site, affected))
    }

    pub async fn reset(&self, site: &str) -> Result<Mutation, AuditError> {
        // ---
        let (site, store) = self.store(site).await?;
        let affected = store.reset().await?;
        warn!("All data for {} was reset", site);
        Ok(self.mutated(&site, affected))
    }

    // --- background operations

    /// Import spreadsheet files into `site` in the background.
    pub async fn import_files(
        &self,
        site: &str,
        paths: Vec<PathBuf>,
    ) -> Result<TaskHandle<ImportSummary>, AuditError> {
        // ---
        let (site, store) = self.store(site).await?;
        let invalidate = InvalidateOnDrop {
            service: self.clone(),
            site,
        };

        Ok(spawn_task("import", move |ctx| async move {
            // Dropped with the body: on success, on failure and when the
            // task is cancelled while a commit may still land.
            let _invalidate = invalidate;
            import::import_files(&store, &paths, &ctx).await
        }))
    }

    /// Export the (optionally filtered) dashboard to a file.
    pub async fn export_dashboard(
        &self,
        site: &str,
        range: DateRange,
        path: PathBuf,
        format: Option<ExportFormat>,
        search: Option<String>,
    ) -> Result<TaskHandle<usize>, AuditError> {
        // ---
        let (site, _) = self.store(site).await?;
        let service = self.clone();
        let format = format.unwrap_or_else(|| ExportFormat::from_path(&path));

        Ok(spawn_task("export-dashboard", move |ctx| async move {
            service
                .write_dashboard_file(&site, range, path, format, search, &ctx)
                .await
        }))
    }

    async fn write_dashboard_file(
        &self,
        site: &str,
        range: DateRange,
        path: PathBuf,
        format: ExportFormat,
        search: Option<String>,
        ctx: &TaskContext,
    ) -> Result<usize, AuditError> {
        // ---
        ctx.report(0, 2, format!("Building dashboard for {site}"));
        let dashboard = self.dashboard(site, range, true).await?;
        let table = match search.as_deref() {
            Some(needle) => dashboard.table().filter(needle),
            None => dashboard.table(),
        };

        ctx.check()?;
        ctx.report(1, 2, format!("Writing {}", path.display()));
        let written =
            tokio::task::spawn_blocking(move || export::write_dashboard(&table, &path, format))
                .await
                .map_err(|e| AuditError::Aborted(e.to_string()))??;
        ctx.report(2, 2, "Done");
        Ok(written)
    }

    /// Read every registered site, skipping the ones that cannot be read.
    async fn collect_sites(
        &self,
        range: &DateRange,
        ctx: &TaskContext,
    ) -> Result<(Vec<SiteData>, Vec<String>), AuditError> {
        // ---
        let sites: Vec<(String, PathBuf)> = {
            let registry = self.inner.registry.read().await;
            registry
                .names()
                .into_iter()
                .filter_map(|name| {
                    let path = registry.database_path(&name).ok()?;
                    Some((name, path))
                })
                .collect()
        };

        let total = sites.len();
        let mut collected = Vec::new();
        let mut skipped = Vec::new();

        for (idx, (site, path)) in sites.into_iter().enumerate() {
            ctx.check()?;
            ctx.report(idx + 1, total, format!("Processing {site}"));

            match self.read_site(&site, &path, range).await {
                Ok(events) => {
                    let (_, days) = collapse_range(&events, range);
                    collected.push(SiteData { site, events, days });
                }
                Err(e) => {
                    warn!("Skipping site {}: {}", site, e);
                    skipped.push(site);
                }
            }
        }
        Ok((collected, skipped))
    }

    /// Events of one site without creating a missing database.
    async fn read_site(
        &self,
        site: &str,
        path: &std::path::Path,
        range: &DateRange,
    ) -> Result<Vec<TestEvent>, AuditError> {
        // ---
        let open = self.inner.stores.lock().await.get(site).cloned();
        match open {
            Some(store) => Ok(store.events_between(range).await?),
            None => {
                let store = SiteStore::open_existing(path, &self.inner.config.store_options()).await?;
                let events = store.events_between(range).await;
                store.close().await;
                Ok(events?)
            }
        }
    }

    /// Every site's daily series, concatenated in site-name order.
    pub fn consolidated_trend(&self, range: DateRange) -> TaskHandle<Vec<SiteDailyAggregate>> {
        // ---
        let service = self.clone();
        spawn_task("consolidated-trend", move |ctx| async move {
            service.build_trend(range, &ctx).await
        })
    }

    async fn build_trend(
        &self,
        range: DateRange,
        ctx: &TaskContext,
    ) -> Result<Vec<SiteDailyAggregate>, AuditError> {
        // ---
        let (sites, _) = self.collect_sites(&range, ctx).await?;
        let per_site: Vec<(String, DayOutcomes)> =
            sites.into_iter().map(|s| (s.site, s.days)).collect();
        Ok(consolidated_trend(&per_site))
    }

    /// Failure-day ranking summed across all sites.
    pub fn consolidated_ranking(&self, range: DateRange) -> TaskHandle<Vec<ConsolidatedFailureRow>> {
        // ---
        let service = self.clone();
        spawn_task("consolidated-ranking", move |ctx| async move {
            service.build_ranking(range, &ctx).await
        })
    }

    async fn build_ranking(
        &self,
        range: DateRange,
        ctx: &TaskContext,
    ) -> Result<Vec<ConsolidatedFailureRow>, AuditError> {
        // ---
        let (sites, _) = self.collect_sites(&range, ctx).await?;
        let per_site: Vec<(String, Vec<SiteFailureRow>)> = sites
            .iter()
            .map(|s| (s.site.clone(), failure_day_ranking(&s.events, &s.days)))
            .collect();
        Ok(consolidate_rankings(&per_site))
    }

    /// Write the multi-site fail-count workbook.
    pub fn export_fail_count_report(
        &self,
        range: DateRange,
        path: PathBuf,
    ) -> TaskHandle<FailCountExport> {
        // ---
        let service = self.clone();
        spawn_task("fail-count-export", move |ctx| async move {
            service.write_fail_count_file(range, path, &ctx).await
        })
    }

    async fn write_fail_count_file(
        &self,
        range: DateRange,
        path: PathBuf,
        ctx: &TaskContext,
    ) -> Result<FailCountExport, AuditError> {
        // ---
        let (sites, mut skipped) = self.collect_sites(&range, ctx).await?;

        let mut reports = Vec::new();
        for data in &sites {
            if data.events.is_empty() {
                info!("No data for {} in {}, leaving it out", data.site, range);
                skipped.push(data.site.clone());
                continue;
            }
            reports.push(site_report(&data.site, &data.events, &data.days));
        }
        if reports.is_empty() {
            return Err(ExportError::NoData.into());
        }

        ctx.check()?;
        ctx.report(sites.len(), sites.len(), format!("Writing {}", path.display()));
        let daily = export::summary_table(&reports);
        let names: Vec<String> = reports.iter().map(|r| r.site.clone()).collect();
        let out = path.clone();
        tokio::task::spawn_blocking(move || export::write_fail_count_report(&reports, &range, &out))
            .await
            .map_err(|e| AuditError::Aborted(e.to_string()))??;

        Ok(FailCountExport {
            path,
            sites: names,
            skipped,
            daily,
        })
    }
}
