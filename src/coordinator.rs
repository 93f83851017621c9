//! Migration coordinator: schema first, then data on a bounded worker pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::apply::{ApplyOutcome, apply};
use crate::config::{ConnectionProfile, MigrateConfig};
use crate::connection::{ConnectionPair, ConnectionProvider};
use crate::database::Connector;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::mysql::MySqlConnector;
use crate::report::{MigrationResult, ObjectReport, ObjectState, SchemaStatus};
use crate::schema::{ObjectKind, SchemaExtractor, SchemaObject, quoted_identifiers};
use crate::transfer::{TransferEngine, TransferOutcome, TransferProgress};

/// An object the run would migrate, as shown by [`Migrator::plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedObject {
    /// Object name
    pub name: String,
    /// Kind, `None` if the source has no such object
    pub kind: Option<ObjectKind>,
}

/// Drives a migration run.
pub struct Migrator {
    config: MigrateConfig,
    provider: ConnectionProvider,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    progress: Option<Arc<dyn Fn(TransferProgress) + Send + Sync>>,
}

impl Migrator {
    /// Create a migrator that talks to MySQL.
    pub fn new(config: MigrateConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(MySqlConnector))
    }

    /// Create a migrator with a custom [`Connector`].
    pub fn with_connector(config: MigrateConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());
        let provider =
            ConnectionProvider::new(connector, config.retry.clone()).with_metrics(metrics.clone());
        Ok(Self {
            config,
            provider,
            metrics,
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// Set progress callback, called after every batch.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// Test connectivity to both databases.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");

        let source = self.provider.acquire(&self.config.source).await?;
        source.close().await;
        info!("Source {}: OK", self.config.source.display_name());

        let destination = self.provider.acquire(&self.config.destination).await?;
        destination.close().await;
        info!("Destination {}: OK", self.config.destination.display_name());

        Ok(())
    }

    /// Objects the run would migrate, in order.
    pub async fn plan(&self) -> Result<Vec<PlannedObject>> {
        let mut source = self.provider.acquire(&self.config.source).await?;
        let listed = source.list_objects().await;

        let planned = match listed {
            Ok(listed) if self.config.migration.objects.is_empty() => {
                let mut view_ddl = HashMap::new();
                for (name, kind) in &listed {
                    if *kind == ObjectKind::View {
                        if let Ok(found) = source.show_create(name).await {
                            view_ddl.insert(name.clone(), found.ddl);
                        }
                    }
                }
                let kinds: HashMap<_, _> = listed.iter().cloned().collect();
                order_objects(&listed, &view_ddl)
                    .into_iter()
                    .map(|name| PlannedObject {
                        kind: kinds.get(&name).copied(),
                        name,
                    })
                    .collect()
            }
            Ok(listed) => {
                let kinds: HashMap<_, _> = listed.into_iter().collect();
                self.explicit_objects()
                    .into_iter()
                    .map(|name| PlannedObject {
                        kind: kinds.get(&name).copied(),
                        name,
                    })
                    .collect()
            }
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        source.close().await;
        Ok(planned)
    }

    /// Run the migration.
    ///
    /// Returns `Err` only when the run cannot start: the setup connections
    /// cannot be opened, or the source cannot be listed. Every per-object
    /// failure is reported in the [`MigrationResult`].
    pub async fn run(&self) -> Result<MigrationResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("migration", run_id = %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String) -> Result<MigrationResult> {
        let start = Instant::now();
        let options = &self.config.migration;
        let cancel = self.cancel.child_token();

        // stops the timeout watcher on every exit path
        let _stop_watch = cancel.clone().drop_guard();
        if let Some(limit) = options.timeout()? {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!("Run timeout of {:?} reached, cancelling", limit);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        info!(
            "Starting migration {} -> {}",
            self.config.source.display_name(),
            self.config.destination.display_name()
        );

        let destination = self.destination_profile();
        let mut setup = self
            .provider
            .acquire_pair(&self.config.source, &destination)
            .await?;

        let mut reports = match self.prepare_schema(&mut setup, &destination, &cancel).await {
            Ok(reports) => reports,
            Err(e) => {
                setup.close().await;
                return Err(e);
            }
        };
        setup.close().await;

        let jobs = self.collect_jobs(&mut reports);
        if !jobs.is_empty() {
            self.transfer_all(&mut reports, jobs, &destination, &cancel)
                .await;
        }

        let cancelled = cancel.is_cancelled();
        for report in reports.iter_mut().filter(|r| r.is_unfinished()) {
            report.abort(if cancelled {
                Error::cancelled("before processing").to_string()
            } else {
                "not processed: no connection available".to_string()
            });
        }

        let result = MigrationResult {
            run_id,
            objects: reports,
            duration_ms: start.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now().to_rfc3339(),
            cancelled,
            metrics: self.metrics.snapshot(),
        };

        if result.is_success() {
            info!(
                "Migration completed successfully in {}ms. Objects: {}, rows written: {}",
                result.duration_ms,
                result.objects.len(),
                result.total_written()
            );
        } else {
            warn!(
                "Migration completed with errors in {}ms. Rows written: {}, failed: {}",
                result.duration_ms,
                result.total_written(),
                result.total_failed()
            );
        }

        Ok(result)
    }

    fn destination_profile(&self) -> ConnectionProfile {
        if self.config.migration.disable_foreign_key_checks {
            self.config
                .destination
                .with_init_statement("SET FOREIGN_KEY_CHECKS=0")
        } else {
            self.config.destination.clone()
        }
    }

    /// The configured object list, first occurrence of each name kept.
    fn explicit_objects(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(self.config.migration.objects.len());
        for name in &self.config.migration.objects {
            if seen.insert(name.as_str()) {
                names.push(name.clone());
            } else {
                warn!("Object {} is listed more than once, migrating it once", name);
            }
        }
        names
    }

    /// Resolve the object order, extract DDL and apply it sequentially.
    #[instrument(skip_all)]
    async fn prepare_schema(
        &self,
        setup: &mut ConnectionPair,
        destination: &ConnectionProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<ObjectReport>> {
        let options = &self.config.migration;

        let (names, listed) = if options.objects.is_empty() {
            let listed = setup.source.list_objects().await?;
            info!("Discovered {} objects on the source", listed.len());
            let names = listed.iter().map(|(name, _)| name.clone()).collect();
            (names, Some(listed))
        } else {
            (self.explicit_objects(), None)
        };

        let extraction = SchemaExtractor::new(options.strip_table_options)
            .extract(&mut *setup.source, &names)
            .await;

        let mut extracted: HashMap<String, SchemaObject> = extraction
            .objects
            .into_iter()
            .map(|o| (o.name.clone(), o))
            .collect();
        let mut failures: HashMap<String, String> = HashMap::new();
        for err in extraction.errors {
            if let Error::Extraction { object, message } = err {
                failures.insert(object, message);
            }
        }

        let order = match &listed {
            Some(listed) => {
                let view_ddl = extracted
                    .values()
                    .filter(|o| o.kind == ObjectKind::View)
                    .map(|o| (o.name.clone(), o.ddl.clone()))
                    .collect();
                order_objects(listed, &view_ddl)
            }
            None => names,
        };
        let listed_kinds: HashMap<String, ObjectKind> =
            listed.unwrap_or_default().into_iter().collect();

        let mut reports = Vec::with_capacity(order.len());
        for (ordinal, name) in order.into_iter().enumerate() {
            let Some(mut object) = extracted.remove(&name) else {
                let kind = listed_kinds
                    .get(&name)
                    .copied()
                    .unwrap_or(ObjectKind::Table);
                let mut report = ObjectReport::new(&name, kind, ordinal);
                report.record_extraction_failure(
                    failures
                        .remove(&name)
                        .unwrap_or_else(|| "DDL not extracted".to_string()),
                );
                report.skip_after_schema_failure();
                self.metrics.record_extraction_failure();
                reports.push(report);
                continue;
            };
            object.ordinal = ordinal;

            let mut report = ObjectReport::new(&name, object.kind, ordinal);
            if cancel.is_cancelled() {
                report.abort(Error::cancelled("before schema apply").to_string());
                reports.push(report);
                continue;
            }

            let mut outcome = apply(&mut *setup.destination, &object).await;
            if let ApplyOutcome::Failed { class, .. } = &outcome {
                if class.is_connection_fatal() {
                    warn!("Destination connection lost during schema apply, reconnecting");
                    let fresh = self.provider.acquire(destination).await?;
                    let dead = std::mem::replace(&mut setup.destination, fresh);
                    dead.close().await;
                    outcome = apply(&mut *setup.destination, &object).await;
                }
            }

            self.metrics.record_apply(&outcome);
            report.record_apply(&outcome);
            report.skip_after_schema_failure();
            reports.push(report);
        }

        Ok(reports)
    }

    /// Tables that need a data transfer, in order.
    fn collect_jobs(&self, reports: &mut [ObjectReport]) -> VecDeque<Job> {
        let mut jobs = VecDeque::new();
        for (index, report) in reports.iter_mut().enumerate() {
            if report.state != ObjectState::SchemaApplied {
                continue;
            }
            if self.config.migration.skip_existing_data
                && report.schema == Some(SchemaStatus::SkippedExists)
            {
                info!("Table {} already existed, skipping data", report.name);
                report.skip_existing_data();
                continue;
            }
            jobs.push_back(Job {
                index,
                table: report.name.clone(),
            });
        }
        jobs
    }

    /// Run every job on the worker pool and fold the reports in.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    async fn transfer_all(
        &self,
        reports: &mut [ObjectReport],
        jobs: VecDeque<Job>,
        destination: &ConnectionProfile,
        cancel: &CancellationToken,
    ) {
        let worker_count = self.config.migration.workers.min(jobs.len()).max(1);
        info!(
            "Transferring {} tables with {} workers",
            jobs.len(),
            worker_count
        );

        let mut engine = TransferEngine::new(self.config.migration.batch_size)
            .with_cancellation(cancel.clone())
            .with_metrics(self.metrics.clone());
        if let Some(progress) = &self.progress {
            engine = engine.with_progress(progress.clone());
        }

        let queue = Arc::new(Mutex::new(jobs));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for id in 0..worker_count {
            let worker = Worker {
                id,
                provider: self.provider.clone(),
                source: self.config.source.clone(),
                destination: destination.clone(),
                engine: engine.clone(),
                cancel: cancel.clone(),
                queue: queue.clone(),
                reports: tx.clone(),
            };
            workers.spawn(worker.run().instrument(info_span!("worker", id)));
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Started { index } => reports[index].begin_transfer(),
                WorkerEvent::Finished { index, outcome } => reports[index].record_transfer(outcome),
                WorkerEvent::Aborted { index, cause } => reports[index].abort(cause),
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

/// A table waiting for its data transfer.
#[derive(Debug, Clone)]
struct Job {
    index: usize,
    table: String,
}

/// Sent by workers; the coordinator is the only writer of the reports.
#[derive(Debug)]
enum WorkerEvent {
    Started { index: usize },
    Finished { index: usize, outcome: TransferOutcome },
    Aborted { index: usize, cause: String },
}

struct Worker {
    id: usize,
    provider: ConnectionProvider,
    source: ConnectionProfile,
    destination: ConnectionProfile,
    engine: TransferEngine,
    cancel: CancellationToken,
    queue: Arc<Mutex<VecDeque<Job>>>,
    reports: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    async fn run(self) {
        let mut pair: Option<ConnectionPair> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(job) = self.queue.lock().await.pop_front() else {
                break;
            };

            if pair.is_none() {
                match self
                    .provider
                    .acquire_pair(&self.source, &self.destination)
                    .await
                {
                    Ok(fresh) => pair = Some(fresh),
                    Err(e) => {
                        error!("Worker {} cannot connect: {}", self.id, e);
                        self.send(WorkerEvent::Aborted {
                            index: job.index,
                            cause: e.to_string(),
                        });
                        break;
                    }
                }
            }
            let Some(conns) = pair.as_mut() else {
                break;
            };

            self.send(WorkerEvent::Started { index: job.index });

            let descriptor = match conns.destination.describe_table(&job.table).await {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => {
                    self.send(WorkerEvent::Aborted {
                        index: job.index,
                        cause: format!("table '{}' not found at destination", job.table),
                    });
                    continue;
                }
                Err(e) => {
                    let fatal = e.is_connection_fatal();
                    self.send(WorkerEvent::Aborted {
                        index: job.index,
                        cause: e.to_string(),
                    });
                    if fatal {
                        if let Some(dead) = pair.take() {
                            dead.close().await;
                        }
                    }
                    continue;
                }
            };

            debug!("Worker {} transferring {}", self.id, job.table);
            let outcome = self
                .engine
                .transfer(&mut *conns.source, &mut *conns.destination, &descriptor)
                .await;
            let lost = outcome.lost_connection();
            self.send(WorkerEvent::Finished {
                index: job.index,
                outcome,
            });

            if lost {
                if let Some(dead) = pair.take() {
                    dead.close().await;
                }
            }
        }

        if let Some(conns) = pair {
            conns.close().await;
        }
    }

    fn send(&self, event: WorkerEvent) {
        if self.reports.send(event).is_err() {
            warn!("Worker {}: coordinator stopped listening", self.id);
        }
    }
}

/// Migration order for discovered objects: base tables by name, then views
/// so that a view referencing another view comes after it.
///
/// References are detected from backquoted identifiers in the view DDL. When
/// the remaining views reference each other in a cycle, the first by name is
/// emitted.
pub fn order_objects(
    listed: &[(String, ObjectKind)],
    view_ddl: &HashMap<String, String>,
) -> Vec<String> {
    let mut tables: Vec<String> = listed
        .iter()
        .filter(|(_, kind)| *kind == ObjectKind::Table)
        .map(|(name, _)| name.clone())
        .collect();
    tables.sort();

    let mut views: Vec<String> = listed
        .iter()
        .filter(|(_, kind)| *kind == ObjectKind::View)
        .map(|(name, _)| name.clone())
        .collect();
    views.sort();

    let deps: HashMap<&str, Vec<&str>> = views
        .iter()
        .map(|view| {
            let refs = view_ddl
                .get(view)
                .map(|ddl| quoted_identifiers(ddl))
                .unwrap_or_default();
            let on: Vec<&str> = views
                .iter()
                .filter(|other| *other != view && refs.contains(other))
                .map(String::as_str)
                .collect();
            (view.as_str(), on)
        })
        .collect();

    let mut ordered = tables;
    let mut remaining: Vec<&str> = views.iter().map(String::as_str).collect();
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|view| {
                deps[view]
                    .iter()
                    .all(|dep| !remaining.contains(dep))
            })
            .unwrap_or(0);
        ordered.push(remaining.remove(ready).to_string());
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(items: &[(&str, ObjectKind)]) -> Vec<(String, ObjectKind)> {
        items.iter().map(|(n, k)| (n.to_string(), *k)).collect()
    }

    #[test]
    fn test_order_tables_before_views() {
        let objects = listed(&[
            ("v_users", ObjectKind::View),
            ("users", ObjectKind::Table),
            ("orders", ObjectKind::Table),
        ]);
        assert_eq!(
            order_objects(&objects, &HashMap::new()),
            vec!["orders", "users", "v_users"]
        );
    }

    #[test]
    fn test_order_view_dependencies() {
        let objects = listed(&[
            ("a_summary", ObjectKind::View),
            ("b_base", ObjectKind::View),
            ("users", ObjectKind::Table),
        ]);
        let mut ddl = HashMap::new();
        ddl.insert(
            "a_summary".to_string(),
            "CREATE VIEW `a_summary` AS select count(0) AS `n` from `b_base`".to_string(),
        );
        ddl.insert(
            "b_base".to_string(),
            "CREATE VIEW `b_base` AS select `users`.`id` AS `id` from `users`".to_string(),
        );
        assert_eq!(
            order_objects(&objects, &ddl),
            vec!["users", "b_base", "a_summary"]
        );
    }

    #[test]
    fn test_order_cycle_falls_back_to_name() {
        let objects = listed(&[("x", ObjectKind::View), ("y", ObjectKind::View)]);
        let mut ddl = HashMap::new();
        ddl.insert("x".to_string(), "CREATE VIEW `x` AS select * from `y`".to_string());
        ddl.insert("y".to_string(), "CREATE VIEW `y` AS select * from `x`".to_string());
        assert_eq!(order_objects(&objects, &ddl), vec!["x", "y"]);
    }

    #[test]
    fn test_migrator_rejects_invalid_config() {
        let mut config = MigrateConfig::builder()
            .source_url("mysql://root:pw@src:3306/app")
            .destination_url("mysql://root:pw@dst:3306/app")
            .build()
            .unwrap();
        config.migration.workers = 0;
        assert!(Migrator::new(config).is_err());
    }
}
