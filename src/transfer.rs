//! Row transfer engine.
//!
//! Rows are pulled from an unbuffered source cursor into fixed-size
//! [`Batch`]es and each batch is written to the destination as one atomic
//! upsert. Memory use is bounded by the batch size, not the table size.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::classify::ErrorClass;
use crate::database::{Database, RowStream};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, Timer};
use crate::schema::TableDescriptor;
use crate::value::Batch;

/// Lazy, finite sequence of batches over one table's cursor.
///
/// Restartable per table: a fresh cursor gives a fresh sequence. A cursor
/// that breaks mid-stream is not resumed.
pub struct Batches<'a> {
    table: String,
    stream: RowStream<'a>,
    batch_size: usize,
    next_ordinal: usize,
    rows_read: usize,
    exhausted: bool,
}

impl<'a> Batches<'a> {
    /// Wrap a row stream.
    pub fn new(table: impl Into<String>, stream: RowStream<'a>, batch_size: usize) -> Self {
        Self {
            table: table.into(),
            stream,
            batch_size: batch_size.max(1),
            next_ordinal: 1,
            rows_read: 0,
            exhausted: false,
        }
    }

    /// Rows pulled from the cursor so far, including rows of a batch that
    /// was cut short by a cursor error.
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// Pull the next batch. `Ok(None)` once the cursor is exhausted.
    ///
    /// A cursor error surfaces as [`Error::CursorLost`]; the rows gathered for
    /// the current batch are discarded.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.batch_size);
        while rows.len() < self.batch_size {
            match self.stream.next().await {
                Some(Ok(row)) => {
                    self.rows_read += 1;
                    rows.push(row);
                }
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Err(Error::cursor_lost(&self.table, e.to_string()));
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }

        let batch = Batch {
            ordinal: self.next_ordinal,
            rows,
        };
        self.next_ordinal += 1;
        Ok(Some(batch))
    }
}

/// Rows read, written and failed for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    /// Rows pulled from the source
    pub read: usize,
    /// Rows acknowledged by the destination
    pub written: usize,
    /// Rows in batches that were not acknowledged
    pub failed: usize,
}

/// A batch that was not written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    /// Table name
    pub table: String,
    /// 1-based batch ordinal
    pub batch: usize,
    /// Rows in the batch
    pub rows: usize,
    /// Failure class
    pub class: ErrorClass,
    /// Error text
    pub cause: String,
}

impl From<&BatchError> for Error {
    fn from(e: &BatchError) -> Self {
        Error::Batch {
            table: e.table.clone(),
            batch: e.batch,
            message: e.cause.clone(),
        }
    }
}

/// How a table's transfer ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    /// Every batch acknowledged
    Complete,
    /// Cursor exhausted, some batches failed
    Partial,
    /// Stopped early on a connection-fatal or cursor error
    Aborted {
        /// Failure class
        class: ErrorClass,
        /// Error text
        cause: String,
    },
    /// Stopped between batches by cancellation
    Cancelled,
}

/// Result of transferring one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    /// Table name
    pub table: String,
    /// Row counters
    pub counts: RowCounts,
    /// Batches processed
    pub batches: usize,
    /// Failed batches
    pub batch_errors: Vec<BatchError>,
    /// Final status
    pub status: TransferStatus,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl TransferOutcome {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            counts: RowCounts::default(),
            batches: 0,
            batch_errors: Vec::new(),
            status: TransferStatus::Complete,
            duration_ms: 0,
        }
    }

    /// Whether the connection used for this table must be replaced.
    pub fn lost_connection(&self) -> bool {
        matches!(
            &self.status,
            TransferStatus::Aborted { class, .. } if class.is_connection_fatal()
        )
    }
}

/// Progress after one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Table name
    pub table: String,
    /// Ordinal of the batch just processed
    pub batch: usize,
    /// Rows read so far
    pub rows_read: usize,
    /// Rows written so far
    pub rows_written: usize,
    /// Rows failed so far
    pub rows_failed: usize,
}

/// Progress callback.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Copies table rows from source to destination.
#[derive(Clone)]
pub struct TransferEngine {
    batch_size: usize,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    metrics: Option<Arc<Metrics>>,
}

impl TransferEngine {
    /// Create an engine with the given batch size.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cancel: CancellationToken::new(),
            progress: None,
            metrics: None,
        }
    }

    /// Observe `cancel` between batches.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress after every batch.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Record counters into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Rows per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Transfer every row of `descriptor.name`.
    ///
    /// Never returns an error: failures are recorded in the outcome. A failed
    /// batch is counted and skipped; a connection-fatal batch failure or a
    /// broken cursor ends the table.
    #[instrument(skip(self, source, destination, descriptor), fields(table = %descriptor.name, batch_size = self.batch_size))]
    pub async fn transfer(
        &self,
        source: &mut dyn Database,
        destination: &mut dyn Database,
        descriptor: &TableDescriptor,
    ) -> TransferOutcome {
        let timer = Timer::start(format!("transfer of {}", descriptor.name));
        let mut outcome = TransferOutcome::new(&descriptor.name);

        if !descriptor.has_key() {
            warn!(
                "Table {} has no primary or unique key; re-runs will duplicate rows",
                descriptor.name
            );
        }

        let stream = match source.stream_rows(&descriptor.name).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open cursor on {}: {}", descriptor.name, e);
                outcome.status = TransferStatus::Aborted {
                    class: e.class(),
                    cause: e.to_string(),
                };
                outcome.duration_ms = timer.stop();
                return outcome;
            }
        };

        let mut batches = Batches::new(&descriptor.name, stream, self.batch_size);
        let mut stopped = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("Transfer of {} cancelled after {} batches", descriptor.name, outcome.batches);
                stopped = Some(TransferStatus::Cancelled);
                break;
            }

            let batch = match batches.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    let dropped = batches.rows_read() - outcome.counts.read;
                    outcome.counts.read += dropped;
                    outcome.counts.failed += dropped;
                    error!("{}", e);
                    stopped = Some(TransferStatus::Aborted {
                        class: e.class(),
                        cause: e.to_string(),
                    });
                    break;
                }
            };

            let ordinal = batch.ordinal;
            let len = batch.len();
            outcome.counts.read += len;
            outcome.batches += 1;

            match write_batch(destination, descriptor, batch).await {
                Ok(()) => {
                    outcome.counts.written += len;
                    debug!("Batch {} of {}: {} rows written", ordinal, descriptor.name, len);
                    if let Some(m) = &self.metrics {
                        m.record_batch(true, len as u64);
                    }
                }
                Err(e) => {
                    outcome.counts.failed += len;
                    warn!("Batch {} of {} failed ({} rows): {}", ordinal, descriptor.name, len, e);
                    if let Some(m) = &self.metrics {
                        m.record_batch(false, len as u64);
                    }
                    let class = e.class();
                    outcome.batch_errors.push(BatchError {
                        table: descriptor.name.clone(),
                        batch: ordinal,
                        rows: len,
                        class,
                        cause: e.to_string(),
                    });
                    if class.is_connection_fatal() {
                        stopped = Some(TransferStatus::Aborted {
                            class,
                            cause: e.to_string(),
                        });
                    }
                }
            }

            self.report(&outcome, ordinal);

            if stopped.is_some() {
                break;
            }
        }

        outcome.status = match stopped {
            Some(status) => status,
            None if outcome.counts.failed > 0 => TransferStatus::Partial,
            None => TransferStatus::Complete,
        };
        outcome.duration_ms = timer.stop();

        info!(
            "Transferred {}: read {}, written {}, failed {} in {} batches",
            descriptor.name,
            outcome.counts.read,
            outcome.counts.written,
            outcome.counts.failed,
            outcome.batches
        );
        outcome
    }

    fn report(&self, outcome: &TransferOutcome, batch: usize) {
        if let Some(ref callback) = self.progress {
            callback(TransferProgress {
                table: outcome.table.clone(),
                batch,
                rows_read: outcome.counts.read,
                rows_written: outcome.counts.written,
                rows_failed: outcome.counts.failed,
            });
        }
    }
}

/// Write one batch, refusing columns the destination does not have.
async fn write_batch(
    destination: &mut dyn Database,
    descriptor: &TableDescriptor,
    batch: Batch,
) -> Result<()> {
    let columns = batch.columns().to_vec();
    let missing = descriptor.missing_columns(&columns);
    if !missing.is_empty() {
        return Err(Error::database(
            ErrorClass::SchemaMismatch,
            None,
            format!(
                "schema mismatch: columns not present at destination: {}",
                missing.join(", ")
            ),
        ));
    }

    destination
        .upsert(&descriptor.name, &columns, batch.rows)
        .await?;
    Ok(())
}
