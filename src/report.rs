//! Migration report types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::apply::ApplyOutcome;
use crate::error::Error;
use crate::metrics::MetricsSnapshot;
use crate::schema::ObjectKind;
use crate::transfer::{BatchError, RowCounts, TransferOutcome, TransferStatus};

/// Schema outcome of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaStatus {
    /// DDL executed at the destination
    Created,
    /// Object already existed
    SkippedExists,
    /// DDL could not be extracted or applied
    Failed,
}

/// Lifecycle state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectState {
    /// Not yet touched
    Pending,
    /// DDL created or already present
    SchemaApplied,
    /// Rows being copied
    DataTransferring,
    /// Finished (rows may still have failed)
    Done,
    /// DDL failed
    SchemaFailed,
    /// No data transfer attempted because the schema failed
    Skipped,
    /// Stopped by a lost connection or cancellation
    Aborted,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectState::Pending => "pending",
            ObjectState::SchemaApplied => "schema applied",
            ObjectState::DataTransferring => "transferring",
            ObjectState::Done => "done",
            ObjectState::SchemaFailed => "schema failed",
            ObjectState::Skipped => "skipped",
            ObjectState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// What happened to an object, as a user sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectOutcome {
    /// Schema present and every row written
    Migrated,
    /// Already existed; data left untouched
    SkippedExisting,
    /// Some rows written, some failed
    Partial,
    /// Nothing usable at the destination
    NotMigrated,
}

impl fmt::Display for ObjectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectOutcome::Migrated => "migrated",
            ObjectOutcome::SkippedExisting => "skipped, already existed, no data change",
            ObjectOutcome::Partial => "partially migrated",
            ObjectOutcome::NotMigrated => "not migrated",
        };
        f.write_str(s)
    }
}

/// Per-object part of a [`MigrationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectReport {
    /// Object name
    pub name: String,
    /// Table or view
    pub kind: ObjectKind,
    /// Position in the migration order
    pub ordinal: usize,
    /// Schema outcome, `None` if never attempted
    pub schema: Option<SchemaStatus>,
    /// Final lifecycle state
    pub state: ObjectState,
    /// Row counters
    pub rows: RowCounts,
    /// Failed batches
    pub batch_errors: Vec<BatchError>,
    /// Data transfer skipped because the table already existed
    pub data_skipped: bool,
    /// Error text, if any
    pub error: Option<String>,
    /// Transfer duration in milliseconds
    pub duration_ms: u64,
}

impl ObjectReport {
    pub(crate) fn new(name: impl Into<String>, kind: ObjectKind, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            ordinal,
            schema: None,
            state: ObjectState::Pending,
            rows: RowCounts::default(),
            batch_errors: Vec::new(),
            data_skipped: false,
            error: None,
            duration_ms: 0,
        }
    }

    pub(crate) fn record_extraction_failure(&mut self, cause: String) {
        self.schema = Some(SchemaStatus::Failed);
        self.state = ObjectState::SchemaFailed;
        self.error = Some(cause);
    }

    pub(crate) fn record_apply(&mut self, outcome: &ApplyOutcome) {
        if !outcome.is_applied() {
            self.schema = Some(SchemaStatus::Failed);
            self.state = ObjectState::SchemaFailed;
            self.error = outcome.to_error(&self.name).map(|e| e.to_string());
            return;
        }
        self.schema = Some(if *outcome == ApplyOutcome::Created {
            SchemaStatus::Created
        } else {
            SchemaStatus::SkippedExists
        });
        self.state = if self.kind.has_data() {
            ObjectState::SchemaApplied
        } else {
            ObjectState::Done
        };
    }

    pub(crate) fn skip_after_schema_failure(&mut self) {
        if self.state == ObjectState::SchemaFailed {
            self.state = ObjectState::Skipped;
        }
    }

    pub(crate) fn skip_existing_data(&mut self) {
        self.data_skipped = true;
        self.state = ObjectState::Done;
    }

    pub(crate) fn begin_transfer(&mut self) {
        self.state = ObjectState::DataTransferring;
    }

    pub(crate) fn record_transfer(&mut self, outcome: TransferOutcome) {
        self.rows = outcome.counts;
        self.duration_ms = outcome.duration_ms;
        self.state = match outcome.status {
            TransferStatus::Complete => ObjectState::Done,
            TransferStatus::Partial => {
                self.error = Some(format!(
                    "{} of {} batches failed",
                    outcome.batch_errors.len(),
                    outcome.batches
                ));
                ObjectState::Done
            }
            TransferStatus::Aborted { cause, .. } => {
                self.error = Some(cause);
                ObjectState::Aborted
            }
            TransferStatus::Cancelled => {
                self.error = Some(Error::cancelled("between batches").to_string());
                ObjectState::Aborted
            }
        };
        self.batch_errors = outcome.batch_errors;
    }

    pub(crate) fn abort(&mut self, cause: impl Into<String>) {
        self.state = ObjectState::Aborted;
        if self.error.is_none() {
            self.error = Some(cause.into());
        }
    }

    /// Whether the object is still waiting for work.
    pub fn is_unfinished(&self) -> bool {
        matches!(
            self.state,
            ObjectState::Pending | ObjectState::SchemaApplied | ObjectState::DataTransferring
        )
    }

    /// Collapse the state into one of four outcomes.
    pub fn outcome(&self) -> ObjectOutcome {
        match (self.schema, self.state) {
            (None, _) | (Some(SchemaStatus::Failed), _) => ObjectOutcome::NotMigrated,
            (_, ObjectState::Done) if self.rows.failed > 0 => ObjectOutcome::Partial,
            (Some(SchemaStatus::SkippedExists), ObjectState::Done) if self.data_skipped => {
                ObjectOutcome::SkippedExisting
            }
            (_, ObjectState::Done) => ObjectOutcome::Migrated,
            (_, ObjectState::Aborted) if self.rows.written > 0 => ObjectOutcome::Partial,
            _ => ObjectOutcome::NotMigrated,
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Run identifier
    pub run_id: String,
    /// One report per object, in migration order
    pub objects: Vec<ObjectReport>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
    /// Whether the run was cancelled or timed out
    pub cancelled: bool,
    /// Counters collected during the run
    pub metrics: MetricsSnapshot,
}

impl MigrationResult {
    /// Look up an object's report.
    pub fn get(&self, name: &str) -> Option<&ObjectReport> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// Total rows read.
    pub fn total_read(&self) -> usize {
        self.objects.iter().map(|o| o.rows.read).sum()
    }

    /// Total rows written.
    pub fn total_written(&self) -> usize {
        self.objects.iter().map(|o| o.rows.written).sum()
    }

    /// Total rows failed.
    pub fn total_failed(&self) -> usize {
        self.objects.iter().map(|o| o.rows.failed).sum()
    }

    /// Number of objects with the given outcome.
    pub fn count(&self, outcome: ObjectOutcome) -> usize {
        self.objects.iter().filter(|o| o.outcome() == outcome).count()
    }

    /// Every object migrated or already present, no row failed.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.objects.iter().all(|o| {
                matches!(
                    o.outcome(),
                    ObjectOutcome::Migrated | ObjectOutcome::SkippedExisting
                )
            })
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}
