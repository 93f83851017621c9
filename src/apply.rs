//! Replaying extracted DDL against the destination.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::classify::ErrorClass;
use crate::database::Database;
use crate::error::Error;
use crate::schema::SchemaObject;

/// Result of applying one object's DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyOutcome {
    /// DDL executed
    Created,
    /// The object was already there; left untouched
    SkippedExists,
    /// DDL failed for another reason
    Failed {
        /// Failure class
        class: ErrorClass,
        /// Error text
        cause: String,
    },
}

impl ApplyOutcome {
    /// Whether the object can be considered present at the destination.
    pub fn is_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::Failed { .. })
    }

    /// The failure as an [`Error::Apply`], if any.
    pub fn to_error(&self, object: &str) -> Option<Error> {
        match self {
            ApplyOutcome::Failed { class, cause } => Some(Error::Apply {
                object: object.to_string(),
                class: *class,
                message: cause.clone(),
            }),
            _ => None,
        }
    }
}

/// Execute `object`'s DDL on the destination and classify the result.
///
/// "Already exists" is not an error: the existing object is assumed to be
/// compatible and no structural comparison is made.
#[instrument(skip(conn, object), fields(object = %object.name, kind = %object.kind))]
pub async fn apply(conn: &mut dyn Database, object: &SchemaObject) -> ApplyOutcome {
    match conn.execute_ddl(&object.ddl).await {
        Ok(()) => {
            info!("Created {} {}", object.kind, object.name);
            ApplyOutcome::Created
        }
        Err(e) if e.class() == ErrorClass::AlreadyExists => {
            info!("{} {} already exists, skipping", object.kind, object.name);
            ApplyOutcome::SkippedExists
        }
        Err(e) => {
            warn!("Failed to create {} {}: {}", object.kind, object.name, e);
            ApplyOutcome::Failed {
                class: e.class(),
                cause: e.to_string(),
            }
        }
    }
}
