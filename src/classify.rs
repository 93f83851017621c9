//! Vendor error classification.
//!
//! Driver-specific error codes are mapped onto a small, vendor-neutral set of
//! classes through [`MYSQL_ERROR_CLASSES`]. The engine only ever branches on
//! [`ErrorClass`], never on message text.

use serde::{Deserialize, Serialize};

/// Abstract class of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The object being created already exists.
    AlreadyExists,
    /// A key, foreign key, NOT NULL or value-range constraint rejected a row.
    ConstraintViolation,
    /// Column count or name does not match the target table.
    SchemaMismatch,
    /// A referenced table, view or database does not exist.
    MissingObject,
    /// The connection is gone; nothing more can be done on it.
    ConnectionLost,
    /// Lock wait timeout, deadlock or connection limit reached.
    Transient,
    /// Anything not covered above.
    Other,
}

impl ErrorClass {
    /// Whether the connection that produced this error is unusable.
    pub fn is_connection_fatal(self) -> bool {
        matches!(self, ErrorClass::ConnectionLost)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::AlreadyExists => "already exists",
            ErrorClass::ConstraintViolation => "constraint violation",
            ErrorClass::SchemaMismatch => "schema mismatch",
            ErrorClass::MissingObject => "missing object",
            ErrorClass::ConnectionLost => "connection lost",
            ErrorClass::Transient => "transient",
            ErrorClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// MySQL / MariaDB server and client error codes.
pub const MYSQL_ERROR_CLASSES: &[(u16, ErrorClass)] = &[
    // ER_TABLE_EXISTS_ERROR
    (1050, ErrorClass::AlreadyExists),
    // ER_DUP_ENTRY
    (1062, ErrorClass::ConstraintViolation),
    // ER_ROW_IS_REFERENCED_2
    (1451, ErrorClass::ConstraintViolation),
    // ER_NO_REFERENCED_ROW_2
    (1452, ErrorClass::ConstraintViolation),
    // ER_BAD_NULL_ERROR
    (1048, ErrorClass::ConstraintViolation),
    // ER_DATA_TOO_LONG
    (1406, ErrorClass::ConstraintViolation),
    // ER_WARN_DATA_OUT_OF_RANGE
    (1264, ErrorClass::ConstraintViolation),
    // ER_TRUNCATED_WRONG_VALUE_FOR_FIELD
    (1366, ErrorClass::ConstraintViolation),
    // ER_TRUNCATED_WRONG_VALUE
    (1292, ErrorClass::ConstraintViolation),
    // ER_BAD_FIELD_ERROR
    (1054, ErrorClass::SchemaMismatch),
    // ER_WRONG_VALUE_COUNT_ON_ROW
    (1136, ErrorClass::SchemaMismatch),
    // ER_NO_SUCH_TABLE
    (1146, ErrorClass::MissingObject),
    // ER_VIEW_INVALID
    (1356, ErrorClass::MissingObject),
    // ER_BAD_DB_ERROR
    (1049, ErrorClass::MissingObject),
    // CR_CONNECTION_ERROR
    (2002, ErrorClass::ConnectionLost),
    // CR_CONN_HOST_ERROR
    (2003, ErrorClass::ConnectionLost),
    // CR_SERVER_GONE_ERROR
    (2006, ErrorClass::ConnectionLost),
    // CR_SERVER_LOST
    (2013, ErrorClass::ConnectionLost),
    // ER_SERVER_SHUTDOWN
    (1053, ErrorClass::ConnectionLost),
    // ER_CONNECTION_KILLED
    (1927, ErrorClass::ConnectionLost),
    // ER_LOCK_WAIT_TIMEOUT
    (1205, ErrorClass::Transient),
    // ER_LOCK_DEADLOCK
    (1213, ErrorClass::Transient),
    // ER_CON_COUNT_ERROR
    (1040, ErrorClass::Transient),
    // ER_TOO_MANY_USER_CONNECTIONS
    (1203, ErrorClass::Transient),
];

/// Look up the class of a MySQL error code.
pub fn classify_code(code: u16) -> ErrorClass {
    MYSQL_ERROR_CLASSES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, class)| *class)
        .unwrap_or(ErrorClass::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_codes() {
        assert_eq!(classify_code(1050), ErrorClass::AlreadyExists);
        assert_eq!(classify_code(1062), ErrorClass::ConstraintViolation);
        assert_eq!(classify_code(1054), ErrorClass::SchemaMismatch);
        assert_eq!(classify_code(1146), ErrorClass::MissingObject);
        assert_eq!(classify_code(2013), ErrorClass::ConnectionLost);
        assert_eq!(classify_code(1213), ErrorClass::Transient);
        assert_eq!(classify_code(1040), ErrorClass::Transient);
    }

    #[test]
    fn test_unknown_code_is_other() {
        assert_eq!(classify_code(1), ErrorClass::Other);
        assert_eq!(classify_code(9999), ErrorClass::Other);
    }

    #[test]
    fn test_table_has_no_duplicate_codes() {
        let codes: HashSet<u16> = MYSQL_ERROR_CLASSES.iter().map(|(c, _)| *c).collect();
        assert_eq!(codes.len(), MYSQL_ERROR_CLASSES.len());
    }

    #[test]
    fn test_only_connection_lost_is_fatal() {
        assert!(ErrorClass::ConnectionLost.is_connection_fatal());
        assert!(!ErrorClass::ConstraintViolation.is_connection_fatal());
        assert!(!ErrorClass::Transient.is_connection_fatal());
    }
}
