//! Schema objects, DDL extraction and normalization.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, instrument, warn};

use crate::database::Database;
use crate::error::{Error, Result};

/// Kind of schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectKind {
    /// Base table
    Table,
    /// View
    View,
}

impl ObjectKind {
    /// Map an `information_schema.TABLES.TABLE_TYPE` value.
    pub fn from_table_type(table_type: &str) -> Option<Self> {
        match table_type {
            "BASE TABLE" => Some(ObjectKind::Table),
            "VIEW" | "SYSTEM VIEW" => Some(ObjectKind::View),
            _ => None,
        }
    }

    /// Whether objects of this kind carry row data.
    pub fn has_data(self) -> bool {
        matches!(self, ObjectKind::Table)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Table => write!(f, "TABLE"),
            ObjectKind::View => write!(f, "VIEW"),
        }
    }
}

/// DDL captured from the source for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    /// Table or view
    pub kind: ObjectKind,
    /// Object name
    pub name: String,
    /// CREATE statement
    pub ddl: String,
    /// Position in the requested order (0-based)
    pub ordinal: usize,
}

/// Destination-side shape of a table, used to build upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<String>,
    /// Primary key columns, or the first unique key when there is no primary key
    pub key_columns: Vec<String>,
}

impl TableDescriptor {
    /// Columns of `incoming` that the table does not have.
    pub fn missing_columns<'a>(&self, incoming: &'a [String]) -> Vec<&'a str> {
        incoming
            .iter()
            .filter(|c| !self.columns.iter().any(|own| own.eq_ignore_ascii_case(c)))
            .map(String::as_str)
            .collect()
    }

    /// Whether collisions can be detected at all.
    pub fn has_key(&self) -> bool {
        !self.key_columns.is_empty()
    }
}

/// Output of [`SchemaExtractor::extract`]: what could be read, and what could
/// not.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Extracted objects, in request order
    pub objects: Vec<SchemaObject>,
    /// One [`Error::Extraction`] per object that failed
    pub errors: Vec<Error>,
}

/// Reads CREATE statements from the source.
#[derive(Debug, Clone, Copy)]
pub struct SchemaExtractor {
    strip_table_options: bool,
}

impl Default for SchemaExtractor {
    fn default() -> Self {
        Self {
            strip_table_options: true,
        }
    }
}

impl SchemaExtractor {
    /// Create an extractor.
    pub fn new(strip_table_options: bool) -> Self {
        Self {
            strip_table_options,
        }
    }

    /// Extract DDL for `names`, in the given order.
    ///
    /// A failure on one object is collected and extraction moves on; the
    /// ordinal of every object is its position in `names`.
    #[instrument(skip(self, conn, names), fields(count = names.len()))]
    pub async fn extract(&self, conn: &mut dyn Database, names: &[String]) -> Extraction {
        let mut extraction = Extraction::default();

        for (ordinal, name) in names.iter().enumerate() {
            match conn.show_create(name).await {
                Ok(found) => {
                    let ddl = if self.strip_table_options {
                        normalize_ddl(found.kind, &found.ddl)
                    } else {
                        found.ddl
                    };
                    debug!("Extracted {} {}", found.kind, name);
                    extraction.objects.push(SchemaObject {
                        kind: found.kind,
                        name: name.clone(),
                        ddl,
                        ordinal,
                    });
                }
                Err(e) => {
                    warn!("Failed to extract DDL for {}: {}", name, e);
                    extraction
                        .errors
                        .push(Error::extraction(name.clone(), e.to_string()));
                }
            }
        }

        extraction
    }
}

static TABLE_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(?:ENGINE|AUTO_INCREMENT|DEFAULT\s+CHARSET|CHARSET|DEFAULT\s+COLLATE|COLLATE)\s*=\s*\S+")
        .expect("static regex")
});

static VIEW_PREAMBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*CREATE\s+(?:OR\s+REPLACE\s+)?(?:ALGORITHM\s*=\s*\w+\s+)?(?:DEFINER\s*=\s*\S+\s+)?(?:SQL\s+SECURITY\s+\w+\s+)?VIEW\b",
    )
    .expect("static regex")
});

static QUOTED_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`((?:[^`]|``)+)`").expect("static regex"));

/// Remove server-specific clauses so the DDL replays on a destination with
/// different defaults.
///
/// Tables lose `ENGINE`, `AUTO_INCREMENT`, `CHARSET` and `COLLATE` table
/// options (column-level collations stay). Views lose `ALGORITHM`, `DEFINER`
/// and `SQL SECURITY`.
pub fn normalize_ddl(kind: ObjectKind, ddl: &str) -> String {
    match kind {
        ObjectKind::Table => match ddl.rfind(')') {
            Some(end) => {
                let (body, options) = ddl.split_at(end + 1);
                format!("{}{}", body, TABLE_OPTION.replace_all(options, ""))
                    .trim_end()
                    .to_string()
            }
            None => ddl.to_string(),
        },
        ObjectKind::View => VIEW_PREAMBLE.replace(ddl, "CREATE VIEW").into_owned(),
    }
}

/// Backquoted identifiers appearing in a statement, in order, unescaped.
pub fn quoted_identifiers(ddl: &str) -> Vec<String> {
    QUOTED_IDENT
        .captures_iter(ddl)
        .map(|c| c[1].replace("``", "`"))
        .collect()
}

/// Quote a MySQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_kind_from_table_type() {
        assert_eq!(ObjectKind::from_table_type("BASE TABLE"), Some(ObjectKind::Table));
        assert_eq!(ObjectKind::from_table_type("VIEW"), Some(ObjectKind::View));
        assert_eq!(ObjectKind::from_table_type("SEQUENCE"), None);
        assert!(ObjectKind::Table.has_data());
        assert!(!ObjectKind::View.has_data());
    }

    #[test]
    fn test_normalize_table_options() {
        let ddl = "CREATE TABLE `users` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `name` varchar(64) COLLATE utf8mb4_bin DEFAULT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB AUTO_INCREMENT=2501 DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_0900_ai_ci";
        let normalized = normalize_ddl(ObjectKind::Table, ddl);

        assert!(normalized.ends_with("PRIMARY KEY (`id`)\n)"));
        assert!(!normalized.contains("ENGINE"));
        assert!(!normalized.contains("AUTO_INCREMENT=2501"));
        assert!(!normalized.contains("CHARSET"));
        // column attributes untouched
        assert!(normalized.contains("NOT NULL AUTO_INCREMENT"));
        assert!(normalized.contains("COLLATE utf8mb4_bin"));
    }

    #[test]
    fn test_normalize_keeps_other_table_options() {
        let ddl = "CREATE TABLE `t` (`id` int) ENGINE=InnoDB ROW_FORMAT=DYNAMIC COMMENT='audit'";
        let normalized = normalize_ddl(ObjectKind::Table, ddl);
        assert_eq!(
            normalized,
            "CREATE TABLE `t` (`id` int) ROW_FORMAT=DYNAMIC COMMENT='audit'"
        );
    }

    #[test]
    fn test_normalize_view_definer() {
        let ddl = "CREATE ALGORITHM=UNDEFINED DEFINER=`admin`@`%` SQL SECURITY DEFINER VIEW `active_users` AS select `users`.`id` AS `id` from `users`";
        assert_eq!(
            normalize_ddl(ObjectKind::View, ddl),
            "CREATE VIEW `active_users` AS select `users`.`id` AS `id` from `users`"
        );
    }

    #[test]
    fn test_normalize_plain_view_unchanged() {
        let ddl = "CREATE VIEW `v` AS select 1 AS `one`";
        assert_eq!(normalize_ddl(ObjectKind::View, ddl), ddl);
    }

    #[test]
    fn test_quoted_identifiers() {
        let ids = quoted_identifiers("select `a`.`x` from `a` join `we``ird` on 1");
        assert_eq!(ids, vec!["a", "x", "a", "we`ird"]);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_missing_columns() {
        let desc = TableDescriptor {
            name: "users".into(),
            columns: vec!["id".into(), "Name".into()],
            key_columns: vec!["id".into()],
        };
        let incoming = vec!["id".to_string(), "name".to_string(), "email".to_string()];
        assert_eq!(desc.missing_columns(&incoming), vec!["email"]);
        assert!(desc.has_key());
    }
}
