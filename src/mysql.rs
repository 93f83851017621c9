//! MySQL implementation of [`Database`] and [`Connector`] on `mysql_async`.
//!
//! Each [`MySqlDatabase`] owns exactly one session. Rows are read with the
//! text protocol through an unbuffered result stream and written back with
//! prepared multi-row `INSERT ... ON DUPLICATE KEY UPDATE` statements inside
//! a single transaction per batch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, OptsBuilder, SslOpts, TxOpts, Value};
use tracing::{debug, info, warn};

use crate::classify::{ErrorClass, classify_code};
use crate::config::{ConnectionProfile, SslMode};
use crate::database::{Connector, Database, ObjectDdl, RowStream};
use crate::error::{Error, Result};
use crate::schema::{ObjectKind, TableDescriptor, quote_ident};
use crate::value::{Row, SqlValue};

/// Upper bound on `?` placeholders in one prepared statement.
pub const MYSQL_MAX_PLACEHOLDERS: usize = 65535;

/// Opens `mysql_async` sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Database>> {
        let conn = match Conn::new(session_opts(profile, true)).await {
            Ok(conn) => conn,
            Err(e) if profile.ssl_mode() == SslMode::Prefer && server_lacks_tls(&e) => {
                warn!(
                    "{} does not offer TLS, connecting in plaintext",
                    profile.display_name()
                );
                Conn::new(session_opts(profile, false))
                    .await
                    .map_err(map_error)?
            }
            Err(e) => return Err(map_error(e)),
        };
        debug!("Connected to {}", profile.display_name());
        Ok(Box::new(MySqlDatabase { conn }))
    }
}

/// Whether the handshake failed only because the server has no TLS support.
fn server_lacks_tls(e: &mysql_async::Error) -> bool {
    matches!(
        e,
        mysql_async::Error::Driver(DriverError::NoClientSslFlagFromServer)
    )
}

/// Session options; `tls = false` leaves TLS off whatever the profile says.
fn session_opts(profile: &ConnectionProfile, tls: bool) -> OptsBuilder {
    let mut init = vec!["SET NAMES utf8mb4".to_string()];
    init.extend(profile.init_statements().iter().cloned());

    let mut builder = OptsBuilder::default()
        .ip_or_hostname(profile.host())
        .tcp_port(profile.port())
        .db_name(Some(profile.database()))
        .user(Some(profile.user()))
        .pass(Some(profile.password()))
        .init(init);

    let ssl = match profile.ssl_mode() {
        _ if !tls => None,
        SslMode::Disable => {
            warn!(
                "TLS is disabled for {}. Credentials will be transmitted in plaintext.",
                profile.display_name()
            );
            None
        }
        SslMode::Prefer | SslMode::Require => {
            Some(SslOpts::default().with_danger_accept_invalid_certs(true))
        }
        SslMode::VerifyIdentity => Some(SslOpts::default()),
    };
    if let Some(ssl) = ssl {
        builder = builder.ssl_opts(ssl);
    }
    builder
}

/// One MySQL session.
pub struct MySqlDatabase {
    conn: Conn,
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await.map_err(map_error)
    }

    async fn list_objects(&mut self) -> Result<Vec<(String, ObjectKind)>> {
        let rows: Vec<(String, String)> = self
            .conn
            .query(
                "SELECT CAST(TABLE_NAME AS CHAR(255)), CAST(TABLE_TYPE AS CHAR(64)) \
                 FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(map_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, table_type)| {
                ObjectKind::from_table_type(&table_type).map(|kind| (name, kind))
            })
            .collect())
    }

    async fn show_create(&mut self, name: &str) -> Result<ObjectDdl> {
        // SHOW CREATE TABLE answers for views too, with a "View" header
        let sql = format!("SHOW CREATE TABLE {}", quote_ident(name));
        let mut row: mysql_async::Row = self
            .conn
            .query_first(sql)
            .await
            .map_err(map_error)?
            .ok_or_else(|| {
                Error::database(
                    ErrorClass::MissingObject,
                    None,
                    format!("SHOW CREATE returned no row for '{}'", name),
                )
            })?;

        let header = row
            .columns_ref()
            .first()
            .map(|c| c.name_str().into_owned())
            .unwrap_or_default();
        let ddl: String = match row.take_opt(1) {
            Some(Ok(ddl)) => ddl,
            _ => {
                return Err(Error::database(
                    ErrorClass::Other,
                    None,
                    format!("SHOW CREATE returned no statement for '{}'", name),
                ));
            }
        };

        let kind = if header.eq_ignore_ascii_case("view") {
            ObjectKind::View
        } else {
            ObjectKind::Table
        };
        Ok(ObjectDdl { kind, ddl })
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        self.conn.query_drop(ddl).await.map_err(map_error)
    }

    async fn describe_table(&mut self, name: &str) -> Result<Option<TableDescriptor>> {
        let columns: Vec<String> = self
            .conn
            .exec(
                "SELECT CAST(COLUMN_NAME AS CHAR(255)) FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (name,),
            )
            .await
            .map_err(map_error)?;
        if columns.is_empty() {
            return Ok(None);
        }

        let mut key_columns: Vec<String> = self
            .conn
            .exec(
                "SELECT CAST(COLUMN_NAME AS CHAR(255)) FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                (name,),
            )
            .await
            .map_err(map_error)?;

        if key_columns.is_empty() {
            let unique: Vec<(String, String)> = self
                .conn
                .exec(
                    "SELECT CAST(INDEX_NAME AS CHAR(255)), CAST(COLUMN_NAME AS CHAR(255)) \
                     FROM information_schema.STATISTICS \
                     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND NON_UNIQUE = 0 \
                     ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                    (name,),
                )
                .await
                .map_err(map_error)?;
            key_columns = first_index_columns(unique);
        }

        Ok(Some(TableDescriptor {
            name: name.to_string(),
            columns,
            key_columns,
        }))
    }

    async fn stream_rows<'a>(&'a mut self, table: &str) -> Result<RowStream<'a>> {
        let sql = format!("SELECT * FROM {}", quote_ident(table));
        let result = self.conn.query_iter(sql).await.map_err(map_error)?;

        let stream = match result
            .stream_and_drop::<mysql_async::Row>()
            .await
            .map_err(map_error)?
        {
            Some(stream) => stream,
            None => return Ok(futures::stream::empty().boxed()),
        };

        let mut columns: Option<Arc<[String]>> = None;
        Ok(stream
            .map_err(map_error)
            .map_ok(move |row| {
                let names = columns
                    .get_or_insert_with(|| {
                        row.columns_ref()
                            .iter()
                            .map(|c| c.name_str().into_owned())
                            .collect()
                    })
                    .clone();
                // mysql_async::Row::unwrap yields the owned column values
                let values = row.unwrap().into_iter().map(from_mysql).collect();
                Row::new(names, values)
            })
            .boxed())
    }

    async fn upsert(&mut self, table: &str, columns: &[String], rows: Vec<Row>) -> Result<u64> {
        if columns.is_empty() || rows.is_empty() {
            return Ok(0);
        }

        let per_statement = max_rows_per_statement(columns.len());
        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(map_error)?;

        let mut written = 0u64;
        for chunk in rows.chunks(per_statement) {
            let sql = build_upsert(table, columns, chunk.len());
            let params: Vec<Value> = chunk
                .iter()
                .flat_map(|row| row.values().iter().map(to_mysql))
                .collect();

            if let Err(e) = tx.exec_drop(sql.as_str(), params).await {
                let err = map_error(e);
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback on {} failed: {}", table, rollback);
                }
                return Err(err);
            }
            written += chunk.len() as u64;
        }

        tx.commit().await.map_err(map_error)?;
        Ok(written)
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.disconnect().await {
            info!("Error while closing connection: {}", e);
        }
    }
}

/// Rows that fit in one statement without exceeding the placeholder limit.
pub fn max_rows_per_statement(column_count: usize) -> usize {
    (MYSQL_MAX_PLACEHOLDERS / column_count.max(1)).max(1)
}

/// Multi-row upsert for `row_count` rows.
///
/// Every column is overwritten from the incoming row on key collision, which
/// makes replaying the same batch a no-op.
pub fn build_upsert(table: &str, columns: &[String], row_count: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let row_placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![row_placeholders; row_count].join(", ");
    let updates = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{} = VALUES({})", c, c)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
        quote_ident(table),
        column_list,
        values,
        updates
    )
}

/// Columns of the first index in `(index, column)` pairs ordered by index.
fn first_index_columns(pairs: Vec<(String, String)>) -> Vec<String> {
    let first = match pairs.first() {
        Some((index, _)) => index.clone(),
        None => return Vec::new(),
    };
    pairs
        .into_iter()
        .take_while(|(index, _)| *index == first)
        .map(|(_, column)| column)
        .collect()
}

/// Convert a driver error into a classified [`Error`].
pub fn map_error(e: mysql_async::Error) -> Error {
    match e {
        mysql_async::Error::Server(ref server) => {
            Error::database(classify_code(server.code), Some(server.code), server.message.clone())
        }
        mysql_async::Error::Io(io) => {
            Error::database(ErrorClass::ConnectionLost, None, io.to_string())
        }
        mysql_async::Error::Driver(
            ref driver @ (DriverError::ConnectionClosed | DriverError::PoolDisconnected),
        ) => Error::database(ErrorClass::ConnectionLost, None, driver.to_string()),
        other => Error::database(ErrorClass::Other, None, other.to_string()),
    }
}

fn from_mysql(value: Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(b) => SqlValue::Bytes(b),
        Value::Int(i) => SqlValue::Int(i),
        Value::UInt(u) => SqlValue::UInt(u),
        Value::Float(f) => SqlValue::Float(f),
        Value::Double(d) => SqlValue::Double(d),
        Value::Date(year, month, day, hour, minute, second, micros) => SqlValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        },
        Value::Time(negative, days, hours, minutes, seconds, micros) => SqlValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        },
    }
}

fn to_mysql(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Int(i) => Value::Int(*i),
        SqlValue::UInt(u) => Value::UInt(*u),
        SqlValue::Float(f) => Value::Float(*f),
        SqlValue::Double(d) => Value::Double(*d),
        SqlValue::Text(s) => Value::Bytes(s.as_bytes().to_vec()),
        SqlValue::Bytes(b) => Value::Bytes(b.clone()),
        SqlValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => Value::Date(*year, *month, *day, *hour, *minute, *second, *micros),
        SqlValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => Value::Time(*negative, *days, *hours, *minutes, *seconds, *micros),
    }
}
