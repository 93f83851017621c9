//! In-memory MySQL stand-in for integration tests.
//!
//! A [`MemoryServer`] holds tables (DDL, columns, key, rows) and views behind a
//! mutex. [`MemoryConnector`] routes a profile to a server by host name, so a
//! test wires "src" and "dst" to two servers. Faults are injected through
//! [`Faults`]. Errors carry real MySQL codes and go through the crate's
//! classification table.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use mysql_migrate::classify::{ErrorClass, classify_code};
use mysql_migrate::config::{ConnectionProfile, MigrateConfig, RetryConfig};
use mysql_migrate::database::{Connector, Database, ObjectDdl, RowStream};
use mysql_migrate::schema::{ObjectKind, TableDescriptor, quoted_identifiers};
use mysql_migrate::{Error, Result, Row, SqlValue};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A table held by a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct Table {
    pub ddl: String,
    pub columns: Vec<String>,
    pub key: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// Injected failures.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many upcoming connection attempts with 2003
    pub fail_connects: usize,
    /// Refuse every login with 1045
    pub reject_logins: bool,
    /// Connection attempt numbers (1-based, counted per server) that fail with 2003
    pub fail_connect_attempts: HashSet<usize>,
    /// Sleep before every upsert
    pub upsert_delay: Option<Duration>,
    /// Objects whose next CREATE statement loses the connection (2013), once
    pub lose_connection_on_ddl: HashSet<String>,
    /// (table, nth upsert on that table, 1-based) -> MySQL error code
    pub fail_upserts: HashMap<(String, usize), u16>,
    /// Table -> rows delivered before the cursor breaks with 2013
    pub break_cursor_after: HashMap<String, usize>,
    /// Object name -> MySQL error code returned by its CREATE statement
    pub fail_ddl: HashMap<String, u16>,
}

/// Server state.
#[derive(Debug, Default)]
pub struct ServerState {
    pub tables: BTreeMap<String, Table>,
    pub views: BTreeMap<String, String>,
    pub faults: Faults,
    pub upserts: HashMap<String, usize>,
    pub opened: usize,
    pub closed: usize,
    pub connect_attempts: usize,
}

/// Shared handle to one in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer(Arc<Mutex<ServerState>>);

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.0.lock().unwrap()
    }

    /// Run a CREATE statement directly, panicking on failure.
    pub fn exec(&self, ddl: &str) {
        self.state().execute(ddl).unwrap();
    }

    /// Append rows to a table.
    pub fn insert(&self, table: &str, rows: Vec<Vec<SqlValue>>) {
        let mut state = self.state();
        state.tables.get_mut(table).unwrap().rows.extend(rows);
    }

    /// Rows of a table, sorted for comparison.
    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        let mut rows = self
            .state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        rows.sort_by(|a, b| format!("{:?}", a).cmp(&format!("{:?}", b)));
        rows
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().tables.contains_key(name)
    }

    pub fn has_view(&self, name: &str) -> bool {
        self.state().views.contains_key(name)
    }
}

fn server_error(code: u16, message: impl Into<String>) -> Error {
    Error::database(classify_code(code), Some(code), message)
}

fn missing_table(name: &str) -> Error {
    server_error(1146, format!("Table 'app.{}' doesn't exist", name))
}

static CREATE_TABLE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+TABLE\s+`((?:[^`]|``)+)`\s*\((.*)\)").unwrap()
});

static CREATE_VIEW: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+.*?VIEW\s+`((?:[^`]|``)+)`\s+AS\s+(.*)$").unwrap()
});

static VIEW_SOURCE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:from|join)\s+`((?:[^`]|``)+)`").unwrap()
});

impl ServerState {
    fn exists(&self, name: &str) -> bool {
        self.tables.contains_key(name) || self.views.contains_key(name)
    }

    fn execute(&mut self, ddl: &str) -> Result<()> {
        if let Some(caps) = CREATE_TABLE.captures(ddl) {
            let name = caps[1].replace("``", "`");
            self.check_create(&name)?;
            let (columns, key) = parse_table_body(&caps[2]);
            self.tables.insert(
                name,
                Table {
                    ddl: ddl.to_string(),
                    columns,
                    key,
                    rows: Vec::new(),
                },
            );
            return Ok(());
        }

        if let Some(caps) = CREATE_VIEW.captures(ddl) {
            let name = caps[1].replace("``", "`");
            self.check_create(&name)?;
            for source in VIEW_SOURCE.captures_iter(&caps[2]) {
                let source = source[1].replace("``", "`");
                if !self.exists(&source) {
                    return Err(missing_table(&source));
                }
            }
            self.views.insert(name, ddl.to_string());
            return Ok(());
        }

        Err(server_error(
            1064,
            "You have an error in your SQL syntax",
        ))
    }

    fn check_create(&mut self, name: &str) -> Result<()> {
        if self.faults.lose_connection_on_ddl.remove(name) {
            return Err(server_error(
                2013,
                "Lost connection to MySQL server during query",
            ));
        }
        if let Some(code) = self.faults.fail_ddl.get(name) {
            return Err(server_error(*code, format!("injected failure for '{}'", name)));
        }
        if self.exists(name) {
            return Err(server_error(1050, format!("Table '{}' already exists", name)));
        }
        Ok(())
    }
}

/// Column names and key columns of a CREATE TABLE body.
fn parse_table_body(body: &str) -> (Vec<String>, Vec<String>) {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in body.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    parts.push(current);

    let mut columns = Vec::new();
    let mut primary = Vec::new();
    let mut unique = Vec::new();
    for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let upper = part.to_ascii_uppercase();
        if upper.starts_with("PRIMARY KEY") {
            primary = quoted_identifiers(part);
        } else if upper.starts_with("UNIQUE") {
            if unique.is_empty() {
                // UNIQUE KEY `name` (`col`, ...): skip the index name
                let ids = quoted_identifiers(part);
                unique = if upper.starts_with("UNIQUE KEY `") || upper.starts_with("UNIQUE INDEX `")
                {
                    ids.into_iter().skip(1).collect()
                } else {
                    ids
                };
            }
        } else if upper.starts_with("KEY")
            || upper.starts_with("INDEX")
            || upper.starts_with("CONSTRAINT")
            || upper.starts_with("FOREIGN KEY")
        {
            continue;
        } else if let Some(name) = quoted_identifiers(part).into_iter().next() {
            columns.push(name);
        }
    }

    let key = if primary.is_empty() { unique } else { primary };
    (columns, key)
}

/// Routes profiles to servers by host.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    servers: HashMap<String, MemoryServer>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, host: &str, server: &MemoryServer) -> Self {
        self.servers.insert(host.to_string(), server.clone());
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Database>> {
        let server = self.servers.get(profile.host()).cloned().ok_or_else(|| {
            server_error(2005, format!("Unknown MySQL server host '{}'", profile.host()))
        })?;
        {
            let mut state = server.state();
            state.connect_attempts += 1;
            let attempt = state.connect_attempts;
            let refused = if state.faults.fail_connects > 0 {
                state.faults.fail_connects -= 1;
                true
            } else {
                state.faults.fail_connect_attempts.contains(&attempt)
            };
            if state.faults.reject_logins {
                return Err(server_error(
                    1045,
                    format!("Access denied for user '{}'@'%'", profile.user()),
                ));
            }
            if refused {
                return Err(server_error(
                    2003,
                    format!("Can't connect to MySQL server on '{}'", profile.host()),
                ));
            }
            state.opened += 1;
        }
        Ok(Box::new(MemoryDatabase { server }))
    }
}

/// One session on a [`MemoryServer`].
pub struct MemoryDatabase {
    server: MemoryServer,
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn list_objects(&mut self) -> Result<Vec<(String, ObjectKind)>> {
        let state = self.server.state();
        let mut objects: Vec<(String, ObjectKind)> = state
            .tables
            .keys()
            .map(|n| (n.clone(), ObjectKind::Table))
            .chain(state.views.keys().map(|n| (n.clone(), ObjectKind::View)))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    async fn show_create(&mut self, name: &str) -> Result<ObjectDdl> {
        let state = self.server.state();
        if let Some(table) = state.tables.get(name) {
            return Ok(ObjectDdl {
                kind: ObjectKind::Table,
                ddl: table.ddl.clone(),
            });
        }
        if let Some(ddl) = state.views.get(name) {
            return Ok(ObjectDdl {
                kind: ObjectKind::View,
                ddl: ddl.clone(),
            });
        }
        Err(missing_table(name))
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        self.server.state().execute(ddl)
    }

    async fn describe_table(&mut self, name: &str) -> Result<Option<TableDescriptor>> {
        Ok(self.server.state().tables.get(name).map(|t| TableDescriptor {
            name: name.to_string(),
            columns: t.columns.clone(),
            key_columns: t.key.clone(),
        }))
    }

    async fn stream_rows<'a>(&'a mut self, table: &str) -> Result<RowStream<'a>> {
        let state = self.server.state();
        let source = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        let columns: Arc<[String]> = source.columns.clone().into();

        let mut items: Vec<Result<Row>> = source
            .rows
            .iter()
            .map(|values| Ok(Row::new(columns.clone(), values.clone())))
            .collect();
        if let Some(&after) = state.faults.break_cursor_after.get(table) {
            items.truncate(after);
            items.push(Err(server_error(
                2013,
                "Lost connection to MySQL server during query",
            )));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn upsert(&mut self, table: &str, columns: &[String], rows: Vec<Row>) -> Result<u64> {
        let delay = self.server.state().faults.upsert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.server.state();

        let call = {
            let counter = state.upserts.entry(table.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if let Some(&code) = state.faults.fail_upserts.get(&(table.to_string(), call)) {
            return Err(server_error(code, format!("injected failure on {} #{}", table, call)));
        }

        let target = state.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let positions = columns
            .iter()
            .map(|c| {
                target.columns.iter().position(|own| own == c).ok_or_else(|| {
                    server_error(1054, format!("Unknown column '{}' in 'field list'", c))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let key_positions: Vec<usize> = target
            .key
            .iter()
            .filter_map(|k| target.columns.iter().position(|c| c == k))
            .collect();

        // staged so a failure leaves the table untouched
        let mut staged = target.rows.clone();
        for row in &rows {
            let mut values = vec![SqlValue::Null; target.columns.len()];
            for (value, &pos) in row.values().iter().zip(&positions) {
                values[pos] = value.clone();
            }
            let existing = if key_positions.is_empty() {
                None
            } else {
                staged
                    .iter()
                    .position(|r| key_positions.iter().all(|&k| r[k] == values[k]))
            };
            match existing {
                Some(i) => staged[i] = values,
                None => staged.push(values),
            }
        }
        target.rows = staged;
        Ok(rows.len() as u64)
    }

    async fn close(self: Box<Self>) {
        self.server.state().closed += 1;
    }
}

/// Source and destination wired to a connector.
pub struct TestEnv {
    pub source: MemoryServer,
    pub destination: MemoryServer,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            source: MemoryServer::new(),
            destination: MemoryServer::new(),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(
            MemoryConnector::new()
                .with_server("src", &self.source)
                .with_server("dst", &self.destination),
        )
    }

    /// Config for the given object list (empty = discover).
    pub fn config(&self, objects: &[&str]) -> MigrateConfig {
        let mut config = MigrateConfig::builder()
            .source(profile("src"))
            .destination(profile("dst"))
            .objects(objects.iter().copied())
            .batch_size(1000)
            .workers(2)
            .build()
            .unwrap();
        config.retry = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter: false,
        };
        config
    }
}

pub fn profile(host: &str) -> ConnectionProfile {
    ConnectionProfile::builder()
        .host(host)
        .user("root")
        .password("secret")
        .database("app")
        .max_retries(2)
        .build()
        .unwrap()
}

pub const USERS_DDL: &str = "CREATE TABLE `users` (\n  `id` bigint NOT NULL,\n  `name` varchar(64) DEFAULT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

pub const ORDERS_DDL: &str = "CREATE TABLE `orders` (\n  `id` bigint NOT NULL,\n  `user_id` bigint NOT NULL,\n  `total` decimal(10,2) DEFAULT NULL,\n  PRIMARY KEY (`id`),\n  KEY `user_idx` (`user_id`)\n) ENGINE=InnoDB";

pub const ACTIVE_USERS_DDL: &str = "CREATE ALGORITHM=UNDEFINED DEFINER=`admin`@`%` SQL SECURITY DEFINER VIEW `active_users` AS select `users`.`id` AS `id` from `users`";

/// `n` user rows with ids starting at 1.
pub fn user_rows(n: usize) -> Vec<Vec<SqlValue>> {
    (1..=n as i64)
        .map(|i| vec![SqlValue::Int(i), SqlValue::Text(format!("user{}", i))])
        .collect()
}

/// `n` order rows.
pub fn order_rows(n: usize) -> Vec<Vec<SqlValue>> {
    (1..=n as i64)
        .map(|i| {
            vec![
                SqlValue::Int(i),
                SqlValue::Int(i % 7 + 1),
                SqlValue::Bytes(format!("{}.50", i).into_bytes()),
            ]
        })
        .collect()
}

/// Source with `users` (n rows), `orders` (10 rows) and the `active_users` view.
pub fn seeded(users: usize) -> TestEnv {
    let env = TestEnv::new();
    env.source.exec(USERS_DDL);
    env.source.exec(ORDERS_DDL);
    env.source.exec(ACTIVE_USERS_DDL);
    env.source.insert("users", user_rows(users));
    env.source.insert("orders", order_rows(10));
    env
}

/// Class of an error, for assertions.
pub fn class_of(err: &Error) -> ErrorClass {
    err.class()
}
