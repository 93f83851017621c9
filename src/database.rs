//! Database abstraction used by the migration engine.
//!
//! The engine talks to both ends of a migration through [`Database`], and
//! obtains connections through a [`Connector`]. The MySQL implementation lives
//! in [`crate::mysql`]; tests plug in an in-memory one.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConnectionProfile;
use crate::error::Result;
use crate::schema::{ObjectKind, TableDescriptor};
use crate::value::Row;

/// Stream of rows read through an open cursor.
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// DDL as reported by the server for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDdl {
    /// Table or view
    pub kind: ObjectKind,
    /// Literal CREATE statement
    pub ddl: String,
}

/// One live connection to a database.
///
/// Connections are never shared; each method takes `&mut self`.
#[async_trait]
pub trait Database: Send {
    /// Cheap round trip to verify the session is usable.
    async fn ping(&mut self) -> Result<()>;

    /// List base tables and views of the connected database.
    async fn list_objects(&mut self) -> Result<Vec<(String, ObjectKind)>>;

    /// Retrieve the CREATE statement for a table or view.
    async fn show_create(&mut self, name: &str) -> Result<ObjectDdl>;

    /// Execute a DDL statement.
    async fn execute_ddl(&mut self, ddl: &str) -> Result<()>;

    /// Read the column list and key columns of a table, `None` if it does not
    /// exist.
    async fn describe_table(&mut self, name: &str) -> Result<Option<TableDescriptor>>;

    /// Open an unbuffered cursor over every row of a table.
    ///
    /// The stream borrows the connection; nothing else can run on it until
    /// the stream is dropped.
    async fn stream_rows<'a>(&'a mut self, table: &str) -> Result<RowStream<'a>>;

    /// Insert `rows` into `table`, overwriting existing rows on key collision.
    ///
    /// `columns` is the column list of every row. The write is atomic: either
    /// every row is stored or none is.
    async fn upsert(&mut self, table: &str, columns: &[String], rows: Vec<Row>) -> Result<u64>;

    /// Close the connection.
    async fn close(self: Box<Self>);
}

/// Opens connections described by a [`ConnectionProfile`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection. Retries are handled by the caller.
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Database>>;
}
