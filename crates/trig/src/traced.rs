//! Traced database connection wrapper.
//!
//! Everything in this crate talks to Postgres through [`Connection`], and
//! every statement goes through [`TracedConn`] so it shows up in `tracing`
//! output with the SQL text attached.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row, Statement};
use tracing::Instrument;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Trait for database connections that can execute queries.
///
/// This is implemented for `tokio_postgres::Client` and `deadpool_postgres::Object`.
/// Transactions are driven with plain `BEGIN`/`COMMIT`/`ROLLBACK` through
/// [`Connection::batch_execute`], so `&self` is all that's ever needed.
pub trait Connection: Send + Sync {
    /// Execute a statement, returning the number of rows affected.
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [&'a (dyn ToSql + Sync)])
    -> BoxFut<'a, u64>;

    /// Execute a query, returning all rows.
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Vec<Row>>;

    /// Execute a query, returning at most one row.
    fn query_opt<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Option<Row>>;

    /// Execute a query, returning exactly one row.
    fn query_one<'a>(&'a self, sql: &'a str, params: &'a [&'a (dyn ToSql + Sync)])
    -> BoxFut<'a, Row>;

    /// Run raw SQL through the simple query protocol.
    ///
    /// May contain several statements; no parameters.
    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFut<'a, ()>;

    /// Ask the server to parse a statement without running it.
    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFut<'a, Statement>;
}

impl Connection for tokio_postgres::Client {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, u64> {
        Box::pin(tokio_postgres::Client::execute(self, sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Vec<Row>> {
        Box::pin(tokio_postgres::Client::query(self, sql, params))
    }

    fn query_opt<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Option<Row>> {
        Box::pin(tokio_postgres::Client::query_opt(self, sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Row> {
        Box::pin(tokio_postgres::Client::query_one(self, sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFut<'a, ()> {
        Box::pin(tokio_postgres::Client::batch_execute(self, sql))
    }

    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFut<'a, Statement> {
        Box::pin(tokio_postgres::Client::prepare(self, sql))
    }
}

impl Connection for deadpool_postgres::Object {
    // Each method derefs to the underlying Client to avoid recursion.

    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, u64> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.execute(sql, params))
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Vec<Row>> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.query(sql, params))
    }

    fn query_opt<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Option<Row>> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.query_opt(sql, params))
    }

    fn query_one<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFut<'a, Row> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.query_one(sql, params))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFut<'a, ()> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.batch_execute(sql))
    }

    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFut<'a, Statement> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(client.prepare(sql))
    }
}

/// A wrapper around a database connection that logs all statements via tracing.
///
/// # Example
///
/// ```ignore
/// use trig::ConnectionExt;
///
/// let rows = client.traced().query("SELECT tgname FROM pg_trigger", &[]).await?;
/// ```
pub struct TracedConn<'a, C: Connection + ?Sized> {
    conn: &'a C,
}

impl<'a, C: Connection + ?Sized> TracedConn<'a, C> {
    /// Create a new traced connection wrapper.
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            params = params.len(),
            affected = tracing::field::Empty,
        );
        let affected = self
            .conn
            .execute(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("affected", affected);
        Ok(affected)
    }

    /// Execute a query, returning all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let rows = self
            .conn
            .query(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Execute a query, returning at most one row.
    pub async fn query_opt(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let row = self
            .conn
            .query_opt(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", if row.is_some() { 1u64 } else { 0u64 });
        Ok(row)
    }

    /// Execute a query, returning exactly one row.
    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row, Error> {
        let span = tracing::debug_span!("db.query", sql = %sql, params = params.len(), rows = 1u64);
        self.conn.query_one(sql, params).instrument(span).await
    }

    /// Run raw SQL (possibly several statements) with the simple query protocol.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.batch", sql = %sql);
        self.conn.batch_execute(sql).instrument(span).await
    }

    /// Parse a statement server-side without executing it.
    pub async fn prepare(&self, sql: &str) -> Result<Statement, Error> {
        let span = tracing::debug_span!("db.prepare", sql = %sql);
        self.conn.prepare(sql).instrument(span).await
    }
}

/// Extension trait to get a traced wrapper from a connection.
pub trait ConnectionExt: Connection {
    /// Wrap this connection in a `TracedConn` for query logging.
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
