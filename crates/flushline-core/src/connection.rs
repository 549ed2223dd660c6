//! Database connection trait.
//!
//! The flush engine never speaks a wire protocol itself. Everything it needs
//! from a database client is captured by [`Connection`]: row-returning
//! selects, row-count-returning updates, identity inserts and transaction
//! demarcation. All operations integrate with asupersync's structured
//! concurrency via `Cx` and report through `Outcome`.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// An asynchronous database client.
///
/// Implementations serialize statements on one logical session; callers
/// await each call before issuing the next.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.select(&cx, "select id from heroes where id = $1", &[Value::BigInt(1)]).await;
/// let count = conn.update(&cx, "delete from heroes where id = $1", &[Value::BigInt(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// The backend dialect, used once to pick placeholder and lock syntax.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn select(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn select_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send {
        async move {
            match self.select(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Execute an INSERT, UPDATE or DELETE and return the rows affected.
    fn update(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT into a table with a database-assigned key and
    /// return the generated key.
    ///
    /// The exact mechanism (RETURNING, last insert id) is up to the driver.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Execute several statements and return the rows affected by each.
    ///
    /// The default runs them one at a time through [`Connection::update`]
    /// and stops at the first failure.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, crate::Error>> + Send {
        async move {
            let mut counts = Vec::with_capacity(statements.len());
            for (sql, params) in statements {
                match self.update(cx, sql, params).await {
                    Outcome::Ok(n) => counts.push(n),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(counts)
        }
    }

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

/// Propagate the non-`Ok` variants of an `Outcome` (or the `Err` of a
/// `Result`) out of the enclosing async function.
///
/// ```rust,ignore
/// let rows = try_outcome!(conn.select(cx, sql, &params).await);
/// let persister = try_outcome!(result metamodel.persister("Hero"));
/// ```
#[macro_export]
macro_rules! try_outcome {
    (result $expr:expr) => {
        match $expr {
            ::std::result::Result::Ok(v) => v,
            ::std::result::Result::Err(e) => {
                return $crate::Outcome::Err(::std::convert::From::from(e));
            }
        }
    };
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}
