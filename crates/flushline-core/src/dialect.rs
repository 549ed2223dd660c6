//! Backend dialects.
//!
//! A [`Dialect`] is declared once per connection and decides the
//! parameter placeholder syntax, the pessimistic row-lock rendering and the
//! conflict-ignoring insert form used when seeding counter rows.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// SQL dialect for rendering dialect-specific statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// CockroachDB (PostgreSQL wire syntax)
    Cockroach,
    /// Microsoft SQL Server (uses @P1, @P2 placeholders)
    SqlServer,
    /// Oracle (uses :1, :2 placeholders)
    Oracle,
    /// MySQL / MariaDB (uses ? placeholders)
    Mysql,
    /// SQLite (uses ? placeholders, no row locks)
    Sqlite,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres | Dialect::Cockroach => format!("${index}"),
            Dialect::SqlServer => format!("@P{index}"),
            Dialect::Oracle => format!(":{index}"),
            Dialect::Mysql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Render `count` comma-separated placeholders starting at `start`.
    pub fn placeholders(self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Table hint placed right after `<table> <alias>` for a pessimistic
    /// write lock, for backends that lock through table hints.
    pub const fn write_lock_table_hint(self) -> &'static str {
        match self {
            Dialect::SqlServer => " with (updlock, rowlock)",
            _ => "",
        }
    }

    /// Clause appended to a SELECT for a pessimistic write lock on `alias`.
    pub fn write_lock_suffix(self, alias: &str, column: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Cockroach => format!(" for update of {alias}"),
            Dialect::Oracle => format!(" for update of {alias}.{column}"),
            Dialect::Mysql => " for update".to_string(),
            Dialect::SqlServer | Dialect::Sqlite => String::new(),
        }
    }

    /// Whether the backend has a single-statement insert that silently skips
    /// rows violating a unique constraint.
    pub const fn supports_insert_ignore(self) -> bool {
        matches!(
            self,
            Dialect::Postgres | Dialect::Cockroach | Dialect::Mysql | Dialect::Sqlite
        )
    }

    /// Render an INSERT of `columns` into `table`.
    ///
    /// With `ignore_conflicts` and a backend that supports it, a row that
    /// collides with a unique key is skipped and reports zero affected rows.
    pub fn insert(self, table: &str, columns: &[&str], ignore_conflicts: bool) -> String {
        let values = self.placeholders(1, columns.len());
        let columns = columns.join(", ");
        let ignore = ignore_conflicts && self.supports_insert_ignore();
        match self {
            Dialect::Mysql if ignore => {
                format!("insert ignore into {table} ({columns}) values ({values})")
            }
            Dialect::Postgres | Dialect::Cockroach | Dialect::Sqlite if ignore => {
                format!("insert into {table} ({columns}) values ({values}) on conflict do nothing")
            }
            _ => format!("insert into {table} ({columns}) values ({values})"),
        }
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "cockroach" | "cockroachdb" => Ok(Dialect::Cockroach),
            "sqlserver" | "mssql" => Ok(Dialect::SqlServer),
            "oracle" => Ok(Dialect::Oracle),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(Error::config(format!("unknown dialect '{other}'"))),
        }
    }
}
