//! Table-backed block allocation.
//!
//! A counter table holds one row per segment. Each allocation reads the
//! segment's counter under a pessimistic write lock, then advances it with a
//! compare-and-swap `update ... where <value> = <current>`. Losing the swap
//! (zero rows affected) restarts the protocol; more than one affected row means
//! the table holds duplicate segment rows and is reported immediately.
//!
//! A missing row is seeded with a conflict-ignoring insert where the dialect
//! has one, so two allocators racing on first use converge: the loser sees zero
//! affected rows and retries against the row the winner created.

use crate::generator::BlockAllocator;
use flushline_core::{
    Connection, Cx, Dialect, Error, Outcome, Result, RowCountError, TableGeneratorConfig, Value,
    try_outcome,
};

const TABLE_ALIAS: &str = "tbl";

/// Statements rendered once for a generator's dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Statements {
    select: String,
    update: String,
    insert: String,
}

/// Allocates identifier blocks from a counter table.
#[derive(Debug, Clone)]
pub struct TableGenerator {
    config: TableGeneratorConfig,
    dialect: Dialect,
    statements: Statements,
}

impl TableGenerator {
    /// Create a generator, rendering its statements for `dialect`.
    pub fn new(config: TableGeneratorConfig, dialect: Dialect) -> Result<Self> {
        config.validate()?;
        let statements = Self::render(&config, dialect);
        tracing::debug!(
            table = %config.table,
            segment = %config.segment_value,
            increment = config.increment_size,
            ?dialect,
            "Table generator configured"
        );
        Ok(Self {
            config,
            dialect,
            statements,
        })
    }

    fn render(config: &TableGeneratorConfig, dialect: Dialect) -> Statements {
        let table = &config.table;
        let value = &config.value_column;

        let mut select = format!(
            "select {TABLE_ALIAS}.{value} from {table} {TABLE_ALIAS}{}",
            dialect.write_lock_table_hint()
        );
        if let Some(segment) = &config.segment_column {
            select.push_str(&format!(
                " where {TABLE_ALIAS}.{segment}={}",
                dialect.placeholder(1)
            ));
        }
        select.push_str(&dialect.write_lock_suffix(TABLE_ALIAS, value));

        let mut update = format!(
            "update {table} set {value}={} where {value}={}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        if let Some(segment) = &config.segment_column {
            update.push_str(&format!(" and {segment}={}", dialect.placeholder(3)));
        }

        let insert = match &config.segment_column {
            Some(segment) => dialect.insert(table, &[segment.as_str(), value.as_str()], config.seed_with_upsert),
            None => dialect.insert(table, &[value.as_str()], config.seed_with_upsert),
        };

        Statements {
            select,
            update,
            insert,
        }
    }

    /// The generator's configuration.
    pub fn config(&self) -> &TableGeneratorConfig {
        &self.config
    }

    /// The dialect the statements were rendered for.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Counter read statement.
    pub fn select_sql(&self) -> &str {
        &self.statements.select
    }

    /// Compare-and-swap statement.
    pub fn update_sql(&self) -> &str {
        &self.statements.update
    }

    /// Seed statement for a missing counter row.
    pub fn insert_sql(&self) -> &str {
        &self.statements.insert
    }

    fn segment_param(&self) -> Option<Value> {
        self.config
            .segment_column
            .as_ref()
            .map(|_| Value::Text(self.config.segment_value.clone()))
    }

    /// `value + increment_size`, failing instead of wrapping.
    fn step(&self, value: i64) -> Result<i64> {
        value.checked_add(self.config.increment_size).ok_or_else(|| {
            Error::IdentifierGeneration(format!(
                "id counter {} of {} overflows past {value}",
                self.config.value_column, self.config.table
            ))
        })
    }

    /// Value recorded by the seed row and the id returned with it.
    fn seed(&self) -> Result<(i64, i64)> {
        let initial = self.config.initial_value;
        if self.config.store_last_used {
            Ok((self.step(initial)?, initial))
        } else {
            Ok((initial, initial))
        }
    }

    /// New counter value and the id returned for a row currently at `current`.
    ///
    /// With `store_last_used` the row holds the first id of the next block,
    /// so the block handed out starts at `current` rather than at the new
    /// value.
    fn advance(&self, current: i64) -> Result<(i64, i64)> {
        let updated = self.step(current)?;
        if self.config.store_last_used {
            Ok((updated, current))
        } else {
            Ok((updated, updated))
        }
    }

    fn statement_for(&self, current: Option<i64>) -> Result<(&str, Vec<Value>, i64)> {
        match current {
            None => {
                let (recorded, id) = self.seed()?;
                let mut params = Vec::with_capacity(2);
                params.extend(self.segment_param());
                params.push(Value::BigInt(recorded));
                Ok((self.insert_sql(), params, id))
            }
            Some(current) => {
                let (updated, id) = self.advance(current)?;
                let mut params = vec![Value::BigInt(updated), Value::BigInt(current)];
                params.extend(self.segment_param());
                Ok((self.update_sql(), params, id))
            }
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, conn),
        fields(table = %self.config.table, segment = %self.config.segment_value)
    )]
    async fn allocate<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<i64, Error> {
        let select_params: Vec<Value> = self.segment_param().into_iter().collect();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            tracing::trace!(sql = %self.select_sql(), attempt, "Reading id counter");
            let rows = try_outcome!(conn.select(cx, self.select_sql(), &select_params).await);
            if rows.len() > 1 {
                return Outcome::Err(Error::TooManyRowsAffected(RowCountError {
                    message: "multiple rows in id table".to_string(),
                    expected: 1,
                    actual: rows.len() as u64,
                }));
            }

            let current = match rows.first() {
                None => None,
                Some(row) => match row.get(0).and_then(Value::as_i64) {
                    Some(v) => Some(v),
                    None => {
                        return Outcome::Err(Error::IdentifierGeneration(format!(
                            "counter column {} of {} holds no integer value",
                            self.config.value_column, self.config.table
                        )));
                    }
                },
            };

            let (sql, params, id) = try_outcome!(result self.statement_for(current));
            tracing::trace!(sql = %sql, ?current, "Advancing id counter");
            let affected = try_outcome!(conn.update(cx, sql, &params).await);

            match affected {
                1 => {
                    tracing::debug!(id, attempt, "Reserved identifier block");
                    return Outcome::Ok(id);
                }
                0 => {
                    tracing::warn!(attempt, ?current, "Lost id counter race, retrying");
                }
                n => {
                    return Outcome::Err(Error::TooManyRowsAffected(RowCountError {
                        message: "multiple rows in id table".to_string(),
                        expected: 1,
                        actual: n,
                    }));
                }
            }
        }
    }
}

impl BlockAllocator for TableGenerator {
    fn block_size(&self) -> i64 {
        self.config.increment_size
    }

    fn next_block<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.allocate(cx, conn)
    }
}
