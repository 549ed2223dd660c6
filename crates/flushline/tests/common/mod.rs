//! In-memory database shared by the integration tests.
//!
//! Understands exactly the statement shapes the session and the table
//! generator render for the Postgres dialect: single-table selects with
//! `col=$n` conjunctions (optionally aliased and locked), inserts, updates
//! and deletes.

#![allow(dead_code)]

use flushline::{Connection, Cx, Dialect, Error, Outcome, QueryError, QueryErrorKind, Row, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

type Record = HashMap<String, Value>;

#[derive(Debug, Default)]
pub struct DbState {
    pub tables: HashMap<String, Vec<Record>>,
    /// Writes in execution order.
    pub writes: Vec<(String, Vec<Value>)>,
    pub selects: Vec<(String, Vec<Value>)>,
    /// `(table, column, amount)` applied right before the next update of
    /// `table`, simulating a concurrent writer.
    pub interference: Vec<(String, String, i64)>,
    pub next_identity: i64,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    pub state: Arc<Mutex<DbState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_row(&self, table: &str, values: &[(&str, Value)]) {
        let record = values
            .iter()
            .map(|(column, value)| ((*column).to_string(), value.clone()))
            .collect();
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .writes
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.writes.clear();
        guard.selects.clear();
    }

    pub fn interfere(&self, table: &str, column: &str, amount: i64) {
        self.state
            .lock()
            .expect("lock poisoned")
            .interference
            .push((table.to_string(), column.to_string(), amount));
    }

    pub fn transactions(&self) -> (usize, usize, usize) {
        let guard = self.state.lock().expect("lock poisoned");
        (guard.begins, guard.commits, guard.rollbacks)
    }
}

fn strip_alias(column: &str) -> String {
    column.trim().rsplit('.').next().unwrap_or(column).to_string()
}

fn param(token: &str, params: &[Value]) -> Value {
    token
        .trim()
        .trim_start_matches('$')
        .parse::<usize>()
        .ok()
        .and_then(|n| params.get(n - 1).cloned())
        .unwrap_or(Value::Null)
}

/// `a=$1 and b=$2` as `(column, value)` pairs.
fn conditions(clause: &str, params: &[Value]) -> Vec<(String, Value)> {
    clause
        .split(" and ")
        .filter_map(|cond| cond.split_once('='))
        .map(|(column, token)| (strip_alias(column), param(token, params)))
        .collect()
}

fn matches(record: &Record, conds: &[(String, Value)]) -> bool {
    conds.iter().all(|(column, value)| {
        record
            .get(column)
            .unwrap_or(&Value::Null)
            .id_eq(value)
    })
}

fn table_after<'a>(sql: &'a str, keyword: &str) -> &'a str {
    sql.split(keyword)
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or_default()
}

fn unsupported(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: "statement not understood by the in-memory database".to_string(),
        source: None,
    })
}

impl DbState {
    fn select(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        let columns: Vec<String> = sql
            .trim_start_matches("select ")
            .split(" from ")
            .next()
            .unwrap_or_default()
            .split(", ")
            .map(strip_alias)
            .collect();
        let table = table_after(sql, " from ");
        let conds = sql
            .split(" where ")
            .nth(1)
            .map(|clause| conditions(clause.split(" for ").next().unwrap_or(clause), params))
            .unwrap_or_default();

        self.tables
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches(r, &conds))
                    .map(|r| {
                        Row::new(
                            columns.clone(),
                            columns
                                .iter()
                                .map(|c| r.get(c).cloned().unwrap_or(Value::Null))
                                .collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert(&mut self, sql: &str, params: &[Value], identity: Option<i64>) -> Result<u64, Error> {
        let table = table_after(sql, "insert into ").to_string();
        let columns: Vec<String> = sql
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(cols, _)| cols.split(", ").map(str::to_string).collect())
            .ok_or_else(|| unsupported(sql))?;
        let mut record: Record = columns.iter().cloned().zip(params.iter().cloned()).collect();
        if let Some(id) = identity {
            record.insert("id".to_string(), Value::BigInt(id));
        }

        let records = self.tables.entry(table).or_default();
        if sql.ends_with("on conflict do nothing") {
            let key = &columns[0];
            let taken = records
                .iter()
                .any(|r| r.get(key).is_some_and(|v| v.id_eq(&record[key])));
            if taken {
                return Ok(0);
            }
        }
        records.push(record);
        Ok(1)
    }

    fn update(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let table = table_after(sql, "update ").to_string();
        let (sets, clause) = sql
            .split_once(" set ")
            .and_then(|(_, rest)| rest.split_once(" where "))
            .ok_or_else(|| unsupported(sql))?;
        let assignments: Vec<(String, Value)> = sets
            .split(", ")
            .filter_map(|s| s.split_once('='))
            .map(|(column, token)| (column.to_string(), param(token, params)))
            .collect();
        let conds = conditions(clause, params);

        if let Some(index) = self.interference.iter().position(|(t, _, _)| *t == table) {
            let (_, column, amount) = self.interference.remove(index);
            for record in self.tables.entry(table.clone()).or_default() {
                if let Some(current) = record.get(&column).and_then(Value::as_i64) {
                    record.insert(column.clone(), Value::BigInt(current + amount));
                }
            }
        }

        let mut count = 0;
        for record in self.tables.entry(table).or_default() {
            if matches(record, &conds) {
                for (column, value) in &assignments {
                    record.insert(column.clone(), value.clone());
                }
                count += 1;
            }
        }
        Ok(count)
    }

    fn delete(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let table = table_after(sql, "delete from ").to_string();
        let clause = sql.split(" where ").nth(1).ok_or_else(|| unsupported(sql))?;
        let conds = conditions(clause, params);
        let records = self.tables.entry(table).or_default();
        let before = records.len();
        records.retain(|r| !matches(r, &conds));
        Ok((before - records.len()) as u64)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.writes.push((sql.to_string(), params.to_vec()));
        if sql.starts_with("insert into ") {
            self.insert(sql, params, None)
        } else if sql.starts_with("update ") {
            self.update(sql, params)
        } else if sql.starts_with("delete from ") {
            self.delete(sql, params)
        } else {
            Err(unsupported(sql))
        }
    }
}

fn outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Connection for MemoryDb {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn select(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.selects.push((sql.clone(), params.clone()));
            Outcome::Ok(guard.select(&sql, &params))
        }
    }

    fn update(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move { outcome(state.lock().expect("lock poisoned").execute(&sql, &params)) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.writes.push((sql.clone(), params.clone()));
            guard.next_identity += 1;
            let id = guard.next_identity;
            outcome(guard.insert(&sql, &params, Some(id)).map(|_| id))
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").begins += 1;
            Outcome::Ok(())
        }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").commits += 1;
            Outcome::Ok(())
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").rollbacks += 1;
            Outcome::Ok(())
        }
    }
}
