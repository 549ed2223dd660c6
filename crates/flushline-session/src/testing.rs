//! In-memory connection used by the unit tests.

use flushline_core::{
    Connection, Cx, Dialect, Error, Outcome, QueryError, QueryErrorKind, Row, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// Row-count statements and identity inserts, in order.
    pub executed: Vec<(String, Vec<Value>)>,
    pub queries: Vec<(String, Vec<Value>)>,
    /// Rows returned by selects, per table.
    pub rows: HashMap<String, Vec<Row>>,
    /// Row counts for statements starting with a prefix; 1 otherwise.
    pub update_counts: Vec<(String, u64)>,
    pub fail_on: Option<String>,
    pub next_identity: i64,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    pub state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub(crate) fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub(crate) fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|(sql, _)| sql).collect()
    }

    pub(crate) fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").queries.clone()
    }

    pub(crate) fn set_update_count(&self, prefix: &str, count: u64) {
        self.state
            .lock()
            .expect("lock poisoned")
            .update_counts
            .push((prefix.to_string(), count));
    }

    pub(crate) fn add_row(&self, table: &str, columns: &[&str], values: Vec<Value>) {
        let row = Row::new(columns.iter().map(|c| (*c).to_string()).collect::<Vec<_>>(), values);
        self.state
            .lock()
            .expect("lock poisoned")
            .rows
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub(crate) fn fail_on(&self, prefix: &str) {
        self.state.lock().expect("lock poisoned").fail_on = Some(prefix.to_string());
    }

    pub(crate) fn clear_failure(&self) {
        self.state.lock().expect("lock poisoned").fail_on = None;
    }

    pub(crate) fn transactions(&self) -> (usize, usize, usize) {
        let guard = self.state.lock().expect("lock poisoned");
        (guard.begins, guard.commits, guard.rollbacks)
    }
}

/// Table and filter column of `select ... from <table> [alias] where <column>=...`.
fn parse_select(sql: &str) -> (String, Option<String>) {
    let after_from = sql.split(" from ").nth(1).unwrap_or_default();
    let table = after_from
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    let column = sql.split(" where ").nth(1).map(|clause| {
        let column = clause.split('=').next().unwrap_or_default().trim();
        column.rsplit('.').next().unwrap_or(column).to_string()
    });
    (table, column)
}

fn query_failure(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: Some(sql.to_string()),
        sqlstate: Some("23505".to_string()),
        message: "mock failure".to_string(),
        source: None,
    })
}

impl Connection for MockConnection {
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
            guard.queries.push((sql.clone(), params.clone()));
            if guard.fail_on.as_deref().is_some_and(|p| sql.starts_with(p)) {
                return Outcome::Err(query_failure(&sql));
            }
            let (table, column) = parse_select(&sql);
            let rows = guard.rows.get(&table).cloned().unwrap_or_default();
            let rows = match (column, params.first()) {
                (Some(column), Some(key)) => rows
                    .into_iter()
                    .filter(|row| row.get_by_name(&column).is_some_and(|v| v.id_eq(key)))
                    .collect(),
                _ => rows,
            };
            Outcome::Ok(rows)
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
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.executed.push((sql.clone(), params));
            if guard.fail_on.as_deref().is_some_and(|p| sql.starts_with(p)) {
                return Outcome::Err(query_failure(&sql));
            }
            let count = guard
                .update_counts
                .iter()
                .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
                .map_or(1, |(_, n)| *n);
            Outcome::Ok(count)
        }
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
            guard.executed.push((sql.clone(), params));
            if guard.fail_on.as_deref().is_some_and(|p| sql.starts_with(p)) {
                return Outcome::Err(query_failure(&sql));
            }
            guard.next_identity += 1;
            Outcome::Ok(guard.next_identity)
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
