// ABOUTME: SQLite analytical store - snapshot slots as tables, query results kept per execution id
// ABOUTME: Queries run on start; later invocations page the stored rows by query id

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{QueryEngine, QueryState, ResultPage};
use crate::record::Record;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_executions (
    id          TEXT PRIMARY KEY,
    sql         TEXT NOT NULL,
    state       TEXT NOT NULL,
    reason      TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS query_results (
    execution_id  TEXT NOT NULL,
    row_no        INTEGER NOT NULL,
    row_json      TEXT NOT NULL,
    PRIMARY KEY (execution_id, row_no)
);
"#;

pub struct SqliteQueryEngine {
    conn: Mutex<Connection>,
}

impl SqliteQueryEngine {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open analytics database {:?}", path))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("Failed to enable WAL mode")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create analytics schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("analytics connection lock poisoned"))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// Run a query and collect the header plus every row as text.
fn execute(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare(sql)?;
    let header: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = header.len();
    let mut out = vec![header];
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(value_text(row.get_ref(idx)?));
        }
        out.push(values);
    }
    Ok(out)
}

#[async_trait]
impl QueryEngine for SqliteQueryEngine {
    async fn start(&self, sql: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.lock()?;
        conn.execute(
            "INSERT INTO query_executions(id, sql, state, created_at) VALUES (?1, ?2, 'running', ?3)",
            params![id, sql, now],
        )?;

        match execute(&conn, sql) {
            Ok(rows) => {
                let tx = conn.transaction()?;
                for (row_no, row) in rows.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO query_results(execution_id, row_no, row_json) VALUES (?1, ?2, ?3)",
                        params![id, row_no as i64, serde_json::to_string(row)?],
                    )?;
                }
                tx.execute(
                    "UPDATE query_executions SET state = 'succeeded' WHERE id = ?1",
                    [&id],
                )?;
                tx.commit()?;
            }
            Err(e) => {
                tracing::error!("Query {} failed: {}", id, e);
                conn.execute(
                    "UPDATE query_executions SET state = 'failed', reason = ?1 WHERE id = ?2",
                    params![e.to_string(), id],
                )?;
            }
        }
        Ok(id)
    }

    async fn status(&self, query_id: &str) -> Result<QueryState> {
        let conn = self.lock()?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT state, reason FROM query_executions WHERE id = ?1",
                [query_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((state, reason)) = row else {
            bail!("Unknown query execution {}", query_id);
        };
        let reason = reason.unwrap_or_default();
        Ok(match state.as_str() {
            "queued" => QueryState::Queued,
            "running" => QueryState::Running,
            "succeeded" => QueryState::Succeeded,
            "cancelled" => QueryState::Cancelled(reason),
            _ => QueryState::Failed(reason),
        })
    }

    async fn page(&self, query_id: &str, token: Option<&str>, size: usize) -> Result<ResultPage> {
        let offset: i64 = match token {
            Some(t) => t
                .parse()
                .with_context(|| format!("Invalid page token '{}'", t))?,
            None => 0,
        };
        if self.status(query_id).await? != QueryState::Succeeded {
            bail!("Query {} has no results", query_id);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT row_no, row_json FROM query_results
             WHERE execution_id = ?1 AND row_no >= ?2
             ORDER BY row_no LIMIT ?3",
        )?;
        let fetched: Vec<(i64, String)> = stmt
            .query_map(params![query_id, offset, (size + 1) as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut page = ResultPage::default();
        for (row_no, json) in fetched {
            if page.rows.len() == size {
                page.next_token = Some(row_no.to_string());
                break;
            }
            page.rows.push(serde_json::from_str(&json)?);
        }
        Ok(page)
    }

    async fn load_table(&self, name: &str, columns: &[String], records: &[Record]) -> Result<()> {
        if columns.is_empty() {
            bail!("Table {} needs at least one column", name);
        }
        let table = quote_ident(name);
        let column_list = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_list});"
        ))?;
        {
            let mut insert =
                tx.prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))?;
            for record in records {
                let values: Vec<&str> = columns.iter().map(|c| record.get(c)).collect();
                insert.execute(rusqlite::params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
