//! Session directory: the persisted link between a student's sandbox and its port.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::BTreeSet;
use tracing::info;

use crate::error::StoreError;

/// One row of the session directory together with its live terminal connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub session_id: String,
    pub sandbox_name: String,
    pub port: u16,
    pub created_at: String,
    pub active_connections: BTreeSet<String>,
    pub active_module: Option<String>,
    pub module_assigned_at: Option<String>,
}

/// Students per time slot, for the teacher dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub created_at: String,
    pub student_count: i64,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    session_id: String,
    sandbox_name: String,
    port: i64,
    created_at: String,
    active_module: Option<String>,
    module_assigned_at: Option<String>,
}

/// Connections kept for a database file. WAL lets readers proceed alongside the writer.
const FILE_POOL_SIZE: u32 = 4;

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub fn create_timestamp() -> String {
    timestamp(Utc::now())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if needed) the session database and its schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = if is_in_memory(url) {
            // An in-memory database lives exactly as long as its single connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(FILE_POOL_SIZE)
        };
        let pool = options.connect(url).await?;

        for pragma_sql in &[
            "PRAGMA foreign_keys = ON;",
            "PRAGMA busy_timeout = 2000;",
            "PRAGMA journal_mode = WAL;",
            "PRAGMA synchronous = NORMAL;",
        ] {
            sqlx::query(pragma_sql).execute(&pool).await?;
        }

        let mut tx = pool.begin().await?;
        for sql in &[
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id             TEXT     NOT NULL,
                session_id          TEXT     NOT NULL,
                sandbox_name        TEXT     NOT NULL,
                port                INTEGER  NOT NULL,
                created_at          TEXT     NOT NULL,
                active_module       TEXT,
                module_assigned_at  TEXT,
                PRIMARY KEY (user_id, session_id)
            );",
            r"
            CREATE TABLE IF NOT EXISTS session_connections (
                user_id        TEXT  NOT NULL,
                session_id     TEXT  NOT NULL,
                connection_id  TEXT  NOT NULL,
                PRIMARY KEY (user_id, session_id, connection_id),
                FOREIGN KEY (user_id, session_id) REFERENCES sessions (user_id, session_id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);",
        ] {
            sqlx::query(sql).execute(tx.as_mut()).await?;
        }
        tx.commit().await?;

        info!(url, "Session database ready");
        Ok(Self { pool })
    }

    /// Record the sandbox serving `(user_id, session_id)`, keeping the original creation time.
    pub async fn upsert(
        &self,
        user_id: &str,
        session_id: &str,
        sandbox_name: &str,
        port: u16,
    ) -> Result<SessionRecord, StoreError> {
        sqlx::query(
            r"
            INSERT INTO sessions (user_id, session_id, sandbox_name, port, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, session_id)
            DO UPDATE SET sandbox_name = excluded.sandbox_name, port = excluded.port
            ",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(sandbox_name)
        .bind(i64::from(port))
        .bind(create_timestamp())
        .execute(&self.pool)
        .await?;

        let record = self.get(user_id, session_id).await?;
        record.ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    pub async fn get(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT user_id, session_id, sandbox_name, port, created_at, active_module, module_assigned_at
            FROM sessions WHERE user_id = ? AND session_id = ?
            ",
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.with_connections(row).await?)),
            None => Ok(None),
        }
    }

    /// The most recently created session of a user, whatever its time slot.
    pub async fn latest_for_user(&self, user_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT user_id, session_id, sandbox_name, port, created_at, active_module, module_assigned_at
            FROM sessions WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.with_connections(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn add_connection(
        &self,
        user_id: &str,
        session_id: &str,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO session_connections (user_id, session_id, connection_id)
            VALUES (?, ?, ?)
            ",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_connection(
        &self,
        user_id: &str,
        session_id: &str,
        connection_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            DELETE FROM session_connections
            WHERE user_id = ? AND session_id = ? AND connection_id = ?
            ",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Time slots with sessions created since `since`, newest first.
    pub async fn active_sessions(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActiveSession>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r"
            SELECT session_id, MIN(created_at) AS first_created, COUNT(*) AS students
            FROM sessions WHERE created_at >= ?
            GROUP BY session_id
            ORDER BY first_created DESC
            ",
        )
        .bind(timestamp(since))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(session_id, created_at, student_count)| ActiveSession {
                session_id,
                created_at,
                student_count,
            })
            .collect())
    }

    /// Mark every session of a time slot with a module; returns the number of sessions touched.
    pub async fn assign_module(&self, session_id: &str, module_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE sessions SET active_module = ?, module_assigned_at = ?
            WHERE session_id = ?
            ",
        )
        .bind(module_id)
        .bind(create_timestamp())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn with_connections(&self, row: SessionRow) -> Result<SessionRecord, StoreError> {
        let connections = sqlx::query_as::<_, (String,)>(
            r"
            SELECT connection_id FROM session_connections
            WHERE user_id = ? AND session_id = ?
            ",
        )
        .bind(&row.user_id)
        .bind(&row.session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(SessionRecord {
            user_id: row.user_id,
            session_id: row.session_id,
            sandbox_name: row.sandbox_name,
            port: u16::try_from(row.port).unwrap_or_default(),
            created_at: row.created_at,
            active_connections: connections.into_iter().map(|(id,)| id).collect(),
            active_module: row.active_module,
            module_assigned_at: row.module_assigned_at,
        })
    }
}
