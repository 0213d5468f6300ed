use anyhow::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents a hung query from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: String,
    pub path: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub repository_id: String,
    pub title: String,
    pub llm_session_id: Option<String>,
    /// `active` | `archived` | `error`
    pub status: String,
    pub working_directory: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub sequence_number: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
    pub is_streaming: bool,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("unbound.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Repositories ───────────────────────────────────────────────────────

    pub async fn upsert_repository(&self, path: &str) -> Result<RepositoryRow> {
        if let Some(existing) = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repositories WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO repositories (id, path, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(path)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(RepositoryRow {
            id,
            path: path.to_string(),
            created_at: now,
        })
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        repository_id: &str,
        title: &str,
        working_directory: &str,
    ) -> Result<SessionRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, repository_id, title, status, working_directory, created_at, updated_at)
             VALUES (?, ?, ?, 'idle', ?, ?, ?)",
        )
        .bind(&id)
        .bind(repository_id)
        .bind(title)
        .bind(working_directory)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn set_llm_session_id(&self, id: &str, llm_session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET llm_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(llm_session_id)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_status(&self, id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Archive, not delete: per the data model, a session is destroyed only
    /// by explicit `delete`; `archive` retains its rows.
    pub async fn archive_session(&self, id: &str) -> Result<()> {
        self.update_session_status(id, "archived").await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// On daemon startup, any session without a live child process handle is
    /// no longer `active` in the sense of having an in-flight turn, but its
    /// status (`active`/`archived`/`error`) reflects conversation state, not
    /// process state, so there is nothing to reconcile here beyond logging —
    /// kept as a named hook so future process-affinity state has a home.
    pub async fn recover_stale_sessions(&self) -> Result<u64> {
        Ok(0)
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Insert the next message for a session inside one transaction that also
    /// reads+bumps a per-session sequence counter, so `sequence_number` stays
    /// strictly increasing and gap-free even under concurrent writers.
    pub async fn append_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        is_streaming: bool,
    ) -> Result<MessageRow> {
        let id = Uuid::new_v4().to_string();
        self.append_message_with_id(&id, session_id, role, content, is_streaming)
            .await
    }

    /// Same as [`append_message`](Self::append_message) but with a
    /// caller-supplied id, so a projection that has already minted an id for
    /// a timeline entry (e.g. the session engine) can keep the two in sync.
    pub async fn append_message_with_id(
        &self,
        id: &str,
        session_id: &str,
        role: &str,
        content: &str,
        is_streaming: bool,
    ) -> Result<MessageRow> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), -1) + 1 FROM messages WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO messages (id, session_id, sequence_number, role, content, created_at, is_streaming)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(next_seq)
        .bind(role)
        .bind(content)
        .bind(&now)
        .bind(is_streaming)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.get_message(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("message not found after insert"))
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Flip `is_streaming` off once a turn's message is finalized. Content
    /// is otherwise append-only; this is the one permitted mutation.
    pub async fn finish_streaming(&self, id: &str, final_content: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET content = ?, is_streaming = 0 WHERE id = ?")
            .bind(final_content)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY sequence_number ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_messages_page(
        &self,
        session_id: &str,
        limit: i64,
        before_sequence: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        let rows = if let Some(before) = before_sequence {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE session_id = ? AND sequence_number < ?
                     ORDER BY sequence_number DESC LIMIT ?
                 ) ORDER BY sequence_number ASC",
            )
            .bind(session_id)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM (
                     SELECT * FROM messages WHERE session_id = ?
                     ORDER BY sequence_number DESC LIMIT ?
                 ) ORDER BY sequence_number ASC",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
