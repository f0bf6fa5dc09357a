//! SQLite conversation store.
//!
//! One table, `messages`, ordered by an autoincrement `seq` column. Rows are
//! only ever inserted; there are no UPDATE or DELETE statements.

use async_trait::async_trait;
use chrono::Utc;
use parley_core::error::StoreError;
use parley_core::message::{Message, Role};
use parley_core::store::{ConversationStore, ensure_persistable};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a store from a connection string (`"sqlite::memory:"`, `"sqlite://parley.db"`).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite url: {e}")))?;
        // Every connection to an in-memory database sees its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        Self::connect(options, max_connections).await
    }

    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("Failed to create {}: {e}", parent.display())))?;
        }
        let options = SqliteConnectOptions::new().filename(path);
        let store = Self::connect(options, 4).await?;
        info!("SQLite store initialized at {}", path.display());
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        Self::from_pool(pool).await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT UNIQUE NOT NULL,
                thread_id  TEXT NOT NULL,
                org_id     TEXT NOT NULL,
                role       TEXT NOT NULL,
                content    TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(org_id, thread_id, seq)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("thread index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
        let column = |name: &str, e: sqlx::Error| StoreError::QueryFailed(format!("{name} column: {e}"));

        let id: String = row.try_get("id").map_err(|e| column("id", e))?;
        let role: String = row.try_get("role").map_err(|e| column("role", e))?;
        let content: String = row.try_get("content").map_err(|e| column("content", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| column("created_at", e))?;

        let role = Role::from_str(&role).map_err(StoreError::QueryFailed)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::QueryFailed(format!("created_at '{created_at}': {e}")))?;

        Ok(Message {
            id,
            role,
            content,
            created_at,
            tool_calls: Vec::new(),
            tool_call_id: None,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, thread_id: &str, org_id: &str, message: &Message) -> Result<String, StoreError> {
        ensure_persistable(message)?;
        let id = if message.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            message.id.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, org_id, role, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(thread_id)
        .bind(org_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;

        debug!(thread_id, org_id, message_id = %id, "Appended message");
        Ok(id)
    }

    async fn last_message(&self, thread_id: &str, org_id: &str) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE org_id = ?1 AND thread_id = ?2 ORDER BY seq DESC LIMIT 1",
        )
        .bind(org_id)
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("last message: {e}")))?;

        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn history(&self, thread_id: &str, org_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE org_id = ?1 AND thread_id = ?2 ORDER BY seq ASC")
            .bind(org_id)
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("history: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }
}
