//! Durable record of which logbook entries have been published.
//!
//! Rows are keyed by `(section_id, entry_id)` and are only ever inserted. The
//! highest recorded entry id of a section is its fetch marker, so a restarted
//! process resumes exactly where the ledger says it stopped.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::{ChatMessageId, EntryId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("entry {entry} of section {section} is already recorded")]
    DuplicateRecord { section: String, entry: EntryId },

    #[error("ledger unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("invalid ledger table name {0:?}")]
    InvalidTable(String),
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::DuplicateRecord { .. } => "DuplicateRecord",
            LedgerError::Unavailable(_) => "LedgerUnavailable",
            LedgerError::InvalidTable(_) => "InvalidTable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub section_id: String,
    pub entry_id: EntryId,
    pub chat_message_id: ChatMessageId,
    pub published_at: DateTime<Utc>,
}

/// Each method is a single transaction against the backing store.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn has_published(&self, section: &str, entry: EntryId) -> Result<bool, LedgerError>;

    /// Fails with [`LedgerError::DuplicateRecord`] if the entry is already
    /// recorded; the existing row is left untouched.
    async fn record_published(
        &self,
        section: &str,
        entry: EntryId,
        chat_message_id: ChatMessageId,
    ) -> Result<(), LedgerError>;

    async fn lookup_chat_message_id(
        &self,
        section: &str,
        entry: EntryId,
    ) -> Result<Option<ChatMessageId>, LedgerError>;

    async fn max_marker(&self, section: &str) -> Result<Option<EntryId>, LedgerError>;
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<(), LedgerError> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidTable(table.to_string()))
    }
}

/// Opens the shared connection pool, creating the database file if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool, LedgerError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    info!("Connected to ledger database");
    Ok(pool)
}

/// SQLite-backed ledger bound to one table. Several sections may share a
/// table; their rows never collide because the key includes the section.
#[derive(Clone)]
pub struct SqlLedger {
    pool: SqlitePool,
    table: String,
}

impl SqlLedger {
    pub async fn open(pool: SqlitePool, table: &str) -> Result<Self, LedgerError> {
        validate_table_name(table)?;

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                section_id TEXT NOT NULL,
                entry_id INTEGER NOT NULL,
                chat_message_id INTEGER NOT NULL,
                published_at TEXT NOT NULL,
                PRIMARY KEY (section_id, entry_id)
            )
            "#
        );
        sqlx::query(&ddl).execute(&pool).await?;
        debug!("Ledger table {} ready", table);

        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Audit trail of a section, oldest entry first.
    pub async fn published_records(&self, section: &str) -> Result<Vec<PublishedRecord>, LedgerError> {
        let sql = format!(
            r#"
            SELECT section_id, entry_id, chat_message_id, published_at
            FROM "{}"
            WHERE section_id = ?1
            ORDER BY entry_id
            "#,
            self.table
        );
        let rows = sqlx::query(&sql).bind(section).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                Ok(PublishedRecord {
                    section_id: row.try_get("section_id")?,
                    entry_id: row.try_get::<i64, _>("entry_id")? as EntryId,
                    chat_message_id: ChatMessageId(row.try_get::<i64, _>("chat_message_id")? as u64),
                    published_at: row.try_get("published_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Ledger for SqlLedger {
    async fn has_published(&self, section: &str, entry: EntryId) -> Result<bool, LedgerError> {
        let sql = format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE section_id = ?1 AND entry_id = ?2"#,
            self.table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(section)
            .bind(entry as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn record_published(
        &self,
        section: &str,
        entry: EntryId,
        chat_message_id: ChatMessageId,
    ) -> Result<(), LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO "{}" (section_id, entry_id, chat_message_id, published_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(section)
            .bind(entry as i64)
            .bind(chat_message_id.0 as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(LedgerError::DuplicateRecord {
                section: section.to_string(),
                entry,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_chat_message_id(
        &self,
        section: &str,
        entry: EntryId,
    ) -> Result<Option<ChatMessageId>, LedgerError> {
        let sql = format!(
            r#"SELECT chat_message_id FROM "{}" WHERE section_id = ?1 AND entry_id = ?2"#,
            self.table
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(section)
            .bind(entry as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(|id| ChatMessageId(id as u64)))
    }

    async fn max_marker(&self, section: &str) -> Result<Option<EntryId>, LedgerError> {
        let sql = format!(
            r#"SELECT MAX(entry_id) FROM "{}" WHERE section_id = ?1"#,
            self.table
        );
        let marker: Option<i64> = sqlx::query_scalar(&sql)
            .bind(section)
            .fetch_one(&self.pool)
            .await?;
        Ok(marker.map(|m| m as EntryId))
    }
}

/// Process-local ledger used for dry runs. Forgets everything on exit.
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<BTreeMap<(String, EntryId), PublishedRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_records(&self, section: &str) -> Vec<PublishedRecord> {
        let rows = self.rows.read().await;
        rows.values()
            .filter(|record| record.section_id == section)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn has_published(&self, section: &str, entry: EntryId) -> Result<bool, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows.contains_key(&(section.to_string(), entry)))
    }

    async fn record_published(
        &self,
        section: &str,
        entry: EntryId,
        chat_message_id: ChatMessageId,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        let key = (section.to_string(), entry);
        if rows.contains_key(&key) {
            return Err(LedgerError::DuplicateRecord {
                section: section.to_string(),
                entry,
            });
        }
        rows.insert(
            key,
            PublishedRecord {
                section_id: section.to_string(),
                entry_id: entry,
                chat_message_id,
                published_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn lookup_chat_message_id(
        &self,
        section: &str,
        entry: EntryId,
    ) -> Result<Option<ChatMessageId>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(section.to_string(), entry))
            .map(|record| record.chat_message_id))
    }

    async fn max_marker(&self, section: &str) -> Result<Option<EntryId>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .keys()
            .filter(|(s, _)| s == section)
            .map(|(_, entry)| *entry)
            .max())
    }
}
