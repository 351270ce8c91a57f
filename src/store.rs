//! Persistent store for classified messages.
//!
//! A thin wrapper around a single `rusqlite` connection. `rusqlite::Connection`
//! is `Send` but not `Sync`, so the connection is kept behind a
//! `parking_lot::Mutex` and every method runs synchronously; async call
//! sites invoke it through `tokio::task::spawn_blocking`.

use crate::model::{MessageRecord, SourceRef};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    folder_id TEXT NOT NULL,
    subject TEXT,
    from_addr TEXT,
    source_ref TEXT NOT NULL,
    predicted_category TEXT,
    confidence REAL,
    is_junk INTEGER NOT NULL DEFAULT 0,
    matched_rule TEXT,
    transferred INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder_id);
CREATE INDEX IF NOT EXISTS idx_messages_category ON messages(predicted_category);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and
    /// apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a message if its id is not already present. Returns
    /// `true` if a new row was inserted, `false` if the message was
    /// already known (idempotent re-ingestion).
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure unrelated to the primary-key
    /// conflict.
    pub fn insert_if_absent(
        &self,
        message_id: &str,
        folder_id: &str,
        subject: &str,
        from_addr: &str,
        source_ref: &SourceRef,
    ) -> crate::Result<bool> {
        let source_ref_json = serde_json::to_string(source_ref)?;
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO messages
                (message_id, folder_id, subject, from_addr, source_ref)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message_id, folder_id, subject, from_addr, source_ref_json],
        )?;
        Ok(rows > 0)
    }

    /// Record the outcome of a rule-engine junk match. No LLM call is
    /// made for these messages.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn mark_junk(&self, message_id: &str, matched_rule: &str) -> crate::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET is_junk = 1, matched_rule = ?2, processed_at = ?3
             WHERE message_id = ?1",
            params![message_id, matched_rule, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a classification outcome.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn update_classification(
        &self,
        message_id: &str,
        predicted_category: &str,
        confidence: f64,
    ) -> crate::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages
             SET predicted_category = ?2, confidence = ?3, processed_at = ?4
             WHERE message_id = ?1",
            params![
                message_id,
                predicted_category,
                confidence,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Mark a message as transferred to its target folder.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn mark_transferred(&self, message_id: &str) -> crate::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET transferred = 1 WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// Mark a batch of messages as transferred in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn bulk_mark_transferred(&self, message_ids: &[String]) -> crate::Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE messages SET transferred = 1 WHERE message_id = ?1")?;
            for message_id in message_ids {
                stmt.execute(params![message_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Clear the transferred flag on every message, so a subsequent
    /// pipeline run re-delivers everything to the target again.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn clear_transferred_markers(&self) -> crate::Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE messages SET transferred = 0", [])?;
        Ok(())
    }

    /// Fetch a single message record.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn get(&self, message_id: &str) -> crate::Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT message_id, folder_id, subject, from_addr, predicted_category,
                    confidence, is_junk, matched_rule, transferred, processed_at
             FROM messages WHERE message_id = ?1",
            params![message_id],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Messages that have neither a predicted category nor a junk
    /// match yet.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn list_unclassified(&self) -> crate::Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, folder_id, subject, from_addr, predicted_category,
                    confidence, is_junk, matched_rule, transferred, processed_at
             FROM messages WHERE predicted_category IS NULL AND is_junk = 0",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Messages currently assigned to `category`.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn list_by_category(&self, category: &str) -> crate::Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, folder_id, subject, from_addr, predicted_category,
                    confidence, is_junk, matched_rule, transferred, processed_at
             FROM messages WHERE predicted_category = ?1",
        )?;
        let rows = stmt.query_map(params![category], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Count of messages per predicted category, highest first.
    ///
    /// # Errors
    ///
    /// Returns an error on a SQL failure.
    pub fn counts_by_category(&self) -> crate::Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT predicted_category, COUNT(*) as n FROM messages
             WHERE predicted_category IS NOT NULL
             GROUP BY predicted_category ORDER BY n DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let processed_at: Option<String> = row.get(9)?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        folder_id: row.get(1)?,
        subject: row.get(2)?,
        from_addr: row.get(3)?,
        predicted_category: row.get(4)?,
        confidence: row.get(5)?,
        is_junk: row.get::<_, i64>(6)? != 0,
        matched_rule: row.get(7)?,
        transferred: row.get::<_, i64>(8)? != 0,
        processed_at: processed_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}
