use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use super::*;

const THREAD_COLUMNS: &str =
    "t.id, t.contact_id, t.subject, t.message_count, t.last_message_at, t.status, t.score, t.metadata";

impl LeadDb {
    // =========================================================================
    // Threads
    // =========================================================================

    pub fn get_thread(&self, id: i64) -> Result<Option<DbThread>, DbError> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads t WHERE t.id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![id], map_raw_thread_row)
            .optional()?;
        raw.map(RawThreadRow::into_thread).transpose()
    }

    /// All threads ordered by id. Intended for tests and small diagnostics.
    pub fn get_all_threads(&self) -> Result<Vec<DbThread>, DbError> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads t ORDER BY t.id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_raw_thread_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_thread()?);
        }
        Ok(results)
    }

    /// Allocate a new, empty, active thread owned by `contact_id`.
    pub fn create_thread(&self, contact_id: i64, subject: Option<&str>) -> Result<i64, DbError> {
        let now = now_timestamp();
        let id = self.conn.query_row(
            "INSERT INTO threads (
                contact_id, subject, message_count, status, score, metadata, created_at, updated_at
             ) VALUES (?1, ?2, 0, 'active', 0, '{}', ?3, ?3)
             RETURNING id",
            params![contact_id, subject, now],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Re-point a reused thread's owner and subject at its component leader.
    pub fn update_thread_owner(
        &self,
        thread_id: i64,
        contact_id: i64,
        subject: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE threads SET contact_id = ?1, subject = ?2, updated_at = ?3
             WHERE id = ?4 AND (contact_id != ?1 OR subject IS NOT ?2)",
            params![contact_id, subject, now_timestamp(), thread_id],
        )?;
        Ok(())
    }

    /// Delete threads that no message points at. Returns the number deleted.
    pub fn delete_empty_threads(&self) -> Result<usize, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM threads
             WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = threads.id)",
            [],
        )?;
        Ok(rows)
    }

    /// Recompute `message_count` and `last_message_at` from current members.
    pub fn refresh_thread_stats(&self) -> Result<usize, DbError> {
        let rows = self.conn.execute(
            "UPDATE threads SET
                message_count = (SELECT COUNT(*) FROM messages m WHERE m.thread_id = threads.id),
                last_message_at = (SELECT MAX(m.sent_at) FROM messages m WHERE m.thread_id = threads.id),
                updated_at = ?1",
            params![now_timestamp()],
        )?;
        Ok(rows)
    }

    /// Put an ignored thread back to active and drop its ignore marker.
    pub fn reactivate_thread(&self, thread_id: i64) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "UPDATE threads SET status = 'active', metadata = '{}', updated_at = ?1
             WHERE id = ?2 AND status = 'ignored'",
            params![now_timestamp(), thread_id],
        )?;
        Ok(rows > 0)
    }

    /// Next page of thread ids after `after_id`, optionally restricted to a status.
    pub fn thread_ids_page(
        &self,
        after_id: i64,
        limit: usize,
        status: Option<ThreadStatus>,
    ) -> Result<Vec<i64>, DbError> {
        let status = status.map(|s| s.as_str());
        let mut stmt = self.conn.prepare(
            "SELECT id FROM threads
             WHERE id > ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![after_id, status, limit as i64], |row| row.get(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Load threads with their owner's email and all member messages.
    ///
    /// Members are sorted by `(sent_at, id)`. Threads whose owner row is missing
    /// are skipped.
    pub fn load_thread_snapshots(&self, thread_ids: &[i64]) -> Result<Vec<ThreadSnapshot>, DbError> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=thread_ids.len()).map(|i| format!("?{i}")).collect();
        let param_values: Vec<&dyn rusqlite::types::ToSql> =
            thread_ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

        let thread_sql = format!(
            "SELECT {THREAD_COLUMNS}, c.email
             FROM threads t
             JOIN contacts c ON c.id = t.contact_id
             WHERE t.id IN ({})
             ORDER BY t.id",
            placeholders.join(", ")
        );
        let mut stmt = self.conn.prepare(&thread_sql)?;
        let rows = stmt.query_map(param_values.as_slice(), |row| {
            Ok((map_raw_thread_row(row)?, row.get::<_, String>(8)?))
        })?;
        let mut snapshots = Vec::new();
        let mut index: HashMap<i64, usize> = HashMap::new();
        for row in rows {
            let (raw, owner_email) = row?;
            let thread = raw.into_thread()?;
            index.insert(thread.id, snapshots.len());
            snapshots.push(ThreadSnapshot {
                thread,
                owner_email,
                members: Vec::new(),
            });
        }

        let member_sql = format!(
            "SELECT thread_id, id, contact_id, sent_at, body, metadata
             FROM messages
             WHERE thread_id IN ({})
             ORDER BY thread_id, sent_at, id",
            placeholders.join(", ")
        );
        let mut stmt = self.conn.prepare(&member_sql)?;
        let rows = stmt.query_map(param_values.as_slice(), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        for row in rows {
            let (thread_id, message_id, contact_id, sent_at, body, raw_metadata) = row?;
            let metadata = match decode_json::<MessageMetadata>("messages.metadata", raw_metadata) {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("Message {} has unreadable header metadata: {}", message_id, e);
                    MessageMetadata::default()
                }
            };
            if let Some(&pos) = index.get(&thread_id) {
                snapshots[pos].members.push(ThreadMember {
                    message_id,
                    contact_id,
                    sent_at,
                    body,
                    metadata,
                });
            }
        }
        Ok(snapshots)
    }

    /// Mark a thread ignored, zero its score and record which filter fired.
    pub fn mark_thread_ignored(&self, thread_id: i64, filter_name: &str) -> Result<(), DbError> {
        let metadata = ThreadMetadata {
            ignored_by: Some(filter_name.to_string()),
            ..Default::default()
        };
        let metadata = encode_json("threads.metadata", &metadata)?;
        self.conn.execute(
            "UPDATE threads SET status = 'ignored', score = 0, metadata = ?1, updated_at = ?2
             WHERE id = ?3",
            params![metadata, now_timestamp(), thread_id],
        )?;
        Ok(())
    }

    /// Store a thread's score and scoring features. Leaves ignored threads alone.
    pub fn set_thread_score(
        &self,
        thread_id: i64,
        score: f64,
        metadata: &ThreadMetadata,
    ) -> Result<(), DbError> {
        let metadata = encode_json("threads.metadata", metadata)?;
        self.conn.execute(
            "UPDATE threads SET score = ?1, metadata = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'active'",
            params![score, metadata, now_timestamp(), thread_id],
        )?;
        Ok(())
    }
}

/// Thread row before the status/metadata columns are decoded.
struct RawThreadRow {
    id: i64,
    contact_id: i64,
    subject: Option<String>,
    message_count: i64,
    last_message_at: Option<String>,
    status: String,
    score: f64,
    metadata: Option<String>,
}

impl RawThreadRow {
    fn into_thread(self) -> Result<DbThread, DbError> {
        let status = ThreadStatus::from_str(&self.status).unwrap_or_else(|| {
            log::warn!("Thread {} has unknown status '{}', treating as active", self.id, self.status);
            ThreadStatus::Active
        });
        Ok(DbThread {
            id: self.id,
            contact_id: self.contact_id,
            subject: self.subject,
            message_count: self.message_count,
            last_message_at: self.last_message_at,
            status,
            score: self.score,
            metadata: decode_json("threads.metadata", self.metadata)?,
        })
    }
}

fn map_raw_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawThreadRow> {
    Ok(RawThreadRow {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        subject: row.get(2)?,
        message_count: row.get(3)?,
        last_message_at: row.get(4)?,
        status: row.get(5)?,
        score: row.get(6)?,
        metadata: row.get(7)?,
    })
}
