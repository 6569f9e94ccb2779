use rusqlite::{params, OptionalExtension};

use super::*;

impl LeadDb {
    // =========================================================================
    // Messages
    // =========================================================================

    /// Store a newly ingested message together with its provisional singleton thread.
    ///
    /// Returns `Ok(None)` without writing anything when the identifier is already
    /// stored, so re-ingesting a source is a no-op rather than an error.
    pub fn insert_message_with_thread(
        &self,
        contact_id: i64,
        message: &NewMessage,
    ) -> Result<Option<i64>, DbError> {
        if let Some(identifier) = message.message_identifier.as_deref() {
            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM messages WHERE message_identifier = ?1",
                    params![identifier],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }
        }

        let now = now_timestamp();
        let thread_id: i64 = self.conn.query_row(
            "INSERT INTO threads (
                contact_id, subject, message_count, last_message_at, status, score,
                metadata, created_at, updated_at
             ) VALUES (?1, ?2, 1, ?3, 'active', 0, '{}', ?4, ?4)
             RETURNING id",
            params![contact_id, message.subject, message.sent_at, now],
            |row| row.get(0),
        )?;

        let metadata = encode_json("messages.metadata", &message.metadata)?;
        let message_id: i64 = self.conn.query_row(
            "INSERT INTO messages (
                thread_id, contact_id, message_identifier, sent_at, subject, body,
                metadata, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING id",
            params![
                thread_id,
                contact_id,
                message.message_identifier,
                message.sent_at,
                message.subject,
                message.body,
                metadata,
                now,
            ],
            |row| row.get(0),
        )?;
        Ok(Some(message_id))
    }

    /// Load every message's threading data, ordered by id.
    ///
    /// Returns the rows plus the number of rows whose header metadata could not
    /// be decoded; those rows are kept with no references (isolated nodes).
    pub fn load_graph_rows(&self) -> Result<(Vec<GraphMessageRow>, usize), DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, thread_id, contact_id, message_identifier, sent_at, subject, metadata
             FROM messages
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                GraphMessageRow {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    contact_id: row.get(2)?,
                    message_identifier: row.get(3)?,
                    sent_at: row.get(4)?,
                    subject: row.get(5)?,
                    in_reply_to: None,
                    references: Vec::new(),
                },
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut results = Vec::new();
        let mut malformed = 0usize;
        for row in rows {
            let (mut message, raw_metadata) = row?;
            match decode_json::<MessageMetadata>("messages.metadata", raw_metadata) {
                Ok(meta) => {
                    message.in_reply_to = meta.in_reply_to;
                    message.references = meta.references;
                }
                Err(e) => {
                    log::warn!("Message {} has unreadable header metadata: {}", message.id, e);
                    malformed += 1;
                }
            }
            results.push(message);
        }
        Ok((results, malformed))
    }

    /// Point a message at a different thread.
    pub fn assign_message_thread(&self, message_id: i64, thread_id: i64) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE messages SET thread_id = ?1 WHERE id = ?2",
            params![thread_id, message_id],
        )?;
        Ok(())
    }

    /// Fill in a missing subject. Matches the identifier with or without angle
    /// brackets and never overwrites a subject that is already present.
    pub fn backfill_subject(&self, normalized_identifier: &str, subject: &str) -> Result<bool, DbError> {
        let bracketed = format!("<{}>", normalized_identifier);
        let rows = self.conn.execute(
            "UPDATE messages SET subject = ?1
             WHERE subject IS NULL AND message_identifier IN (?2, ?3)",
            params![subject, normalized_identifier, bracketed],
        )?;
        Ok(rows > 0)
    }

    /// The thread a message currently belongs to.
    pub fn get_message_thread_id(&self, message_id: i64) -> Result<Option<i64>, DbError> {
        let thread_id = self
            .conn
            .query_row(
                "SELECT thread_id FROM messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{seed_contact, test_db};
    use super::*;

    fn new_message(identifier: Option<&str>, subject: Option<&str>) -> NewMessage {
        NewMessage {
            message_identifier: identifier.map(str::to_string),
            sent_at: "2024-09-01T08:00:00Z".to_string(),
            subject: subject.map(str::to_string),
            body: None,
            metadata: MessageMetadata {
                in_reply_to: Some("<root@example.com>".to_string()),
                references: vec!["<root@example.com>".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_insert_creates_provisional_thread() {
        let db = test_db();
        let contact = seed_contact(&db, "alice@example.com");
        let id = db
            .insert_message_with_thread(contact, &new_message(Some("<a@example.com>"), Some("Hello")))
            .unwrap()
            .expect("new message");

        let thread_id = db.get_message_thread_id(id).unwrap().expect("thread");
        let thread = db.get_thread(thread_id).unwrap().expect("thread row");
        assert_eq!(thread.message_count, 1);
        assert_eq!(thread.contact_id, contact);
        assert_eq!(thread.subject.as_deref(), Some("Hello"));
        assert_eq!(thread.last_message_at.as_deref(), Some("2024-09-01T08:00:00Z"));
    }

    #[test]
    fn test_duplicate_identifier_is_noop() {
        let db = test_db();
        let contact = seed_contact(&db, "alice@example.com");
        let msg = new_message(Some("<a@example.com>"), None);
        assert!(db.insert_message_with_thread(contact, &msg).unwrap().is_some());
        assert!(db.insert_message_with_thread(contact, &msg).unwrap().is_none());

        let counts = db.counts().unwrap();
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.threads, 1, "no orphan thread for the duplicate");
    }

    #[test]
    fn test_absent_identifiers_do_not_collide() {
        let db = test_db();
        let contact = seed_contact(&db, "alice@example.com");
        assert!(db.insert_message_with_thread(contact, &new_message(None, None)).unwrap().is_some());
        assert!(db.insert_message_with_thread(contact, &new_message(None, None)).unwrap().is_some());
        assert_eq!(db.counts().unwrap().messages, 2);
    }

    #[test]
    fn test_load_graph_rows_decodes_references() {
        let db = test_db();
        let contact = seed_contact(&db, "alice@example.com");
        db.insert_message_with_thread(contact, &new_message(Some("<a@example.com>"), Some("Hi")))
            .unwrap();
        db.conn_ref()
            .execute(
                "INSERT INTO messages (thread_id, contact_id, message_identifier, sent_at, metadata, created_at)
                 SELECT thread_id, contact_id, 'broken', sent_at, '{not json', created_at FROM messages LIMIT 1",
                [],
            )
            .unwrap();

        let (rows, malformed) = db.load_graph_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(malformed, 1);
        assert_eq!(rows[0].references, vec!["<root@example.com>".to_string()]);
        assert!(rows[1].references.is_empty());
    }

    #[test]
    fn test_backfill_subject_only_fills_missing() {
        let db = test_db();
        let contact = seed_contact(&db, "alice@example.com");
        let missing = db
            .insert_message_with_thread(contact, &new_message(Some("<a@example.com>"), None))
            .unwrap()
            .unwrap();
        db.insert_message_with_thread(contact, &new_message(Some("b@example.com"), Some("Kept")))
            .unwrap();

        assert!(db.backfill_subject("a@example.com", "Recovered").unwrap());
        assert!(!db.backfill_subject("b@example.com", "Overwritten").unwrap());

        let subject: Option<String> = db
            .conn_ref()
            .query_row("SELECT subject FROM messages WHERE id = ?1", params![missing], |row| row.get(0))
            .unwrap();
        assert_eq!(subject.as_deref(), Some("Recovered"));
    }
}
