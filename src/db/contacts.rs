use rusqlite::{params, OptionalExtension};

use super::*;

/// Per-contact rollup of active threads: `(contact_id, max score, max last_message_at)`.
pub type ContactRollup = (i64, f64, Option<String>);

impl LeadDb {
    // =========================================================================
    // Contacts
    // =========================================================================

    /// Insert or update a contact keyed by lower-cased email. Returns the contact id.
    ///
    /// An existing display name is only replaced when a non-empty one is supplied.
    pub fn upsert_contact(&self, email: &str, name: Option<&str>) -> Result<i64, DbError> {
        let now = now_timestamp();
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let id = self.conn.query_row(
            "INSERT INTO contacts (email, name, closeness_score, created_at, updated_at)
             VALUES (LOWER(TRIM(?1)), ?2, 0, ?3, ?3)
             ON CONFLICT(email) DO UPDATE SET
                name = COALESCE(excluded.name, contacts.name),
                updated_at = excluded.updated_at
             RETURNING id",
            params![email, name, now],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<DbContact>, DbError> {
        let contact = self
            .conn
            .query_row(
                "SELECT id, email, name, closeness_score, last_contacted_at
                 FROM contacts WHERE id = ?1",
                params![id],
                map_contact_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Contacts ordered by closeness, highest first. Used by `status` and tests.
    pub fn get_top_contacts(&self, limit: usize) -> Result<Vec<DbContact>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, name, closeness_score, last_contacted_at
             FROM contacts
             ORDER BY closeness_score DESC, id
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_contact_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Zero every contact's closeness and clear `last_contacted_at`.
    pub fn reset_closeness(&self) -> Result<usize, DbError> {
        let rows = self.conn.execute(
            "UPDATE contacts SET closeness_score = 0, last_contacted_at = NULL, updated_at = ?1",
            params![now_timestamp()],
        )?;
        Ok(rows)
    }

    /// MAX score and MAX last_message_at over each contact's active threads.
    pub fn active_thread_rollup(&self) -> Result<Vec<ContactRollup>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id, MAX(score), MAX(last_message_at)
             FROM threads
             WHERE status = 'active'
             GROUP BY contact_id
             ORDER BY contact_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn set_closeness(
        &self,
        contact_id: i64,
        score: f64,
        last_contacted_at: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE contacts
             SET closeness_score = ?1, last_contacted_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![score, last_contacted_at, now_timestamp(), contact_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Ignore list (read-mostly; curated outside the pipeline)
    // =========================================================================

    pub fn get_ignore_list(&self) -> Result<Vec<IgnoreEntry>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, value, kind FROM ignore_list ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (id, value, kind) = row?;
            match IgnoreKind::from_str(&kind) {
                Some(kind) => results.push(IgnoreEntry { id, value, kind }),
                None => log::warn!("Ignoring ignore_list row {} with unknown kind '{}'", id, kind),
            }
        }
        Ok(results)
    }

    /// Add an ignore-list entry. Returns false if the value was already listed.
    pub fn add_ignore_entry(&self, value: &str, kind: IgnoreKind) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO ignore_list (value, kind, created_at) VALUES (LOWER(TRIM(?1)), ?2, ?3)",
            params![value, kind.as_str(), now_timestamp()],
        )?;
        Ok(inserted > 0)
    }
}

fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbContact> {
    Ok(DbContact {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        closeness_score: row.get(3)?,
        last_contacted_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_upsert_contact_is_case_insensitive() {
        let db = test_db();
        let first = db.upsert_contact("Alice@Example.com", Some("Alice")).unwrap();
        let second = db.upsert_contact("alice@example.com ", None).unwrap();
        assert_eq!(first, second);

        let contact = db.get_contact(first).unwrap().expect("contact");
        assert_eq!(contact.email, "alice@example.com");
        assert_eq!(contact.name.as_deref(), Some("Alice"), "empty name keeps existing");
        assert_eq!(contact.closeness_score, 0.0);
    }

    #[test]
    fn test_ignore_list_dedupes() {
        let db = test_db();
        assert!(db.add_ignore_entry("Spam.example", IgnoreKind::Domain).unwrap());
        assert!(!db.add_ignore_entry("spam.example", IgnoreKind::Domain).unwrap());
        let entries = db.get_ignore_list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "spam.example");
        assert_eq!(entries[0].kind, IgnoreKind::Domain);
    }
}
