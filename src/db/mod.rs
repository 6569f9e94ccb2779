//! SQLite store for ingested messages, reconstructed threads and contacts.
//!
//! The database lives at `~/.pastlead/pastlead.db` by default. One `LeadDb`
//! owns one connection and is passed explicitly to every pipeline stage; each
//! stage commits its work in batches through `with_transaction`, which is the
//! visibility boundary for downstream readers.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

pub mod types;
pub use types::*;

mod checkpoints;
mod contacts;
mod messages;
mod threads;

pub struct LeadDb {
    conn: Connection,
}

impl LeadDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::Sqlite(e)));
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        // Set after migrations so table recreation in future migrations can
        // toggle enforcement freely.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Open a database in read-only mode, for `status` while a run is writing.
    pub fn open_readonly_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.pastlead/pastlead.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".pastlead").join("pastlead.db"))
    }

    /// Row counts across the owned tables.
    pub fn counts(&self) -> Result<DbCounts, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(DbCounts {
            contacts: count("SELECT COUNT(*) FROM contacts")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            threads: count("SELECT COUNT(*) FROM threads")?,
            active_threads: count("SELECT COUNT(*) FROM threads WHERE status = 'active'")?,
            ignored_threads: count("SELECT COUNT(*) FROM threads WHERE status = 'ignored'")?,
            ignore_list_entries: count("SELECT COUNT(*) FROM ignore_list")?,
        })
    }
}


fn decode_json<T: serde::de::DeserializeOwned + Default>(
    column: &'static str,
    raw: Option<String>,
) -> Result<T, DbError> {
    match raw {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(&text).map_err(|source| DbError::Json { column, source })
        }
        _ => Ok(T::default()),
    }
}

fn encode_json<T: serde::Serialize>(column: &'static str, value: &T) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|source| DbError::Json { column, source })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use rusqlite::params;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let counts = db.counts().expect("counts");
        assert_eq!(counts.contacts, 0);
        assert_eq!(counts.messages, 0);
        assert_eq!(counts.threads, 0);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("leads.db");
        {
            let db = LeadDb::open_at(path.clone()).expect("first open");
            db.upsert_contact("alice@example.com", Some("Alice")).unwrap();
        }
        let db = LeadDb::open_at(path).expect("second open");
        assert_eq!(db.counts().unwrap().contacts, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.upsert_contact("alice@example.com", None)?;
            Err(DbError::Migration("forced".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.counts().unwrap().contacts, 0, "insert should be rolled back");
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let db = test_db();
        let id: i64 = db
            .with_transaction(|tx| tx.upsert_contact("bob@example.com", None))
            .expect("commit");
        let email: String = db
            .conn_ref()
            .query_row("SELECT email FROM contacts WHERE id = ?1", params![id], |row| row.get(0))
            .unwrap();
        assert_eq!(email, "bob@example.com");
    }

    #[test]
    fn test_decode_json_defaults_on_empty() {
        let meta: MessageMetadata = decode_json("messages.metadata", None).unwrap();
        assert_eq!(meta, MessageMetadata::default());
        let err = decode_json::<MessageMetadata>("messages.metadata", Some("{".to_string()));
        assert!(matches!(err, Err(DbError::Json { .. })));
    }
}
