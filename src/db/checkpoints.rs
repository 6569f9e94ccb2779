use rusqlite::{params, OptionalExtension};

use super::*;

impl LeadDb {
    // =========================================================================
    // Ingest checkpoints
    // =========================================================================

    pub fn get_checkpoint(&self, source_key: &str) -> Result<Option<IngestCheckpoint>, DbError> {
        let checkpoint = self
            .conn
            .query_row(
                "SELECT source_key, processed_count, last_message_identifier, skipped_count
                 FROM ingest_checkpoints WHERE source_key = ?1",
                params![source_key],
                map_checkpoint_row,
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self) -> Result<Vec<IngestCheckpoint>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT source_key, processed_count, last_message_identifier, skipped_count
             FROM ingest_checkpoints ORDER BY source_key",
        )?;
        let rows = stmt.query_map([], map_checkpoint_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Write the checkpoint. Call inside the same transaction as the batch it covers.
    pub fn save_checkpoint(&self, checkpoint: &IngestCheckpoint) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO ingest_checkpoints (
                source_key, processed_count, last_message_identifier, skipped_count, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_key) DO UPDATE SET
                processed_count = excluded.processed_count,
                last_message_identifier = COALESCE(
                    excluded.last_message_identifier,
                    ingest_checkpoints.last_message_identifier
                ),
                skipped_count = excluded.skipped_count,
                updated_at = excluded.updated_at",
            params![
                checkpoint.source_key,
                checkpoint.processed_count as i64,
                checkpoint.last_message_identifier,
                checkpoint.skipped_count as i64,
                now_timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Remove a checkpoint so the source is read from the start. Returns whether one existed.
    pub fn delete_checkpoint(&self, source_key: &str) -> Result<bool, DbError> {
        let rows = self.conn.execute(
            "DELETE FROM ingest_checkpoints WHERE source_key = ?1",
            params![source_key],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Pipeline runs
    // =========================================================================

    pub fn start_pipeline_run(&self) -> Result<i64, DbError> {
        let id = self.conn.query_row(
            "INSERT INTO pipeline_runs (started_at, status) VALUES (?1, 'running') RETURNING id",
            params![now_timestamp()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_pipeline_run(
        &self,
        run_id: i64,
        succeeded: bool,
        report_json: Option<&str>,
    ) -> Result<(), DbError> {
        let status = if succeeded { "succeeded" } else { "failed" };
        self.conn.execute(
            "UPDATE pipeline_runs SET finished_at = ?1, status = ?2, report_json = ?3 WHERE id = ?4",
            params![now_timestamp(), status, report_json, run_id],
        )?;
        Ok(())
    }

    pub fn get_last_pipeline_run(&self) -> Result<Option<DbPipelineRun>, DbError> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, status, report_json
                 FROM pipeline_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(DbPipelineRun {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        status: row.get(3)?,
                        report_json: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }
}

fn map_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestCheckpoint> {
    Ok(IngestCheckpoint {
        source_key: row.get(0)?,
        processed_count: row.get::<_, i64>(1)?.max(0) as u64,
        last_message_identifier: row.get(2)?,
        skipped_count: row.get::<_, i64>(3)?.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_checkpoint_upsert_keeps_last_identifier() {
        let db = test_db();
        let mut checkpoint = IngestCheckpoint {
            source_key: "/data/archive.ndjson".to_string(),
            processed_count: 1000,
            last_message_identifier: Some("<1000@x>".to_string()),
            skipped_count: 3,
        };
        db.save_checkpoint(&checkpoint).unwrap();

        // A batch of records without identifiers must not erase the last good one.
        checkpoint.processed_count = 1500;
        checkpoint.last_message_identifier = None;
        db.save_checkpoint(&checkpoint).unwrap();

        let stored = db.get_checkpoint("/data/archive.ndjson").unwrap().unwrap();
        assert_eq!(stored.processed_count, 1500);
        assert_eq!(stored.last_message_identifier.as_deref(), Some("<1000@x>"));
        assert_eq!(stored.skipped_count, 3);

        assert!(db.delete_checkpoint("/data/archive.ndjson").unwrap());
        assert!(!db.delete_checkpoint("/data/archive.ndjson").unwrap());
        assert!(db.list_checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_pipeline_run_lifecycle() {
        let db = test_db();
        assert!(db.get_last_pipeline_run().unwrap().is_none());

        let run_id = db.start_pipeline_run().unwrap();
        let running = db.get_last_pipeline_run().unwrap().unwrap();
        assert_eq!(running.status, "running");
        assert!(running.finished_at.is_none());

        db.finish_pipeline_run(run_id, true, Some("{\"threadsScored\":3}")).unwrap();
        let finished = db.get_last_pipeline_run().unwrap().unwrap();
        assert_eq!(finished.id, run_id);
        assert_eq!(finished.status, "succeeded");
        assert!(finished.finished_at.is_some());
    }
}
