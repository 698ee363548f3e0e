//! SQLite backend implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::repository::{check_dimension, RepoResult, Repository};
use super::schema::SCHEMA;
use super::{
    bytes_to_embedding, embedding_to_bytes, from_db_timestamp, to_db_timestamp, Event,
    EventCounts, FaceRow, NewBib, PhotoCommit, RegistryEntry, RepoError, UpdateItem,
};
use crate::extract::{BibRead, FaceRead};
use crate::scanner::diff::DiffPlan;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDb {
    pub(crate) conn: Connection,
    embedding_dim: usize,
}

impl SqliteDb {
    pub fn open(path: &Path, embedding_dim: usize) -> RepoResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RepoError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, embedding_dim)
    }

    pub fn open_in_memory(embedding_dim: usize) -> RepoResult<Self> {
        Self::configure(Connection::open_in_memory()?, embedding_dim)
    }

    fn configure(conn: Connection, embedding_dim: usize) -> RepoResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, embedding_dim })
    }
}

// ============================================================================
// Statement helpers shared by plain calls and transactions
// ============================================================================

fn upsert_photo(conn: &Connection, event_id: i64, path: &str, timestamp: &DateTime<Utc>) -> RepoResult<i64> {
    let id = conn.query_row(
        r#"
        INSERT INTO photo (event_id, path, last_updated)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (event_id, path) DO UPDATE SET last_updated = excluded.last_updated
        RETURNING id
        "#,
        params![event_id, path, to_db_timestamp(timestamp)],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn touch_photo(conn: &Connection, photo_id: i64, timestamp: &DateTime<Utc>) -> RepoResult<()> {
    let updated = conn.execute(
        "UPDATE photo SET last_updated = ?1 WHERE id = ?2",
        params![to_db_timestamp(timestamp), photo_id],
    )?;
    if updated == 0 {
        return Err(RepoError::NotFound(format!("photo {}", photo_id)));
    }
    Ok(())
}

fn clear_detections(conn: &Connection, photo_id: i64) -> RepoResult<()> {
    conn.execute("DELETE FROM bib_photo WHERE photo_id = ?1", [photo_id])?;
    conn.execute("DELETE FROM face_photo WHERE photo_id = ?1", [photo_id])?;
    Ok(())
}

fn delete_photo(conn: &Connection, photo_id: i64) -> RepoResult<()> {
    clear_detections(conn, photo_id)?;
    conn.execute("DELETE FROM photo WHERE id = ?1", [photo_id])?;
    Ok(())
}

fn insert_bib_detection(conn: &Connection, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO bib_photo (event_id, bib_number, photo_id, confidence) VALUES (?1, ?2, ?3, ?4)",
        params![event_id, bib.text, photo_id, bib.confidence as f64],
    )?;
    Ok(())
}

fn insert_face_detection(
    conn: &Connection,
    embedding_dim: usize,
    event_id: i64,
    photo_id: i64,
    face: &FaceRead,
) -> RepoResult<()> {
    check_dimension(embedding_dim, &face.embedding)?;
    conn.execute(
        r#"
        INSERT INTO face_photo (event_id, photo_id, embedding, embedding_dim, confidence)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            event_id,
            photo_id,
            embedding_to_bytes(&face.embedding),
            face.embedding.len() as i64,
            face.confidence as f64,
        ],
    )?;
    Ok(())
}

fn count(conn: &Connection, sql: &str, event_id: i64) -> RepoResult<u64> {
    let n: i64 = conn.query_row(sql, [event_id], |row| row.get(0))?;
    Ok(n as u64)
}

impl Repository for SqliteDb {
    fn initialize(&self) -> RepoResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    // ========================================================================
    // Events and bibs
    // ========================================================================

    fn add_event(&self, name: &str, enabled: bool, expiry: DateTime<Utc>) -> RepoResult<i64> {
        self.conn.execute(
            "INSERT INTO event (name, enabled, expiry) VALUES (?1, ?2, ?3)",
            params![name, enabled, to_db_timestamp(&expiry)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_event(&self, event_id: i64) -> RepoResult<Option<Event>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, enabled, expiry FROM event WHERE id = ?1",
                [event_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, name, enabled, expiry)) => Ok(Some(Event {
                id,
                name,
                enabled,
                expiry: from_db_timestamp(&expiry)?,
            })),
            None => Ok(None),
        }
    }

    fn add_bib(&self, event_id: i64, bib: &NewBib) -> RepoResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO bib (event_id, bib_number, enabled, expiry, name, code)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                event_id,
                bib.bib_number,
                bib.enabled,
                to_db_timestamp(&bib.expiry),
                bib.name,
                bib.code,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn event_counts(&self, event_id: i64) -> RepoResult<EventCounts> {
        Ok(EventCounts {
            bibs: count(&self.conn, "SELECT COUNT(*) FROM bib WHERE event_id = ?1", event_id)?,
            photos: count(&self.conn, "SELECT COUNT(*) FROM photo WHERE event_id = ?1", event_id)?,
            bib_detections: count(&self.conn, "SELECT COUNT(*) FROM bib_photo WHERE event_id = ?1", event_id)?,
            faces: count(&self.conn, "SELECT COUNT(*) FROM face_photo WHERE event_id = ?1", event_id)?,
        })
    }

    // ========================================================================
    // Photos and detections
    // ========================================================================

    fn upsert_photo(&self, event_id: i64, path: &str, timestamp: DateTime<Utc>) -> RepoResult<i64> {
        upsert_photo(&self.conn, event_id, path, &timestamp)
    }

    fn touch_photo(&self, photo_id: i64, timestamp: DateTime<Utc>) -> RepoResult<()> {
        touch_photo(&self.conn, photo_id, &timestamp)
    }

    fn photo_registry(&self, event_id: i64) -> RepoResult<HashMap<String, RegistryEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, last_updated FROM photo WHERE event_id = ?1")?;
        let rows = stmt
            .query_map([event_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut registry = HashMap::with_capacity(rows.len());
        for (id, path, last_updated) in rows {
            let last_updated = from_db_timestamp(&last_updated)?;
            registry.insert(path, RegistryEntry { id, last_updated });
        }
        Ok(registry)
    }

    fn delete_photo(&self, photo_id: i64) -> RepoResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        delete_photo(&tx, photo_id)?;
        tx.commit()?;
        Ok(())
    }

    fn clear_detections(&self, photo_id: i64) -> RepoResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        clear_detections(&tx, photo_id)?;
        tx.commit()?;
        Ok(())
    }

    fn add_bib_detection(&self, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()> {
        insert_bib_detection(&self.conn, event_id, photo_id, bib)
    }

    fn add_face_detection(&self, event_id: i64, photo_id: i64, face: &FaceRead) -> RepoResult<()> {
        insert_face_detection(&self.conn, self.embedding_dim, event_id, photo_id, face)
    }

    fn apply_diff(&self, event_id: i64, plan: &DiffPlan) -> RepoResult<Vec<UpdateItem>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updates = Vec::with_capacity(plan.update_count());

        for photo in &plan.purge {
            delete_photo(&tx, photo.photo_id)?;
        }
        for photo in &plan.refresh {
            clear_detections(&tx, photo.photo_id)?;
            updates.push(UpdateItem {
                photo_id: photo.photo_id,
                path: photo.path.clone(),
            });
        }
        for photo in &plan.register {
            let photo_id = upsert_photo(&tx, event_id, &photo.path, &photo.watermark)?;
            updates.push(UpdateItem {
                photo_id,
                path: photo.path.clone(),
            });
        }

        tx.commit()?;
        updates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(updates)
    }

    fn commit_photo(&self, commit: &PhotoCommit) -> RepoResult<()> {
        // Dropping the transaction on any error rolls everything back.
        let tx = self.conn.unchecked_transaction()?;
        clear_detections(&tx, commit.photo_id)?;
        for bib in &commit.bibs {
            insert_bib_detection(&tx, commit.event_id, commit.photo_id, bib)?;
        }
        for face in &commit.faces {
            insert_face_detection(&tx, self.embedding_dim, commit.event_id, commit.photo_id, face)?;
        }
        touch_photo(&tx, commit.photo_id, &commit.completed_at)?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Search and downloads
    // ========================================================================

    fn search_bib_photos(
        &self,
        event_id: i64,
        bib: &str,
        substring: bool,
        min_confidence: f32,
    ) -> RepoResult<Vec<String>> {
        let sql = if substring {
            r#"
            SELECT DISTINCT p.path
            FROM bib_photo b
            JOIN photo p ON p.id = b.photo_id
            WHERE b.event_id = ?1 AND instr(b.bib_number, ?2) > 0 AND b.confidence >= ?3
            ORDER BY p.path
            "#
        } else {
            r#"
            SELECT DISTINCT p.path
            FROM bib_photo b
            JOIN photo p ON p.id = b.photo_id
            WHERE b.event_id = ?1 AND b.bib_number = ?2 AND b.confidence >= ?3
            ORDER BY p.path
            "#
        };

        let mut stmt = self.conn.prepare(sql)?;
        let paths = stmt
            .query_map(params![event_id, bib, min_confidence as f64], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    fn face_rows(&self, event_id: i64) -> RepoResult<Vec<FaceRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.path, f.embedding, f.confidence
            FROM face_photo f
            JOIN photo p ON p.id = f.photo_id
            WHERE f.event_id = ?1
            ORDER BY f.id
            "#,
        )?;
        let rows = stmt
            .query_map([event_id], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok(FaceRow {
                    path: row.get(0)?,
                    embedding: bytes_to_embedding(&bytes),
                    confidence: row.get::<_, f64>(2)? as f32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn record_download(&self, bib_id: i64, files: usize, total_size: u64) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO download_history (bib_id, files, total_size, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![bib_id, files as i64, total_size as i64, to_db_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    fn downloaded_bytes_since(&self, bib_id: i64, since: DateTime<Utc>) -> RepoResult<u64> {
        let total: i64 = self.conn.query_row(
            r#"
            SELECT COALESCE(SUM(total_size), 0)
            FROM download_history
            WHERE bib_id = ?1 AND timestamp >= ?2
            "#,
            params![bib_id, to_db_timestamp(&since)],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::diff::{NewPhoto, PhotoRef};
    use chrono::{Duration as ChronoDuration, TimeZone};

    const DIM: usize = 4;

    fn setup() -> (SqliteDb, i64) {
        let db = SqliteDb::open_in_memory(DIM).unwrap();
        db.initialize().unwrap();
        let event_id = db.add_event("City Marathon", true, Utc::now() + ChronoDuration::days(30)).unwrap();
        (db, event_id)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn face(values: [f32; DIM], confidence: f32) -> FaceRead {
        FaceRead { embedding: values.to_vec(), confidence }
    }

    fn bib(text: &str, confidence: f32) -> BibRead {
        BibRead { text: text.to_string(), confidence }
    }

    #[test]
    fn test_upsert_updates_instead_of_duplicating() {
        let (db, event_id) = setup();
        let first = db.upsert_photo(event_id, "finish/001.jpg", at(0)).unwrap();
        let second = db.upsert_photo(event_id, "finish/001.jpg", at(60)).unwrap();
        assert_eq!(first, second);

        let registry = db.photo_registry(event_id).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry["finish/001.jpg"].last_updated, at(60));
    }

    #[test]
    fn test_commit_photo_replaces_detections() {
        let (db, event_id) = setup();
        let photo_id = db.upsert_photo(event_id, "a.jpg", at(0)).unwrap();

        let commit = PhotoCommit {
            event_id,
            photo_id,
            bibs: vec![bib("1234", 0.9)],
            faces: vec![face([1.0, 0.0, 0.0, 0.0], 0.95)],
            completed_at: at(100),
        };
        db.commit_photo(&commit).unwrap();
        db.commit_photo(&commit).unwrap();

        let counts = db.event_counts(event_id).unwrap();
        assert_eq!(counts.bib_detections, 1);
        assert_eq!(counts.faces, 1);
        assert_eq!(counts.photos, 1);
        assert_eq!(db.photo_registry(event_id).unwrap()["a.jpg"].last_updated, at(100));
    }

    #[test]
    fn test_dimension_mismatch_rolls_back_commit() {
        let (db, event_id) = setup();
        let photo_id = db.upsert_photo(event_id, "a.jpg", at(0)).unwrap();

        let bad = PhotoCommit {
            event_id,
            photo_id,
            bibs: vec![bib("77", 0.9)],
            faces: vec![FaceRead { embedding: vec![0.5; DIM + 1], confidence: 0.9 }],
            completed_at: at(100),
        };
        let err = db.commit_photo(&bad).unwrap_err();
        assert!(matches!(err, RepoError::DimensionMismatch { expected: DIM, actual: 5 }));

        // nothing from the failed commit is visible and the watermark did not move
        let counts = db.event_counts(event_id).unwrap();
        assert_eq!(counts.bib_detections, 0);
        assert_eq!(counts.faces, 0);
        assert_eq!(db.photo_registry(event_id).unwrap()["a.jpg"].last_updated, at(0));

        let short = FaceRead { embedding: vec![0.5; DIM - 1], confidence: 0.9 };
        assert!(db.add_face_detection(event_id, photo_id, &short).is_err());
    }

    #[test]
    fn test_delete_photo_removes_detections_first() {
        let (db, event_id) = setup();
        let photo_id = db.upsert_photo(event_id, "a.jpg", at(0)).unwrap();
        db.add_bib_detection(event_id, photo_id, &bib("5", 0.9)).unwrap();
        db.add_face_detection(event_id, photo_id, &face([0.0, 1.0, 0.0, 0.0], 0.8)).unwrap();

        db.delete_photo(photo_id).unwrap();
        assert_eq!(db.event_counts(event_id).unwrap(), EventCounts::default());

        // clearing a photo with no detections is fine
        db.clear_detections(photo_id).unwrap();
    }

    #[test]
    fn test_apply_diff() {
        let (db, event_id) = setup();
        let stale = db.upsert_photo(event_id, "stale.jpg", at(0)).unwrap();
        let gone = db.upsert_photo(event_id, "gone.jpg", at(0)).unwrap();
        db.add_bib_detection(event_id, stale, &bib("12", 0.9)).unwrap();
        db.add_bib_detection(event_id, gone, &bib("34", 0.9)).unwrap();

        let plan = DiffPlan {
            register: vec![NewPhoto { path: "new.jpg".to_string(), watermark: at(-86_400) }],
            refresh: vec![PhotoRef { photo_id: stale, path: "stale.jpg".to_string() }],
            purge: vec![PhotoRef { photo_id: gone, path: "gone.jpg".to_string() }],
            orphaned: 0,
            unchanged: 0,
        };
        let updates = db.apply_diff(event_id, &plan).unwrap();

        let paths: Vec<&str> = updates.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["new.jpg", "stale.jpg"]);

        let registry = db.photo_registry(event_id).unwrap();
        assert!(!registry.contains_key("gone.jpg"));
        assert_eq!(registry["new.jpg"].last_updated, at(-86_400));
        assert_eq!(db.event_counts(event_id).unwrap().bib_detections, 0);
    }

    #[test]
    fn test_search_bib_photos() {
        let (db, event_id) = setup();
        let a = db.upsert_photo(event_id, "a.jpg", at(0)).unwrap();
        let b = db.upsert_photo(event_id, "b.jpg", at(0)).unwrap();
        let c = db.upsert_photo(event_id, "c.jpg", at(0)).unwrap();
        db.add_bib_detection(event_id, a, &bib("1234", 0.9)).unwrap();
        db.add_bib_detection(event_id, b, &bib("12345", 0.95)).unwrap();
        db.add_bib_detection(event_id, c, &bib("1234", 0.5)).unwrap();

        assert_eq!(db.search_bib_photos(event_id, "1234", false, 0.8).unwrap(), vec!["a.jpg"]);
        assert_eq!(
            db.search_bib_photos(event_id, "1234", true, 0.8).unwrap(),
            vec!["a.jpg", "b.jpg"]
        );
        assert_eq!(
            db.search_bib_photos(event_id, "1234", false, 0.0).unwrap(),
            vec!["a.jpg", "c.jpg"]
        );
        assert!(db.search_bib_photos(event_id + 1, "1234", true, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_face_rows_round_trip() {
        let (db, event_id) = setup();
        let photo_id = db.upsert_photo(event_id, "a.jpg", at(0)).unwrap();
        db.add_face_detection(event_id, photo_id, &face([0.1, 0.2, 0.3, 0.4], 0.75)).unwrap();

        let rows = db.face_rows(event_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "a.jpg");
        assert_eq!(rows[0].embedding, vec![0.1, 0.2, 0.3, 0.4]);
        assert!((rows[0].confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_events_bibs_and_downloads() {
        let (db, event_id) = setup();
        let event = db.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.name, "City Marathon");
        assert!(event.enabled);
        assert!(db.get_event(event_id + 100).unwrap().is_none());

        let bib_id = db
            .add_bib(
                event_id,
                &NewBib {
                    bib_number: "1234".to_string(),
                    enabled: true,
                    expiry: Utc::now() + ChronoDuration::days(30),
                    name: Some("Ada".to_string()),
                    code: Some("XK2P".to_string()),
                },
            )
            .unwrap();
        assert_eq!(db.event_counts(event_id).unwrap().bibs, 1);

        let hour_ago = Utc::now() - ChronoDuration::hours(1);
        db.record_download(bib_id, 3, 1_000).unwrap();
        db.record_download(bib_id, 1, 500).unwrap();
        assert_eq!(db.downloaded_bytes_since(bib_id, hour_ago).unwrap(), 1_500);
        assert_eq!(
            db.downloaded_bytes_since(bib_id, Utc::now() + ChronoDuration::hours(1)).unwrap(),
            0
        );
    }

    #[test]
    fn test_touch_unknown_photo() {
        let (db, _) = setup();
        assert!(matches!(db.touch_photo(999, at(0)), Err(RepoError::NotFound(_))));
    }
}
