//! PostgreSQL backend implementation.
//!
//! Face embeddings live in a pgvector column, so face search runs as one
//! ranked query instead of through an in-memory index.

use chrono::{DateTime, Utc};
use postgres::{GenericClient, NoTls};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use std::collections::HashMap;

use super::postgres_schema::postgres_schema;
use super::repository::{check_dimension, RepoResult, Repository};
use super::{
    from_db_timestamp, to_db_timestamp, Event, EventCounts, FaceMatch, FaceQuery, FaceRow,
    NewBib, PhotoCommit, RegistryEntry, RepoError, UpdateItem,
};
use crate::config::SimilarityMetric;
use crate::extract::{BibRead, FaceRead};
use crate::scanner::diff::DiffPlan;

pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    embedding_dim: usize,
}

/// pgvector text form: `[0.1,0.2,...]`
fn vector_literal(embedding: &[f32]) -> String {
    let values: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", values.join(","))
}

fn parse_vector(text: &str) -> Vec<f32> {
    text.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32, embedding_dim: usize) -> anyhow::Result<Self> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)?;
        Ok(Self { pool, embedding_dim })
    }
}

// ============================================================================
// Statement helpers shared by plain clients and transactions
// ============================================================================

fn upsert_photo<C: GenericClient>(client: &mut C, event_id: i64, path: &str, timestamp: &DateTime<Utc>) -> RepoResult<i64> {
    let row = client.query_one(
        r#"
        INSERT INTO photo (event_id, path, last_updated)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id, path) DO UPDATE SET last_updated = EXCLUDED.last_updated
        RETURNING id
        "#,
        &[&event_id, &path, &to_db_timestamp(timestamp)],
    )?;
    Ok(row.get(0))
}

fn touch_photo<C: GenericClient>(client: &mut C, photo_id: i64, timestamp: &DateTime<Utc>) -> RepoResult<()> {
    let updated = client.execute(
        "UPDATE photo SET last_updated = $1 WHERE id = $2",
        &[&to_db_timestamp(timestamp), &photo_id],
    )?;
    if updated == 0 {
        return Err(RepoError::NotFound(format!("photo {}", photo_id)));
    }
    Ok(())
}

fn clear_detections<C: GenericClient>(client: &mut C, photo_id: i64) -> RepoResult<()> {
    client.execute("DELETE FROM bib_photo WHERE photo_id = $1", &[&photo_id])?;
    client.execute("DELETE FROM face_photo WHERE photo_id = $1", &[&photo_id])?;
    Ok(())
}

fn delete_photo<C: GenericClient>(client: &mut C, photo_id: i64) -> RepoResult<()> {
    clear_detections(client, photo_id)?;
    client.execute("DELETE FROM photo WHERE id = $1", &[&photo_id])?;
    Ok(())
}

fn insert_bib_detection<C: GenericClient>(client: &mut C, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()> {
    client.execute(
        "INSERT INTO bib_photo (event_id, bib_number, photo_id, confidence) VALUES ($1, $2, $3, $4)",
        &[&event_id, &bib.text, &photo_id, &bib.confidence],
    )?;
    Ok(())
}

fn insert_face_detection<C: GenericClient>(
    client: &mut C,
    embedding_dim: usize,
    event_id: i64,
    photo_id: i64,
    face: &FaceRead,
) -> RepoResult<()> {
    check_dimension(embedding_dim, &face.embedding)?;
    client.execute(
        r#"
        INSERT INTO face_photo (event_id, photo_id, embedding, confidence)
        VALUES ($1, $2, $3::text::vector, $4)
        "#,
        &[&event_id, &photo_id, &vector_literal(&face.embedding), &face.confidence],
    )?;
    Ok(())
}

fn count<C: GenericClient>(client: &mut C, sql: &str, event_id: i64) -> RepoResult<u64> {
    let row = client.query_one(sql, &[&event_id])?;
    let n: i64 = row.get(0);
    Ok(n as u64)
}

impl Repository for PgDb {
    fn initialize(&self) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        client.batch_execute(&postgres_schema(self.embedding_dim))?;
        Ok(())
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    // ========================================================================
    // Events and bibs
    // ========================================================================

    fn add_event(&self, name: &str, enabled: bool, expiry: DateTime<Utc>) -> RepoResult<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one(
            "INSERT INTO event (name, enabled, expiry) VALUES ($1, $2, $3) RETURNING id",
            &[&name, &enabled, &to_db_timestamp(&expiry)],
        )?;
        Ok(row.get(0))
    }

    fn get_event(&self, event_id: i64) -> RepoResult<Option<Event>> {
        let mut client = self.pool.get()?;
        let row = client.query_opt(
            "SELECT id, name, enabled, expiry FROM event WHERE id = $1",
            &[&event_id],
        )?;
        match row {
            Some(row) => {
                let expiry: String = row.get(3);
                Ok(Some(Event {
                    id: row.get(0),
                    name: row.get(1),
                    enabled: row.get(2),
                    expiry: from_db_timestamp(&expiry)?,
                }))
            }
            None => Ok(None),
        }
    }

    fn add_bib(&self, event_id: i64, bib: &NewBib) -> RepoResult<i64> {
        let mut client = self.pool.get()?;
        let row = client.query_one(
            r#"
            INSERT INTO bib (event_id, bib_number, enabled, expiry, name, code)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
            &[
                &event_id,
                &bib.bib_number,
                &bib.enabled,
                &to_db_timestamp(&bib.expiry),
                &bib.name,
                &bib.code,
            ],
        )?;
        Ok(row.get(0))
    }

    fn event_counts(&self, event_id: i64) -> RepoResult<EventCounts> {
        let mut client = self.pool.get()?;
        Ok(EventCounts {
            bibs: count(&mut *client, "SELECT COUNT(*) FROM bib WHERE event_id = $1", event_id)?,
            photos: count(&mut *client, "SELECT COUNT(*) FROM photo WHERE event_id = $1", event_id)?,
            bib_detections: count(&mut *client, "SELECT COUNT(*) FROM bib_photo WHERE event_id = $1", event_id)?,
            faces: count(&mut *client, "SELECT COUNT(*) FROM face_photo WHERE event_id = $1", event_id)?,
        })
    }

    // ========================================================================
    // Photos and detections
    // ========================================================================

    fn upsert_photo(&self, event_id: i64, path: &str, timestamp: DateTime<Utc>) -> RepoResult<i64> {
        let mut client = self.pool.get()?;
        upsert_photo(&mut *client, event_id, path, &timestamp)
    }

    fn touch_photo(&self, photo_id: i64, timestamp: DateTime<Utc>) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        touch_photo(&mut *client, photo_id, &timestamp)
    }

    fn photo_registry(&self, event_id: i64) -> RepoResult<HashMap<String, RegistryEntry>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            "SELECT id, path, last_updated FROM photo WHERE event_id = $1",
            &[&event_id],
        )?;

        let mut registry = HashMap::with_capacity(rows.len());
        for row in rows {
            let last_updated: String = row.get(2);
            registry.insert(
                row.get::<_, String>(1),
                RegistryEntry {
                    id: row.get(0),
                    last_updated: from_db_timestamp(&last_updated)?,
                },
            );
        }
        Ok(registry)
    }

    fn delete_photo(&self, photo_id: i64) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        delete_photo(&mut tx, photo_id)?;
        tx.commit()?;
        Ok(())
    }

    fn clear_detections(&self, photo_id: i64) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        clear_detections(&mut tx, photo_id)?;
        tx.commit()?;
        Ok(())
    }

    fn add_bib_detection(&self, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        insert_bib_detection(&mut *client, event_id, photo_id, bib)
    }

    fn add_face_detection(&self, event_id: i64, photo_id: i64, face: &FaceRead) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        insert_face_detection(&mut *client, self.embedding_dim, event_id, photo_id, face)
    }

    fn apply_diff(&self, event_id: i64, plan: &DiffPlan) -> RepoResult<Vec<UpdateItem>> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        let mut updates = Vec::with_capacity(plan.update_count());

        for photo in &plan.purge {
            delete_photo(&mut tx, photo.photo_id)?;
        }
        for photo in &plan.refresh {
            clear_detections(&mut tx, photo.photo_id)?;
            updates.push(UpdateItem {
                photo_id: photo.photo_id,
                path: photo.path.clone(),
            });
        }
        for photo in &plan.register {
            let photo_id = upsert_photo(&mut tx, event_id, &photo.path, &photo.watermark)?;
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
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        clear_detections(&mut tx, commit.photo_id)?;
        for bib in &commit.bibs {
            insert_bib_detection(&mut tx, commit.event_id, commit.photo_id, bib)?;
        }
        for face in &commit.faces {
            insert_face_detection(&mut tx, self.embedding_dim, commit.event_id, commit.photo_id, face)?;
        }
        touch_photo(&mut tx, commit.photo_id, &commit.completed_at)?;
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
            WHERE b.event_id = $1 AND strpos(b.bib_number, $2) > 0 AND b.confidence >= $3
            ORDER BY p.path
            "#
        } else {
            r#"
            SELECT DISTINCT p.path
            FROM bib_photo b
            JOIN photo p ON p.id = b.photo_id
            WHERE b.event_id = $1 AND b.bib_number = $2 AND b.confidence >= $3
            ORDER BY p.path
            "#
        };

        let mut client = self.pool.get()?;
        let rows = client.query(sql, &[&event_id, &bib, &min_confidence])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn face_rows(&self, event_id: i64) -> RepoResult<Vec<FaceRow>> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            r#"
            SELECT p.path, f.embedding::text, f.confidence
            FROM face_photo f
            JOIN photo p ON p.id = f.photo_id
            WHERE f.event_id = $1
            ORDER BY f.id
            "#,
            &[&event_id],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let embedding: String = row.get(1);
                FaceRow {
                    path: row.get(0),
                    embedding: parse_vector(&embedding),
                    confidence: row.get(2),
                }
            })
            .collect())
    }

    fn native_face_search(&self, query: &FaceQuery<'_>) -> RepoResult<Option<Vec<FaceMatch>>> {
        check_dimension(self.embedding_dim, query.embedding)?;

        // <=> is cosine distance (1 - cos); <-> is Euclidean distance.
        let similarity = match query.metric {
            SimilarityMetric::Cosine => "1 - (f.embedding <=> $2::text::vector)",
            SimilarityMetric::L2 => "1 - power(f.embedding <-> $2::text::vector, 2) / 2",
        };
        let sql = format!(
            r#"
            SELECT path, similarity, confidence FROM (
                SELECT DISTINCT ON (p.path)
                       p.path AS path,
                       ({similarity})::real AS similarity,
                       f.confidence AS confidence
                FROM face_photo f
                JOIN photo p ON p.id = f.photo_id
                WHERE f.event_id = $1 AND f.confidence >= $3
                ORDER BY p.path, similarity DESC, f.confidence DESC
            ) best
            WHERE similarity >= $4
            ORDER BY similarity DESC, path
            LIMIT $5
            "#
        );

        let mut client = self.pool.get()?;
        let rows = client.query(
            sql.as_str(),
            &[
                &query.event_id,
                &vector_literal(query.embedding),
                &query.min_confidence,
                &query.min_similarity,
                &(query.limit as i64),
            ],
        )?;

        Ok(Some(
            rows.iter()
                .map(|row| FaceMatch {
                    path: row.get(0),
                    similarity: row.get(1),
                    confidence: row.get(2),
                })
                .collect(),
        ))
    }

    fn record_download(&self, bib_id: i64, files: usize, total_size: u64) -> RepoResult<()> {
        let mut client = self.pool.get()?;
        client.execute(
            "INSERT INTO download_history (bib_id, files, total_size, timestamp) VALUES ($1, $2, $3, $4)",
            &[&bib_id, &(files as i32), &(total_size as i64), &to_db_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    fn downloaded_bytes_since(&self, bib_id: i64, since: DateTime<Utc>) -> RepoResult<u64> {
        let mut client = self.pool.get()?;
        let row = client.query_one(
            r#"
            SELECT COALESCE(SUM(total_size), 0)::BIGINT
            FROM download_history
            WHERE bib_id = $1 AND timestamp >= $2
            "#,
            &[&bib_id, &to_db_timestamp(&since)],
        )?;
        let total: i64 = row.get(0);
        Ok(total as u64)
    }
}
