/// PostgreSQL schema. `{dim}` is replaced with the configured embedding
/// dimension; face embeddings use pgvector so searches can run in the database.
pub const POSTGRES_SCHEMA: &str = r#"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS event (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    expiry TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bib (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL REFERENCES event(id),
    bib_number TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    expiry TEXT NOT NULL,
    name TEXT,
    code TEXT,
    UNIQUE (event_id, bib_number)
);

CREATE INDEX IF NOT EXISTS idx_bib_code ON bib(code);

CREATE TABLE IF NOT EXISTS photo (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL REFERENCES event(id),
    path TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    UNIQUE (event_id, path)
);

CREATE TABLE IF NOT EXISTS bib_photo (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL,
    bib_number TEXT NOT NULL,
    photo_id BIGINT NOT NULL REFERENCES photo(id),
    confidence REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_bib_photo_event_bib ON bib_photo(event_id, bib_number);
CREATE INDEX IF NOT EXISTS idx_bib_photo_photo ON bib_photo(photo_id);

CREATE TABLE IF NOT EXISTS face_photo (
    id BIGSERIAL PRIMARY KEY,
    event_id BIGINT NOT NULL,
    photo_id BIGINT NOT NULL REFERENCES photo(id),
    embedding vector({dim}) NOT NULL,
    confidence REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_photo_event ON face_photo(event_id);
CREATE INDEX IF NOT EXISTS idx_face_photo_photo ON face_photo(photo_id);

CREATE TABLE IF NOT EXISTS download_history (
    id BIGSERIAL PRIMARY KEY,
    bib_id BIGINT NOT NULL REFERENCES bib(id),
    files INTEGER NOT NULL DEFAULT 0,
    total_size BIGINT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_download_history_bib ON download_history(bib_id, timestamp);
"#;

pub fn postgres_schema(embedding_dim: usize) -> String {
    POSTGRES_SCHEMA.replace("{dim}", &embedding_dim.to_string())
}
