pub const SCHEMA: &str = r#"
-- Events: one race or meet; owns bibs and photos
CREATE TABLE IF NOT EXISTS event (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    expiry TEXT NOT NULL
);

-- Enrolled bibs (registrations, not detections)
CREATE TABLE IF NOT EXISTS bib (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    bib_number TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    expiry TEXT NOT NULL,
    name TEXT,
    code TEXT,
    UNIQUE (event_id, bib_number),
    FOREIGN KEY (event_id) REFERENCES event(id)
);

CREATE INDEX IF NOT EXISTS idx_bib_code ON bib(code);

-- Photos; last_updated is the extraction watermark
CREATE TABLE IF NOT EXISTS photo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    last_updated TEXT NOT NULL,     -- RFC 3339, UTC, nanosecond precision
    UNIQUE (event_id, path),
    FOREIGN KEY (event_id) REFERENCES event(id)
);

-- OCR reads; bib_number is free text and need not match an enrolled bib
CREATE TABLE IF NOT EXISTS bib_photo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    bib_number TEXT NOT NULL,
    photo_id INTEGER NOT NULL,
    confidence REAL NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photo(id)
);

CREATE INDEX IF NOT EXISTS idx_bib_photo_event_bib ON bib_photo(event_id, bib_number);
CREATE INDEX IF NOT EXISTS idx_bib_photo_photo ON bib_photo(photo_id);

-- Face embeddings stored as little-endian f32 blobs
CREATE TABLE IF NOT EXISTS face_photo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    photo_id INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    confidence REAL NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photo(id)
);

CREATE INDEX IF NOT EXISTS idx_face_photo_event ON face_photo(event_id);
CREATE INDEX IF NOT EXISTS idx_face_photo_photo ON face_photo(photo_id);

-- Download accounting per bib
CREATE TABLE IF NOT EXISTS download_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bib_id INTEGER NOT NULL,
    files INTEGER NOT NULL DEFAULT 0,
    total_size INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (bib_id) REFERENCES bib(id)
);

CREATE INDEX IF NOT EXISTS idx_download_history_bib ON download_history(bib_id, timestamp);
"#;
