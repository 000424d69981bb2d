/// Version this build writes into `PRAGMA user_version` after migrating.
pub const SCHEMA_VERSION: i64 = 3;

/// Ordered migrations. Entry `n` upgrades a database from version `n` to `n + 1`.
pub const MIGRATIONS: &[&str] = &[
    // 0 -> 1: base tables
    r#"
-- Users: people analyses can be attributed to
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One row per analyze/verify invocation on an image
CREATE TABLE IF NOT EXISTS face_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,                  -- NULL for anonymous analyses
    image_path TEXT NOT NULL,
    analysis_type TEXT NOT NULL CHECK (analysis_type IN ('verify', 'analyze')),
    result_data TEXT NOT NULL,        -- JSON document
    confidence_score REAL,            -- 0-1
    processing_time REAL,             -- seconds
    model_used TEXT,
    detector_used TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

-- Face embeddings, each owned by exactly one analysis
CREATE TABLE IF NOT EXISTS face_embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    analysis_id INTEGER NOT NULL,
    embedding BLOB NOT NULL,          -- f64 array stored as little-endian bytes
    embedding_dim INTEGER NOT NULL,
    face_location TEXT,               -- JSON bounding box
    created_at TEXT NOT NULL,
    FOREIGN KEY (analysis_id) REFERENCES face_analyses(id)
);

-- Pairwise verification outcomes
CREATE TABLE IF NOT EXISTS verification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image1_id INTEGER NOT NULL,
    image2_id INTEGER NOT NULL,
    similarity_score REAL NOT NULL,
    verified INTEGER NOT NULL,
    threshold_used REAL NOT NULL,
    model_used TEXT,
    detector_used TEXT,
    processing_time REAL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (image1_id) REFERENCES face_analyses(id),
    FOREIGN KEY (image2_id) REFERENCES face_analyses(id)
);
"#,
    // 1 -> 2: indexes for the history, per-user and search queries
    r#"
CREATE INDEX IF NOT EXISTS idx_analyses_user_id ON face_analyses(user_id);
CREATE INDEX IF NOT EXISTS idx_analyses_type ON face_analyses(analysis_type);
CREATE INDEX IF NOT EXISTS idx_analyses_created ON face_analyses(created_at);
CREATE INDEX IF NOT EXISTS idx_embeddings_analysis ON face_embeddings(analysis_id);
CREATE INDEX IF NOT EXISTS idx_verification_created ON verification_history(created_at);
"#,
    // 2 -> 3: store-wide values that must outlive the data tables
    r#"
CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_timestamp TEXT               -- latest record timestamp issued before a clear
);
"#,
];

/// Columns every table must have for this build to read and write it.
pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("users", &["id", "name", "email", "created_at", "updated_at"]),
    (
        "face_analyses",
        &[
            "id",
            "user_id",
            "image_path",
            "analysis_type",
            "result_data",
            "confidence_score",
            "processing_time",
            "model_used",
            "detector_used",
            "created_at",
        ],
    ),
    (
        "face_embeddings",
        &["id", "analysis_id", "embedding", "embedding_dim", "face_location", "created_at"],
    ),
    (
        "verification_history",
        &[
            "id",
            "image1_id",
            "image2_id",
            "similarity_score",
            "verified",
            "threshold_used",
            "model_used",
            "detector_used",
            "processing_time",
            "created_at",
        ],
    ),
    ("store_meta", &["id", "last_timestamp"]),
];

/// Tables wiped by `clear_database`, children first.
pub const DATA_TABLES: &[&str] = &["verification_history", "face_embeddings", "face_analyses", "users"];
