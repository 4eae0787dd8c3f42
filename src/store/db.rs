use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::Result;
use crate::session::SessionStatus;

/// One `recording_session` row
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub transcript_text: Option<String>,
    pub summary: Option<String>,
    pub duration_secs: Option<f64>,
}

/// One `transcript_chunk` row
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub session_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f32>,
}

/// Thread-safe SQLite handle. Statements are short; the pipeline never
/// holds the connection across an await point.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Database opened: {}", path.as_ref().display());
        Ok(db)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS recording_session (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                transcript_text TEXT,
                summary TEXT,
                duration_secs REAL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transcript_chunk (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                confidence REAL,
                UNIQUE(session_id, chunk_index),
                FOREIGN KEY (session_id) REFERENCES recording_session(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunk_session
             ON transcript_chunk(session_id, chunk_index)",
            [],
        )?;

        Ok(())
    }

    /// Insert a new session row in Recording state.
    /// Returns false if the ID already exists.
    pub fn insert_session(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO recording_session (id, user_id, title, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                user_id,
                title,
                SessionStatus::Recording.as_str(),
                created_at.to_rfc3339()
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, user_id, title, status, created_at,
                        transcript_text, summary, duration_secs
                 FROM recording_session WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recording_session SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Mark a session Completed with its final transcript and summary
    pub fn finalize_session(
        &self,
        id: &str,
        transcript: &str,
        summary: &str,
        duration_secs: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recording_session
             SET status = ?1, transcript_text = ?2, summary = ?3, duration_secs = ?4
             WHERE id = ?5",
            params![
                SessionStatus::Completed.as_str(),
                transcript,
                summary,
                duration_secs,
                id
            ],
        )?;
        Ok(())
    }

    pub fn insert_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        text: &str,
        timestamp: DateTime<Utc>,
        confidence: Option<f32>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transcript_chunk (session_id, chunk_index, text, timestamp, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                chunk_index,
                text,
                timestamp.to_rfc3339(),
                confidence
            ],
        )?;
        Ok(())
    }

    /// Number of chunks persisted for a session; the next chunk index
    pub fn chunk_count(&self, session_id: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM transcript_chunk WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// The last `n` chunk texts for a session, oldest first
    pub fn recent_chunk_texts(&self, session_id: &str, n: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT text FROM transcript_chunk
             WHERE session_id = ?1
             ORDER BY chunk_index DESC
             LIMIT ?2",
        )?;
        let mut texts: Vec<String> = stmt
            .query_map(params![session_id, n as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        texts.reverse();
        Ok(texts)
    }

    /// All chunks for a session in index order
    pub fn chunks(&self, session_id: &str) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, chunk_index, text, timestamp, confidence
             FROM transcript_chunk
             WHERE session_id = ?1
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], chunk_from_row)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }
}

fn session_from_row(row: &Row) -> rusqlite::Result<SessionRow> {
    let status_text: String = row.get(3)?;
    let created_text: String = row.get(4)?;
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        status: SessionStatus::from_str(&status_text).unwrap_or(SessionStatus::Cancelled),
        created_at: DateTime::parse_from_rfc3339(&created_text)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        transcript_text: row.get(5)?,
        summary: row.get(6)?,
        duration_secs: row.get(7)?,
    })
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<ChunkRow> {
    let ts_text: String = row.get(3)?;
    Ok(ChunkRow {
        session_id: row.get(0)?,
        chunk_index: row.get(1)?,
        text: row.get(2)?,
        timestamp: DateTime::parse_from_rfc3339(&ts_text)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        confidence: row.get(4)?,
    })
}
