//! Watermark persistence
//!
//! The watermark is the publish time (ms since epoch) of the newest mirrored
//! post. It is the only state that survives a restart. Two storage backends
//! are provided:
//!
//! - [`FileBackend`]: a decimal string in a plain file (default)
//! - [`SqliteBackend`]: a single-row table in a SQLite database
//!
//! [`WatermarkStore`] wraps a backend and never fails: load degrades to 0 and
//! save failures are logged. Re-announcing the latest page after data loss is
//! preferred over silently skipping posts.

use crate::error::PersistenceError;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Storage collaborator for a single scalar watermark
pub trait WatermarkBackend: Send + Sync {
    /// Read the stored value; `Ok(None)` when nothing has been stored yet
    fn read(&self) -> Result<Option<i64>, PersistenceError>;

    /// Replace the stored value
    fn write(&self, value: i64) -> Result<(), PersistenceError>;

    /// Human readable location for logs
    fn describe(&self) -> String;
}

/// Fault-tolerant facade over a [`WatermarkBackend`]
pub struct WatermarkStore {
    backend: Box<dyn WatermarkBackend>,
}

impl WatermarkStore {
    pub fn new(backend: Box<dyn WatermarkBackend>) -> Self {
        Self { backend }
    }

    /// Load the persisted watermark, treating missing or corrupt data as 0
    pub fn load(&self) -> i64 {
        match self.backend.read() {
            Ok(Some(value)) => {
                info!("Loaded watermark {} from {}", value, self.backend.describe());
                value
            }
            Ok(None) => {
                info!(
                    "No watermark stored at {}, treating all posts as new",
                    self.backend.describe()
                );
                0
            }
            Err(e) => {
                error!(
                    "Failed to load watermark from {}: {}. Treating all posts as new",
                    self.backend.describe(),
                    e
                );
                0
            }
        }
    }

    /// Persist `value`, returning whether it was written
    pub fn save(&self, value: i64) -> bool {
        match self.backend.write(value) {
            Ok(()) => {
                debug!("Saved watermark {} to {}", value, self.backend.describe());
                true
            }
            Err(e) => {
                error!(
                    "Failed to save watermark {} to {}: {}",
                    value,
                    self.backend.describe(),
                    e
                );
                false
            }
        }
    }

    pub fn location(&self) -> String {
        self.backend.describe()
    }
}

// =============================================================================
// File backend
// =============================================================================

/// Watermark stored as a decimal string in a file
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WatermarkBackend for FileBackend {
    fn read(&self) -> Result<Option<i64>, PersistenceError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let trimmed = content.trim();
        trimmed
            .parse::<i64>()
            .map(Some)
            .map_err(|_| PersistenceError::Corrupt(trimmed.to_string()))
    }

    fn write(&self, value: i64) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write then rename so a crash never leaves a half-written value
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(value.to_string().as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// =============================================================================
// SQLite backend
// =============================================================================

/// Watermark stored in a single-row SQLite table
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteBackend {
    /// Open or create the database at `path`
    pub fn open_at(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let backend = Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        };
        backend.initialize()?;
        Ok(backend)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let backend = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            location: ":memory:".to_string(),
        };
        backend.initialize()?;
        Ok(backend)
    }

    fn initialize(&self) -> Result<(), PersistenceError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS watermark (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    value INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                );
                "#,
            )
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, PersistenceError> {
        let conn = match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Watermark database lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        Ok(f(&conn)?)
    }
}

impl WatermarkBackend for SqliteBackend {
    fn read(&self) -> Result<Option<i64>, PersistenceError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM watermark WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
        })
    }

    fn write(&self, value: i64) -> Result<(), PersistenceError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO watermark (id, value, updated_at)
                VALUES (1, ?1, ?2)
                ON CONFLICT(id) DO UPDATE SET
                    value = MAX(value, ?1),
                    updated_at = ?2
                "#,
                params![value, now],
            )
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}
