//! Shared SQLite storage for the provisioning core.
//!
//! One database holds the container records, the image catalog and the
//! healing-event history. Repositories hand out typed access to their own
//! tables; all of them share a single connection behind a mutex, which is
//! what gives single-document updates their atomicity.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;

use crate::container::store::ContainerStore;
use crate::healer::HealingHistory;
use crate::image::ImageCatalog;

/// Errors from storage initialization.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the core database.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                app_name TEXT NOT NULL,
                process_name TEXT NOT NULL DEFAULT 'web',
                platform TEXT NOT NULL DEFAULT '',
                image TEXT NOT NULL,
                build_image TEXT,
                host_addr TEXT NOT NULL DEFAULT '',
                host_port TEXT NOT NULL DEFAULT '',
                ip TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                status_updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_containers_app ON containers(app_name);
            CREATE INDEX IF NOT EXISTS idx_containers_host ON containers(host_addr);
            CREATE INDEX IF NOT EXISTS idx_containers_status ON containers(status);

            CREATE TABLE IF NOT EXISTS app_images (
                app_name TEXT NOT NULL,
                tag TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (app_name, tag)
            );

            CREATE TABLE IF NOT EXISTS app_image_versions (
                app_name TEXT PRIMARY KEY,
                next_version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS image_data (
                image TEXT PRIMARY KEY,
                custom_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS healing_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                node TEXT NOT NULL,
                containers TEXT NOT NULL,
                outcome TEXT NOT NULL
            );
            "#,
        )?;
        debug!("storage schema initialized");
        Ok(())
    }

    pub fn containers(&self) -> ContainerStore {
        ContainerStore::new(self.conn.clone())
    }

    pub fn images(&self) -> ImageCatalog {
        ImageCatalog::new(self.conn.clone())
    }

    pub fn healing(&self) -> HealingHistory {
        HealingHistory::new(self.conn.clone())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }
}

/// Lock a shared connection, recovering from poisoning.
///
/// SQLite statements are self-contained; a panic in another thread cannot
/// leave a half-applied write behind, so the guard is safe to reuse.
pub(crate) fn lock(conn: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_initializes_schema() {
        let storage = Storage::open_in_memory().unwrap();
        // Repositories over the same handle see the same tables.
        let containers = storage.containers();
        assert!(containers.list_all().unwrap().is_empty());
    }
}
