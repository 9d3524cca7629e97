use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use filament_types::{Base, BaseId, Item};

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectDatabase;

/// SQL to create the objects table.
///
/// One row per base document, keyed by its content hash. `size` is the
/// serialized payload length recorded at download time.
const SCHEMA_CREATE_OBJECTS: &str = "
CREATE TABLE IF NOT EXISTS objects (
    base_id TEXT PRIMARY KEY NOT NULL,
    document TEXT NOT NULL,
    size INTEGER
)
";

/// Embedded durable object database backed by SQLite.
///
/// The connection is synchronous; batched operations hop onto the blocking
/// pool so the async caller never stalls the runtime. Writes use
/// `INSERT OR IGNORE` — rows are immutable and re-inserting an id is a
/// no-op.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    disposed: AtomicBool,
    warmed: AtomicBool,
}

impl SqliteDatabase {
    /// Open (or create) a database file at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a transient in-memory database (tests, embedding).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(SCHEMA_CREATE_OBJECTS, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            disposed: AtomicBool::new(false),
            warmed: AtomicBool::new(false),
        })
    }

    fn check_live(&self) -> StoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }

    async fn run_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("lock poisoned");
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl ObjectDatabase for SqliteDatabase {
    async fn get_all(&self, ids: &[BaseId]) -> StoreResult<Vec<Option<Item>>> {
        self.check_live()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<BaseId> = ids.to_vec();
        self.run_blocking(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT document, size FROM objects WHERE base_id = ?1")?;
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                let row = stmt
                    .query_row(params![id.as_str()], |row| {
                        let document: String = row.get(0)?;
                        let size: Option<i64> = row.get(1)?;
                        Ok((document, size))
                    })
                    .optional()?;
                match row {
                    Some((document, size)) => {
                        let base: Base = serde_json::from_str(&document)
                            .map_err(|e| StoreError::Serialization(e.to_string()))?;
                        out.push(Some(Item {
                            base_id: id.clone(),
                            base: Some(base),
                            size: size.map(|s| s as u64),
                        }));
                    }
                    None => out.push(None),
                }
            }
            Ok(out)
        })
        .await
    }

    async fn put_all(&self, items: &[Item]) -> StoreResult<()> {
        self.check_live()?;
        // Unresolved items carry nothing durable; skip them.
        let rows: Vec<(BaseId, String, Option<i64>)> = items
            .iter()
            .filter_map(|item| {
                item.base.as_ref().map(|base| {
                    serde_json::to_string(base)
                        .map(|doc| (item.base_id.clone(), doc, item.size.map(|s| s as i64)))
                        .map_err(|e| StoreError::Serialization(e.to_string()))
                })
            })
            .collect::<StoreResult<_>>()?;
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO objects (base_id, document, size) VALUES (?1, ?2, ?3)",
            )?;
            conn.execute_batch("BEGIN")?;
            for (id, document, size) in &rows {
                if let Err(e) = stmt.execute(params![id.as_str(), document, size]) {
                    conn.execute_batch("ROLLBACK")?;
                    return Err(e.into());
                }
            }
            conn.execute_batch("COMMIT")?;
            Ok(())
        })
        .await?;
        debug!(count, "persisted object batch");
        Ok(())
    }

    async fn warm_up(&self) -> StoreResult<()> {
        self.check_live()?;
        // Idempotent: a single throwaway query establishes the connection
        // before the first real batch touches it.
        if self.warmed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.run_blocking(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn dispose(&self) -> StoreResult<()> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
