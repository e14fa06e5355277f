use std::collections::VecDeque;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::error::{LfssError, LfssResult};

/// A transaction hook with three callbacks, mirroring the source's
/// `TransactionHookBase`: `on_before_commit` may fail the transaction
/// (forcing a rollback), `on_commit`/`on_rollback` are best-effort and
/// must not panic across the boundary back into async code.
pub trait TransactionHook: Send + 'static {
    fn on_before_commit(&mut self, _conn: &Connection) -> rusqlite::Result<()> {
        Ok(())
    }
    fn on_commit(self)
    where
        Self: Sized,
    {
    }
    fn on_rollback(self)
    where
        Self: Sized,
    {
    }
}

/// No-op hook for operations that don't need deferred work.
pub struct NoHook;
impl TransactionHook for NoHook {}

struct Slots {
    semaphore: Arc<Semaphore>,
    queue: AsyncMutex<VecDeque<Connection>>,
}

/// One writer connection (mutex-protected) and N reader connections
/// (semaphore-bounded), over a single SQLite file in WAL mode —
/// the statically-typed equivalent of the source's single cursor
/// abstraction, split into [`ReadCursor`] and [`WriteCursor`] so the
/// single-writer discipline is enforced by the type system.
pub struct ConnectionPool {
    writer: Arc<Slots>,
    readers: Arc<Slots>,
}

impl ConnectionPool {
    /// Opens `index_path` as the pool's main database and attaches
    /// `blobs_path` under the schema name `blobs` on every connection —
    /// the same shape as the source's writer/reader connections each
    /// attaching a second file for inline blob payloads.
    pub fn open(index_path: &std::path::Path, blobs_path: &std::path::Path, reader_pool_size: usize) -> LfssResult<Self> {
        std::fs::create_dir_all(index_path.parent().unwrap_or(std::path::Path::new("."))).ok();

        let writer_conn = open_conn(index_path, blobs_path)?;
        let mut writer_queue = VecDeque::new();
        writer_queue.push_back(writer_conn);

        let mut reader_queue = VecDeque::new();
        for _ in 0..reader_pool_size.max(1) {
            reader_queue.push_back(open_conn(index_path, blobs_path)?);
        }

        Ok(ConnectionPool {
            writer: Arc::new(Slots {
                semaphore: Arc::new(Semaphore::new(1)),
                queue: AsyncMutex::new(writer_queue),
            }),
            readers: Arc::new(Slots {
                semaphore: Arc::new(Semaphore::new(reader_pool_size.max(1))),
                queue: AsyncMutex::new(reader_queue),
            }),
        })
    }

    pub async fn read_cursor(&self) -> ReadCursor {
        let permit = self.readers.semaphore.clone().acquire_owned().await.expect("semaphore closed");
        let conn = self.readers.queue.lock().await.pop_front().expect("reader slot invariant");
        ReadCursor {
            conn: Some(conn),
            slots: self.readers.clone(),
            _permit: permit,
        }
    }

    pub async fn write_cursor(&self) -> WriteCursor {
        let permit = self.writer.semaphore.clone().acquire_owned().await.expect("semaphore closed");
        let conn = self.writer.queue.lock().await.pop_front().expect("writer slot invariant");
        WriteCursor {
            conn: Some(conn),
            slots: self.writer.clone(),
            _permit: permit,
        }
    }

    /// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`/`ROLLBACK`, with a
    /// hook invoked around the commit boundary. "database is locked"
    /// and reentrant-transaction failures surface as their own error
    /// kinds so the HTTP layer can answer 503.
    pub async fn transaction<H, F, R>(&self, hook: H, f: F) -> LfssResult<R>
    where
        H: TransactionHook,
        F: FnOnce(&Connection, &mut H) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut cursor = self.write_cursor().await;
        let conn = cursor.conn.take().expect("write cursor just acquired");

        let (conn, hook, result) = tokio::task::spawn_blocking(move || {
            let mut hook = hook;
            let mut result = conn.execute_batch("BEGIN IMMEDIATE").and_then(|_| f(&conn, &mut hook));
            if result.is_ok() {
                if let Err(e) = hook.on_before_commit(&conn) {
                    result = Err(e);
                }
            }
            if result.is_ok() {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    result = Err(e);
                }
            }
            if result.is_err() {
                let _ = conn.execute_batch("ROLLBACK");
            }
            (conn, hook, result)
        })
        .await
        .expect("writer worker panicked");

        cursor.conn = Some(conn);
        drop(cursor);

        match result {
            Ok(v) => {
                hook.on_commit();
                Ok(v)
            }
            Err(e) => {
                hook.on_rollback();
                Err(LfssError::from_sqlite(e))
            }
        }
    }
}

fn open_conn(index_path: &std::path::Path, blobs_path: &std::path::Path) -> LfssResult<Connection> {
    let conn = Connection::open(index_path).map_err(LfssError::from_sqlite)?;
    conn.pragma_update(None, "journal_mode", "WAL").map_err(LfssError::from_sqlite)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(LfssError::from_sqlite)?;
    conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(LfssError::from_sqlite)?;
    conn.execute(
        "ATTACH DATABASE ?1 AS blobs",
        rusqlite::params![blobs_path.to_string_lossy().to_string()],
    )
    .map_err(LfssError::from_sqlite)?;
    Ok(conn)
}

/// A scoped read-only handle. Must not be held across a suspension
/// that depends on acquiring another cursor, or a deadlock is
/// possible against the bounded reader semaphore.
pub struct ReadCursor {
    conn: Option<Connection>,
    slots: Arc<Slots>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl ReadCursor {
    pub async fn with<F, R>(&mut self, f: F) -> LfssResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.take().expect("cursor closed");
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let r = f(&conn);
            (conn, r)
        })
        .await
        .expect("reader worker panicked");
        self.conn = Some(conn);
        result.map_err(LfssError::from_sqlite)
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Best-effort: the queue mutex is uncontended on return
            // since the owning permit (held until this point) bounds
            // concurrent holders to the semaphore count.
            if let Ok(mut q) = self.slots.queue.try_lock() {
                q.push_back(conn);
            }
        }
    }
}

/// A scoped single-writer handle for non-transactional statements
/// (e.g. debounce flushes). Transactional writers should prefer
/// [`ConnectionPool::transaction`].
pub struct WriteCursor {
    conn: Option<Connection>,
    slots: Arc<Slots>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl WriteCursor {
    pub async fn with<F, R>(&mut self, f: F) -> LfssResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.take().expect("cursor closed");
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let r = f(&conn);
            (conn, r)
        })
        .await
        .expect("writer worker panicked");
        self.conn = Some(conn);
        result.map_err(LfssError::from_sqlite)
    }
}

impl Drop for WriteCursor {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut q) = self.slots.queue.try_lock() {
                q.push_back(conn);
            }
        }
    }
}
