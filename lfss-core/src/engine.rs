use std::sync::Arc;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::debounce::DebounceQueues;
use crate::error::LfssResult;
use crate::pool::ConnectionPool;
use crate::schema;

/// The process-wide lifecycle object named in the design notes: the
/// connection pool, blob store, debounce queues and config, held by
/// the HTTP adapter for the life of the service and passed explicitly
/// to every operation rather than reached for as a hidden global.
pub struct Engine {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) lock_pool: ConnectionPool,
    pub(crate) blobs: BlobStore,
    pub config: Config,
    pub(crate) debounce: DebounceQueues,
}

impl Engine {
    pub async fn open(config: Config) -> LfssResult<Arc<Self>> {
        std::fs::create_dir_all(&config.data_home)?;

        let pool = Arc::new(ConnectionPool::open(
            &config.index_db_path(),
            &config.blobs_db_path(),
            config.reader_pool_size,
        )?);

        {
            let mut cursor = pool.write_cursor().await;
            cursor
                .with(|conn| {
                    schema::init_index_schema(conn)
                        .and_then(|_| schema::init_blobs_schema(conn))
                        .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))
                })
                .await?;
        }

        // The lock table lives in its own file and is recreated empty
        // on every startup, so no lock survives a restart.
        let lock_pool = ConnectionPool::open(&config.lock_db_path(), &config.lock_db_path(), 1)?;
        {
            let mut cursor = lock_pool.write_cursor().await;
            cursor
                .with(|conn| {
                    schema::init_lock_schema_fresh(conn)
                        .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))
                })
                .await?;
        }

        let blobs = BlobStore::new(&config);
        let debounce = DebounceQueues::spawn(pool.clone());

        Ok(Arc::new(Engine { pool, lock_pool, blobs, config, debounce }))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn debounce(&self) -> &DebounceQueues {
        &self.debounce
    }
}
