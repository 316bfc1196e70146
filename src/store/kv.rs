//! 键值存储抽象层
//!
//! 定义统一的字符串键值接口，支持内存和 SQLite 两种实现。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::PipelineError;

/// 键值存储接口
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), PipelineError>;

    async fn delete(&self, key: &str) -> Result<(), PipelineError>;
}

/// 内存键值存储（进程退出即丢失）
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), PipelineError> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_impl::SqliteKv;

#[cfg(feature = "sqlite")]
mod sqlite_impl {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use tokio::sync::Mutex;

    use super::KvStore;
    use crate::core::PipelineError;

    fn db_err(e: rusqlite::Error) -> PipelineError {
        PipelineError::Persistence(e.to_string())
    }

    /// SQLite 键值存储：单表 `kv(key, value, updated_at)`
    pub struct SqliteKv {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteKv {
        /// 打开（或创建）数据库文件；父目录不存在时自动创建
        pub fn open(db_path: impl AsRef<Path>) -> Result<Self, PipelineError> {
            let db_path = db_path.as_ref();
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::Persistence(e.to_string()))?;
            }
            let conn = Connection::open(db_path).map_err(db_err)?;
            Self::init(conn)
        }

        pub fn in_memory() -> Result<Self, PipelineError> {
            Self::init(Connection::open_in_memory().map_err(db_err)?)
        }

        fn init(conn: Connection) -> Result<Self, PipelineError> {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous  = NORMAL;
                 CREATE TABLE IF NOT EXISTS kv (
                    key        TEXT PRIMARY KEY,
                    value      TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );",
            )
            .map_err(db_err)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }
    }

    #[async_trait]
    impl KvStore for SqliteKv {
        async fn get(&self, key: &str) -> Result<Option<String>, PipelineError> {
            let conn = self.conn.lock().await;
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)
        }

        async fn put(&self, key: &str, value: &str) -> Result<(), PipelineError> {
            let conn = self.conn.lock().await;
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map_err(db_err)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), PipelineError> {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(db_err)?;
            Ok(())
        }
    }
}
