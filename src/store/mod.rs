//! 会话持久化：键值存储后端与带 TTL 的会话快照

pub mod kv;
pub mod session_store;

use std::sync::Arc;

pub use kv::{KvStore, MemoryKv};
#[cfg(feature = "sqlite")]
pub use kv::SqliteKv;
pub use session_store::{Clock, ManualClock, SessionStore, SystemClock};

use crate::config::{SessionBackend, SessionSection};

/// 按配置创建键值存储；SQLite 打开失败时回退到内存存储
pub fn create_kv_store(section: &SessionSection) -> Arc<dyn KvStore> {
    #[cfg(feature = "sqlite")]
    if section.backend == SessionBackend::Sqlite {
        match SqliteKv::open(&section.db_path) {
            Ok(store) => {
                tracing::info!("Using sqlite session store: {:?}", section.db_path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "sqlite"))]
    if section.backend == SessionBackend::Sqlite {
        tracing::warn!("Sqlite session store requested but sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemoryKv::new())
}

/// 按配置创建会话存储
pub fn create_session_store(section: &SessionSection) -> SessionStore {
    SessionStore::new(create_kv_store(section), section.ttl()).with_prefix(section.key_prefix.clone())
}
