//! 会话快照存储
//!
//! 快照按 pipelineId 存放，另有一个「活跃指针」键记录最近活跃的 pipelineId。
//! 两者都带固定 TTL，只在读取时惰性检查：过期记录在访问时删除，不做后台清扫。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kv::KvStore;
use crate::core::state::PipelineSession;
use crate::core::PipelineError;

/// 时间来源（测试中可手动拨动）
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 手动时钟
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// 落盘记录：写入时间 + TTL + 载荷
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    saved_at_ms: i64,
    ttl_ms: i64,
    value: Value,
}

impl Envelope {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.saved_at_ms.saturating_add(self.ttl_ms)
    }
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    prefix: String,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            ttl,
            prefix: "conductor".to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn session_key(&self, pipeline_id: &str) -> String {
        format!("{}:pipeline:{}", self.prefix, pipeline_id)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    async fn write(&self, key: &str, value: Value, now_ms: i64) -> Result<(), PipelineError> {
        let envelope = Envelope {
            saved_at_ms: now_ms,
            ttl_ms: self.ttl.as_millis() as i64,
            value,
        };
        self.kv.put(key, &serde_json::to_string(&envelope)?).await
    }

    /// 读取未过期的载荷；过期或损坏的记录在此删除
    async fn read_live(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping unreadable record {}: {}", key, e);
                self.kv.delete(key).await?;
                return Ok(None);
            }
        };
        if envelope.is_expired(self.clock.now_ms()) {
            tracing::info!("Record {} expired, deleting", key);
            self.kv.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    /// 写入快照并更新活跃指针；尚未分配 pipelineId 的会话不落盘。返回写入时间
    pub async fn save(&self, session: &PipelineSession) -> Result<Option<i64>, PipelineError> {
        let Some(pipeline_id) = session.pipeline_id.as_deref() else {
            return Ok(None);
        };
        let now_ms = self.clock.now_ms();
        let mut snapshot = session.clone();
        snapshot.saved_at_ms = Some(now_ms);
        self.write(
            &self.session_key(pipeline_id),
            serde_json::to_value(&snapshot)?,
            now_ms,
        )
        .await?;
        self.write(&self.active_key(), Value::String(pipeline_id.to_string()), now_ms)
            .await?;
        Ok(Some(now_ms))
    }

    pub async fn load(&self, pipeline_id: &str) -> Result<Option<PipelineSession>, PipelineError> {
        let Some(value) = self.read_live(&self.session_key(pipeline_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    /// 经活跃指针读取最近的会话；指针悬空时一并删除
    pub async fn load_active(&self) -> Result<Option<PipelineSession>, PipelineError> {
        let active_key = self.active_key();
        let Some(Value::String(pipeline_id)) = self.read_live(&active_key).await? else {
            return Ok(None);
        };
        let session = self.load(&pipeline_id).await?;
        if session.is_none() {
            self.kv.delete(&active_key).await?;
        }
        Ok(session)
    }

    /// 删除快照；活跃指针指向它时一并删除
    pub async fn clear(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        self.kv.delete(&self.session_key(pipeline_id)).await?;
        let active_key = self.active_key();
        if let Some(Value::String(active)) = self.read_live(&active_key).await? {
            if active == pipeline_id {
                self.kv.delete(&active_key).await?;
            }
        }
        Ok(())
    }
}
