//! 执行守卫：长任务调用的代际计数
//!
//! 每次发起长任务调用递增一次 epoch；事件分发时带着调用开始时的 epoch，
//! 若已不是当前值，则该事件只记日志，不修改状态。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 调用代际
pub type Epoch = u64;

/// 可跨任务共享的 epoch 计数器（克隆共享同一计数）
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    epoch: Arc<AtomicU64>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子递增并返回新的 epoch，调用方将其记为本次调用所属的 epoch
    pub fn begin_execution(&self) -> Epoch {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current_epoch() == epoch
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    /// 会话重置时归零
    pub fn reset(&self) {
        self.epoch.store(0, Ordering::SeqCst);
    }
}
