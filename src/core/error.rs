//! 流水线错误类型与呈现方式
//!
//! 与 ErrorRouter 配合：根据 PipelineError 决定弹出重试提议 / 警告 / 校验失败 / Schema 恢复 / 通用横幅 / 静默。

use serde::Serialize;
use thiserror::Error;

use crate::core::state::{Operation, Step};

/// 编排过程中可能出现的错误（网络、provider、校验、过期事件、持久化等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// 本地重试耗尽后才会出现
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },

    #[error("{operation} submission timed out after {secs}s")]
    Timeout { operation: Operation, secs: u64 },

    /// 远端 worker 无法用当前 provider 继续
    #[error("Provider failed during {stage}: {message}")]
    ProviderTerminal {
        stage: Operation,
        message: String,
        available_providers: Vec<String>,
    },

    /// worker 可能仍在运行
    #[error("Provider warning during {stage}: {message}")]
    ProviderWarning { stage: Operation, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    /// 校验门返回的 schema 类校验错误
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Stale event from epoch {epoch} (current {current})")]
    StaleEvent { epoch: u64, current: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("{operation} is not available at step {step}")]
    StepLocked { operation: Operation, step: Step },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Could not restore session: {0}")]
    Restore(String),
}

impl PipelineError {
    /// 终态条件：必须清除进行中的进度并结束加载态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineError::Network { .. }
                | PipelineError::Timeout { .. }
                | PipelineError::ProviderTerminal { .. }
                | PipelineError::Validation(_)
                | PipelineError::Schema(_)
        )
    }

    /// 仅网络类错误允许本地重试
    ///
    /// 提交超时单独成一个变体而不是并入 `Network`：呈现方式相同（可重试横幅），
    /// 但状态机要靠它让该次调用的 epoch 失效。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Network { .. } | PipelineError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Decode(e.to_string())
    }
}

/// 错误最终呈现给用户的方式
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Surface {
    /// 终态 provider 错误：展示可选 provider，由用户确认后重试
    RetryOffer { stage: Operation, message: String },
    /// 非阻塞提示，状态不变
    Warning { message: String },
    /// 具名的校验失败，不并入通用横幅
    ValidationFailed { message: String },
    /// 校验门的 Schema 错误，进入专门的可恢复状态
    SchemaRecovery { message: String },
    /// 通用错误横幅
    Banner { message: String },
    /// 会话恢复失败，本地状态保持原样
    RestoreFailed { message: String },
    /// 仅跨重载持久性丢失，会话继续可用
    Degraded { message: String },
    /// 不展示
    Silent,
}
