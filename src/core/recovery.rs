//! 错误路由
//!
//! 根据 PipelineError 类型返回 Surface，供编排器决定是弹出重试提议、警告、校验失败提示还是静默。

use crate::core::{PipelineError, Surface};

/// 语义化错误路由：将错误映射为用户可见的呈现方式
#[derive(Debug, Default)]
pub struct ErrorRouter {
    /// 诊断模式下过期事件只记日志，仍不呈现给用户
    diagnostic: bool,
}

impl ErrorRouter {
    pub fn new(diagnostic: bool) -> Self {
        Self { diagnostic }
    }

    pub fn route(&self, err: &PipelineError) -> Surface {
        match err {
            PipelineError::ProviderTerminal {
                stage,
                message,
                available_providers,
            } if !available_providers.is_empty() => Surface::RetryOffer {
                stage: *stage,
                message: message.clone(),
            },
            PipelineError::ProviderTerminal { message, .. } => Surface::Banner {
                message: message.clone(),
            },
            PipelineError::ProviderWarning { message, .. } => Surface::Warning {
                message: message.clone(),
            },
            PipelineError::Validation(msg) => Surface::ValidationFailed {
                message: msg.clone(),
            },
            PipelineError::Schema(msg) => Surface::SchemaRecovery {
                message: msg.clone(),
            },
            PipelineError::StaleEvent { epoch, current } => {
                if self.diagnostic {
                    tracing::info!("Stale event dropped (epoch {} vs current {})", epoch, current);
                }
                Surface::Silent
            }
            PipelineError::Persistence(msg) => Surface::Degraded {
                message: msg.clone(),
            },
            PipelineError::Restore(msg) => Surface::RestoreFailed {
                message: msg.clone(),
            },
            other => Surface::Banner {
                message: other.to_string(),
            },
        }
    }
}
