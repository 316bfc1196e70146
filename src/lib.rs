//! Conductor - 代码生成流水线的客户端编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、执行守卫、对账、重试、修正回环检测、主控循环
//! - **events**: 事件线上格式、幂等消费者、SSE 订阅
//! - **observability**: 日志初始化
//! - **remote**: 对账与步骤提交端点
//! - **store**: 带 TTL 的会话快照存储

pub mod config;
pub mod core;
pub mod events;
pub mod observability;
pub mod remote;
pub mod store;

pub use crate::core::{Command, PipelineError, PipelineOrchestrator};
