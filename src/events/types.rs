//! 事件流记录：线上格式与解码后的封闭标签集合
//!
//! 线上记录为 `{id, sequence?, type, payload}`；`type` 不在已知集合内的事件只记日志并忽略。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::{Artifact, ArtifactStage, Operation, TokenUsage};
use crate::core::PipelineError;

/// 线上事件记录（同一 pipeline 内 id 单调递增）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub id: u64,
    #[serde(default)]
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// 已知的事件类型标签
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "stage_started",
    "stage_progress",
    "stage_completed",
    "gate_started",
    "gate_completed",
    "stage_failed",
    "pipeline_status",
];

impl PipelineEvent {
    pub fn new(id: u64, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            sequence: id,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// 解码为 EventKind；未知类型返回 Ok(None)，已知类型但载荷不合法返回 Validation
    pub fn decode(&self) -> Result<Option<EventKind>, PipelineError> {
        if !KNOWN_EVENT_TYPES.contains(&self.event_type.as_str()) {
            return Ok(None);
        }
        let tagged = serde_json::json!({
            "type": self.event_type,
            "payload": self.payload,
        });
        serde_json::from_value(tagged).map(Some).map_err(|e| {
            PipelineError::Validation(format!("malformed {} payload: {e}", self.event_type))
        })
    }
}

/// stage_progress 载荷：各字段按需出现
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressPayload {
    pub stage: Operation,
    #[serde(default)]
    pub iteration: Option<u32>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tokens_in: Option<u64>,
    #[serde(default)]
    pub tokens_out: Option<u64>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

/// stage_completed 载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionPayload {
    pub stage: Operation,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// fix 阶段修正的目标阶段，缺省为 spec
    #[serde(default)]
    pub target: Option<ArtifactStage>,
}

/// 校验门结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    SchemaError,
}

/// 解码后的事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    StageStarted {
        stage: Operation,
        #[serde(default)]
        run_id: Option<String>,
    },
    StageProgress(ProgressPayload),
    StageCompleted(CompletionPayload),
    GateStarted {
        run_id: String,
    },
    GateCompleted {
        #[serde(default)]
        run_id: Option<String>,
        status: GateOutcome,
        #[serde(default)]
        message: Option<String>,
    },
    StageFailed {
        stage: Operation,
        message: String,
        #[serde(default)]
        terminal: bool,
        #[serde(default)]
        available_providers: Vec<String>,
    },
    PipelineStatus {
        status: String,
        #[serde(default)]
        stage: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
    },
}

impl EventKind {
    /// 与长任务调用绑定的事件所属的操作（用于 epoch 盖章）
    pub fn invocation(&self) -> Option<Operation> {
        match self {
            EventKind::StageStarted { stage, .. } | EventKind::StageFailed { stage, .. } => {
                Some(stage.invocation())
            }
            EventKind::StageProgress(p) => Some(p.stage.invocation()),
            EventKind::StageCompleted(c) => Some(c.stage.invocation()),
            EventKind::GateStarted { .. }
            | EventKind::GateCompleted { .. }
            | EventKind::PipelineStatus { .. } => None,
        }
    }
}
