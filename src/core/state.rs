//! 流水线会话数据模型与 UI 投影
//!
//! PipelineSession 是唯一的根聚合，只由 PipelineStateMachine 持有并修改；
//! UI 只拿到轻量的 UiState 投影（步骤、加载态、条件提示、重试提议）。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::error::Surface;
use crate::core::guard::Epoch;
use crate::core::retry::RetryOffer;

/// 向导位置（0..=4）
pub type Step = u8;

pub const STEP_TASK: Step = 0;
pub const STEP_PLAN: Step = 1;
pub const STEP_SPEC: Step = 2;
pub const STEP_VALIDATE: Step = 3;
pub const STEP_EXECUTE: Step = 4;

/// 远端 worker 执行的一类长任务；discovery 属于 plan 调用的一部分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Discovery,
    Plan,
    Spec,
    Fix,
    Execute,
}

impl Operation {
    /// 该操作所属的向导步骤
    pub fn step(self) -> Step {
        match self {
            Operation::Discovery | Operation::Plan => STEP_PLAN,
            Operation::Spec => STEP_SPEC,
            Operation::Fix => STEP_VALIDATE,
            Operation::Execute => STEP_EXECUTE,
        }
    }

    /// 事件归属的调用：discovery 事件由 plan 调用产生
    pub fn invocation(self) -> Operation {
        match self {
            Operation::Discovery => Operation::Plan,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Discovery => "discovery",
            Operation::Plan => "plan",
            Operation::Spec => "spec",
            Operation::Fix => "fix",
            Operation::Execute => "execute",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产出产物集合的逻辑阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStage {
    Plan,
    Spec,
    Discovery,
}

impl ArtifactStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactStage::Plan => "plan",
            ArtifactStage::Spec => "spec",
            ArtifactStage::Discovery => "discovery",
        }
    }
}

/// Plan 步骤内的子状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStep {
    Discovery,
    Planner,
}

/// 校验门状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    #[default]
    None,
    Running,
    Passed,
    Failed,
    SchemaError,
}

/// 单个步骤使用的 provider / model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    pub provider: String,
    pub model: String,
}

impl StepConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// 产物：文件名在所属阶段内唯一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub content: String,
}

impl Artifact {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// 阶段完成时上报的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// 执行进度字段：只有当前 epoch 的事件可以修改
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionProgress {
    pub iteration: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub last_tool: Option<String>,
    pub thinking: Option<String>,
    pub elapsed_ms: u64,
}

/// 正在进行的长任务调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub operation: Operation,
    pub epoch: Epoch,
    pub started_at_ms: i64,
}

/// 流水线会话根聚合（持久化为 camelCase JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSession {
    /// 首次提交成功后由远端分配
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub step: Step,
    #[serde(default)]
    pub substep: Option<SubStep>,
    #[serde(default)]
    pub completed_steps: BTreeSet<Step>,
    #[serde(default)]
    pub per_step_config: BTreeMap<Step, StepConfig>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactStage, Vec<Artifact>>,
    #[serde(default)]
    pub usage: BTreeMap<Operation, TokenUsage>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub gate_status: GateStatus,
    #[serde(default)]
    pub gate_message: Option<String>,
    #[serde(default)]
    pub last_event_id: u64,
    #[serde(default)]
    pub last_sequence: u64,
    #[serde(default)]
    pub pipeline_status: Option<String>,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
    #[serde(default)]
    pub pipeline_progress: Option<f64>,
    #[serde(default)]
    pub fix_loop: bool,
    #[serde(default)]
    pub saved_at_ms: Option<i64>,

    // 以下字段只在进程内有效，不写入快照
    #[serde(skip)]
    pub loading: bool,
    #[serde(skip)]
    pub in_flight: Option<InFlight>,
    #[serde(skip)]
    pub progress: ExecutionProgress,
}

impl Default for PipelineSession {
    fn default() -> Self {
        Self {
            pipeline_id: None,
            task: None,
            step: STEP_TASK,
            substep: None,
            completed_steps: BTreeSet::new(),
            per_step_config: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            usage: BTreeMap::new(),
            run_id: None,
            gate_status: GateStatus::None,
            gate_message: None,
            last_event_id: 0,
            last_sequence: 0,
            pipeline_status: None,
            pipeline_stage: None,
            pipeline_progress: None,
            fix_loop: false,
            saved_at_ms: None,
            loading: false,
            in_flight: None,
            progress: ExecutionProgress::default(),
        }
    }
}

impl PipelineSession {
    pub fn artifacts_of(&self, stage: ArtifactStage) -> &[Artifact] {
        self.artifacts
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_complete(&self, step: Step) -> bool {
        self.completed_steps.contains(&step)
    }
}

/// 远端状态中视为终态的取值
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "passed" | "failed" | "completed")
}

/// UI 看到的「投影」状态
#[derive(Debug, Clone, Default, Serialize)]
pub struct UiState {
    pub pipeline_id: Option<String>,
    pub step: Step,
    pub substep: Option<SubStep>,
    pub completed_steps: Vec<Step>,
    pub gate_status: GateStatus,
    pub loading: bool,
    pub in_flight: Option<Operation>,
    pub progress: ExecutionProgress,
    pub pipeline_status: Option<String>,
    pub fix_loop: bool,
    pub condition: Option<Surface>,
    pub retry_offer: Option<RetryOffer>,
}

impl UiState {
    /// 将会话与当前的条件提示 / 重试提议合并为 UI 可渲染的状态
    pub fn project(
        session: &PipelineSession,
        condition: Option<Surface>,
        retry_offer: Option<RetryOffer>,
    ) -> Self {
        Self {
            pipeline_id: session.pipeline_id.clone(),
            step: session.step,
            substep: session.substep,
            completed_steps: session.completed_steps.iter().copied().collect(),
            gate_status: session.gate_status,
            loading: session.loading,
            in_flight: session.in_flight.map(|f| f.operation),
            progress: session.progress.clone(),
            pipeline_status: session.pipeline_status.clone(),
            fix_loop: session.fix_loop,
            condition,
            retry_offer,
        }
    }
}
