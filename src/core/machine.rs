//! 流水线状态机
//!
//! 会话状态的唯一修改入口：实时事件与对账回放都经由 `apply` 进入，
//! 步骤只通过「领先才推进」规则前进，已完成集合只增不减（显式 reset 除外）。

use std::collections::BTreeMap;

use crate::core::guard::{Epoch, ExecutionGuard};
use crate::core::state::{
    is_terminal_status, Artifact, ArtifactStage, GateStatus, InFlight, Operation,
    PipelineSession, Step, StepConfig, SubStep, STEP_EXECUTE, STEP_PLAN, STEP_SPEC,
    STEP_TASK, STEP_VALIDATE,
};
use crate::core::PipelineError;
use crate::events::types::{CompletionPayload, EventKind, GateOutcome, ProgressPayload};

/// 各阶段必须出现的产物文件名
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    pub required: BTreeMap<ArtifactStage, Vec<String>>,
}

impl ValidationRules {
    pub fn require(mut self, stage: ArtifactStage, filename: impl Into<String>) -> Self {
        self.required.entry(stage).or_default().push(filename.into());
        self
    }
}

/// 单个事件作用于状态机后的结果，编排器据此触发后续动作
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// 状态已修改
    Changed,
    /// 事件合法但没有可修改的内容
    Unchanged,
    /// 事件 id 已应用过，直接丢弃
    Duplicate,
    /// 未知事件类型，只记日志
    Ignored,
    /// epoch 已过期：事件只记日志
    Stale { epoch: Epoch, current: Epoch },
    /// 某个调用已完成
    Completed(Operation),
    /// 一次修正 pass 完成，前后产物用于回环检测
    FixPass {
        stage: ArtifactStage,
        before: Vec<Artifact>,
        after: Vec<Artifact>,
    },
    /// 事件携带的错误（终态 provider 错误 / 非终态警告 / schema 错误）
    Failed(PipelineError),
    /// 远端进入终态
    Terminal { status: String },
}

/// 远端权威状态摘要（对账时合并）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteProgress {
    pub step: Step,
    pub completed_steps: Vec<Step>,
    pub pipeline_status: Option<String>,
    pub pipeline_stage: Option<String>,
    pub pipeline_progress: Option<f64>,
}

pub struct PipelineStateMachine {
    session: PipelineSession,
    guard: ExecutionGuard,
    rules: ValidationRules,
    /// 每次修改递增，编排器据此决定是否写快照
    revision: u64,
}

impl PipelineStateMachine {
    pub fn new(rules: ValidationRules) -> Self {
        Self::from_snapshot(PipelineSession::default(), rules)
    }

    /// 从持久化快照恢复；进程内字段（加载态、进行中调用）总是从空开始
    pub fn from_snapshot(session: PipelineSession, rules: ValidationRules) -> Self {
        Self {
            session,
            guard: ExecutionGuard::new(),
            rules,
            revision: 0,
        }
    }

    pub fn session(&self) -> &PipelineSession {
        &self.session
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    /// 领先才推进：candidate 不大于当前步骤时什么也不做
    pub fn advance_step(&mut self, candidate: Step) {
        if candidate > STEP_EXECUTE {
            tracing::warn!("Ignoring out-of-range step candidate {}", candidate);
            return;
        }
        if candidate > self.session.step {
            tracing::debug!("Advancing step {} -> {}", self.session.step, candidate);
            self.session.step = candidate;
            self.touch();
        }
    }

    pub fn mark_complete(&mut self, step: Step) {
        if step > STEP_EXECUTE {
            tracing::warn!("Ignoring out-of-range completed step {}", step);
            return;
        }
        if self.session.completed_steps.insert(step) {
            self.touch();
        }
    }

    /// 清空会话并将 epoch 归零；返回被清除的 pipeline id，调用方据此删除持久化快照
    pub fn reset(&mut self) -> Option<String> {
        let cleared = self.session.pipeline_id.take();
        self.session = PipelineSession::default();
        self.guard.reset();
        self.touch();
        tracing::info!("Pipeline session reset (was {:?})", cleared);
        cleared
    }

    pub fn set_pipeline_id(&mut self, pipeline_id: impl Into<String>) {
        let pipeline_id = pipeline_id.into();
        if self.session.pipeline_id.as_deref() != Some(pipeline_id.as_str()) {
            self.session.pipeline_id = Some(pipeline_id);
            self.touch();
        }
    }

    pub fn set_task(&mut self, task: impl Into<String>) {
        self.session.task = Some(task.into());
        self.touch();
    }

    pub fn set_step_config(&mut self, step: Step, config: StepConfig) {
        self.session.per_step_config.insert(step, config);
        self.touch();
    }

    pub fn set_fix_loop(&mut self, detected: bool) {
        if self.session.fix_loop != detected {
            self.session.fix_loop = detected;
            self.touch();
        }
    }

    pub fn mark_saved(&mut self, saved_at_ms: i64) {
        // 快照时间不算状态修改，避免写入后再次触发写入
        self.session.saved_at_ms = Some(saved_at_ms);
    }

    /// 发起一次长任务调用：递增 epoch、记录进行中调用、进入加载态
    pub fn begin_invocation(&mut self, operation: Operation) -> Epoch {
        let epoch = self.guard.begin_execution();
        self.session.in_flight = Some(InFlight {
            operation,
            epoch,
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        });
        self.session.loading = true;
        self.session.progress = Default::default();
        if operation == Operation::Plan {
            self.advance_step(STEP_PLAN);
            self.session.substep = Some(SubStep::Discovery);
        }
        self.touch();
        tracing::info!("Began {} invocation at epoch {}", operation, epoch);
        epoch
    }

    /// 当前记录的某操作的调用 epoch
    pub fn in_flight_epoch(&self, operation: Operation) -> Option<Epoch> {
        self.session
            .in_flight
            .filter(|f| f.operation == operation)
            .map(|f| f.epoch)
    }

    /// 本地侧的终态失败（提交超时、网络重试耗尽、provider 拒绝）
    ///
    /// 步骤与已完成集合保持不变；只有 epoch 仍为当前时才清除进行中字段。
    pub fn fail_invocation(&mut self, epoch: Epoch, err: &PipelineError) {
        if !self.guard.is_current(epoch) {
            tracing::debug!("Ignoring failure of superseded epoch {}: {}", epoch, err);
            return;
        }
        self.settle(None);
        if matches!(
            err,
            PipelineError::ProviderTerminal { .. }
                | PipelineError::Network { .. }
                | PipelineError::Timeout { .. }
        ) {
            self.session.gate_status = GateStatus::Failed;
        }
        if matches!(err, PipelineError::Timeout { .. }) {
            // 远端调用并未取消，之后到达的事件一律按过期丢弃
            self.guard.begin_execution();
        }
        self.touch();
    }

    /// 加载态回到空闲（对账发现远端终态时）
    pub fn set_idle(&mut self) {
        if self.session.loading || self.session.in_flight.is_some() {
            self.session.loading = false;
            self.session.in_flight = None;
            self.touch();
        }
    }

    /// 水位只增不减
    pub fn record_watermark(&mut self, event_id: u64, sequence: u64) {
        let mut changed = false;
        if event_id > self.session.last_event_id {
            self.session.last_event_id = event_id;
            changed = true;
        }
        if sequence > self.session.last_sequence {
            self.session.last_sequence = sequence;
            changed = true;
        }
        if changed {
            self.touch();
        }
    }

    /// 合并远端权威进度：步骤按领先规则推进，已完成集合取并集
    pub fn merge_remote(&mut self, remote: &RemoteProgress) {
        self.advance_step(remote.step);
        for step in &remote.completed_steps {
            self.mark_complete(*step);
        }
        self.set_remote_status(
            remote.pipeline_status.clone(),
            remote.pipeline_stage.clone(),
            remote.pipeline_progress,
        );
    }

    fn set_remote_status(
        &mut self,
        status: Option<String>,
        stage: Option<String>,
        progress: Option<f64>,
    ) {
        let session = &mut self.session;
        if session.pipeline_status != status
            || session.pipeline_stage != stage
            || session.pipeline_progress != progress
        {
            session.pipeline_status = status;
            session.pipeline_stage = stage;
            session.pipeline_progress = progress;
            self.touch();
        }
    }

    fn is_current(&self, stamp: Option<Epoch>) -> bool {
        stamp.map_or(true, |epoch| self.guard.is_current(epoch))
    }

    fn stale(&self, stamp: Option<Epoch>) -> Applied {
        Applied::Stale {
            epoch: stamp.unwrap_or_default(),
            current: self.guard.current_epoch(),
        }
    }

    /// 结束进行中的调用；operation 为 None 时无条件结束
    fn settle(&mut self, operation: Option<Operation>) {
        let matches = match (self.session.in_flight, operation) {
            (Some(_), None) => true,
            (Some(flight), Some(op)) => flight.operation == op,
            (None, _) => false,
        };
        if matches {
            self.session.in_flight = None;
        }
        if matches || self.session.in_flight.is_none() {
            self.session.loading = false;
        }
    }

    /// 单一的事件分发入口：实时消费与对账回放共用
    pub fn apply(
        &mut self,
        kind: &EventKind,
        stamp: Option<Epoch>,
    ) -> Result<Applied, PipelineError> {
        match kind {
            EventKind::StageStarted { stage, .. } => {
                if !self.is_current(stamp) {
                    return Ok(self.stale(stamp));
                }
                self.on_stage_started(*stage);
                Ok(Applied::Changed)
            }
            EventKind::StageProgress(progress) => {
                if !self.is_current(stamp) {
                    return Ok(self.stale(stamp));
                }
                self.on_progress(progress);
                Ok(Applied::Changed)
            }
            EventKind::StageCompleted(completion) => {
                if !self.is_current(stamp) {
                    return Ok(self.stale(stamp));
                }
                self.on_completed(completion)
            }
            EventKind::StageFailed {
                stage,
                message,
                terminal,
                available_providers,
            } => {
                if !self.is_current(stamp) {
                    return Ok(self.stale(stamp));
                }
                if !*terminal {
                    return Ok(Applied::Failed(PipelineError::ProviderWarning {
                        stage: *stage,
                        message: message.clone(),
                    }));
                }
                let err = PipelineError::ProviderTerminal {
                    stage: *stage,
                    message: message.clone(),
                    available_providers: available_providers.clone(),
                };
                self.settle(Some(stage.invocation()));
                self.session.gate_status = GateStatus::Failed;
                self.touch();
                Ok(Applied::Failed(err))
            }
            EventKind::GateStarted { run_id } => {
                self.session.gate_status = GateStatus::Running;
                self.session.run_id = Some(run_id.clone());
                self.session.gate_message = None;
                self.touch();
                Ok(Applied::Changed)
            }
            EventKind::GateCompleted {
                run_id,
                status,
                message,
            } => self.on_gate_completed(run_id.as_deref(), *status, message.clone()),
            EventKind::PipelineStatus {
                status,
                stage,
                progress,
            } => {
                self.set_remote_status(Some(status.clone()), stage.clone(), *progress);
                if is_terminal_status(status) {
                    self.set_idle();
                    return Ok(Applied::Terminal {
                        status: status.clone(),
                    });
                }
                Ok(Applied::Changed)
            }
        }
    }

    fn on_stage_started(&mut self, stage: Operation) {
        match stage {
            Operation::Discovery => self.session.substep = Some(SubStep::Discovery),
            Operation::Plan => self.session.substep = Some(SubStep::Planner),
            _ => {}
        }
        self.session.pipeline_status = Some("running".to_string());
        self.session.pipeline_stage = Some(stage.as_str().to_string());
        self.touch();
    }

    fn on_progress(&mut self, p: &ProgressPayload) {
        let progress = &mut self.session.progress;
        if let Some(iteration) = p.iteration {
            progress.iteration = iteration;
        }
        if let Some(tool) = &p.tool {
            progress.last_tool = Some(tool.clone());
        }
        if let Some(thinking) = &p.thinking {
            progress.thinking = Some(thinking.clone());
        }
        if let Some(tokens_in) = p.tokens_in {
            progress.tokens_in = tokens_in;
        }
        if let Some(tokens_out) = p.tokens_out {
            progress.tokens_out = tokens_out;
        }
        if let Some(elapsed) = p.elapsed_ms {
            progress.elapsed_ms = elapsed;
        }
        self.touch();
    }

    fn validate(&self, stage: ArtifactStage, artifacts: &[Artifact]) -> Result<(), PipelineError> {
        if artifacts.is_empty() {
            return Err(PipelineError::Validation(format!(
                "{} completed without artifacts",
                stage.as_str()
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for artifact in artifacts {
            if artifact.filename.trim().is_empty() {
                return Err(PipelineError::Validation(format!(
                    "{} artifact with empty filename",
                    stage.as_str()
                )));
            }
            if !seen.insert(artifact.filename.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "duplicate {} artifact `{}`",
                    stage.as_str(),
                    artifact.filename
                )));
            }
        }
        if let Some(required) = self.rules.required.get(&stage) {
            if let Some(missing) = required.iter().find(|name| !seen.contains(name.as_str())) {
                return Err(PipelineError::Validation(format!(
                    "{} is missing required artifact `{}`",
                    stage.as_str(),
                    missing
                )));
            }
        }
        Ok(())
    }

    fn on_completed(&mut self, c: &CompletionPayload) -> Result<Applied, PipelineError> {
        let artifact_stage = match c.stage {
            Operation::Discovery => Some(ArtifactStage::Discovery),
            Operation::Plan => Some(ArtifactStage::Plan),
            Operation::Spec => Some(ArtifactStage::Spec),
            Operation::Fix => Some(c.target.unwrap_or(ArtifactStage::Spec)),
            Operation::Execute => None,
        };
        if let Some(stage) = artifact_stage {
            if let Err(e) = self.validate(stage, &c.artifacts) {
                // 校验失败是终态条件：结束加载态，但不推进步骤、不改产物
                if c.stage != Operation::Discovery {
                    self.settle(Some(c.stage.invocation()));
                    self.touch();
                }
                return Err(e);
            }
        }
        if let Some(usage) = c.usage {
            self.session.usage.insert(c.stage, usage);
        }

        match c.stage {
            Operation::Discovery => {
                self.session
                    .artifacts
                    .insert(ArtifactStage::Discovery, c.artifacts.clone());
                self.session.substep = Some(SubStep::Planner);
                self.touch();
                Ok(Applied::Changed)
            }
            Operation::Plan => {
                self.session
                    .artifacts
                    .insert(ArtifactStage::Plan, c.artifacts.clone());
                self.session.substep = None;
                self.mark_complete(STEP_TASK);
                self.mark_complete(STEP_PLAN);
                self.advance_step(STEP_SPEC);
                self.settle(Some(Operation::Plan));
                self.touch();
                Ok(Applied::Completed(Operation::Plan))
            }
            Operation::Spec => {
                self.session
                    .artifacts
                    .insert(ArtifactStage::Spec, c.artifacts.clone());
                self.mark_complete(STEP_SPEC);
                self.advance_step(STEP_VALIDATE);
                self.settle(Some(Operation::Spec));
                self.touch();
                Ok(Applied::Completed(Operation::Spec))
            }
            Operation::Fix => {
                let stage = c.target.unwrap_or(ArtifactStage::Spec);
                let before = self.session.artifacts_of(stage).to_vec();
                let slot = self.session.artifacts.entry(stage).or_default();
                for incoming in &c.artifacts {
                    match slot.iter_mut().find(|a| a.filename == incoming.filename) {
                        Some(existing) => existing.content = incoming.content.clone(),
                        None => slot.push(incoming.clone()),
                    }
                }
                let after = slot.clone();
                // 修正后需要重新过校验门
                self.session.gate_status = GateStatus::None;
                self.session.gate_message = None;
                self.settle(Some(Operation::Fix));
                self.touch();
                Ok(Applied::FixPass {
                    stage,
                    before,
                    after,
                })
            }
            Operation::Execute => {
                self.mark_complete(STEP_EXECUTE);
                self.advance_step(STEP_EXECUTE);
                self.settle(Some(Operation::Execute));
                self.touch();
                Ok(Applied::Completed(Operation::Execute))
            }
        }
    }

    fn on_gate_completed(
        &mut self,
        run_id: Option<&str>,
        status: GateOutcome,
        message: Option<String>,
    ) -> Result<Applied, PipelineError> {
        if let (Some(incoming), Some(current)) = (run_id, self.session.run_id.as_deref()) {
            if incoming != current {
                tracing::debug!("Ignoring gate result for run {} (current {})", incoming, current);
                return Ok(Applied::Unchanged);
            }
        }
        self.session.gate_message = message.clone();
        let applied = match status {
            GateOutcome::Passed => {
                self.session.gate_status = GateStatus::Passed;
                self.mark_complete(STEP_VALIDATE);
                self.advance_step(STEP_EXECUTE);
                Applied::Changed
            }
            GateOutcome::Failed => {
                self.session.gate_status = GateStatus::Failed;
                Applied::Changed
            }
            GateOutcome::SchemaError => {
                self.session.gate_status = GateStatus::SchemaError;
                Applied::Failed(PipelineError::Schema(
                    message.unwrap_or_else(|| "gate reported a schema error".to_string()),
                ))
            }
        };
        self.touch();
        Ok(applied)
    }
}
