//! 流水线编排器：主控循环
//!
//! 负责：步骤门控与提交、事件订阅、对账与崩溃恢复、快照写入，
//! 并在后台任务中消费命令通道（Plan/Spec/Fix/Execute/Retry/Reset/Quit）与事件通道，通过 watch 通道发布 UI 状态。
//! 会话状态只在这一个任务里被修改。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::fix_loop::FixLoopDetector;
use crate::core::guard::Epoch;
use crate::core::machine::{Applied, PipelineStateMachine, ValidationRules};
use crate::core::reconcile::{ReconciliationResult, ReconciliationService};
use crate::core::recovery::ErrorRouter;
use crate::core::retry::RetryCoordinator;
use crate::core::state::{
    ArtifactStage, GateStatus, Operation, PipelineSession, StepConfig, UiState, STEP_EXECUTE,
    STEP_PLAN, STEP_SPEC, STEP_VALIDATE,
};
use crate::core::{PipelineError, Surface};
use crate::events::consumer::EventStreamConsumer;
use crate::events::feed::{EventFeed, FeedSubscription, StampedEvent};
use crate::remote::{PipelineRemote, SubmitRequest};
use crate::store::SessionStore;

/// 发往编排器的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交任务描述，发起 plan（含 discovery）
    Plan(String),
    Spec,
    /// 按校验发现修正某阶段产物
    Fix {
        target: ArtifactStage,
        findings: Vec<String>,
    },
    Execute,
    /// 接受重试提议；可改选 provider / model
    Retry {
        provider: String,
        model: Option<String>,
    },
    Reconcile,
    Reset,
    Quit,
}

/// 当前步骤是否允许发起该操作
pub fn is_allowed(operation: Operation, session: &PipelineSession) -> bool {
    let step = session.step;
    match operation {
        Operation::Plan => step <= STEP_PLAN,
        Operation::Spec => step >= STEP_SPEC,
        Operation::Fix => step >= STEP_VALIDATE,
        Operation::Execute => step >= STEP_EXECUTE || session.gate_status == GateStatus::Passed,
        // discovery 只作为 plan 的一部分运行
        Operation::Discovery => false,
    }
}

pub struct PipelineOrchestrator {
    machine: PipelineStateMachine,
    rules: ValidationRules,
    consumer: EventStreamConsumer,
    reconciler: ReconciliationService,
    retry: RetryCoordinator,
    fix_loop: FixLoopDetector,
    router: ErrorRouter,
    store: SessionStore,
    remote: Arc<dyn PipelineRemote>,
    feed: Arc<dyn EventFeed>,
    subscription: Option<FeedSubscription>,
    events_tx: mpsc::UnboundedSender<StampedEvent>,
    events_rx: mpsc::UnboundedReceiver<StampedEvent>,
    ui_tx: watch::Sender<UiState>,
    condition: Option<Surface>,
    /// 最近一次 fix 的参数，重试时原样重发
    last_fix: Option<(ArtifactStage, Vec<String>)>,
    persisted_revision: u64,
    submit_timeout: Duration,
    reconnect_delay: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        cfg: &AppConfig,
        store: SessionStore,
        remote: Arc<dyn PipelineRemote>,
        feed: Arc<dyn EventFeed>,
    ) -> Self {
        let rules = cfg.validation_rules();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = watch::channel(UiState::default());
        Self {
            machine: PipelineStateMachine::new(rules.clone()),
            rules,
            consumer: EventStreamConsumer::new(),
            reconciler: ReconciliationService::new(),
            retry: RetryCoordinator::new(cfg.defaults.clone(), cfg.provider_models()),
            fix_loop: FixLoopDetector::new(),
            router: ErrorRouter::new(cfg.feed.diagnostic),
            store,
            remote,
            feed,
            subscription: None,
            events_tx,
            events_rx,
            ui_tx,
            condition: None,
            last_fix: None,
            persisted_revision: 0,
            submit_timeout: cfg.remote.submit_timeout(),
            reconnect_delay: cfg.feed.reconnect_delay(),
        }
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn session(&self) -> &PipelineSession {
        self.machine.session()
    }

    pub fn condition(&self) -> Option<&Surface> {
        self.condition.as_ref()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.machine.guard().current_epoch()
    }

    pub fn subscribe_ui(&self) -> watch::Receiver<UiState> {
        self.ui_tx.subscribe()
    }

    pub fn ui_state(&self) -> UiState {
        UiState::project(
            self.machine.session(),
            self.condition.clone(),
            self.retry.current_offer().cloned(),
        )
    }

    fn publish(&self) {
        self.ui_tx.send_replace(self.ui_state());
    }

    /// 有修改才写快照；写失败只降级，不回滚内存状态
    async fn persist(&mut self) {
        if self.machine.revision() == self.persisted_revision {
            return;
        }
        match self.store.save(self.machine.session()).await {
            Ok(Some(saved_at)) => self.machine.mark_saved(saved_at),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Session snapshot not saved: {}", e);
                if self.condition.is_none() {
                    self.condition = Some(self.router.route(&e));
                }
            }
        }
        self.persisted_revision = self.machine.revision();
    }

    fn surface(&mut self, err: &PipelineError) {
        match self.router.route(err) {
            Surface::Silent => {}
            surface => self.condition = Some(surface),
        }
    }

    fn on_error(&mut self, err: PipelineError) {
        if let PipelineError::ProviderTerminal {
            stage,
            available_providers,
            ..
        } = &err
        {
            self.retry.offer_retry(stage.invocation(), available_providers);
        }
        self.surface(&err);
    }

    fn on_applied(&mut self, applied: Applied) {
        match applied {
            Applied::Completed(operation) => {
                tracing::info!("{} completed", operation);
                self.condition = None;
            }
            Applied::FixPass {
                stage,
                before,
                after,
            } => {
                let detected = self.fix_loop.check_loop(stage, &before, &after);
                self.machine.set_fix_loop(detected);
            }
            Applied::Failed(err) => self.on_error(err),
            Applied::Terminal { status } => {
                tracing::info!("Pipeline reached terminal status `{}`", status);
                self.cancel_subscription();
            }
            Applied::Stale { epoch, current } => {
                self.surface(&PipelineError::StaleEvent { epoch, current });
            }
            Applied::Changed | Applied::Unchanged | Applied::Duplicate | Applied::Ignored => {}
        }
    }

    fn cancel_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    /// 重新订阅事件流，绑定到给定 epoch，从当前水位之后开始
    fn open_subscription(&mut self, pipeline_id: String, epoch: Option<Epoch>) {
        self.cancel_subscription();
        let after = self.machine.session().last_event_id;
        tracing::debug!(
            "Opening feed for {} after event {} (epoch {:?})",
            pipeline_id,
            after,
            epoch
        );
        self.subscription = Some(FeedSubscription::spawn(
            self.feed.clone(),
            pipeline_id,
            after,
            epoch,
            self.events_tx.clone(),
            self.reconnect_delay,
        ));
    }

    /// 处理一个带来源 epoch 的事件；不属于当前 pipeline 的事件直接丢弃
    pub async fn handle_event(&mut self, stamped: StampedEvent) -> Option<Applied> {
        if self.machine.session().pipeline_id.as_deref() != Some(stamped.pipeline_id.as_str()) {
            tracing::debug!(
                "Event {} of pipeline {} dropped, current pipeline {:?}",
                stamped.event.id,
                stamped.pipeline_id,
                self.machine.session().pipeline_id
            );
            return Some(Applied::Ignored);
        }
        let result = self
            .consumer
            .on_event(&mut self.machine, &stamped.event, stamped.epoch);
        let applied = match result {
            Ok(applied) => {
                self.on_applied(applied.clone());
                Some(applied)
            }
            Err(e) => {
                self.on_error(e);
                None
            }
        };
        self.persist().await;
        self.publish();
        applied
    }

    /// 等待并处理下一个订阅事件
    pub async fn next_event(&mut self) -> Option<Applied> {
        let stamped = self.events_rx.recv().await?;
        self.handle_event(stamped).await
    }

    /// 从活跃指针恢复会话；返回是否恢复了快照
    pub async fn restore(&mut self) -> bool {
        let restored = match self.store.load_active().await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("Could not load session snapshot: {}", e);
                self.surface(&PipelineError::Restore(e.to_string()));
                self.publish();
                return false;
            }
        };
        tracing::info!(
            "Restored pipeline {:?} at step {} (event {})",
            restored.pipeline_id,
            restored.step,
            restored.last_event_id
        );
        self.consumer = EventStreamConsumer::resume_from(restored.last_event_id);
        self.machine = PipelineStateMachine::from_snapshot(restored, self.rules.clone());
        self.reconciler.reset();
        self.persisted_revision = self.machine.revision();
        self.publish();
        true
    }

    /// 与远端对账；成功且远端未终止时恢复实时订阅
    pub async fn reconcile(&mut self) -> ReconciliationResult {
        let result = self
            .reconciler
            .reconcile(&mut self.machine, &mut self.consumer, self.remote.as_ref())
            .await;
        match &result {
            ReconciliationResult::Restored {
                terminal_status,
                outcomes,
                ..
            } => {
                for applied in outcomes.clone() {
                    self.on_applied(applied);
                }
                if terminal_status.is_none() {
                    if let Some(pipeline_id) = self.machine.session().pipeline_id.clone() {
                        self.open_subscription(pipeline_id, None);
                    }
                }
            }
            ReconciliationResult::Unavailable { error } => {
                let error = error.clone();
                self.surface(&error);
            }
            ReconciliationResult::AlreadyApplied | ReconciliationResult::NothingToRestore => {}
        }
        self.persist().await;
        self.publish();
        result
    }

    fn reject(&mut self, err: PipelineError) -> Result<(), PipelineError> {
        tracing::warn!("Rejected: {}", err);
        self.surface(&err);
        self.publish();
        Err(err)
    }

    fn step_config(&self, operation: Operation) -> Result<StepConfig, PipelineError> {
        self.machine
            .session()
            .per_step_config
            .get(&operation.step())
            .cloned()
            .or_else(|| self.retry.default_config(operation).cloned())
            .ok_or_else(|| PipelineError::Config(format!("no provider configured for {operation}")))
    }

    async fn submit(
        &mut self,
        operation: Operation,
        payload: Map<String, Value>,
    ) -> Result<(), PipelineError> {
        if !is_allowed(operation, self.machine.session()) {
            let step = self.machine.session().step;
            return self.reject(PipelineError::StepLocked { operation, step });
        }
        let config = match self.step_config(operation) {
            Ok(config) => config,
            Err(e) => return self.reject(e),
        };

        self.retry.clear();
        self.condition = None;
        let pipeline_id = self.machine.session().pipeline_id.clone();
        let epoch = self.machine.begin_invocation(operation);
        if let Some(id) = &pipeline_id {
            self.open_subscription(id.clone(), Some(epoch));
        }
        self.persist().await;
        self.publish();

        let request = SubmitRequest {
            pipeline_id: pipeline_id.clone(),
            provider: config.provider,
            model: config.model,
            payload,
        };
        tracing::info!(
            "Submitting {} with {}/{} (epoch {})",
            operation,
            request.provider,
            request.model,
            epoch
        );
        let result = match tokio::time::timeout(
            self.submit_timeout,
            self.remote.submit(operation, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                operation,
                secs: self.submit_timeout.as_secs(),
            }),
        };

        let outcome = match result {
            Ok(accepted) => {
                if pipeline_id.is_none() {
                    tracing::info!("Pipeline {} created", accepted.pipeline_id);
                    self.machine.set_pipeline_id(accepted.pipeline_id.clone());
                    self.open_subscription(accepted.pipeline_id, Some(epoch));
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} submission failed: {}", operation, e);
                self.machine.fail_invocation(epoch, &e);
                self.on_error(e.clone());
                Err(e)
            }
        };
        self.persist().await;
        self.publish();
        outcome
    }

    pub async fn start_plan(&mut self, task: impl Into<String>) -> Result<(), PipelineError> {
        let task = task.into();
        if task.trim().is_empty() {
            return self.reject(PipelineError::Validation("task description is empty".to_string()));
        }
        if is_allowed(Operation::Plan, self.machine.session()) {
            self.machine.set_task(task.clone());
        }
        let mut payload = Map::new();
        payload.insert("task".to_string(), Value::String(task));
        self.submit(Operation::Plan, payload).await
    }

    pub async fn start_spec(&mut self) -> Result<(), PipelineError> {
        self.submit(Operation::Spec, Map::new()).await
    }

    pub async fn start_fix(
        &mut self,
        target: ArtifactStage,
        findings: Vec<String>,
    ) -> Result<(), PipelineError> {
        self.last_fix = Some((target, findings.clone()));
        let mut payload = Map::new();
        payload.insert("target".to_string(), json!(target));
        payload.insert("findings".to_string(), json!(findings));
        self.submit(Operation::Fix, payload).await
    }

    pub async fn start_execute(&mut self) -> Result<(), PipelineError> {
        self.submit(Operation::Execute, Map::new()).await
    }

    /// 接受当前的重试提议：写回失败步骤的配置并重新发起同一操作
    pub async fn apply_retry(
        &mut self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<(), PipelineError> {
        if let Err(e) = self.retry.choose(provider, model) {
            return self.reject(e);
        }
        let offer = match self.retry.apply_retry(&mut self.machine) {
            Ok(offer) => offer,
            Err(e) => return self.reject(e),
        };
        match offer.operation {
            Operation::Plan | Operation::Discovery => {
                let task = self.machine.session().task.clone().unwrap_or_default();
                self.start_plan(task).await
            }
            Operation::Spec => self.start_spec().await,
            Operation::Fix => {
                let (target, findings) = self
                    .last_fix
                    .clone()
                    .unwrap_or((ArtifactStage::Spec, Vec::new()));
                self.start_fix(target, findings).await
            }
            Operation::Execute => self.start_execute().await,
        }
    }

    /// 清空会话并删除快照
    ///
    /// 旧订阅已经送进通道、尚未处理的事件随旧通道一起丢弃。
    pub async fn reset(&mut self) {
        self.cancel_subscription();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        let cleared = self.machine.reset();
        self.consumer.reset();
        self.reconciler.reset();
        self.retry.clear();
        self.fix_loop.reset();
        self.condition = None;
        self.last_fix = None;
        if let Some(pipeline_id) = cleared {
            if let Err(e) = self.store.clear(&pipeline_id).await {
                tracing::warn!("Could not delete snapshot of {}: {}", pipeline_id, e);
            }
        }
        self.persisted_revision = self.machine.revision();
        self.publish();
    }

    async fn dispatch(&mut self, cmd: Command) -> Result<(), PipelineError> {
        match cmd {
            Command::Plan(task) => self.start_plan(task).await,
            Command::Spec => self.start_spec().await,
            Command::Fix { target, findings } => self.start_fix(target, findings).await,
            Command::Execute => self.start_execute().await,
            Command::Retry { provider, model } => {
                self.apply_retry(&provider, model.as_deref()).await
            }
            Command::Reconcile => {
                self.reconcile().await;
                Ok(())
            }
            Command::Reset => {
                self.reset().await;
                Ok(())
            }
            Command::Quit => Ok(()),
        }
    }

    /// 主循环：命令与事件在同一个任务里串行处理
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.publish();
        loop {
            tokio::select! {
                Some(stamped) = self.events_rx.recv() => {
                    self.handle_event(stamped).await;
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => {
                        if let Err(e) = self.dispatch(cmd).await {
                            tracing::debug!("Command failed: {}", e);
                        }
                    }
                },
            }
        }
        self.cancel_subscription();
        tracing::info!("Orchestrator stopped");
    }

    /// 在后台任务中运行：返回命令发送端、状态接收端与任务句柄
    pub fn spawn(
        self,
    ) -> (
        mpsc::UnboundedSender<Command>,
        watch::Receiver<UiState>,
        JoinHandle<()>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state_rx = self.subscribe_ui();
        let handle = tokio::spawn(self.run(cmd_rx));
        (cmd_tx, state_rx, handle)
    }
}

/// 按配置创建编排器：HTTP 远端、SSE 事件流、会话存储；随后恢复快照并对账
pub async fn create_conductor(cfg: &AppConfig) -> anyhow::Result<PipelineOrchestrator> {
    use anyhow::Context;

    let remote = crate::remote::HttpRemote::new(&cfg.remote).context("Failed to build remote client")?;
    tracing::info!("Pipeline service at {}", remote.base_url());
    let feed = crate::events::feed::SseEventFeed::new(&cfg.remote)
        .context("Failed to build event feed client")?;
    let store = crate::store::create_session_store(&cfg.session);

    let mut orchestrator = PipelineOrchestrator::new(cfg, store, Arc::new(remote), Arc::new(feed));
    if orchestrator.restore().await {
        match orchestrator.reconcile().await {
            ReconciliationResult::Unavailable { error } => {
                tracing::warn!("Continuing with local snapshot: {}", error)
            }
            result => tracing::debug!("Reconciliation: {:?}", result),
        }
    }
    Ok(orchestrator)
}
