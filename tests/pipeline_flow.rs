//! 编排器集成测试：用进程内的假远端与假事件流驱动完整流水线

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use conductor::config::{AppConfig, ProviderSection};
use conductor::core::state::{
    Artifact, ArtifactStage, GateStatus, Operation, PipelineSession, StepConfig,
};
use conductor::core::{Applied, PipelineError, PipelineOrchestrator, ReconciliationResult, Surface};
use conductor::events::{EventFeed, EventStream, PipelineEvent, StampedEvent};
use conductor::remote::{
    MissedEvent, PipelineRemote, ReconcileRequest, RemoteSummary, SubmitAccepted, SubmitRequest,
};
use conductor::store::{KvStore, MemoryKv, SessionStore};

const TTL: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct FakeRemote {
    submissions: Mutex<Vec<(Operation, SubmitRequest)>>,
    failures: Mutex<VecDeque<PipelineError>>,
    delay: Mutex<Option<Duration>>,
    summary: Mutex<Option<RemoteSummary>>,
    created: Mutex<u32>,
}

impl FakeRemote {
    fn last_submission(&self) -> (Operation, SubmitRequest) {
        self.submissions.lock().unwrap().last().cloned().unwrap()
    }

    fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl PipelineRemote for FakeRemote {
    async fn reconcile(&self, _: &ReconcileRequest) -> Result<RemoteSummary, PipelineError> {
        self.summary
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PipelineError::Network {
                attempts: 1,
                message: "unreachable".into(),
            })
    }

    async fn submit(
        &self,
        operation: Operation,
        request: &SubmitRequest,
    ) -> Result<SubmitAccepted, PipelineError> {
        self.submissions
            .lock()
            .unwrap()
            .push((operation, request.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(e) = failure {
            return Err(e);
        }
        let pipeline_id = match &request.pipeline_id {
            Some(id) => id.clone(),
            None => {
                let mut created = self.created.lock().unwrap();
                *created += 1;
                format!("p-{}", *created)
            }
        };
        Ok(SubmitAccepted { pipeline_id })
    }
}

/// 按 pipeline 分开的历史事件 + 实时广播
struct FakeFeed {
    history: Mutex<Vec<(String, PipelineEvent)>>,
    live: broadcast::Sender<(String, PipelineEvent)>,
    subscriptions: Mutex<Vec<(String, u64)>>,
}

impl FakeFeed {
    fn new() -> Self {
        let (live, _) = broadcast::channel(64);
        Self {
            history: Mutex::new(Vec::new()),
            live,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn publish(&self, pipeline_id: &str, event: PipelineEvent) {
        let entry = (pipeline_id.to_string(), event);
        self.history.lock().unwrap().push(entry.clone());
        let _ = self.live.send(entry);
    }
}

#[async_trait]
impl EventFeed for FakeFeed {
    async fn subscribe(&self, pipeline_id: &str, after: u64) -> Result<EventStream, PipelineError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((pipeline_id.to_string(), after));
        let rx = self.live.subscribe();
        let backlog: Vec<_> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, e)| id == pipeline_id && e.id > after)
            .map(|(_, e)| Ok(e.clone()))
            .collect();
        let owner = pipeline_id.to_string();
        let live = futures_util::stream::unfold((rx, owner), |(mut rx, owner)| async move {
            loop {
                match rx.recv().await {
                    Ok((id, event)) if id == owner => return Some((Ok(event), (rx, owner))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(futures_util::stream::iter(backlog).chain(live).boxed())
    }
}

struct FailingKv;

#[async_trait]
impl KvStore for FailingKv {
    async fn get(&self, _: &str) -> Result<Option<String>, PipelineError> {
        Err(PipelineError::Persistence("disk full".into()))
    }

    async fn put(&self, _: &str, _: &str) -> Result<(), PipelineError> {
        Err(PipelineError::Persistence("disk full".into()))
    }

    async fn delete(&self, _: &str) -> Result<(), PipelineError> {
        Err(PipelineError::Persistence("disk full".into()))
    }
}

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    for op in [Operation::Plan, Operation::Spec, Operation::Fix, Operation::Execute] {
        cfg.defaults.insert(op, StepConfig::new("openai", "gpt-4o"));
    }
    cfg.providers.insert(
        "mistral".into(),
        ProviderSection {
            default_model: Some("mistral-large".into()),
        },
    );
    cfg.feed.reconnect_delay_ms = 10;
    cfg
}

struct Harness {
    orch: PipelineOrchestrator,
    remote: Arc<FakeRemote>,
    feed: Arc<FakeFeed>,
    next_id: u64,
}

impl Harness {
    fn with_kv(kv: Arc<dyn KvStore>) -> Self {
        let remote = Arc::new(FakeRemote::default());
        let feed = Arc::new(FakeFeed::new());
        let orch = PipelineOrchestrator::new(
            &config(),
            SessionStore::new(kv, TTL),
            remote.clone(),
            feed.clone(),
        );
        Self {
            orch,
            remote,
            feed,
            next_id: 0,
        }
    }

    fn new() -> (Self, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (Self::with_kv(kv.clone()), kv)
    }

    /// 经假事件流发布一个事件并等待编排器处理
    async fn emit(&mut self, event_type: &str, payload: Value) -> Option<Applied> {
        self.next_id += 1;
        let pipeline_id = self.orch.session().pipeline_id.clone().unwrap_or_default();
        self.feed.publish(
            &pipeline_id,
            PipelineEvent::new(self.next_id, event_type, payload),
        );
        tokio::time::timeout(Duration::from_secs(2), self.orch.next_event())
            .await
            .expect("event was not delivered")
    }

    async fn complete(&mut self, stage: &str, files: &[(&str, &str)]) -> Option<Applied> {
        let artifacts: Vec<Value> = files
            .iter()
            .map(|(name, content)| json!({"filename": name, "content": content}))
            .collect();
        self.emit(
            "stage_completed",
            json!({"stage": stage, "artifacts": artifacts}),
        )
        .await
    }

    async fn advance_to_execute(&mut self) {
        self.orch.start_plan("build a todo app").await.unwrap();
        self.complete("plan", &[("PLAN.md", "plan")]).await;
        self.orch.start_spec().await.unwrap();
        self.complete("spec", &[("SPEC.md", "spec")]).await;
        self.emit("gate_started", json!({"run_id": "r1"})).await;
        self.emit("gate_completed", json!({"run_id": "r1", "status": "passed"}))
            .await;
    }
}

#[tokio::test]
async fn test_full_pipeline_from_task_to_execution() {
    let (mut h, kv) = Harness::new();
    let mut ui = h.orch.subscribe_ui();

    h.orch.start_plan("build a todo app").await.unwrap();
    let (op, req) = h.remote.last_submission();
    assert_eq!(op, Operation::Plan);
    assert_eq!(req.provider, "openai");
    assert!(req.pipeline_id.is_none());
    assert_eq!(req.payload["task"], "build a todo app");
    assert_eq!(h.orch.session().pipeline_id.as_deref(), Some("p-1"));
    assert!(h.orch.session().loading);

    let store = SessionStore::new(kv.clone(), TTL);
    assert_eq!(
        store.load_active().await.unwrap().unwrap().pipeline_id.as_deref(),
        Some("p-1")
    );

    h.emit("stage_started", json!({"stage": "discovery"})).await;
    h.complete("discovery", &[("CONTEXT.md", "ctx")]).await;
    assert_eq!(
        h.complete("plan", &[("PLAN.md", "p"), ("TASKS.md", "t"), ("RISKS.md", "r")])
            .await,
        Some(Applied::Completed(Operation::Plan))
    );
    assert_eq!(h.orch.session().step, 2);
    assert_eq!(
        h.orch.session().completed_steps.iter().copied().collect::<Vec<_>>(),
        vec![0, 1]
    );

    // plan 已完成，不能再次发起
    assert!(matches!(
        h.orch.start_plan("again").await,
        Err(PipelineError::StepLocked { .. })
    ));

    h.orch.start_spec().await.unwrap();
    assert_eq!(h.remote.last_submission().1.pipeline_id.as_deref(), Some("p-1"));
    h.complete("spec", &[("SPEC.md", "s")]).await;
    assert_eq!(h.orch.session().step, 3);

    match h.orch.start_execute().await {
        Err(PipelineError::StepLocked { operation, step }) => {
            assert_eq!(operation, Operation::Execute);
            assert_eq!(step, 3);
        }
        other => panic!("Expected StepLocked, got {other:?}"),
    }
    assert!(matches!(h.orch.condition(), Some(Surface::Banner { .. })));

    h.emit("gate_started", json!({"run_id": "r1"})).await;
    h.emit("gate_completed", json!({"run_id": "r1", "status": "passed"}))
        .await;
    assert_eq!(h.orch.session().step, 4);

    h.orch.start_execute().await.unwrap();
    h.emit(
        "stage_progress",
        json!({"stage": "execute", "iteration": 3, "tool": "cargo", "tokens_in": 1200}),
    )
    .await;
    assert_eq!(ui.borrow_and_update().progress.iteration, 3);
    assert_eq!(
        h.emit("stage_completed", json!({"stage": "execute"})).await,
        Some(Applied::Completed(Operation::Execute))
    );

    let state = ui.borrow_and_update().clone();
    assert_eq!(state.step, 4);
    assert_eq!(state.completed_steps, vec![0, 1, 2, 3, 4]);
    assert!(!state.loading);
    assert!(state.condition.is_none());

    let persisted = store.load("p-1").await.unwrap().unwrap();
    assert_eq!(persisted.step, 4);
    assert_eq!(persisted.last_event_id, h.next_id);
    assert_eq!(h.remote.submission_count(), 3);
}

#[tokio::test]
async fn test_terminal_provider_error_offers_retry_with_other_provider() {
    let (mut h, _) = Harness::new();
    h.orch.start_plan("build a todo app").await.unwrap();
    h.complete("plan", &[("PLAN.md", "plan")]).await;
    h.orch.start_spec().await.unwrap();

    let applied = h
        .emit(
            "stage_failed",
            json!({"stage": "spec", "message": "quota exhausted", "terminal": true,
                   "available_providers": ["openai", "mistral"]}),
        )
        .await;
    assert!(matches!(
        applied,
        Some(Applied::Failed(PipelineError::ProviderTerminal { .. }))
    ));

    let state = h.orch.ui_state();
    let offer = state.retry_offer.expect("retry offer");
    assert_eq!(offer.chosen_provider, "openai");
    assert_eq!(offer.failed_step, 2);
    assert!(matches!(state.condition, Some(Surface::RetryOffer { .. })));
    assert_eq!(state.gate_status, GateStatus::Failed);
    assert!(!state.loading);
    assert_eq!(state.step, 2);

    assert!(h.orch.apply_retry("anthropic", None).await.is_err());
    h.orch.apply_retry("mistral", None).await.unwrap();

    let (op, req) = h.remote.last_submission();
    assert_eq!(op, Operation::Spec);
    assert_eq!(req.provider, "mistral");
    assert_eq!(req.model, "mistral-large");
    assert_eq!(
        h.orch.session().per_step_config.get(&2),
        Some(&StepConfig::new("mistral", "mistral-large"))
    );
    let state = h.orch.ui_state();
    assert!(state.retry_offer.is_none());
    assert!(state.condition.is_none());
    assert!(state.loading);
}

#[tokio::test]
async fn test_superseded_execution_completion_is_discarded() {
    let (mut h, _) = Harness::new();
    h.advance_to_execute().await;

    h.orch.start_execute().await.unwrap();
    let first = h.orch.current_epoch();
    h.orch.start_execute().await.unwrap();
    let second = h.orch.current_epoch();
    assert_eq!(second, first + 1);

    h.next_id += 1;
    let late = PipelineEvent::new(h.next_id, "stage_completed", json!({"stage": "execute"}));
    let applied = h
        .orch
        .handle_event(StampedEvent {
            pipeline_id: "p-1".into(),
            event: late,
            epoch: Some(first),
        })
        .await;
    assert_eq!(
        applied,
        Some(Applied::Stale {
            epoch: first,
            current: second
        })
    );
    assert!(h.orch.session().in_flight.is_some());
    assert!(!h.orch.session().is_complete(4));
    assert!(h.orch.condition().is_none());

    assert_eq!(
        h.emit("stage_completed", json!({"stage": "execute"})).await,
        Some(Applied::Completed(Operation::Execute))
    );
    assert!(h.orch.session().in_flight.is_none());
    assert!(!h.orch.session().loading);
}

#[tokio::test]
async fn test_submission_timeout_surfaces_and_retires_epoch() {
    let (mut h, _) = Harness::new();
    h.orch = h.orch.with_submit_timeout(Duration::from_millis(50));
    h.orch.start_plan("build a todo app").await.unwrap();
    h.complete("plan", &[("PLAN.md", "plan")]).await;

    *h.remote.delay.lock().unwrap() = Some(Duration::from_millis(500));
    let spec_epoch = h.orch.current_epoch() + 1;
    let err = h.orch.start_spec().await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Timeout {
            operation: Operation::Spec,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert!(h.orch.current_epoch() > spec_epoch);
    assert!(!h.orch.session().loading);
    assert_eq!(h.orch.session().gate_status, GateStatus::Failed);
    assert_eq!(h.orch.session().step, 2);
    assert!(matches!(h.orch.condition(), Some(Surface::Banner { .. })));

    // 超时的调用之后才完成：事件按过期丢弃
    h.next_id += 1;
    let late = PipelineEvent::new(
        h.next_id,
        "stage_completed",
        json!({"stage": "spec", "artifacts": [{"filename": "SPEC.md", "content": "s"}]}),
    );
    let applied = h
        .orch
        .handle_event(StampedEvent {
            pipeline_id: "p-1".into(),
            event: late,
            epoch: Some(spec_epoch),
        })
        .await;
    assert!(matches!(applied, Some(Applied::Stale { epoch, .. }) if epoch == spec_epoch));
    assert_eq!(h.orch.session().step, 2);
    assert!(h.orch.session().artifacts_of(ArtifactStage::Spec).is_empty());
}

#[tokio::test]
async fn test_network_failure_after_retries_keeps_step() {
    let (mut h, _) = Harness::new();
    h.orch.start_plan("build a todo app").await.unwrap();
    h.complete("plan", &[("PLAN.md", "plan")]).await;
    h.remote
        .failures
        .lock()
        .unwrap()
        .push_back(PipelineError::Network {
            attempts: 3,
            message: "connection refused".into(),
        });

    let err = h.orch.start_spec().await.unwrap_err();
    assert!(matches!(err, PipelineError::Network { attempts: 3, .. }));
    let session = h.orch.session();
    assert_eq!(session.step, 2);
    assert_eq!(session.completed_steps.len(), 2);
    assert!(!session.loading);
    assert!(session.in_flight.is_none());
}

#[tokio::test]
async fn test_restore_and_reconcile_then_resume_live_feed() {
    let kv = Arc::new(MemoryKv::new());
    let store = SessionStore::new(kv.clone(), TTL);
    let mut snapshot = PipelineSession {
        pipeline_id: Some("p-9".into()),
        step: 2,
        last_event_id: 4,
        last_sequence: 4,
        ..Default::default()
    };
    snapshot.completed_steps.extend([0, 1]);
    snapshot
        .artifacts
        .insert(ArtifactStage::Plan, vec![Artifact::new("PLAN.md", "plan")]);
    store.save(&snapshot).await.unwrap();

    let mut h = Harness::with_kv(kv.clone());
    *h.remote.summary.lock().unwrap() = Some(RemoteSummary {
        step: 3,
        completed_steps: vec![0, 1, 2],
        last_event_id: 6,
        last_sequence: 6,
        missed_events: vec![
            MissedEvent {
                id: 6,
                sequence: None,
                payload: json!({"type": "gate_started", "payload": {"run_id": "r2"}}),
            },
            MissedEvent {
                id: 5,
                sequence: None,
                payload: json!({"type": "stage_completed", "payload": {
                    "stage": "spec", "artifacts": [{"filename": "SPEC.md", "content": "spec"}]
                }}),
            },
        ],
        ..Default::default()
    });

    assert!(h.orch.restore().await);
    assert_eq!(h.orch.session().step, 2);
    match h.orch.reconcile().await {
        ReconciliationResult::Restored {
            replayed,
            terminal_status,
            ..
        } => {
            assert_eq!(replayed, 2);
            assert!(terminal_status.is_none());
        }
        other => panic!("Expected Restored, got {other:?}"),
    }
    assert_eq!(h.orch.session().step, 3);
    assert_eq!(h.orch.session().gate_status, GateStatus::Running);
    assert_eq!(h.orch.session().artifacts_of(ArtifactStage::Spec).len(), 1);
    assert_eq!(
        h.orch.reconcile().await,
        ReconciliationResult::AlreadyApplied
    );

    h.next_id = 6;
    h.emit("gate_completed", json!({"run_id": "r2", "status": "passed"}))
        .await;
    assert_eq!(h.orch.session().step, 4);
    assert_eq!(
        h.feed.subscriptions.lock().unwrap().first().cloned(),
        Some(("p-9".to_string(), 6))
    );
    assert_eq!(store.load("p-9").await.unwrap().unwrap().step, 4);
}

#[tokio::test]
async fn test_reconcile_failure_keeps_local_snapshot() {
    let kv = Arc::new(MemoryKv::new());
    let store = SessionStore::new(kv.clone(), TTL);
    let mut snapshot = PipelineSession {
        pipeline_id: Some("p-3".into()),
        step: 3,
        ..Default::default()
    };
    snapshot
        .artifacts
        .insert(ArtifactStage::Spec, vec![Artifact::new("SPEC.md", "spec")]);
    store.save(&snapshot).await.unwrap();

    let mut h = Harness::with_kv(kv);
    assert!(h.orch.restore().await);
    assert!(matches!(
        h.orch.reconcile().await,
        ReconciliationResult::Unavailable { .. }
    ));
    assert!(matches!(
        h.orch.condition(),
        Some(Surface::RestoreFailed { .. })
    ));
    assert_eq!(h.orch.session().step, 3);
    assert_eq!(h.orch.session().artifacts_of(ArtifactStage::Spec).len(), 1);

    // 恢复后重试：回放出的完成事件与实时到达时一样清除条件
    *h.remote.summary.lock().unwrap() = Some(RemoteSummary {
        step: 3,
        completed_steps: vec![0, 1, 2],
        last_event_id: 1,
        last_sequence: 1,
        missed_events: vec![MissedEvent {
            id: 1,
            sequence: None,
            payload: json!({"type": "stage_completed", "payload": {
                "stage": "spec", "artifacts": [{"filename": "SPEC.md", "content": "spec v2"}]
            }}),
        }],
        ..Default::default()
    });
    match h.orch.reconcile().await {
        ReconciliationResult::Restored { outcomes, .. } => {
            assert_eq!(outcomes, vec![Applied::Completed(Operation::Spec)])
        }
        other => panic!("Expected Restored, got {other:?}"),
    }
    assert!(h.orch.condition().is_none());
    assert_eq!(
        h.orch.session().artifacts_of(ArtifactStage::Spec)[0].content,
        "spec v2"
    );
}

#[tokio::test]
async fn test_identical_fix_pass_raises_loop_flag() {
    let (mut h, _) = Harness::new();
    h.orch.start_plan("build a todo app").await.unwrap();
    h.complete("plan", &[("PLAN.md", "plan")]).await;
    h.orch.start_spec().await.unwrap();
    h.complete("spec", &[("SPEC.md", "v1")]).await;
    h.emit("gate_completed", json!({"status": "failed", "message": "missing goal"}))
        .await;

    h.orch
        .start_fix(ArtifactStage::Spec, vec!["missing goal".into()])
        .await
        .unwrap();
    let (op, req) = h.remote.last_submission();
    assert_eq!(op, Operation::Fix);
    assert_eq!(req.payload["target"], "spec");

    let applied = h
        .emit(
            "stage_completed",
            json!({"stage": "fix", "target": "spec",
                   "artifacts": [{"filename": "SPEC.md", "content": "v1"}]}),
        )
        .await;
    assert!(matches!(applied, Some(Applied::FixPass { .. })));
    assert!(h.orch.ui_state().fix_loop);
    assert_eq!(h.orch.session().gate_status, GateStatus::None);
}

#[tokio::test]
async fn test_empty_plan_artifacts_surface_validation() {
    let (mut h, _) = Harness::new();
    h.orch.start_plan("build a todo app").await.unwrap();
    let applied = h
        .emit("stage_completed", json!({"stage": "plan", "artifacts": []}))
        .await;
    assert!(applied.is_none());
    assert!(matches!(
        h.orch.condition(),
        Some(Surface::ValidationFailed { .. })
    ));
    assert_eq!(h.orch.session().step, 1);
    assert!(!h.orch.session().loading);
}

#[tokio::test]
async fn test_persistence_failure_degrades_without_blocking() {
    let mut h = Harness::with_kv(Arc::new(FailingKv));
    h.orch.start_plan("build a todo app").await.unwrap();
    assert!(matches!(h.orch.condition(), Some(Surface::Degraded { .. })));

    h.complete("plan", &[("PLAN.md", "plan")]).await;
    assert_eq!(h.orch.session().step, 2);
    assert!(matches!(h.orch.condition(), Some(Surface::Degraded { .. })));
}

#[tokio::test]
async fn test_reset_clears_session_and_snapshot() {
    let (mut h, kv) = Harness::new();
    h.orch.start_plan("build a todo app").await.unwrap();
    h.complete("plan", &[("PLAN.md", "plan")]).await;
    assert_eq!(kv.len().await, 2);

    h.orch.reset().await;
    assert_eq!(kv.len().await, 0);
    assert_eq!(h.orch.session(), &PipelineSession::default());
    assert_eq!(h.orch.current_epoch(), 0);
    assert_eq!(h.orch.ui_state().step, 0);
    assert!(!h.orch.restore().await);
}

#[tokio::test]
async fn test_events_in_flight_at_reset_do_not_reach_next_pipeline() {
    let (mut h, _) = Harness::new();
    h.orch.start_plan("first task").await.unwrap();
    assert_eq!(h.orch.session().pipeline_id.as_deref(), Some("p-1"));

    // 旧 pipeline 的完成事件已进入通道但尚未处理
    h.feed.publish(
        "p-1",
        PipelineEvent::new(
            1,
            "stage_completed",
            json!({"stage": "plan", "artifacts": [{"filename": "OLD.md", "content": "old pipeline"}]}),
        ),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.orch.reset().await;
    h.orch.start_plan("second task").await.unwrap();
    assert_eq!(h.orch.session().pipeline_id.as_deref(), Some("p-2"));
    assert_eq!(h.orch.current_epoch(), 1);

    let queued = tokio::time::timeout(Duration::from_millis(100), h.orch.next_event()).await;
    assert!(queued.is_err(), "old event was delivered: {queued:?}");

    // 迟到的旧事件同 epoch、同 id 也不生效
    let applied = h
        .orch
        .handle_event(StampedEvent {
            pipeline_id: "p-1".into(),
            event: PipelineEvent::new(
                1,
                "stage_completed",
                json!({"stage": "plan", "artifacts": [{"filename": "OLD.md", "content": "old pipeline"}]}),
            ),
            epoch: Some(1),
        })
        .await;
    assert_eq!(applied, Some(Applied::Ignored));
    assert_eq!(h.orch.session().step, 1);
    assert!(h.orch.session().artifacts_of(ArtifactStage::Plan).is_empty());

    assert_eq!(
        h.complete("plan", &[("PLAN.md", "new pipeline")]).await,
        Some(Applied::Completed(Operation::Plan))
    );
    assert_eq!(h.orch.session().step, 2);
    assert_eq!(
        h.orch.session().artifacts_of(ArtifactStage::Plan)[0].filename,
        "PLAN.md"
    );
}
