//! 对账服务：断线 / 重启后与远端权威状态重新同步
//!
//! 补发的事件经由与实时事件完全相同的 `EventStreamConsumer::on_event` 回放，
//! 所以「对账 + 之后的实时消费」与「不间断的实时消费」得到同一个会话状态。
//! 拉取失败时本地状态保持原样。

use crate::core::machine::{Applied, PipelineStateMachine};
use crate::core::state::is_terminal_status;
use crate::core::PipelineError;
use crate::events::consumer::EventStreamConsumer;
use crate::events::types::PipelineEvent;
use crate::remote::{PipelineRemote, ReconcileRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationResult {
    /// 已合并远端摘要并回放补发事件
    Restored {
        replayed: usize,
        terminal_status: Option<String>,
        /// 回放中产生的需要编排器处理的结果（完成、失败、修正 pass 等）
        outcomes: Vec<Applied>,
    },
    /// 本会话生命周期内已经对账过
    AlreadyApplied,
    /// 会话还没有 pipelineId，无从对账
    NothingToRestore,
    /// 远端不可用；可以稍后再试
    Unavailable { error: PipelineError },
}

#[derive(Debug, Default)]
pub struct ReconciliationService {
    applied: bool,
}

impl ReconciliationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新的会话生命周期（reset 之后）允许再次对账
    pub fn reset(&mut self) {
        self.applied = false;
    }

    pub async fn reconcile(
        &mut self,
        machine: &mut PipelineStateMachine,
        consumer: &mut EventStreamConsumer,
        remote: &dyn PipelineRemote,
    ) -> ReconciliationResult {
        if self.applied {
            return ReconciliationResult::AlreadyApplied;
        }
        let Some(pipeline_id) = machine.session().pipeline_id.clone() else {
            return ReconciliationResult::NothingToRestore;
        };
        let local_last = machine.session().last_event_id;
        let request = ReconcileRequest {
            pipeline_id: pipeline_id.clone(),
            last_event_id: local_last,
        };

        let summary = match remote.reconcile(&request).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("Could not reconcile pipeline {}: {}", pipeline_id, e);
                return ReconciliationResult::Unavailable {
                    error: PipelineError::Restore(e.to_string()),
                };
            }
        };
        tracing::info!(
            "Reconciling {}: local step {} / event {}, remote step {} / event {}",
            pipeline_id,
            machine.session().step,
            local_last,
            summary.step,
            summary.last_event_id
        );

        machine.advance_step(summary.step);
        for step in &summary.completed_steps {
            machine.mark_complete(*step);
        }

        let mut missed: Vec<PipelineEvent> = summary
            .missed_events
            .iter()
            .cloned()
            .map(|m| m.into_event())
            .filter(|e| e.id > local_last && e.id <= summary.last_event_id)
            .collect();
        missed.sort_by_key(|e| e.id);

        let mut replayed = 0;
        let mut outcomes = Vec::new();
        for event in &missed {
            match consumer.on_event(machine, event, None) {
                Ok(Applied::Duplicate) => {}
                Ok(applied) => {
                    replayed += 1;
                    if matches!(
                        applied,
                        Applied::Completed(_)
                            | Applied::Failed(_)
                            | Applied::FixPass { .. }
                            | Applied::Terminal { .. }
                    ) {
                        outcomes.push(applied);
                    }
                }
                Err(e) => {
                    replayed += 1;
                    outcomes.push(Applied::Failed(e));
                }
            }
        }

        machine.record_watermark(summary.last_event_id, summary.last_sequence);
        consumer.advance_floor(summary.last_event_id);
        machine.merge_remote(&summary.progress());

        let terminal_status = summary
            .pipeline_status
            .clone()
            .filter(|status| is_terminal_status(status));
        if let Some(status) = &terminal_status {
            tracing::info!("Pipeline {} already {}", pipeline_id, status);
            machine.set_idle();
        }

        self.applied = true;
        ReconciliationResult::Restored {
            replayed,
            terminal_status,
            outcomes,
        }
    }
}
