//! 事件流消费者
//!
//! 按事件 id 去重后分发给状态机；实时事件与对账回放共用这一条路径，
//! 因此两者产生的状态必然一致。

use std::collections::HashSet;

use crate::core::guard::Epoch;
use crate::core::machine::{Applied, PipelineStateMachine};
use crate::core::PipelineError;
use crate::events::types::PipelineEvent;

/// 幂等分发器：每个事件 id 至多应用一次
#[derive(Debug, Default)]
pub struct EventStreamConsumer {
    /// floor 之上、尚未连成一段的已应用 id
    applied: HashSet<u64>,
    /// 不超过它的事件视为已应用；连续的已应用 id 会并入这里
    floor: u64,
}

impl EventStreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以快照中的 lastEventId 作为去重下界
    pub fn resume_from(last_event_id: u64) -> Self {
        Self {
            applied: HashSet::new(),
            floor: last_event_id,
        }
    }

    pub fn is_applied(&self, event_id: u64) -> bool {
        event_id <= self.floor || self.applied.contains(&event_id)
    }

    /// floor 之上单独记住的 id 个数
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// 把已确认的水位并入 floor，丢弃其下的单独记录
    pub fn advance_floor(&mut self, watermark: u64) {
        if watermark <= self.floor {
            return;
        }
        self.floor = watermark;
        self.applied.retain(|id| *id > watermark);
        self.fold();
    }

    fn fold(&mut self) {
        while self.applied.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }

    /// 处理一个事件
    ///
    /// `origin` 为投递该事件的订阅所绑定的 epoch；回放事件传 None，
    /// 此时按该操作当前记录的调用 epoch 盖章。
    pub fn on_event(
        &mut self,
        machine: &mut PipelineStateMachine,
        event: &PipelineEvent,
        origin: Option<Epoch>,
    ) -> Result<Applied, PipelineError> {
        if self.is_applied(event.id) {
            tracing::trace!("Duplicate event {} dropped", event.id);
            return Ok(Applied::Duplicate);
        }
        self.applied.insert(event.id);
        self.fold();

        let decoded = event.decode();
        machine.record_watermark(event.id, event.sequence);
        let kind = match decoded {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                tracing::warn!("Ignoring unknown event type `{}` (id {})", event.event_type, event.id);
                return Ok(Applied::Ignored);
            }
            Err(e) => {
                tracing::warn!("Rejecting event {}: {}", event.id, e);
                return Err(e);
            }
        };

        let stamp = origin.or_else(|| {
            kind.invocation()
                .and_then(|operation| machine.in_flight_epoch(operation))
        });
        let applied = machine.apply(&kind, stamp)?;
        if let Applied::Stale { epoch, current } = &applied {
            tracing::debug!(
                "Event {} ({}) from epoch {} discarded, current epoch {}",
                event.id,
                event.event_type,
                epoch,
                current
            );
        }
        Ok(applied)
    }

    pub fn reset(&mut self) {
        self.applied.clear();
        self.floor = 0;
    }
}
