//! 事件流订阅
//!
//! `EventFeed` 抽象出「按 pipeline 订阅、从某个事件 id 之后开始」的有序事件流；
//! `SseEventFeed` 是基于 Server-Sent Events 的实现。`FeedSubscription` 在后台任务中
//! 把事件盖上所属调用的 epoch 转发给编排器，断线后从最后转发的 id 继续（补发），
//! 直到被取消。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteSection;
use crate::core::guard::Epoch;
use crate::core::PipelineError;
use crate::events::types::PipelineEvent;

pub type EventStream = BoxStream<'static, Result<PipelineEvent, PipelineError>>;

#[async_trait]
pub trait EventFeed: Send + Sync {
    /// 订阅 id 大于 `after_event_id` 的事件
    async fn subscribe(
        &self,
        pipeline_id: &str,
        after_event_id: u64,
    ) -> Result<EventStream, PipelineError>;
}

/// 带来源 pipeline 与 epoch 的事件；对账后恢复的订阅 epoch 为 None
#[derive(Debug, Clone, PartialEq)]
pub struct StampedEvent {
    pub pipeline_id: String,
    pub event: PipelineEvent,
    pub epoch: Option<Epoch>,
}

/// 一个完整的 SSE 帧
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// data 本身是完整记录时直接解析；否则用帧的 id / event 字段组装
    pub fn into_event(self) -> Result<PipelineEvent, PipelineError> {
        if let Ok(event) = serde_json::from_str::<PipelineEvent>(&self.data) {
            return Ok(event);
        }
        let id = self
            .id
            .as_deref()
            .and_then(|id| id.trim().parse::<u64>().ok())
            .ok_or_else(|| PipelineError::Decode(format!("SSE frame without numeric id: {:?}", self.id)))?;
        let event_type = self
            .event
            .ok_or_else(|| PipelineError::Decode(format!("SSE frame {id} without event type")))?;
        let payload = if self.data.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&self.data)?
        };
        Ok(PipelineEvent::new(id, event_type, payload))
    }
}

/// 增量 SSE 解析器：按字节缓冲，分块边界落在多字节字符中间也不会出错
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if !self.has_data {
                self.current = SseFrame::default();
                return None;
            }
            self.has_data = false;
            return Some(std::mem::take(&mut self.current));
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.current.id = Some(value.to_string()),
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }
}

/// 基于 reqwest 的 SSE 事件流
pub struct SseEventFeed {
    client: reqwest::Client,
    base_url: String,
}

impl SseEventFeed {
    pub fn new(section: &RemoteSection) -> Result<Self, PipelineError> {
        // 长连接不设整体超时，只限制建连
        let client = reqwest::Client::builder()
            .connect_timeout(section.request_timeout())
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: section.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EventFeed for SseEventFeed {
    async fn subscribe(
        &self,
        pipeline_id: &str,
        after_event_id: u64,
    ) -> Result<EventStream, PipelineError> {
        let url = format!("{}/api/pipeline/{}/events", self.base_url, pipeline_id);
        let resp = self
            .client
            .get(&url)
            .query(&[("after", after_event_id)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("Last-Event-ID", after_event_id.to_string())
            .send()
            .await
            .map_err(|e| PipelineError::Network {
                attempts: 1,
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(PipelineError::Network {
                attempts: 1,
                message: format!("event subscription failed: HTTP {}", resp.status()),
            });
        }
        tracing::debug!("Subscribed to {} after event {}", url, after_event_id);

        let bytes = Box::pin(resp.bytes_stream());
        let state = (bytes, SseParser::new(), VecDeque::new(), false);
        let stream = futures_util::stream::unfold(
            state,
            |(mut bytes, mut parser, mut pending, mut done)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, parser, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            pending.extend(parser.push(&chunk).into_iter().map(SseFrame::into_event));
                        }
                        Some(Err(e)) => {
                            pending.push_back(Err(PipelineError::Network {
                                attempts: 1,
                                message: format!("event stream error: {e}"),
                            }));
                            done = true;
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

/// 一个绑定到某次调用 epoch 的后台订阅
pub struct FeedSubscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FeedSubscription {
    pub fn spawn(
        feed: Arc<dyn EventFeed>,
        pipeline_id: String,
        after_event_id: u64,
        epoch: Option<Epoch>,
        tx: mpsc::UnboundedSender<StampedEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut last_id = after_event_id;
            loop {
                let subscribed = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    r = feed.subscribe(&pipeline_id, last_id) => r,
                };
                match subscribed {
                    Ok(mut stream) => loop {
                        let next = tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                if event.id <= last_id {
                                    continue;
                                }
                                last_id = event.id;
                                let stamped = StampedEvent {
                                    pipeline_id: pipeline_id.clone(),
                                    event,
                                    epoch,
                                };
                                if tx.send(stamped).is_err() {
                                    tracing::debug!("Event receiver dropped, ending subscription");
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!("Event feed for {} interrupted: {}", pipeline_id, e);
                                break;
                            }
                            None => {
                                tracing::debug!("Event feed for {} ended", pipeline_id);
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Subscribing to {} failed: {}", pipeline_id, e);
                    }
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {
                        tracing::debug!("Reconnecting feed for {} after event {}", pipeline_id, last_id);
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
