//! 事件层：线上记录、幂等消费者与事件流订阅

pub mod consumer;
pub mod feed;
pub mod types;

pub use consumer::EventStreamConsumer;
pub use feed::{EventFeed, EventStream, FeedSubscription, SseEventFeed, StampedEvent};
pub use types::{EventKind, PipelineEvent};
