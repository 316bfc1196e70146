//! 远端流水线服务：对账端点与各阶段提交端点
//!
//! 接口层只关心请求 / 响应形状；HTTP 实现带单次请求超时与线性退避重试。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RemoteSection;
use crate::core::machine::RemoteProgress;
use crate::core::state::{Operation, Step};
use crate::core::PipelineError;
use crate::events::types::PipelineEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub pipeline_id: String,
    pub last_event_id: u64,
}

/// 对账响应中补发的事件：`payload` 内含 `type` 与实际载荷
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MissedEvent {
    pub id: u64,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl MissedEvent {
    /// 还原为与实时事件相同的线上记录
    ///
    /// 内层载荷可以放在 `payload.payload`，也可以与 `type` 平铺在同一层。
    pub fn into_event(self) -> PipelineEvent {
        let (event_type, payload) = match self.payload {
            Value::Object(mut map) => {
                let event_type = match map.remove("type") {
                    Some(Value::String(t)) => t,
                    _ => String::new(),
                };
                let payload = map
                    .remove("payload")
                    .unwrap_or(Value::Object(map));
                (event_type, payload)
            }
            other => (String::new(), other),
        };
        let event = PipelineEvent::new(self.id, event_type, payload);
        match self.sequence {
            Some(sequence) => event.with_sequence(sequence),
            None => event,
        }
    }
}

/// 远端权威摘要
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteSummary {
    pub step: Step,
    pub completed_steps: Vec<Step>,
    pub last_event_id: u64,
    pub last_sequence: u64,
    pub pipeline_status: Option<String>,
    pub pipeline_stage: Option<String>,
    pub pipeline_progress: Option<f64>,
    pub missed_events: Vec<MissedEvent>,
}

impl RemoteSummary {
    pub fn progress(&self) -> RemoteProgress {
        RemoteProgress {
            step: self.step,
            completed_steps: self.completed_steps.clone(),
            pipeline_status: self.pipeline_status.clone(),
            pipeline_stage: self.pipeline_stage.clone(),
            pipeline_progress: self.pipeline_progress,
        }
    }
}

/// 步骤提交请求；阶段相关字段平铺在顶层
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// 提交被接受（完成情况通过事件流异步回报）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAccepted {
    pub pipeline_id: String,
}

#[async_trait]
pub trait PipelineRemote: Send + Sync {
    async fn reconcile(&self, request: &ReconcileRequest) -> Result<RemoteSummary, PipelineError>;

    async fn submit(
        &self,
        operation: Operation,
        request: &SubmitRequest,
    ) -> Result<SubmitAccepted, PipelineError>;
}

/// 有上限的线性退避重试：第 n 次失败后等待 n × backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }

    /// 只重试可重试错误；耗尽后返回带总次数的 Network 错误
    pub async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(PipelineError::Network { message, .. }) => {
                    return Err(PipelineError::Network {
                        attempts: attempt,
                        message,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&RemoteSection> for RetryPolicy {
    fn from(section: &RemoteSection) -> Self {
        Self::new(section.max_attempts, Duration::from_millis(section.backoff_ms))
    }
}

/// 4xx 响应体
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    available_providers: Vec<String>,
}

/// 按状态码与响应体把失败归类
fn classify(status: u16, body: &str, operation: Option<Operation>) -> PipelineError {
    if status >= 500 || status == 408 || status == 429 {
        return PipelineError::Network {
            attempts: 1,
            message: format!("HTTP {status}"),
        };
    }
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .unwrap_or_else(|| format!("HTTP {status}"));
    match operation {
        Some(stage) if !parsed.available_providers.is_empty() => PipelineError::ProviderTerminal {
            stage,
            message,
            available_providers: parsed.available_providers,
        },
        Some(_) => PipelineError::Validation(message),
        None => PipelineError::Restore(message),
    }
}

/// reqwest 实现
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl HttpRemote {
    pub fn new(section: &RemoteSection) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(section.request_timeout())
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            policy: RetryPolicy::from(section),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_once<B, T>(
        &self,
        url: &str,
        body: &B,
        operation: Option<Operation>,
    ) -> Result<T, PipelineError>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!("POST {} (request {})", url, request_id);
        let resp = self
            .client
            .post(url)
            .header("x-request-id", &request_id)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Network {
                attempts: 1,
                message: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify(status.as_u16(), &text, operation));
        }
        resp.json::<T>()
            .await
            .map_err(|e| PipelineError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PipelineRemote for HttpRemote {
    async fn reconcile(&self, request: &ReconcileRequest) -> Result<RemoteSummary, PipelineError> {
        let url = format!("{}/api/pipeline/reconcile", self.base_url);
        self.policy
            .run(|| self.post_once(&url, request, None))
            .await
    }

    async fn submit(
        &self,
        operation: Operation,
        request: &SubmitRequest,
    ) -> Result<SubmitAccepted, PipelineError> {
        let url = format!("{}/api/pipeline/{}", self.base_url, operation.as_str());
        self.policy
            .run(|| self.post_once(&url, request, Some(operation)))
            .await
    }
}
