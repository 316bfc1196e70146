//! Provider 重试协调
//!
//! 仅在携带可选 provider 列表的终态错误上生成 RetryOffer；从不自动重试，
//! 必须由外部（用户或自动化）显式确认后才重新提交失败的步骤。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::machine::PipelineStateMachine;
use crate::core::state::{Operation, Step, StepConfig};
use crate::core::PipelineError;

/// 一次失败后给出的重试提议（不持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOffer {
    pub failed_step: Step,
    pub operation: Operation,
    pub available_providers: Vec<String>,
    pub chosen_provider: String,
    pub chosen_model: String,
}

#[derive(Debug, Default)]
pub struct RetryCoordinator {
    /// 各操作配置的默认 provider / model
    defaults: BTreeMap<Operation, StepConfig>,
    /// provider 切换时使用的默认模型
    provider_models: BTreeMap<String, String>,
    offer: Option<RetryOffer>,
}

impl RetryCoordinator {
    pub fn new(
        defaults: BTreeMap<Operation, StepConfig>,
        provider_models: BTreeMap<String, String>,
    ) -> Self {
        Self {
            defaults,
            provider_models,
            offer: None,
        }
    }

    pub fn default_config(&self, operation: Operation) -> Option<&StepConfig> {
        self.defaults.get(&operation)
    }

    fn model_for(&self, operation: Operation, provider: &str) -> String {
        if let Some(default) = self.defaults.get(&operation) {
            if default.provider == provider {
                return default.model.clone();
            }
        }
        self.provider_models
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// 优先选择与该步骤默认配置一致的 provider，否则取第一个可用的
    pub fn offer_retry(
        &mut self,
        operation: Operation,
        available_providers: &[String],
    ) -> Option<RetryOffer> {
        if available_providers.is_empty() {
            return None;
        }
        let preferred = self
            .defaults
            .get(&operation)
            .map(|d| d.provider.as_str())
            .filter(|p| available_providers.iter().any(|a| a == p));
        let provider = preferred.unwrap_or(available_providers[0].as_str()).to_string();
        let offer = RetryOffer {
            failed_step: operation.step(),
            operation,
            available_providers: available_providers.to_vec(),
            chosen_model: self.model_for(operation, &provider),
            chosen_provider: provider,
        };
        tracing::info!(
            "Retry offered for {} with {} ({} option(s))",
            operation,
            offer.chosen_provider,
            offer.available_providers.len()
        );
        self.offer = Some(offer.clone());
        Some(offer)
    }

    pub fn current_offer(&self) -> Option<&RetryOffer> {
        self.offer.as_ref()
    }

    /// 修改提议中的 provider（必须在可选列表内）；model 缺省时取该 provider 的默认模型
    pub fn choose(
        &mut self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<RetryOffer, PipelineError> {
        let mut offer = self
            .offer
            .take()
            .ok_or_else(|| PipelineError::Validation("no retry offer pending".to_string()))?;
        if !offer.available_providers.iter().any(|p| p == provider) {
            self.offer = Some(offer);
            return Err(PipelineError::Validation(format!(
                "provider `{provider}` is not available for retry"
            )));
        }
        offer.chosen_model = model
            .map(String::from)
            .unwrap_or_else(|| self.model_for(offer.operation, provider));
        offer.chosen_provider = provider.to_string();
        self.offer = Some(offer.clone());
        Ok(offer)
    }

    /// 写回失败步骤的配置并清除提议；返回需要重新发起的操作
    pub fn apply_retry(
        &mut self,
        machine: &mut PipelineStateMachine,
    ) -> Result<RetryOffer, PipelineError> {
        let offer = self
            .offer
            .take()
            .ok_or_else(|| PipelineError::Validation("no retry offer pending".to_string()))?;
        machine.set_step_config(
            offer.failed_step,
            StepConfig::new(offer.chosen_provider.clone(), offer.chosen_model.clone()),
        );
        tracing::info!(
            "Applying retry of {} with {}/{}",
            offer.operation,
            offer.chosen_provider,
            offer.chosen_model
        );
        Ok(offer)
    }

    /// 下一次步骤成功发起时清除
    pub fn clear(&mut self) {
        self.offer = None;
    }
}
