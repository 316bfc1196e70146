//! 修正回环检测
//!
//! 对修正 pass 前后的产物内容按顺序做哈希；结果与本次修正前相同，
//! 或与上一次修正的前 / 后任一哈希相同，即视为没有进展（覆盖 1 环与 2 环振荡）。
//! 只负责标记，不阻止用户继续重试。

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::core::state::{Artifact, ArtifactStage};

/// 按顺序拼接产物内容的哈希；每段带长度前缀，避免拼接歧义
pub fn artifact_set_hash(artifacts: &[Artifact]) -> String {
    let mut hasher = Sha256::new();
    for artifact in artifacts {
        hasher.update((artifact.content.len() as u64).to_le_bytes());
        hasher.update(artifact.content.as_bytes());
    }
    format!("{:064x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PassHashes {
    before: String,
    after: String,
}

#[derive(Debug, Default)]
pub struct FixLoopDetector {
    previous: BTreeMap<ArtifactStage, PassHashes>,
}

impl FixLoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_loop(
        &mut self,
        stage: ArtifactStage,
        before: &[Artifact],
        after: &[Artifact],
    ) -> bool {
        let before_hash = artifact_set_hash(before);
        let after_hash = artifact_set_hash(after);

        let repeated = after_hash == before_hash;
        let oscillating = self
            .previous
            .get(&stage)
            .is_some_and(|prev| prev.after == after_hash || prev.before == after_hash);

        self.previous.insert(
            stage,
            PassHashes {
                before: before_hash,
                after: after_hash,
            },
        );

        let detected = repeated || oscillating;
        if detected {
            tracing::warn!("Fix loop detected on {} artifacts", stage.as_str());
        }
        detected
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }
}
