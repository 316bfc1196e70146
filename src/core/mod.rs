//! 核心编排层：错误与路由、会话状态、执行守卫、状态机、重试、修正回环、对账、主控循环

pub mod error;
pub mod fix_loop;
pub mod guard;
pub mod machine;
pub mod orchestrator;
pub mod reconcile;
pub mod recovery;
pub mod retry;
pub mod state;

pub use error::{PipelineError, Surface};
pub use fix_loop::FixLoopDetector;
pub use guard::{Epoch, ExecutionGuard};
pub use machine::{Applied, PipelineStateMachine, ValidationRules};
pub use orchestrator::{create_conductor, Command, PipelineOrchestrator};
pub use reconcile::{ReconciliationResult, ReconciliationService};
pub use recovery::ErrorRouter;
pub use retry::{RetryCoordinator, RetryOffer};
pub use state::{Operation, PipelineSession, UiState};
