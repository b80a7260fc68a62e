//! 核心编排层：错误类型、组装、编排器、优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod shutdown;

pub use builder::OrchestratorBuilder;
pub use error::AgentError;
pub use orchestrator::{new_task_id, Orchestrator, TASK_ID_PREFIX};
pub use shutdown::{ShutdownManager, ShutdownReason};
