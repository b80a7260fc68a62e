//! 消息驱动的 Agent：Controller -> PromptAnalyzer -> WorkflowPlanner -> TaskExecutor
//!
//! 每个 Agent 只通过总线收发消息，不直接调用其他 Agent。错误统一转成发给 controller 的
//! `execution_error`，再由 controller 以 `task_error` 转发给调用方。

mod analyzer;
mod controller;
mod executor;
mod planner;
pub mod runtime;

pub use analyzer::PromptAnalyzer;
pub use controller::{Controller, ControllerStats};
pub use executor::TaskExecutor;
pub use planner::WorkflowPlanner;
pub use runtime::{Agent, AgentContext, AgentHandle, AgentRuntime, RuntimeConfig};

use crate::bus::Payload;
use crate::core::AgentError;

pub const CONTROLLER: &str = "controller";
pub const PROMPT_ANALYZER: &str = "prompt_analyzer";
pub const WORKFLOW_PLANNER: &str = "workflow_planner";
pub const TASK_EXECUTOR: &str = "task_executor";
/// 调用方频道（接收 task_error）
pub const CLIENT: &str = "client";

/// 缺少 task_id 的请求以此前缀 + uuid 上报错误
pub const UNTRACKED_TASK_PREFIX: &str = "untracked-";

pub fn untracked_task_id() -> String {
    format!("{}{}", UNTRACKED_TASK_PREFIX, uuid::Uuid::new_v4())
}

/// 去掉空白后为空的字符串视为缺失
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// 向 controller 上报执行错误
pub(crate) async fn report_error(
    ctx: &AgentContext,
    task_id: &str,
    error: &AgentError,
) -> Result<(), AgentError> {
    tracing::error!(agent = %ctx.id(), task_id, error = %error, "Reporting execution error");
    ctx.send(
        CONTROLLER,
        Payload::ExecutionError {
            task_id: task_id.to_string(),
            error: error.to_string(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_ids_are_unique() {
        let a = untracked_task_id();
        let b = untracked_task_id();
        assert!(a.starts_with(UNTRACKED_TASK_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("x".into())), Some("x".into()));
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(None), None);
    }
}
