//! Controller：外部请求入口与错误汇聚点

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::{
    non_empty, untracked_task_id, Agent, AgentContext, CLIENT, CONTROLLER, PROMPT_ANALYZER,
    TASK_EXECUTOR,
};
use crate::bus::{Message, Payload};
use crate::core::AgentError;

/// 计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub started: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct Controller {
    started: AtomicU64,
    failed: AtomicU64,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            started: self.started.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn start_task(
        &self,
        ctx: &AgentContext,
        task_id: Option<String>,
        prompt: Option<String>,
    ) -> Result<(), AgentError> {
        let task_id = match non_empty(task_id) {
            Some(id) => id,
            None => {
                let sentinel = untracked_task_id();
                let error = AgentError::MissingField("task_id");
                return self.forward_error(ctx, sentinel, error.to_string()).await;
            }
        };
        let Some(prompt) = non_empty(prompt) else {
            let error = AgentError::MissingField("prompt");
            return self.forward_error(ctx, task_id, error.to_string()).await;
        };

        self.started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(task_id = %task_id, "Task started");
        ctx.send(
            PROMPT_ANALYZER,
            Payload::AnalyzePrompt {
                task_id: Some(task_id),
                prompt: Some(prompt),
            },
        )
        .await
    }

    async fn cancel_task(&self, ctx: &AgentContext, task_id: String) -> Result<(), AgentError> {
        if task_id.trim().is_empty() {
            let error = AgentError::MissingField("task_id");
            return self
                .forward_error(ctx, untracked_task_id(), error.to_string())
                .await;
        }
        tracing::info!(task_id = %task_id, "Cancellation requested");
        ctx.send(TASK_EXECUTOR, Payload::CancelWorkflow { task_id }).await
    }

    /// 错误转发给调用方
    async fn forward_error(
        &self,
        ctx: &AgentContext,
        task_id: String,
        error: String,
    ) -> Result<(), AgentError> {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(task_id = %task_id, %error, "Task error");
        ctx.send(CLIENT, Payload::TaskError { task_id, error }).await
    }
}

#[async_trait]
impl Agent for Controller {
    fn id(&self) -> &str {
        CONTROLLER
    }

    async fn process(&self, ctx: &AgentContext, message: Message) -> Result<(), AgentError> {
        match message.into_payload() {
            Payload::StartTask { task_id, prompt } => self.start_task(ctx, task_id, prompt).await,
            Payload::CancelTask { task_id } => self.cancel_task(ctx, task_id).await,
            Payload::ExecutionError { task_id, error } => {
                self.forward_error(ctx, task_id, error).await
            }
            other => {
                tracing::warn!(intent = other.intent(), "Controller ignoring unexpected intent");
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.stats()).ok()
    }

    fn restore(&self, state: serde_json::Value) -> Result<(), AgentError> {
        let stats: ControllerStats = serde_json::from_value(state)?;
        self.started.store(stats.started, Ordering::Relaxed);
        self.failed.store(stats.failed, Ordering::Relaxed);
        Ok(())
    }
}
