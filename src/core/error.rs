//! Agent 错误类型
//!
//! Agent 内部使用 [`AgentError`]；跨 Agent 边界时统一转换为 `execution_error` 消息的
//! `error` 文本，从不以 Rust 错误的形式传播。

use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::bus::BusError;
use crate::execution::{ArtifactError, InsufficientResources};
use crate::workflow::WorkflowError;

/// Agent 运行过程中可能出现的错误（校验、准入、步骤执行、持久化、传输等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid analysis result: {0}")]
    InvalidAnalysis(String),

    #[error("Prompt analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Prompt analysis timed out after {0}s")]
    AnalysisTimeout(u64),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("{0}")]
    InsufficientResources(#[from] InsufficientResources),

    #[error("Unknown step action: {0}")]
    UnknownAction(String),

    #[error("Step {step_id} input '{input}' references output of {source_step} which is not available")]
    UnresolvedInput {
        step_id: String,
        input: String,
        source_step: String,
    },

    #[error("Step {step_id} failed: {reason}")]
    StepFailed { step_id: String, reason: String },

    #[error("Step {step_id} timed out after {secs}s")]
    StepTimeout { step_id: String, secs: u64 },

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("State store error: {0}")]
    State(String),
}
