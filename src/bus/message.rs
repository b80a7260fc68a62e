//! Agent 间消息协议定义
//!
//! 统一的消息信封：`{sender, intent, content}`。intent 与 content 由 [`Payload`] 的
//! 邻接标签（adjacently tagged）表示，每个 intent 一个变体，序列化为 JSON 字节。

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::workflow::{AnalysisResult, Workflow};

/// Agent 标识（同时决定订阅频道：`agent:<id>`）
pub type AgentId = String;

/// 任务执行状态（status_update 中使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（completed / failed / cancelled）
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 消息内容：每个 intent 一个变体
///
/// 标记为 `Option` 的字段在类型层面允许缺失，缺失（或空串）由接收方 Agent
/// 作为校验错误经 `execution_error` 上报，而不是反序列化失败。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", content = "content", rename_all = "snake_case")]
pub enum Payload {
    /// 外部请求：开始任务（→ controller）
    StartTask {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },

    /// 外部请求：取消任务（→ controller）
    CancelTask { task_id: String },

    /// 分析提示词（controller → prompt_analyzer）
    AnalyzePrompt {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },

    /// 规划工作流（prompt_analyzer → workflow_planner）
    PlanWorkflow {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        analysis_result: Option<AnalysisResult>,
        #[serde(default)]
        original_prompt: String,
    },

    /// 执行工作流（workflow_planner → task_executor）
    ExecuteWorkflow {
        task_id: String,
        workflow: Workflow,
        #[serde(default)]
        original_prompt: String,
    },

    /// 取消工作流（controller → task_executor）
    CancelWorkflow { task_id: String },

    /// 状态更新（task_executor → task_status 广播频道）
    StatusUpdate {
        task_id: String,
        status: TaskStatus,
        progress: f64,
    },

    /// 执行错误（任意 Agent → controller）
    ExecutionError { task_id: String, error: String },

    /// 面向调用方的错误（controller → client）
    TaskError { task_id: String, error: String },
}

impl Payload {
    /// intent 名称（与序列化后的 `intent` 字段一致）
    pub fn intent(&self) -> &'static str {
        match self {
            Payload::StartTask { .. } => "start_task",
            Payload::CancelTask { .. } => "cancel_task",
            Payload::AnalyzePrompt { .. } => "analyze_prompt",
            Payload::PlanWorkflow { .. } => "plan_workflow",
            Payload::ExecuteWorkflow { .. } => "execute_workflow",
            Payload::CancelWorkflow { .. } => "cancel_workflow",
            Payload::StatusUpdate { .. } => "status_update",
            Payload::ExecutionError { .. } => "execution_error",
            Payload::TaskError { .. } => "task_error",
        }
    }

    /// 消息关联的任务 ID（若有）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Payload::StartTask { task_id, .. }
            | Payload::AnalyzePrompt { task_id, .. }
            | Payload::PlanWorkflow { task_id, .. } => task_id.as_deref(),
            Payload::CancelTask { task_id }
            | Payload::ExecuteWorkflow { task_id, .. }
            | Payload::CancelWorkflow { task_id }
            | Payload::StatusUpdate { task_id, .. }
            | Payload::ExecutionError { task_id, .. }
            | Payload::TaskError { task_id, .. } => Some(task_id),
        }
    }
}

/// Agent 间通信的消息信封，构造后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    sender: AgentId,
    #[serde(flatten)]
    payload: Payload,
}

impl Message {
    pub fn new(sender: impl Into<AgentId>, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            payload,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn intent(&self) -> &'static str {
        self.payload.intent()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// 编码为传输字节（JSON）
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// 从传输字节解码
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
