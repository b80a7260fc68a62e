//! Choreo - 消息驱动的多 Agent 动作生成编排
//!
//! 模块划分：
//! - **bus**: 消息信封与发布/订阅总线
//! - **agents**: Agent 运行时与四个 Agent（Controller / PromptAnalyzer / WorkflowPlanner / TaskExecutor）
//! - **analysis**: 提示词分析抽象与关键词实现
//! - **workflow**: 工作流类型、依赖图、构建器
//! - **execution**: 资源准入、步骤处理器、产物存储
//! - **tasks**: 调用方任务跟踪
//! - **state**: Agent 状态快照持久化
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、编排器组装、优雅关闭

pub mod agents;
pub mod analysis;
pub mod bus;
pub mod config;
pub mod core;
pub mod execution;
pub mod observability;
pub mod state;
pub mod tasks;
pub mod workflow;

pub use crate::core::{AgentError, Orchestrator, OrchestratorBuilder};
pub use crate::tasks::{TaskRecord, TaskState};
