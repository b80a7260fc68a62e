//! 编排器：对调用方暴露提交 / 取消 / 查询 / 等待，内部只通过总线与 Agent 交互

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentContext, AgentHandle, CLIENT, CONTROLLER};
use crate::bus::{MessageBus, Payload, Subscription, STATUS_CHANNEL};
use crate::config::AppConfig;
use crate::core::{AgentError, OrchestratorBuilder, ShutdownManager, ShutdownReason};
use crate::execution::ArtifactStore;
use crate::tasks::{TaskRecord, TaskTracker};

/// 新任务 ID 前缀
pub const TASK_ID_PREFIX: &str = "task_";

pub fn new_task_id() -> String {
    format!("{}{}", TASK_ID_PREFIX, uuid::Uuid::new_v4())
}

pub struct Orchestrator {
    client: AgentContext,
    bus: Arc<dyn MessageBus>,
    tracker: Arc<TaskTracker>,
    tracker_task: JoinHandle<()>,
    tracker_token: CancellationToken,
    agents: Vec<AgentHandle>,
    shutdown: ShutdownManager,
    artifacts: ArtifactStore,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: AgentContext,
        bus: Arc<dyn MessageBus>,
        tracker: Arc<TaskTracker>,
        tracker_task: JoinHandle<()>,
        tracker_token: CancellationToken,
        agents: Vec<AgentHandle>,
        shutdown: ShutdownManager,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            client,
            bus,
            tracker,
            tracker_task,
            tracker_token,
            agents,
            shutdown,
            artifacts,
        }
    }

    /// 按配置启动（默认协作者）
    pub async fn start(config: AppConfig) -> Result<Self, AgentError> {
        OrchestratorBuilder::new(config).start().await
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// 提交提示词；未给出 task_id 时生成 `task_<uuid>`。返回任务 ID
    pub async fn submit(&self, prompt: &str, task_id: Option<String>) -> Result<String, AgentError> {
        let task_id = task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_task_id);

        self.tracker.register(&task_id, prompt);
        self.client
            .send(
                CONTROLLER,
                Payload::StartTask {
                    task_id: Some(task_id.clone()),
                    prompt: Some(prompt.to_string()),
                },
            )
            .await?;
        tracing::info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// 请求取消；结果通过状态更新体现
    pub async fn cancel(&self, task_id: &str) -> Result<(), AgentError> {
        self.client
            .send(
                CONTROLLER,
                Payload::CancelTask {
                    task_id: task_id.to_string(),
                },
            )
            .await
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tracker.task(task_id)
    }

    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Option<TaskRecord> {
        self.tracker.wait_for_terminal(task_id, timeout).await
    }

    /// 订阅状态广播频道（所有任务）
    pub async fn subscribe_status(&self) -> Result<Subscription, AgentError> {
        Ok(self.bus.subscribe(STATUS_CHANNEL).await?)
    }

    /// 停止全部 Agent（执行器先取消并等待在途工作流，各自保存快照并释放身份），
    /// 再停止任务跟踪器；返回时每个被接纳的任务都已有终态记录
    pub async fn shutdown(self) {
        self.shutdown.shutdown(ShutdownReason::UserInitiated);
        for agent in self.agents {
            agent.shutdown().await;
        }
        self.tracker_token.cancel();
        if let Err(e) = self.tracker_task.await {
            tracing::error!(error = %e, "Task tracker failed");
        }
        self.bus.release_identity(CLIENT).await;
        tracing::info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskState;

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.app.output_dir = dir.to_path_buf();
        config.bus.poll_timeout_ms = 50;
        config
    }

    #[test]
    fn test_new_task_id_format() {
        let id = new_task_id();
        assert!(id.starts_with(TASK_ID_PREFIX));
        assert_eq!(id.len(), TASK_ID_PREFIX.len() + 36);
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::start(test_config(dir.path())).await.unwrap();

        let task_id = orchestrator
            .submit("run happily", Some("t1".into()))
            .await
            .unwrap();
        assert_eq!(task_id, "t1");

        let record = orchestrator
            .wait_for_terminal(&task_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(record.status, TaskState::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(record.artifact_dir, Some(dir.path().join("t1")));
        assert!(orchestrator.artifacts().exists("t1").await);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_orchestrator_on_same_bus_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bus: Arc<dyn MessageBus> = Arc::new(crate::bus::InMemoryBus::default());
        let first = OrchestratorBuilder::new(test_config(dir.path()))
            .with_bus(Arc::clone(&bus))
            .start()
            .await
            .unwrap();

        let second = OrchestratorBuilder::new(test_config(dir.path()))
            .with_bus(Arc::clone(&bus))
            .start()
            .await;
        assert!(matches!(second, Err(AgentError::Bus(_))));

        first.shutdown().await;
        let third = OrchestratorBuilder::new(test_config(dir.path()))
            .with_bus(bus)
            .start()
            .await
            .unwrap();
        third.shutdown().await;
    }
}
