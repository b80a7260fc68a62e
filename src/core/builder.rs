//! 编排器构建器：统一的组装逻辑
//!
//! CLI 与测试共用同一套组装：总线、四个 Agent、任务跟踪器。各协作者（分析后端、步骤处理器、
//! 状态存储、总线）都可替换，未指定时按配置构建默认实现。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agents::{
    Agent, AgentContext, AgentHandle, AgentRuntime, Controller, PromptAnalyzer, RuntimeConfig,
    TaskExecutor, WorkflowPlanner, CLIENT,
};
use crate::analysis::{KeywordAnalyzer, MotionAnalyzer};
use crate::bus::{InMemoryBus, MessageBus};
use crate::config::AppConfig;
use crate::core::{AgentError, Orchestrator, ShutdownManager};
use crate::execution::{ArtifactStore, HandlerRegistry};
use crate::state::{FileStateStore, MemoryStateStore, StateStore};
use crate::tasks::TaskTracker;

pub struct OrchestratorBuilder {
    config: AppConfig,
    bus: Option<Arc<dyn MessageBus>>,
    analyzer: Option<Arc<dyn MotionAnalyzer>>,
    handlers: Option<HandlerRegistry>,
    state_store: Option<Arc<dyn StateStore>>,
    shutdown: Option<ShutdownManager>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            bus: None,
            analyzer: None,
            handlers: None,
            state_store: None,
            shutdown: None,
        }
    }

    /// 使用外部总线（默认按 [bus] 段创建 InMemoryBus）
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// 替换提示词分析后端（默认 KeywordAnalyzer）
    pub fn with_analyzer(mut self, analyzer: Arc<dyn MotionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// 替换步骤处理器（默认三个内置处理器）
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_shutdown_manager(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// 配置了 state_dir 时使用文件快照，否则只保存在内存
    fn build_state_store(&self) -> Arc<dyn StateStore> {
        match &self.config.app.state_dir {
            Some(dir) => Arc::new(FileStateStore::new(dir)),
            None => Arc::new(MemoryStateStore::new()),
        }
    }

    fn build_agents(&mut self) -> Vec<Arc<dyn Agent>> {
        let config = &self.config;
        let analyzer = self
            .analyzer
            .take()
            .unwrap_or_else(|| Arc::new(KeywordAnalyzer::from_config(&config.analyzer)));
        let artifacts = ArtifactStore::new(&config.app.output_dir);

        let mut agents: Vec<Arc<dyn Agent>> = Vec::with_capacity(4);
        agents.push(Arc::new(Controller::new()));
        agents.push(Arc::new(PromptAnalyzer::new(
            analyzer,
            Duration::from_secs(config.analyzer.timeout_secs.max(1)),
        )));
        agents.push(Arc::new(WorkflowPlanner::new(config.planner.clone())));
        agents.push(Arc::new(TaskExecutor::from_config(
            &config.executor,
            artifacts,
            self.handlers.take(),
        )));
        agents
    }

    /// 启动全部 Agent 与任务跟踪器；返回时所有订阅均已生效
    pub async fn start(mut self) -> Result<Orchestrator, AgentError> {
        let bus = self
            .bus
            .take()
            .unwrap_or_else(|| Arc::new(InMemoryBus::new(self.config.bus.capacity)));
        let store = self
            .state_store
            .take()
            .unwrap_or_else(|| self.build_state_store());
        let shutdown = self.shutdown.take().unwrap_or_default();
        let runtime_config = RuntimeConfig {
            poll_timeout: self.config.bus.poll_timeout(),
        };

        bus.claim_identity(CLIENT).await?;

        let mut handles: Vec<AgentHandle> = Vec::new();
        for agent in self.build_agents() {
            let spawned = AgentRuntime::new(agent, Arc::clone(&bus))
                .with_config(runtime_config.clone())
                .with_state_store(Arc::clone(&store))
                .with_cancellation(shutdown.child_token())
                .spawn()
                .await;
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        handle.shutdown().await;
                    }
                    bus.release_identity(CLIENT).await;
                    return Err(e);
                }
            }
        }

        // 跟踪器不挂在关闭管理器上：Agent 停止时发布的终态还需要它记录
        let tracker = Arc::new(TaskTracker::new(&self.config.app.output_dir));
        let tracker_token = CancellationToken::new();
        let tracker_task = match tracker
            .attach(Arc::clone(&bus), CLIENT, tracker_token.clone())
            .await
        {
            Ok(task) => task,
            Err(e) => {
                for handle in handles {
                    handle.shutdown().await;
                }
                bus.release_identity(CLIENT).await;
                return Err(e.into());
            }
        };

        tracing::info!(
            agents = handles.len(),
            output_dir = %self.config.app.output_dir.display(),
            "Orchestrator started"
        );

        Ok(Orchestrator::new(
            AgentContext::new(CLIENT, Arc::clone(&bus)),
            bus,
            tracker,
            tracker_task,
            tracker_token,
            handles,
            shutdown,
            ArtifactStore::new(&self.config.app.output_dir),
        ))
    }
}
