//! Agent 运行时：订阅 / 接收 / 分发循环
//!
//! 每个 Agent 一个独立的 tokio 任务：在自己的频道上带超时接收消息，按 intent 交给
//! [`Agent::process`] 处理。处理失败（包括 panic）只记日志，循环继续；无法解码的消息直接丢弃。
//! 启动时恢复状态快照；停止时先让 Agent 收尾（[`Agent::on_stop`]），再保存快照并释放身份。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{channel_for, AgentId, Message, MessageBus, Payload, Subscription, STATUS_CHANNEL};
use crate::core::AgentError;
use crate::state::{state_key, StateStore};

/// Agent 行为：由各具体 Agent 实现
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Agent 身份（同时是订阅频道 `agent:<id>`）
    fn id(&self) -> &str;

    /// 处理一条消息
    async fn process(&self, ctx: &AgentContext, message: Message) -> Result<(), AgentError>;

    /// 当前状态快照；返回 None 表示没有需要保存的状态
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// 从快照恢复
    fn restore(&self, _state: serde_json::Value) -> Result<(), AgentError> {
        Ok(())
    }

    /// 循环退出后、保存快照前调用；Agent 在此收尾自己派生的后台任务
    async fn on_stop(&self, _ctx: &AgentContext) {}
}

/// 处理消息时可用的发送能力
#[derive(Clone)]
pub struct AgentContext {
    id: AgentId,
    bus: Arc<dyn MessageBus>,
}

impl AgentContext {
    pub fn new(id: impl Into<AgentId>, bus: Arc<dyn MessageBus>) -> Self {
        Self { id: id.into(), bus }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 发送到指定 Agent 的频道
    pub async fn send(&self, receiver: &str, payload: Payload) -> Result<(), AgentError> {
        self.publish(&channel_for(receiver), payload).await
    }

    /// 发布状态更新到广播频道
    pub async fn broadcast_status(&self, payload: Payload) -> Result<(), AgentError> {
        self.publish(STATUS_CHANNEL, payload).await
    }

    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), AgentError> {
        let message = Message::new(self.id.clone(), payload);
        let delivered = self.bus.publish(channel, message.to_bytes()?).await?;
        tracing::debug!(
            from = %self.id,
            channel,
            intent = message.intent(),
            delivered,
            "Message published"
        );
        Ok(())
    }
}

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 接收超时；超时后重新检查停止信号
    pub poll_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Agent 运行时
pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    bus: Arc<dyn MessageBus>,
    store: Option<Arc<dyn StateStore>>,
    config: RuntimeConfig,
    token: CancellationToken,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            agent,
            bus,
            store: None,
            config: RuntimeConfig::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 使用外部 token（通常是关闭管理器的子 token）控制停止
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// 保存当前状态快照
    pub async fn save_state(&self) -> Result<(), AgentError> {
        let (Some(store), Some(state)) = (&self.store, self.agent.snapshot()) else {
            return Ok(());
        };
        store
            .save(&state_key(self.agent.id()), &state)
            .await
            .map_err(|e| AgentError::State(e.to_string()))
    }

    /// 加载状态快照；没有快照时返回 false（冷启动）
    pub async fn load_state(&self) -> Result<bool, AgentError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let loaded = store
            .load(&state_key(self.agent.id()))
            .await
            .map_err(|e| AgentError::State(e.to_string()))?;
        match loaded {
            Some(state) => {
                self.agent.restore(state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 声明身份并订阅频道后启动循环；返回时订阅已生效，之后发布的消息不会丢失
    pub async fn spawn(self) -> Result<AgentHandle, AgentError> {
        let id = self.agent.id().to_string();
        self.bus.claim_identity(&id).await?;

        let subscription = match self.bus.subscribe(&channel_for(&id)).await {
            Ok(sub) => sub,
            Err(e) => {
                self.bus.release_identity(&id).await;
                return Err(e.into());
            }
        };

        match self.load_state().await {
            Ok(true) => tracing::info!(agent = %id, "Agent state restored"),
            Ok(false) => tracing::debug!(agent = %id, "No saved state, cold start"),
            Err(e) => tracing::warn!(agent = %id, error = %e, "Failed to load agent state"),
        }

        let token = self.token.clone();
        let join = tokio::spawn(self.run(subscription));
        Ok(AgentHandle { id, token, join })
    }

    async fn run(self, mut subscription: Subscription) {
        let id = self.agent.id().to_string();
        let ctx = AgentContext::new(id.clone(), Arc::clone(&self.bus));
        tracing::info!(agent = %id, channel = subscription.channel(), "Agent started");

        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => break,
                received = subscription.recv_timeout(self.config.poll_timeout) => received,
            };

            match received {
                Ok(Some(bytes)) => self.dispatch(&ctx, &bytes).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(agent = %id, error = %e, "Subscription lost, stopping agent");
                    break;
                }
            }

            tokio::task::yield_now().await;
        }

        self.agent.on_stop(&ctx).await;
        if let Err(e) = self.save_state().await {
            tracing::warn!(agent = %id, error = %e, "Failed to save agent state");
        }
        self.bus.release_identity(&id).await;
        tracing::info!(agent = %id, "Agent stopped");
    }

    async fn dispatch(&self, ctx: &AgentContext, bytes: &[u8]) {
        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(agent = %ctx.id(), error = %e, "Dropping malformed message");
                return;
            }
        };

        let intent = message.intent();
        tracing::debug!(agent = %ctx.id(), from = message.sender(), intent, "Message received");

        match AssertUnwindSafe(self.agent.process(ctx, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(agent = %ctx.id(), intent, error = %e, "Message processing failed");
            }
            Err(_) => {
                tracing::error!(agent = %ctx.id(), intent, "Message processing panicked");
            }
        }
    }
}

/// 运行中的 Agent 句柄
pub struct AgentHandle {
    id: AgentId,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// 请求停止（下一次循环检查时退出）
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// 停止并等待循环退出（含状态保存）
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            tracing::error!(agent = %self.id, error = %e, "Agent task failed");
        }
    }
}
