//! 发布/订阅消息总线
//!
//! [`MessageBus`] 抽象传输层：按频道发布字节、订阅频道、声明 Agent 身份。
//! 默认实现 [`InMemoryBus`] 基于 `tokio::sync::broadcast`，语义为至多一次投递：
//! 发布到无订阅者的频道时消息被丢弃（与 Redis PUB/SUB 一致）。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// 每个 Agent 的订阅频道前缀
pub const AGENT_CHANNEL_PREFIX: &str = "agent:";

/// 状态更新广播频道
pub const STATUS_CHANNEL: &str = "task_status";

/// Agent 身份对应的频道名
pub fn channel_for(agent_id: &str) -> String {
    format!("{}{}", AGENT_CHANNEL_PREFIX, agent_id)
}

/// 总线错误
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Agent identity already in use: {0}")]
    IdentityInUse(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// 消息总线 trait
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布到频道，返回收到消息的订阅者数量
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// 订阅频道；返回之后发布的消息都会被该订阅收到
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError>;

    /// 声明 Agent 身份（同一身份同时只允许一个运行时）
    async fn claim_identity(&self, agent_id: &str) -> Result<(), BusError>;

    /// 释放 Agent 身份
    async fn release_identity(&self, agent_id: &str);
}

/// 单个频道的订阅句柄
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 在超时内等待下一条消息；超时返回 `Ok(None)`，便于调用方重新检查存活标志
    ///
    /// 接收方落后（lagged）时丢弃的消息只记日志，继续等待后续消息。
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(bytes)) => return Ok(Some(bytes)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        channel = %self.channel,
                        skipped,
                        "Subscriber lagged, messages dropped"
                    );
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BusError::ChannelClosed(self.channel.clone()));
                }
            }
        }
    }
}

/// 进程内消息总线
pub struct InMemoryBus {
    /// 每个频道的缓冲容量
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    identities: RwLock<HashSet<String>>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashSet::new()),
        }
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        if let Some(tx) = self.channels.read().await.get(channel) {
            return tx.clone();
        }
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let tx = match self.channels.read().await.get(channel) {
            Some(tx) => tx.clone(),
            None => {
                tracing::debug!(channel, "Publish to channel without subscribers");
                return Ok(0);
            }
        };
        // 无订阅者时 send 返回 Err，视为投递 0 份
        Ok(tx.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BusError> {
        let rx = self.sender(channel).await.subscribe();
        Ok(Subscription::new(channel, rx))
    }

    async fn claim_identity(&self, agent_id: &str) -> Result<(), BusError> {
        let mut identities = self.identities.write().await;
        if !identities.insert(agent_id.to_string()) {
            return Err(BusError::IdentityInUse(agent_id.to_string()));
        }
        Ok(())
    }

    async fn release_identity(&self, agent_id: &str) {
        self.identities.write().await.remove(agent_id);
    }
}
