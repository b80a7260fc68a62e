//! 优雅关闭
//!
//! 根 token 被取消时，所有 Agent 运行时（持有子 token）退出循环、收尾、保存快照并释放身份；
//! 关闭原因通过广播通知关心的一方（如 CLI 决定退出信息）。

use std::fmt;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// 调用方主动关闭（任务结束或 Ctrl+C）
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 致命错误
    FatalError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => write!(f, "interrupted by user"),
            ShutdownReason::Signal => write!(f, "terminated by signal"),
            ShutdownReason::FatalError(e) => write!(f, "aborted: {}", e),
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 子 token：根 token 取消时一并取消，单独取消不影响其他组件
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    /// 触发关闭（重复调用只有第一次的原因会被广播）
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown triggered");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    /// 订阅关闭原因；只收到订阅之后触发的那一次
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
