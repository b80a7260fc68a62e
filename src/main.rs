//! Choreo - 动作生成任务编排
//!
//! 入口：初始化日志、加载配置、启动编排器，提交提示词并打印状态直到任务结束。
//!
//! ```bash
//! choreo "make the character run happily" [--task-id ID] [--config PATH]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use choreo::bus::{Message, Payload};
use choreo::config::load_config;
use choreo::core::{OrchestratorBuilder, ShutdownManager, ShutdownReason};
use choreo::TaskState;

struct CliArgs {
    prompt: String,
    task_id: Option<String>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut prompt = None;
    let mut task_id = None;
    let mut config = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--task-id" => task_id = Some(args.next().context("--task-id requires a value")?),
            "--config" => {
                config = Some(PathBuf::from(
                    args.next().context("--config requires a value")?,
                ))
            }
            "-h" | "--help" => {
                println!("Usage: choreo \"<prompt>\" [--task-id ID] [--config PATH]");
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("Unknown option: {}", other),
            other => {
                if prompt.replace(other.to_string()).is_some() {
                    bail!("Only one prompt may be given");
                }
            }
        }
    }

    Ok(CliArgs {
        prompt: prompt.context("Usage: choreo \"<prompt>\" [--task-id ID] [--config PATH]")?,
        task_id,
        config,
    })
}

/// 打印属于该任务的状态更新
fn print_update(bytes: &[u8], task_id: &str) {
    if let Ok(message) = Message::from_bytes(bytes) {
        if let Payload::StatusUpdate {
            task_id: id,
            status,
            progress,
        } = message.payload()
        {
            if id == task_id {
                println!("[{}] {} {:.1}%", id, status, progress);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    choreo::observability::init();

    let args = parse_args()?;
    let config = load_config(args.config).context("Failed to load config")?;

    // 信号触发关闭：Agent 停止，执行器取消并等待在途工作流，任务以 cancelled 结束
    let signals = ShutdownManager::new();
    let mut reasons = signals.subscribe();
    signals.install_signal_handlers();

    let orchestrator = OrchestratorBuilder::new(config)
        .with_shutdown_manager(signals)
        .start()
        .await
        .context("Failed to start orchestrator")?;

    let mut updates = orchestrator
        .subscribe_status()
        .await
        .context("Failed to subscribe to status updates")?;
    let task_id = orchestrator
        .submit(&args.prompt, args.task_id)
        .await
        .context("Failed to submit task")?;
    println!("Submitted task {}", task_id);

    let interrupted = loop {
        if let Some(record) = orchestrator.task(&task_id) {
            if record.status.is_terminal() {
                break None;
            }
        }
        tokio::select! {
            reason = reasons.recv() => {
                break Some(reason.unwrap_or(ShutdownReason::UserInitiated));
            }
            received = updates.recv_timeout(Duration::from_millis(200)) => match received {
                Ok(Some(bytes)) => print_update(&bytes, &task_id),
                Ok(None) => {}
                Err(e) => orchestrator
                    .shutdown_manager()
                    .shutdown(ShutdownReason::FatalError(format!("status subscription lost: {}", e))),
            }
        }
    };

    let tracker = Arc::clone(orchestrator.tracker());
    orchestrator.shutdown().await;

    let Some(record) = tracker.task(&task_id) else {
        bail!("Task {} was not tracked", task_id);
    };
    match (record.status, interrupted) {
        (TaskState::Completed, _) => {
            if let Some(dir) = &record.artifact_dir {
                println!("Artifacts written to {}", dir.display());
            }
            Ok(())
        }
        (other, Some(reason)) => bail!("Task {} ended as {:?}: {}", task_id, other, reason),
        (other, None) => {
            let reason = record.error.unwrap_or_else(|| "no error reported".into());
            bail!("Task {} ended as {:?}: {}", task_id, other, reason)
        }
    }
}
