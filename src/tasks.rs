//! 调用方任务跟踪
//!
//! 订阅 `task_status` 广播频道与 `agent:client` 错误频道，维护每个任务的生命周期记录：
//! pending -> running -> completed | failed | cancelled。终态记录不再改变，唯一例外是
//! cancelled 记录会采用同一任务后续 cancelled 更新中的进度（取消确认之后的停止事件）。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{channel_for, BusError, Message, MessageBus, Payload, TaskStatus, STATUS_CHANNEL};

/// 请求日志保留条数
pub const REQUEST_LOG_CAPACITY: usize = 1000;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl From<TaskStatus> for TaskState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Running => TaskState::Running,
            TaskStatus::Completed => TaskState::Completed,
            TaskStatus::Failed => TaskState::Failed,
            TaskStatus::Cancelled => TaskState::Cancelled,
        }
    }
}

/// 单个任务的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub prompt: String,
    pub status: TaskState,
    pub progress: f64,
    pub error: Option<String>,
    /// 完成后的产物目录
    pub artifact_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn new(task_id: &str, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            prompt: prompt.to_string(),
            status: TaskState::Pending,
            progress: 0.0,
            error: None,
            artifact_dir: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, status: TaskState) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<String, TaskRecord>,
    log: VecDeque<String>,
}

/// 任务跟踪器
pub struct TaskTracker {
    output_dir: PathBuf,
    state: Mutex<TrackerState>,
    /// 每次记录变化递增，用于等待终态
    version: watch::Sender<u64>,
}

impl TaskTracker {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            state: Mutex::new(TrackerState::default()),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// 登记新提交的任务（pending）；已存在的任务保持不变
    pub fn register(&self, task_id: &str, prompt: &str) {
        {
            let mut state = self.lock();
            if state.records.contains_key(task_id) {
                return;
            }
            state
                .records
                .insert(task_id.to_string(), TaskRecord::new(task_id, prompt));
            push_log(&mut state.log, format!("{} submitted", task_id));
        }
        self.changed();
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().records.get(task_id).cloned()
    }

    /// 全部任务，按创建时间排序
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<_> = self.lock().records.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 最近的请求日志（旧 -> 新）
    pub fn request_log(&self) -> Vec<String> {
        self.lock().log.iter().cloned().collect()
    }

    /// 应用一条来自总线的消息
    pub fn apply(&self, message: &Message) {
        match message.payload() {
            Payload::StatusUpdate {
                task_id,
                status,
                progress,
            } => self.apply_status(task_id, *status, *progress),
            Payload::TaskError { task_id, error } => self.apply_error(task_id, error),
            other => tracing::debug!(intent = other.intent(), "Tracker ignoring message"),
        }
    }

    pub fn apply_status(&self, task_id: &str, status: TaskStatus, progress: f64) {
        let next = TaskState::from(status);
        let artifact_dir = self.output_dir.join(task_id);
        {
            let mut state = self.lock();
            let record = state
                .records
                .entry(task_id.to_string())
                .or_insert_with(|| TaskRecord::new(task_id, ""));

            if record.status.is_terminal() {
                if record.status == TaskState::Cancelled && next == TaskState::Cancelled {
                    record.progress = progress;
                    record.updated_at = Utc::now();
                } else {
                    tracing::debug!(task_id, %status, "Update for finished task ignored");
                    return;
                }
            } else {
                record.progress = progress;
                record.transition(next);
                if next == TaskState::Completed {
                    record.artifact_dir = Some(artifact_dir);
                }
            }
            push_log(
                &mut state.log,
                format!("{} {} {:.1}", task_id, status, progress),
            );
        }
        self.changed();
    }

    /// 调用方错误：非终态任务转为 failed；已 failed 的任务补充错误信息
    pub fn apply_error(&self, task_id: &str, error: &str) {
        {
            let mut state = self.lock();
            let record = state
                .records
                .entry(task_id.to_string())
                .or_insert_with(|| TaskRecord::new(task_id, ""));

            if !record.status.is_terminal() {
                record.transition(TaskState::Failed);
                record.error = Some(error.to_string());
            } else if record.status == TaskState::Failed && record.error.is_none() {
                record.error = Some(error.to_string());
                record.updated_at = Utc::now();
            } else {
                tracing::debug!(task_id, error, "Error for finished task ignored");
                return;
            }
            push_log(&mut state.log, format!("{} error: {}", task_id, error));
        }
        self.changed();
    }

    /// 等待任务进入终态；超时返回当前记录（可能仍未结束），任务不存在返回 None
    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Option<TaskRecord> {
        let mut rx = self.version.subscribe();
        let wait = async {
            loop {
                if let Some(record) = self.task(task_id) {
                    if record.status.is_terminal() {
                        return;
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.task(task_id)
    }

    /// 订阅状态频道与调用方频道并在后台应用消息；返回时订阅已生效
    pub async fn attach(
        self: &Arc<Self>,
        bus: Arc<dyn MessageBus>,
        client_id: &str,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut status = bus.subscribe(STATUS_CHANNEL).await?;
        let mut client = bus.subscribe(&channel_for(client_id)).await?;
        let tracker = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let poll = Duration::from_secs(1);
            loop {
                // 先取已到达的消息，停止前把缓冲读完
                let received = tokio::select! {
                    biased;
                    r = status.recv_timeout(poll) => r,
                    r = client.recv_timeout(poll) => r,
                    _ = token.cancelled() => break,
                };
                match received {
                    Ok(Some(bytes)) => match Message::from_bytes(&bytes) {
                        Ok(message) => tracker.apply(&message),
                        Err(e) => tracing::warn!(error = %e, "Tracker dropping malformed message"),
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Tracker subscription lost");
                        break;
                    }
                }
            }
            tracing::debug!("Task tracker stopped");
        }))
    }
}

fn push_log(log: &mut VecDeque<String>, line: String) {
    if log.len() == REQUEST_LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(format!("{} {}", Utc::now().to_rfc3339(), line));
}
