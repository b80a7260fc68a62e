//! TaskExecutor：准入控制、顺序执行步骤、协作式取消、产物持久化
//!
//! 每个被接纳的工作流在独立的 tokio 任务中运行，执行器本身继续接收 `cancel_workflow`
//! 与其他工作流。同一任务的所有状态发布都在持有 `state` 锁时进行，保证：进度单调（取消确认除外），
//! 终态总是最后一条。停止时取消全部未收尾的工作流，并等它们在步骤边界发布终态后才返回。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker as WorkflowTasks;

use crate::agents::{report_error, Agent, AgentContext, TASK_EXECUTOR};
use crate::bus::{Message, Payload, TaskStatus};
use crate::config::ExecutorSection;
use crate::core::AgentError;
use crate::execution::{
    ArtifactStore, HandlerRegistry, Reservation, ResourcePool, StepData, StepRunner,
};
use crate::workflow::{StepId, Workflow, WorkflowStep};

/// 运行中任务的记录
struct ActiveTask {
    cancel: CancellationToken,
    /// 已进入收尾阶段，之后的取消请求被忽略
    finalizing: bool,
    /// 任务结束（记录移除）时释放
    _reservation: Reservation,
}

struct ExecutorState {
    active: HashMap<String, ActiveTask>,
    finished: HashSet<String>,
    /// 已结束任务的先后顺序，超出容量时从最早的开始淘汰
    finished_order: VecDeque<String>,
    finished_capacity: usize,
}

impl ExecutorState {
    fn new(finished_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashSet::new(),
            finished_order: VecDeque::new(),
            finished_capacity,
        }
    }

    fn is_known(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.finished.contains(task_id)
    }

    /// 移除记录（归还资源）并记入已结束集合
    fn retire(&mut self, task_id: &str) {
        self.active.remove(task_id);
        if self.finished_capacity == 0 || !self.finished.insert(task_id.to_string()) {
            return;
        }
        self.finished_order.push_back(task_id.to_string());
        while self.finished_order.len() > self.finished_capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

struct ExecutorInner {
    pool: ResourcePool,
    runner: StepRunner,
    artifacts: ArtifactStore,
    state: Mutex<ExecutorState>,
    workflows: WorkflowTasks,
}

pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    pub fn new(
        pool: ResourcePool,
        runner: StepRunner,
        artifacts: ArtifactStore,
        finished_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                pool,
                runner,
                artifacts,
                state: Mutex::new(ExecutorState::new(finished_capacity)),
                workflows: WorkflowTasks::new(),
            }),
        }
    }

    /// 按配置构建；registry 为 None 时使用默认处理器
    pub fn from_config(
        section: &ExecutorSection,
        artifacts: ArtifactStore,
        registry: Option<HandlerRegistry>,
    ) -> Self {
        let registry = registry.unwrap_or_else(|| HandlerRegistry::with_defaults(section));
        Self::new(
            ResourcePool::new(section.cpu_capacity, section.gpu_capacity),
            StepRunner::new(registry, section.step_timeout()),
            artifacts,
            section.finished_capacity,
        )
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.inner.pool
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    /// 当前运行中的任务数
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    async fn execute_workflow(
        &self,
        ctx: &AgentContext,
        task_id: String,
        workflow: Workflow,
    ) -> Result<(), AgentError> {
        if self.inner.state.lock().await.is_known(&task_id) {
            tracing::warn!(task_id = %task_id, "Duplicate execute_workflow ignored");
            return Ok(());
        }

        if let Err(e) = workflow.validate() {
            return report_error(ctx, &task_id, &e.into()).await;
        }
        let reservation = match self.inner.pool.try_reserve(workflow.total_demand()) {
            Ok(reservation) => reservation,
            Err(e) => return report_error(ctx, &task_id, &e.into()).await,
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().await;
            state.active.insert(
                task_id.clone(),
                ActiveTask {
                    cancel: cancel.clone(),
                    finalizing: false,
                    _reservation: reservation,
                },
            );
            tracing::info!(task_id = %task_id, steps = workflow.len(), "Workflow admitted");
            publish_status(ctx, &task_id, TaskStatus::Running, 0.0).await;
        }

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        self.inner.workflows.spawn(async move {
            inner.run_workflow(&ctx, &task_id, &workflow, &cancel).await;
        });
        Ok(())
    }

    async fn cancel_workflow(&self, ctx: &AgentContext, task_id: &str) {
        let state = self.inner.state.lock().await;
        match state.active.get(task_id) {
            Some(task) if !task.finalizing && !task.cancel.is_cancelled() => {
                task.cancel.cancel();
                tracing::info!(task_id, "Workflow cancellation requested");
                publish_status(ctx, task_id, TaskStatus::Cancelled, 0.0).await;
            }
            Some(_) => tracing::info!(task_id, "Workflow is finishing, cancel ignored"),
            None => tracing::info!(task_id, "Cancel for unknown or finished task ignored"),
        }
    }

    /// 取消所有未收尾的工作流，等待它们全部结束
    async fn drain(&self) {
        let cancelled = {
            let state = self.inner.state.lock().await;
            let mut cancelled = 0;
            for task in state.active.values() {
                if !task.finalizing && !task.cancel.is_cancelled() {
                    task.cancel.cancel();
                    cancelled += 1;
                }
            }
            cancelled
        };

        self.inner.workflows.close();
        if !self.inner.workflows.is_empty() {
            tracing::info!(
                cancelled,
                running = self.inner.workflows.len(),
                "Waiting for in-flight workflows"
            );
        }
        self.inner.workflows.wait().await;
        self.inner.workflows.reopen();
    }
}

fn progress(completed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

/// 第 0 步作为种子，第 1 步替换，之后浅合并（后者覆盖）
fn merge_output(result: &mut StepData, index: usize, output: StepData) {
    if index <= 1 {
        *result = output;
    } else {
        result.extend(output);
    }
}

/// 将步骤的输出引用解析为上游步骤的输出
fn resolve_inputs(
    step: &WorkflowStep,
    outputs: &HashMap<StepId, StepData>,
) -> Result<StepData, AgentError> {
    let mut params = step.params.clone();
    for (name, reference) in &step.inputs {
        let output = outputs
            .get(&reference.step_id)
            .ok_or_else(|| AgentError::UnresolvedInput {
                step_id: step.step_id.clone(),
                input: name.clone(),
                source_step: reference.step_id.clone(),
            })?;
        params.insert(name.clone(), Value::Object(output.clone()));
    }
    Ok(params)
}

async fn publish_status(ctx: &AgentContext, task_id: &str, status: TaskStatus, progress: f64) {
    let update = Payload::StatusUpdate {
        task_id: task_id.to_string(),
        status,
        progress,
    };
    if let Err(e) = ctx.broadcast_status(update).await {
        tracing::warn!(task_id, %status, error = %e, "Failed to publish status update");
    }
}

impl ExecutorInner {
    async fn run_workflow(
        &self,
        ctx: &AgentContext,
        task_id: &str,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) {
        let total = workflow.len();
        let mut outputs: HashMap<StepId, StepData> = HashMap::new();
        let mut result = StepData::new();

        for (index, step) in workflow.steps.iter().enumerate() {
            if cancel.is_cancelled() && self.stop_if_cancelled(ctx, task_id, index, total).await {
                return;
            }

            let outcome = match resolve_inputs(step, &outputs) {
                Ok(params) => self.runner.run(step, params).await,
                Err(e) => Err(e),
            };

            match self.complete_step(ctx, task_id, index, total, outcome).await {
                Some(output) => {
                    merge_output(&mut result, index, output.clone());
                    outputs.insert(step.step_id.clone(), output);
                }
                None => return,
            }
        }

        self.finalize(ctx, task_id, &result).await;
    }

    /// 取消标志已设置时发布最终的 cancelled 并结束任务
    async fn stop_if_cancelled(
        &self,
        ctx: &AgentContext,
        task_id: &str,
        completed: usize,
        total: usize,
    ) -> bool {
        let mut state = self.state.lock().await;
        let cancelled = state
            .active
            .get(task_id)
            .map(|task| task.cancel.is_cancelled());
        match cancelled {
            Some(true) => {
                self.retire_cancelled(&mut state, ctx, task_id, completed, total)
                    .await;
                true
            }
            Some(false) => false,
            // 已结束
            None => true,
        }
    }

    async fn retire_cancelled(
        &self,
        state: &mut ExecutorState,
        ctx: &AgentContext,
        task_id: &str,
        completed: usize,
        total: usize,
    ) {
        state.retire(task_id);
        let progress = progress(completed, total);
        tracing::info!(task_id, completed, total, "Workflow cancelled");
        publish_status(ctx, task_id, TaskStatus::Cancelled, progress).await;
    }

    /// 步骤返回后的检查点：取消时丢弃输出；成功时发布进度，最后一步同时进入收尾；失败时结束任务
    async fn complete_step(
        &self,
        ctx: &AgentContext,
        task_id: &str,
        index: usize,
        total: usize,
        outcome: Result<StepData, AgentError>,
    ) -> Option<StepData> {
        let mut state = self.state.lock().await;
        let Some(task) = state.active.get_mut(task_id) else {
            return None;
        };

        if task.cancel.is_cancelled() {
            self.retire_cancelled(&mut state, ctx, task_id, index, total)
                .await;
            return None;
        }

        match outcome {
            Ok(output) => {
                let done = progress(index + 1, total);
                task.finalizing = index + 1 == total;
                publish_status(ctx, task_id, TaskStatus::Running, done).await;
                Some(output)
            }
            Err(e) => {
                self.retire_failed(&mut state, ctx, task_id, &e).await;
                None
            }
        }
    }

    async fn retire_failed(
        &self,
        state: &mut ExecutorState,
        ctx: &AgentContext,
        task_id: &str,
        error: &AgentError,
    ) {
        state.retire(task_id);
        publish_status(ctx, task_id, TaskStatus::Failed, 0.0).await;
        if let Err(e) = report_error(ctx, task_id, error).await {
            tracing::warn!(task_id, error = %e, "Failed to report execution error");
        }
    }

    async fn finalize(&self, ctx: &AgentContext, task_id: &str, result: &StepData) {
        let saved = self.artifacts.save(task_id, result).await;

        let mut state = self.state.lock().await;
        match saved {
            Ok(path) => {
                state.retire(task_id);
                tracing::info!(task_id, path = %path.display(), "Workflow completed");
                publish_status(ctx, task_id, TaskStatus::Completed, 100.0).await;
            }
            Err(e) => {
                self.retire_failed(&mut state, ctx, task_id, &e.into()).await;
            }
        }
    }
}

#[async_trait]
impl Agent for TaskExecutor {
    fn id(&self) -> &str {
        TASK_EXECUTOR
    }

    async fn process(&self, ctx: &AgentContext, message: Message) -> Result<(), AgentError> {
        match message.into_payload() {
            Payload::ExecuteWorkflow {
                task_id, workflow, ..
            } => {
                if task_id.trim().is_empty() {
                    return report_error(ctx, &task_id, &AgentError::MissingField("task_id")).await;
                }
                self.execute_workflow(ctx, task_id, workflow).await
            }
            Payload::CancelWorkflow { task_id } => {
                self.cancel_workflow(ctx, &task_id).await;
                Ok(())
            }
            other => {
                tracing::warn!(intent = other.intent(), "Executor ignoring unexpected intent");
                Ok(())
            }
        }
    }

    async fn on_stop(&self, _ctx: &AgentContext) {
        self.drain().await;
    }
}
