//! 端到端集成测试：Orchestrator -> Controller -> PromptAnalyzer -> WorkflowPlanner -> TaskExecutor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use choreo::agents::UNTRACKED_TASK_PREFIX;
use choreo::analysis::{AnalysisError, MotionAnalyzer};
use choreo::bus::{Message, Payload, Subscription, TaskStatus};
use choreo::config::AppConfig;
use choreo::execution::{HandlerRegistry, PostProcessor, PrepareMotionData, StepData, StepHandler};
use choreo::state::{state_key, FileStateStore, StateStore};
use choreo::workflow::{AnalysisResult, StepAction};
use choreo::{Orchestrator, OrchestratorBuilder, TaskState};

const WAIT: Duration = Duration::from_secs(10);

fn test_config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.output_dir = dir.join("output");
    config.bus.poll_timeout_ms = 50;
    config
}

async fn updates_for(sub: &mut Subscription, task_id: &str) -> Vec<(TaskStatus, f64)> {
    let mut updates = Vec::new();
    while let Some(bytes) = sub.recv_timeout(Duration::from_millis(500)).await.unwrap() {
        if let Payload::StatusUpdate {
            task_id: id,
            status,
            progress,
        } = Message::from_bytes(&bytes).unwrap().into_payload()
        {
            if id == task_id {
                updates.push((status, progress));
                if status == TaskStatus::Completed || status == TaskStatus::Failed {
                    break;
                }
            }
        }
    }
    updates
}

struct FailingAnalyzer;

#[async_trait]
impl MotionAnalyzer for FailingAnalyzer {
    async fn analyze(&self, _prompt: &str) -> Result<AnalysisResult, AnalysisError> {
        Err(AnalysisError::Backend("model unavailable".into()))
    }
}

/// create_animation 拿到许可后才返回
struct HeldSynthesizer {
    permits: Arc<Semaphore>,
}

#[async_trait]
impl StepHandler for HeldSynthesizer {
    fn action(&self) -> StepAction {
        StepAction::CreateAnimation
    }

    async fn run(&self, _params: StepData) -> Result<StepData, String> {
        self.permits
            .acquire()
            .await
            .map_err(|e| e.to_string())?
            .forget();
        Ok(json!({"poses": [[0.0]], "fps": 30.0}).as_object().cloned().unwrap_or_default())
    }
}

#[tokio::test]
async fn test_prompt_to_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let frame_count = config.executor.frame_count;
    let fps = config.executor.fps;
    let orchestrator = Orchestrator::start(config).await.unwrap();

    let mut status = orchestrator.subscribe_status().await.unwrap();
    let task_id = orchestrator
        .submit("make the character run happily", None)
        .await
        .unwrap();
    assert!(task_id.starts_with("task_"));

    let updates = updates_for(&mut status, &task_id).await;
    let progress: Vec<f64> = updates.iter().map(|(_, p)| (p * 10.0).round() / 10.0).collect();
    assert_eq!(progress, vec![0.0, 33.3, 66.7, 100.0, 100.0]);
    assert_eq!(updates.last().unwrap().0, TaskStatus::Completed);

    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Completed);
    assert_eq!(record.prompt, "make the character run happily");
    assert!(record.error.is_none());
    assert!(record.finished_at.is_some());

    let (animation, metadata) = orchestrator.artifacts().load(&task_id).await.unwrap();
    assert_eq!(animation.poses.len(), frame_count);
    assert_eq!(metadata.duration, frame_count as f64 / fps);
    assert_eq!(
        record.artifact_dir.unwrap(),
        dir.path().join("output").join(&task_id)
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_empty_prompt_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::start(test_config(dir.path())).await.unwrap();

    let task_id = orchestrator.submit("   ", Some("t-empty".into())).await.unwrap();
    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Failed);
    assert!(record.error.unwrap().contains("prompt"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_analyzer_failure_reaches_caller() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = OrchestratorBuilder::new(test_config(dir.path()))
        .with_analyzer(Arc::new(FailingAnalyzer))
        .start()
        .await
        .unwrap();

    let task_id = orchestrator.submit("run", None).await.unwrap();
    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Failed);
    assert!(record.error.unwrap().contains("model unavailable"));
    assert!(!orchestrator.artifacts().exists(&task_id).await);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_insufficient_resources_fail_without_status() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.executor.cpu_capacity = 1.0;
    config.executor.gpu_capacity = 1.0;
    let orchestrator = Orchestrator::start(config).await.unwrap();

    let mut status = orchestrator.subscribe_status().await.unwrap();
    let task_id = orchestrator.submit("run happily", None).await.unwrap();
    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Failed);
    assert!(record.error.unwrap().starts_with("insufficient resources"));
    assert!(updates_for(&mut status, &task_id).await.is_empty());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_missing_step_handler_fails_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut handlers = HandlerRegistry::new();
    handlers.register(PrepareMotionData::new(config.executor.fps));
    handlers.register(PostProcessor);
    let orchestrator = OrchestratorBuilder::new(config)
        .with_handlers(handlers)
        .start()
        .await
        .unwrap();

    let mut status = orchestrator.subscribe_status().await.unwrap();
    let task_id = orchestrator.submit("walk sadly", None).await.unwrap();
    let updates = updates_for(&mut status, &task_id).await;
    assert_eq!(updates.last().unwrap(), &(TaskStatus::Failed, 0.0));

    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Failed);
    assert!(record.error.unwrap().contains("create_animation"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_through_controller() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let permits = Arc::new(Semaphore::new(0));
    let mut handlers = HandlerRegistry::with_defaults(&config.executor);
    handlers.register(HeldSynthesizer {
        permits: Arc::clone(&permits),
    });
    let orchestrator = OrchestratorBuilder::new(config)
        .with_handlers(handlers)
        .start()
        .await
        .unwrap();

    let mut status = orchestrator.subscribe_status().await.unwrap();
    let task_id = orchestrator.submit("jump", Some("t-cancel".into())).await.unwrap();

    // 等第一步完成（running 33.3）后取消
    loop {
        let bytes = status.recv_timeout(WAIT).await.unwrap().expect("status update");
        if let Payload::StatusUpdate { progress, .. } = Message::from_bytes(&bytes).unwrap().into_payload() {
            if progress > 0.0 {
                break;
            }
        }
    }
    orchestrator.cancel(&task_id).await.unwrap();

    let record = orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskState::Cancelled);
    permits.add_permits(10);

    // 停止事件到达后进度细化为已完成步骤的比例
    let mut refined = false;
    for _ in 0..50 {
        let record = orchestrator.task(&task_id).unwrap();
        if (record.progress - 100.0 / 3.0).abs() < 0.01 {
            refined = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refined);
    assert_eq!(orchestrator.task(&task_id).unwrap().status, TaskState::Cancelled);
    assert!(!orchestrator.artifacts().exists(&task_id).await);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_start_task_without_id_reports_untracked_error() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::start(test_config(dir.path())).await.unwrap();

    let raw = Message::new(
        "external",
        Payload::StartTask {
            task_id: None,
            prompt: Some("run".into()),
        },
    );
    orchestrator
        .bus()
        .publish("agent:controller", raw.to_bytes().unwrap())
        .await
        .unwrap();

    let mut found = None;
    for _ in 0..100 {
        found = orchestrator
            .tracker()
            .tasks()
            .into_iter()
            .find(|t| t.task_id.starts_with(UNTRACKED_TASK_PREFIX));
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = found.expect("untracked task error should reach the caller");
    assert_eq!(record.status, TaskState::Failed);
    assert!(record.error.unwrap().contains("task_id"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_agent_state_persisted_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let state_dir = dir.path().join("state");
    config.app.state_dir = Some(state_dir.clone());

    let orchestrator = Orchestrator::start(config.clone()).await.unwrap();
    let task_id = orchestrator.submit("dance calmly", None).await.unwrap();
    orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    orchestrator.shutdown().await;

    let store = FileStateStore::new(&state_dir);
    let saved = store.load(&state_key("controller")).await.unwrap().unwrap();
    assert_eq!(saved, json!({"started": 1, "failed": 0}));

    // 重启后计数从快照继续
    let orchestrator = Orchestrator::start(config).await.unwrap();
    let task_id = orchestrator.submit("", None).await.unwrap();
    orchestrator.wait_for_terminal(&task_id, WAIT).await.unwrap();
    orchestrator.shutdown().await;

    let saved = store.load(&state_key("controller")).await.unwrap().unwrap();
    assert_eq!(saved, json!({"started": 1, "failed": 1}));
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let permits = Arc::new(Semaphore::new(0));
    let mut handlers = HandlerRegistry::with_defaults(&config.executor);
    handlers.register(HeldSynthesizer {
        permits: Arc::clone(&permits),
    });
    let orchestrator = OrchestratorBuilder::new(config)
        .with_handlers(handlers)
        .start()
        .await
        .unwrap();

    let mut status = orchestrator.subscribe_status().await.unwrap();
    let task_id = orchestrator.submit("walk", Some("t-stop".into())).await.unwrap();
    loop {
        let bytes = status.recv_timeout(WAIT).await.unwrap().expect("status update");
        if let Payload::StatusUpdate { progress, .. } = Message::from_bytes(&bytes).unwrap().into_payload() {
            if progress > 0.0 {
                break;
            }
        }
    }

    let tracker = Arc::clone(orchestrator.tracker());
    let artifacts = orchestrator.artifacts().clone();
    let stopping = tokio::spawn(orchestrator.shutdown());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stopping.is_finished());

    permits.add_permits(10);
    stopping.await.unwrap();

    // 关闭返回时任务已有终态，之后也不会再写产物
    let record = tracker.task(&task_id).unwrap();
    assert_eq!(record.status, TaskState::Cancelled);
    assert!((record.progress - 100.0 / 3.0).abs() < 0.01);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!artifacts.exists(&task_id).await);
}
