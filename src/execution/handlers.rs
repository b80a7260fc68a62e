//! 步骤处理器
//!
//! 每个 [`StepAction`] 对应一个 [`StepHandler`]，由 [`HandlerRegistry`] 按动作注册与查找；
//! [`StepRunner`] 在调用时加超时，并把结果映射为 [`AgentError`]。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::config::ExecutorSection;
use crate::core::AgentError;
use crate::workflow::{StepAction, WorkflowStep};

/// 步骤参数 / 输出（JSON 对象）
pub type StepData = Map<String, Value>;

/// 步骤处理器 trait
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// 处理的动作
    fn action(&self) -> StepAction;

    /// 执行；params 中已包含解析后的上游输出
    async fn run(&self, params: StepData) -> Result<StepData, String>;
}

/// 动作 -> 处理器
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepAction, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册三个内置动作的默认处理器
    pub fn with_defaults(section: &ExecutorSection) -> Self {
        let mut registry = Self::new();
        registry.register(PrepareMotionData::new(section.fps));
        registry.register(PlaceholderSynthesizer::new(section.frame_count, section.fps));
        registry.register(PostProcessor);
        registry
    }

    /// 注册处理器；同一动作后注册的覆盖先注册的
    pub fn register(&mut self, handler: impl StepHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.action(), handler);
    }

    pub fn get(&self, action: &StepAction) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(action).cloned()
    }
}

/// 步骤执行器：查找处理器并施加超时
#[derive(Clone)]
pub struct StepRunner {
    registry: HandlerRegistry,
    timeout: Duration,
}

impl StepRunner {
    pub fn new(registry: HandlerRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行单个步骤；未知动作返回 UnknownAction，超时返回 StepTimeout，处理器报错返回 StepFailed
    pub async fn run(&self, step: &WorkflowStep, params: StepData) -> Result<StepData, AgentError> {
        let handler = self
            .registry
            .get(&step.action)
            .ok_or_else(|| AgentError::UnknownAction(step.action.to_string()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, handler.run(params)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(step_id = %step.step_id, action = %step.action, duration_ms, "Step finished");
                Ok(output)
            }
            Ok(Err(reason)) => {
                tracing::warn!(step_id = %step.step_id, action = %step.action, duration_ms, %reason, "Step failed");
                Err(AgentError::StepFailed {
                    step_id: step.step_id.clone(),
                    reason,
                })
            }
            Err(_) => Err(AgentError::StepTimeout {
                step_id: step.step_id.clone(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn str_param<'a>(params: &'a StepData, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// prepare_motion_data：从 input_file 载入 `{poses, fps}`，否则生成空的动作数据种子
#[derive(Debug, Clone)]
pub struct PrepareMotionData {
    fps: f64,
}

impl PrepareMotionData {
    pub fn new(fps: f64) -> Self {
        Self { fps }
    }
}

#[async_trait]
impl StepHandler for PrepareMotionData {
    fn action(&self) -> StepAction {
        StepAction::PrepareMotionData
    }

    async fn run(&self, params: StepData) -> Result<StepData, String> {
        let mut output = StepData::new();
        output.insert("motion_type".into(), json!(str_param(&params, "motion_type")));
        output.insert("emotion".into(), json!(str_param(&params, "emotion")));

        let input_file = str_param(&params, "input_file");
        if input_file.is_empty() {
            output.insert("poses".into(), json!([]));
            output.insert("fps".into(), json!(self.fps));
            return Ok(output);
        }

        let path = PathBuf::from(input_file);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let loaded: StepData = serde_json::from_slice(&data)
            .map_err(|e| format!("invalid motion file {}: {}", path.display(), e))?;

        let poses = loaded
            .get("poses")
            .filter(|p| p.is_array())
            .cloned()
            .ok_or_else(|| format!("motion file {} has no poses array", path.display()))?;
        let fps = loaded.get("fps").and_then(Value::as_f64).unwrap_or(self.fps);

        output.insert("poses".into(), poses);
        output.insert("fps".into(), json!(fps));
        Ok(output)
    }
}

/// create_animation：占位合成器，输出 frame_count 帧、每帧 72 个 0.0
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    frame_count: usize,
    fps: f64,
}

/// 每帧关节参数个数
pub const POSE_WIDTH: usize = 72;

impl PlaceholderSynthesizer {
    pub fn new(frame_count: usize, fps: f64) -> Self {
        Self { frame_count, fps }
    }
}

#[async_trait]
impl StepHandler for PlaceholderSynthesizer {
    fn action(&self) -> StepAction {
        StepAction::CreateAnimation
    }

    async fn run(&self, params: StepData) -> Result<StepData, String> {
        let fps = params
            .get("motion_data")
            .and_then(|m| m.get("fps"))
            .and_then(Value::as_f64)
            .filter(|fps| *fps > 0.0)
            .unwrap_or(self.fps);

        let poses: Vec<Value> = (0..self.frame_count)
            .map(|_| json!(vec![0.0_f64; POSE_WIDTH]))
            .collect();

        let mut output = StepData::new();
        output.insert("poses".into(), Value::Array(poses));
        output.insert("fps".into(), json!(fps));
        Ok(output)
    }
}

/// apply_post_processing：返回参数中的 effects 列表
#[derive(Debug, Clone, Default)]
pub struct PostProcessor;

#[async_trait]
impl StepHandler for PostProcessor {
    fn action(&self) -> StepAction {
        StepAction::ApplyPostProcessing
    }

    async fn run(&self, params: StepData) -> Result<StepData, String> {
        let effects = match params.get("effects") {
            None | Some(Value::Null) => json!([]),
            Some(effects @ Value::Array(_)) => effects.clone(),
            Some(other) => return Err(format!("effects must be a list, got {}", other)),
        };
        let mut output = StepData::new();
        output.insert("effects".into(), effects);
        Ok(output)
    }
}
