//! 工作流类型定义
//!
//! 定义分析结果、工作流步骤、资源需求、步骤间输出引用等核心数据类型

use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StepId = String;

/// 提示词分析结果：动作类别 + 情绪
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// 动作类别（如 RUNNING）
    #[serde(default)]
    pub motion: String,
    /// 情绪（如 HAPPILY）
    #[serde(default)]
    pub emotion: String,
}

impl AnalysisResult {
    pub fn new(motion: impl Into<String>, emotion: impl Into<String>) -> Self {
        Self {
            motion: motion.into(),
            emotion: emotion.into(),
        }
    }

    /// 两个标签都必须非空
    pub fn is_complete(&self) -> bool {
        !self.motion.trim().is_empty() && !self.emotion.trim().is_empty()
    }
}

/// 步骤优先级，决定资源分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// 步骤动作（封闭集合）；未知名称保留为 `Other`，由执行器判定失败
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepAction {
    PrepareMotionData,
    CreateAnimation,
    ApplyPostProcessing,
    Other(String),
}

impl StepAction {
    pub fn as_str(&self) -> &str {
        match self {
            StepAction::PrepareMotionData => "prepare_motion_data",
            StepAction::CreateAnimation => "create_animation",
            StepAction::ApplyPostProcessing => "apply_post_processing",
            StepAction::Other(name) => name,
        }
    }
}

impl From<String> for StepAction {
    fn from(name: String) -> Self {
        match name.as_str() {
            "prepare_motion_data" => StepAction::PrepareMotionData,
            "create_animation" => StepAction::CreateAnimation,
            "apply_post_processing" => StepAction::ApplyPostProcessing,
            _ => StepAction::Other(name),
        }
    }
}

impl From<StepAction> for String {
    fn from(action: StepAction) -> Self {
        match action {
            StepAction::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对另一步骤输出的引用，执行器在派发前解析
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub step_id: StepId,
}

impl OutputRef {
    pub fn new(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
        }
    }
}

/// 资源需求（抽象份额，1.0 = 资源池的一个完整单位）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub gpu: f64,
    #[serde(default)]
    pub memory: f64,
}

impl ResourceDemand {
    pub fn new(cpu: f64, gpu: f64, memory: f64) -> Self {
        Self { cpu, gpu, memory }
    }
}

impl Add for ResourceDemand {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            gpu: self.gpu + other.gpu,
            memory: self.memory + other.memory,
        }
    }
}

impl<'a> Sum<&'a ResourceDemand> for ResourceDemand {
    fn sum<I: Iterator<Item = &'a ResourceDemand>>(iter: I) -> Self {
        iter.fold(ResourceDemand::default(), |acc, d| acc + *d)
    }
}

/// 工作流中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: StepId,
    pub action: StepAction,
    pub priority: Priority,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// 参数名 -> 上游步骤输出
    #[serde(default)]
    pub inputs: BTreeMap<String, OutputRef>,
}

impl WorkflowStep {
    pub fn new(step_id: impl Into<StepId>, action: StepAction, priority: Priority) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            priority,
            params: serde_json::Map::new(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, output: OutputRef) -> Self {
        self.inputs.insert(name.into(), output);
        self
    }
}

/// 工作流元数据
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub motion_type: String,
}

/// 工作流定义：有序步骤 + 依赖表 + 资源表
///
/// 步骤顺序即执行顺序，由规划器保证它是依赖表的拓扑序。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub steps: Vec<WorkflowStep>,
    pub dependencies: BTreeMap<StepId, Vec<StepId>>,
    pub resources: BTreeMap<StepId, ResourceDemand>,
    pub metadata: WorkflowMetadata,
}

impl Workflow {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 所有步骤声明的资源需求之和
    pub fn total_demand(&self) -> ResourceDemand {
        self.resources.values().sum()
    }

    pub fn demand_of(&self, step_id: &str) -> Option<ResourceDemand> {
        self.resources.get(step_id).copied()
    }

    /// 结构校验：步骤非空、ID 唯一、依赖与输入引用已知、声明顺序为拓扑序
    pub fn validate_structure(&self) -> Result<(), WorkflowError> {
        crate::workflow::graph::WorkflowGraph::new(self)?.check_declared_order(self)
    }

    /// 完整校验：结构 + 每个步骤都有资源条目
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.validate_structure()?;
        if let Some(step) = self
            .steps
            .iter()
            .find(|s| !self.resources.contains_key(&s.step_id))
        {
            return Err(WorkflowError::MissingResources(step.step_id.clone()));
        }
        Ok(())
    }
}

/// 工作流错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow has no steps")]
    Empty,
    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("No resource entry for step: {0}")]
    MissingResources(StepId),
    #[error("Dependency entry for unknown step: {0}")]
    UnknownStep(StepId),
    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("Step {step} reads output of unknown step {input}")]
    UnknownInput { step: StepId, input: StepId },
    #[error("Cyclic dependency detected")]
    CyclicDependency,
    #[error("Step {step} is ordered before its prerequisite {dependency}")]
    OutOfOrder { step: StepId, dependency: StepId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_action_string_mapping() {
        let action: StepAction = serde_json::from_str("\"create_animation\"").unwrap();
        assert_eq!(action, StepAction::CreateAnimation);

        let unknown: StepAction = serde_json::from_str("\"teleport\"").unwrap();
        assert_eq!(unknown, StepAction::Other("teleport".into()));
        assert_eq!(serde_json::to_string(&unknown).unwrap(), "\"teleport\"");
    }

    #[test]
    fn test_priority_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
        let low: Priority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(low, Priority::Low);
    }

    #[test]
    fn test_total_demand_sums_resource_map() {
        let mut workflow = Workflow::default();
        workflow.resources.insert("a".into(), ResourceDemand::new(2.0, 1.0, 8.0));
        workflow.resources.insert("b".into(), ResourceDemand::new(1.0, 0.5, 4.0));
        let total = workflow.total_demand();
        assert_eq!(total, ResourceDemand::new(3.0, 1.5, 12.0));
    }

    #[test]
    fn test_empty_json_object_is_empty_workflow() {
        let workflow: Workflow = serde_json::from_str("{}").unwrap();
        assert!(workflow.is_empty());
        assert_eq!(workflow.validate(), Err(WorkflowError::Empty));
    }

    #[test]
    fn test_validate_requires_resources_for_every_step() {
        let mut workflow = Workflow::default();
        workflow.steps.push(WorkflowStep::new("a", StepAction::PrepareMotionData, Priority::Low));
        assert_eq!(
            workflow.validate(),
            Err(WorkflowError::MissingResources("a".into()))
        );
        workflow.resources.insert("a".into(), ResourceDemand::default());
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_analysis_result_completeness() {
        assert!(AnalysisResult::new("RUNNING", "HAPPILY").is_complete());
        assert!(!AnalysisResult::new("RUNNING", " ").is_complete());
        assert!(!AnalysisResult::default().is_complete());
    }
}
