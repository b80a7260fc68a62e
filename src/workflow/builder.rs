//! 工作流构建器
//!
//! 提供流畅的API来构建工作流

use std::collections::BTreeMap;

use crate::workflow::types::*;

/// 工作流构建器
#[derive(Default)]
pub struct WorkflowBuilder {
    steps: Vec<WorkflowStep>,
    dependencies: BTreeMap<StepId, Vec<StepId>>,
    metadata: WorkflowMetadata,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置元数据
    pub fn metadata(mut self, emotion: impl Into<String>, motion_type: impl Into<String>) -> Self {
        self.metadata = WorkflowMetadata {
            emotion: emotion.into(),
            motion_type: motion_type.into(),
        };
        self
    }

    /// 添加无依赖的步骤
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 添加步骤，并设置对上一个步骤的顺序依赖
    pub fn then(mut self, step: WorkflowStep) -> Self {
        if let Some(prev) = self.steps.last() {
            self.dependencies
                .entry(step.step_id.clone())
                .or_default()
                .push(prev.step_id.clone());
        }
        self.steps.push(step);
        self
    }

    /// 设置AND依赖（所有前置步骤）
    pub fn depends_on_all(mut self, step_id: impl Into<StepId>, deps: Vec<StepId>) -> Self {
        self.dependencies.entry(step_id.into()).or_default().extend(deps);
        self
    }

    /// 最后一个步骤的 ID
    pub fn last_step_id(&self) -> Option<&str> {
        self.steps.last().map(|s| s.step_id.as_str())
    }

    /// 构建工作流（资源表留空，由规划器分配）
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let workflow = Workflow {
            steps: self.steps,
            dependencies: self.dependencies,
            resources: BTreeMap::new(),
            metadata: self.metadata,
        };
        workflow.validate_structure()?;
        Ok(workflow)
    }
}
