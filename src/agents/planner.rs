//! WorkflowPlanner：分析结果 -> 工作流（步骤 + 依赖 + 资源）

use async_trait::async_trait;
use serde_json::json;

use crate::agents::{
    non_empty, report_error, untracked_task_id, Agent, AgentContext, TASK_EXECUTOR,
    WORKFLOW_PLANNER,
};
use crate::bus::{Message, Payload};
use crate::config::PlannerSection;
use crate::core::AgentError;
use crate::workflow::{
    AnalysisResult, OutputRef, Priority, StepAction, Workflow, WorkflowBuilder, WorkflowStep,
};

pub const PREPARE_STEP: &str = "prepare_motion";
pub const GENERATE_STEP: &str = "generate_animation";
pub const POST_PROCESS_STEP: &str = "post_process";

#[derive(Debug, Clone, Default)]
pub struct WorkflowPlanner {
    section: PlannerSection,
}

impl WorkflowPlanner {
    pub fn new(section: PlannerSection) -> Self {
        Self { section }
    }

    /// 生成线性工作流：准备动作数据 -> 生成动画 -> 后处理
    pub fn plan(&self, analysis: &AnalysisResult) -> Result<Workflow, AgentError> {
        if !analysis.is_complete() {
            return Err(AgentError::InvalidAnalysis(format!(
                "motion={:?} emotion={:?}",
                analysis.motion, analysis.emotion
            )));
        }

        let motion = analysis.motion.to_lowercase();
        let priority = if self
            .section
            .high_priority_motions
            .iter()
            .any(|m| m.to_lowercase() == motion)
        {
            Priority::High
        } else {
            Priority::Medium
        };

        let prepare = WorkflowStep::new(PREPARE_STEP, StepAction::PrepareMotionData, priority)
            .with_param("emotion", analysis.emotion.clone())
            .with_param("motion_type", analysis.motion.clone());
        let generate = WorkflowStep::new(GENERATE_STEP, StepAction::CreateAnimation, priority)
            .with_param("style", "default")
            .with_input("motion_data", OutputRef::new(PREPARE_STEP));

        let builder = WorkflowBuilder::new()
            .metadata(analysis.emotion.clone(), analysis.motion.clone())
            .step(prepare)
            .then(generate);

        // 后处理总是读取紧邻的上一步输出
        let previous = builder.last_step_id().unwrap_or(GENERATE_STEP).to_string();
        let post = WorkflowStep::new(POST_PROCESS_STEP, StepAction::ApplyPostProcessing, Priority::Low)
            .with_param("effects", json!([]))
            .with_input("animation", OutputRef::new(previous));

        let mut workflow = builder.then(post).build()?;
        self.optimize_workflow(&mut workflow);
        Ok(workflow)
    }

    /// 按优先级为每个步骤分配资源
    pub fn optimize_workflow(&self, workflow: &mut Workflow) {
        workflow.resources = workflow
            .steps
            .iter()
            .map(|step| (step.step_id.clone(), self.section.profile(step.priority)))
            .collect();
    }
}

#[async_trait]
impl Agent for WorkflowPlanner {
    fn id(&self) -> &str {
        WORKFLOW_PLANNER
    }

    async fn process(&self, ctx: &AgentContext, message: Message) -> Result<(), AgentError> {
        let (task_id, analysis_result, original_prompt) = match message.into_payload() {
            Payload::PlanWorkflow {
                task_id,
                analysis_result,
                original_prompt,
            } => (task_id, analysis_result, original_prompt),
            other => {
                tracing::warn!(intent = other.intent(), "Planner ignoring unexpected intent");
                return Ok(());
            }
        };

        let Some(task_id) = non_empty(task_id) else {
            return report_error(ctx, &untracked_task_id(), &AgentError::MissingField("task_id")).await;
        };
        let Some(analysis) = analysis_result else {
            return report_error(ctx, &task_id, &AgentError::MissingField("analysis_result")).await;
        };

        let workflow = match self.plan(&analysis) {
            Ok(workflow) => workflow,
            Err(e) => return report_error(ctx, &task_id, &e).await,
        };

        tracing::info!(task_id = %task_id, steps = workflow.len(), "Workflow planned");
        ctx.send(
            TASK_EXECUTOR,
            Payload::ExecuteWorkflow {
                task_id,
                workflow,
                original_prompt,
            },
        )
        .await
    }
}
