//! PromptAnalyzer：提示词 -> 分析结果，转交规划器

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::{
    non_empty, report_error, untracked_task_id, Agent, AgentContext, PROMPT_ANALYZER,
    WORKFLOW_PLANNER,
};
use crate::analysis::MotionAnalyzer;
use crate::bus::{Message, Payload};
use crate::core::AgentError;
use crate::workflow::AnalysisResult;

pub struct PromptAnalyzer {
    analyzer: Arc<dyn MotionAnalyzer>,
    timeout: Duration,
}

impl PromptAnalyzer {
    pub fn new(analyzer: Arc<dyn MotionAnalyzer>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }

    /// 带超时调用分析后端，并校验两个标签非空
    pub async fn analyze(&self, prompt: &str) -> Result<AnalysisResult, AgentError> {
        let result = tokio::time::timeout(self.timeout, self.analyzer.analyze(prompt))
            .await
            .map_err(|_| AgentError::AnalysisTimeout(self.timeout.as_secs()))??;

        if !result.is_complete() {
            return Err(AgentError::InvalidAnalysis(format!(
                "motion={:?} emotion={:?}",
                result.motion, result.emotion
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl Agent for PromptAnalyzer {
    fn id(&self) -> &str {
        PROMPT_ANALYZER
    }

    async fn process(&self, ctx: &AgentContext, message: Message) -> Result<(), AgentError> {
        let (task_id, prompt) = match message.into_payload() {
            Payload::AnalyzePrompt { task_id, prompt } => (task_id, prompt),
            other => {
                tracing::warn!(intent = other.intent(), "Analyzer ignoring unexpected intent");
                return Ok(());
            }
        };

        let Some(task_id) = non_empty(task_id) else {
            return report_error(ctx, &untracked_task_id(), &AgentError::MissingField("task_id")).await;
        };
        let Some(prompt) = non_empty(prompt) else {
            return report_error(ctx, &task_id, &AgentError::MissingField("prompt")).await;
        };

        match self.analyze(&prompt).await {
            Ok(analysis) => {
                tracing::info!(
                    task_id = %task_id,
                    motion = %analysis.motion,
                    emotion = %analysis.emotion,
                    "Prompt analyzed"
                );
                ctx.send(
                    WORKFLOW_PLANNER,
                    Payload::PlanWorkflow {
                        task_id: Some(task_id),
                        analysis_result: Some(analysis),
                        original_prompt: prompt,
                    },
                )
                .await
            }
            Err(e) => report_error(ctx, &task_id, &e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisError, KeywordAnalyzer};
    use crate::bus::{InMemoryBus, MessageBus, Subscription};

    struct Stalled;

    #[async_trait]
    impl MotionAnalyzer for Stalled {
        async fn analyze(&self, _prompt: &str) -> Result<AnalysisResult, AnalysisError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(AnalysisResult::new("RUNNING", "HAPPILY"))
        }
    }

    struct Blank;

    #[async_trait]
    impl MotionAnalyzer for Blank {
        async fn analyze(&self, _prompt: &str) -> Result<AnalysisResult, AnalysisError> {
            Ok(AnalysisResult::new("RUNNING", ""))
        }
    }

    async fn next(sub: &mut Subscription) -> Payload {
        let bytes = sub
            .recv_timeout(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("expected a message");
        Message::from_bytes(&bytes).unwrap().into_payload()
    }

    fn analyze_prompt(task_id: Option<&str>, prompt: &str) -> Message {
        Message::new(
            "controller",
            Payload::AnalyzePrompt {
                task_id: task_id.map(String::from),
                prompt: Some(prompt.into()),
            },
        )
    }

    async fn run_with(
        analyzer: Arc<dyn MotionAnalyzer>,
        timeout: Duration,
        message: Message,
    ) -> (Subscription, Subscription) {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::default());
        let planner = bus.subscribe("agent:workflow_planner").await.unwrap();
        let controller = bus.subscribe("agent:controller").await.unwrap();
        let ctx = AgentContext::new(PROMPT_ANALYZER, bus);
        PromptAnalyzer::new(analyzer, timeout)
            .process(&ctx, message)
            .await
            .unwrap();
        (planner, controller)
    }

    #[tokio::test]
    async fn test_forwards_analysis_to_planner() {
        let (mut planner, _) = run_with(
            Arc::new(KeywordAnalyzer::default()),
            Duration::from_secs(1),
            analyze_prompt(Some("t1"), "run happily"),
        )
        .await;

        assert_eq!(
            next(&mut planner).await,
            Payload::PlanWorkflow {
                task_id: Some("t1".into()),
                analysis_result: Some(AnalysisResult::new("RUNNING", "HAPPILY")),
                original_prompt: "run happily".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_reports_execution_error() {
        let (_, mut controller) = run_with(
            Arc::new(Stalled),
            Duration::from_millis(20),
            analyze_prompt(Some("t1"), "run"),
        )
        .await;

        match next(&mut controller).await {
            Payload::ExecutionError { task_id, error } => {
                assert_eq!(task_id, "t1");
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incomplete_analysis_reports_error() {
        let (_, mut controller) = run_with(
            Arc::new(Blank),
            Duration::from_secs(1),
            analyze_prompt(Some("t1"), "run"),
        )
        .await;
        assert!(matches!(
            next(&mut controller).await,
            Payload::ExecutionError { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_task_id_reports_sentinel() {
        let (_, mut controller) = run_with(
            Arc::new(KeywordAnalyzer::default()),
            Duration::from_secs(1),
            analyze_prompt(None, "run"),
        )
        .await;
        match next(&mut controller).await {
            Payload::ExecutionError { task_id, .. } => {
                assert!(task_id.starts_with(crate::agents::UNTRACKED_TASK_PREFIX))
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
