//! 提示词分析抽象
//!
//! 所有分析后端（关键词 / LLM 服务）实现 MotionAnalyzer：从自由文本中提取动作类别与情绪。

use async_trait::async_trait;
use thiserror::Error;

use crate::workflow::AnalysisResult;

/// 分析错误
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("Analyzer backend error: {0}")]
    Backend(String),
}

/// 提示词分析 trait
#[async_trait]
pub trait MotionAnalyzer: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<AnalysisResult, AnalysisError>;
}
