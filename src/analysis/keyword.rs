//! 关键词分析器（默认实现，无需外部服务）
//!
//! 按提示词中词语出现顺序查找第一个命中的动作关键词与情绪关键词；未命中时使用配置的默认标签。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use regex::Regex;

use crate::analysis::{AnalysisError, MotionAnalyzer};
use crate::config::AnalyzerSection;
use crate::workflow::AnalysisResult;

/// 关键词分析器
#[derive(Debug)]
pub struct KeywordAnalyzer {
    words: Regex,
    /// 关键词 -> 动作标签
    motions: HashMap<String, String>,
    /// 关键词 -> 情绪标签
    emotions: HashMap<String, String>,
    default_motion: String,
    default_emotion: String,
}

impl KeywordAnalyzer {
    pub fn new(
        motion_keywords: &BTreeMap<String, Vec<String>>,
        emotion_keywords: &BTreeMap<String, Vec<String>>,
        default_motion: impl Into<String>,
        default_emotion: impl Into<String>,
    ) -> Self {
        Self {
            words: Regex::new(r"\w+").expect("static word pattern is valid"),
            motions: invert(motion_keywords),
            emotions: invert(emotion_keywords),
            default_motion: default_motion.into().to_uppercase(),
            default_emotion: default_emotion.into().to_uppercase(),
        }
    }

    pub fn from_config(section: &AnalyzerSection) -> Self {
        Self::new(
            &section.motion_keywords,
            &section.emotion_keywords,
            section.default_motion.clone(),
            section.default_emotion.clone(),
        )
    }

    fn first_match(&self, tokens: &[String], table: &HashMap<String, String>) -> Option<String> {
        tokens.iter().find_map(|t| table.get(t).cloned())
    }
}

impl Default for KeywordAnalyzer {
    fn default() -> Self {
        Self::from_config(&AnalyzerSection::default())
    }
}

/// 标签 -> 关键词列表  反转为  关键词 -> 标签；同一关键词出现在多个标签下时，按标签字典序先到先得
fn invert(table: &BTreeMap<String, Vec<String>>) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for (label, keywords) in table {
        for keyword in keywords {
            index
                .entry(keyword.to_lowercase())
                .or_insert_with(|| label.to_uppercase());
        }
    }
    index
}

#[async_trait]
impl MotionAnalyzer for KeywordAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<AnalysisResult, AnalysisError> {
        if prompt.trim().is_empty() {
            return Err(AnalysisError::EmptyPrompt);
        }
        let tokens: Vec<String> = self
            .words
            .find_iter(prompt)
            .map(|m| m.as_str().to_lowercase())
            .collect();

        let motion = self
            .first_match(&tokens, &self.motions)
            .unwrap_or_else(|| self.default_motion.clone());
        let emotion = self
            .first_match(&tokens, &self.emotions)
            .unwrap_or_else(|| self.default_emotion.clone());

        Ok(AnalysisResult::new(motion, emotion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_motion_and_emotion() {
        let analyzer = KeywordAnalyzer::default();
        let result = analyzer
            .analyze("Make the character run happily across the field")
            .await
            .unwrap();
        assert_eq!(result, AnalysisResult::new("RUNNING", "HAPPILY"));
    }

    #[tokio::test]
    async fn test_first_keyword_in_prompt_wins() {
        let analyzer = KeywordAnalyzer::default();
        let result = analyzer.analyze("jump, then walk slowly").await.unwrap();
        assert_eq!(result.motion, "JUMPING");
    }

    #[tokio::test]
    async fn test_falls_back_to_defaults() {
        let analyzer = KeywordAnalyzer::default();
        let result = analyzer.analyze("something unusual").await.unwrap();
        assert_eq!(result, AnalysisResult::new("WALKING", "NEUTRAL"));
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let analyzer = KeywordAnalyzer::default();
        assert!(matches!(
            analyzer.analyze("   ").await,
            Err(AnalysisError::EmptyPrompt)
        ));
    }

    #[tokio::test]
    async fn test_custom_tables() {
        let mut motions = BTreeMap::new();
        motions.insert("swimming".to_string(), vec!["swim".to_string()]);
        let analyzer = KeywordAnalyzer::new(&motions, &BTreeMap::new(), "idle", "calm");
        let result = analyzer.analyze("SWIM now").await.unwrap();
        assert_eq!(result, AnalysisResult::new("SWIMMING", "CALM"));
    }
}
