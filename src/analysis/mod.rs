//! 提示词分析：抽象与默认实现（关键词）

mod keyword;
mod traits;

pub use keyword::KeywordAnalyzer;
pub use traits::{AnalysisError, MotionAnalyzer};
