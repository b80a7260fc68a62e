//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CHOREO__*` 覆盖（双下划线表示嵌套，如 `CHOREO__EXECUTOR__CPU_CAPACITY=16`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::workflow::{Priority, ResourceDemand};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub bus: BusSection,
    pub analyzer: AnalyzerSection,
    pub planner: PlannerSection,
    pub executor: ExecutorSection,
}

/// [app] 段：应用名、产物目录、Agent 状态快照目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 任务产物根目录（每个任务一个子目录）
    pub output_dir: PathBuf,
    /// Agent 状态快照目录；未设置时快照只保存在内存
    pub state_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            output_dir: PathBuf::from("output"),
            state_dir: None,
        }
    }
}

/// [bus] 段：频道缓冲与接收轮询超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// 每个频道的缓冲消息数
    pub capacity: usize,
    /// 接收超时（毫秒），超时后运行时重新检查存活标志
    pub poll_timeout_ms: u64,
}

impl BusSection {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            capacity: 256,
            poll_timeout_ms: 1000,
        }
    }
}

/// [analyzer] 段：分析超时、默认标签、关键词表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    pub timeout_secs: u64,
    pub default_motion: String,
    pub default_emotion: String,
    /// 动作标签 -> 关键词
    pub motion_keywords: BTreeMap<String, Vec<String>>,
    /// 情绪标签 -> 关键词
    pub emotion_keywords: BTreeMap<String, Vec<String>>,
}

fn keyword_table(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(label, words)| {
            (
                label.to_string(),
                words.iter().map(|w| w.to_string()).collect(),
            )
        })
        .collect()
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            default_motion: "WALKING".into(),
            default_emotion: "NEUTRAL".into(),
            motion_keywords: keyword_table(&[
                ("RUNNING", &["run", "runs", "running", "ran", "jog", "jogging", "sprint"]),
                ("WALKING", &["walk", "walks", "walking", "walked", "stroll", "strolling"]),
                ("JUMPING", &["jump", "jumps", "jumping", "hop", "leap"]),
                ("DANCING", &["dance", "dances", "dancing"]),
                ("WAVING", &["wave", "waves", "waving"]),
                ("SITTING", &["sit", "sits", "sitting"]),
            ]),
            emotion_keywords: keyword_table(&[
                ("HAPPILY", &["happy", "happily", "joyful", "joyfully", "cheerful"]),
                ("SADLY", &["sad", "sadly", "gloomy"]),
                ("ANGRILY", &["angry", "angrily", "furious"]),
                ("CALMLY", &["calm", "calmly", "relaxed"]),
                ("EXCITEDLY", &["excited", "excitedly", "energetic"]),
            ]),
        }
    }
}

/// [planner] 段：高优先级动作集合与各优先级的资源配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 命中时前两个步骤为 HIGH（小写比较）
    pub high_priority_motions: Vec<String>,
    pub high: ResourceDemand,
    pub medium: ResourceDemand,
    pub low: ResourceDemand,
}

impl PlannerSection {
    pub fn profile(&self, priority: Priority) -> ResourceDemand {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            high_priority_motions: vec!["running".into(), "walking".into()],
            high: ResourceDemand::new(2.0, 1.0, 8.0),
            medium: ResourceDemand::new(1.0, 0.5, 4.0),
            low: ResourceDemand::new(1.0, 0.0, 2.0),
        }
    }
}

/// [executor] 段：资源池容量、步骤超时、占位合成器参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// CPU 容量（抽象份额）
    pub cpu_capacity: f64,
    /// GPU 容量（抽象份额）
    pub gpu_capacity: f64,
    /// 单个步骤处理器的超时（秒）
    pub step_timeout_secs: u64,
    /// 占位合成器输出的帧数
    pub frame_count: usize,
    pub fps: f64,
    /// 记住的已结束任务数，用于忽略重复的 execute_workflow；超出后最早的先淘汰
    pub finished_capacity: usize,
}

impl ExecutorSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            cpu_capacity: 8.0,
            gpu_capacity: 4.0,
            step_timeout_secs: 60,
            frame_count: 60,
            fps: 30.714_286_237_346_89,
            finished_capacity: 1000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 CHOREO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CHOREO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CHOREO")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bus.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.executor.cpu_capacity, 8.0);
        assert_eq!(config.planner.profile(Priority::High), ResourceDemand::new(2.0, 1.0, 8.0));
        assert_eq!(config.planner.profile(Priority::Low).gpu, 0.0);
        assert!(config.analyzer.motion_keywords.contains_key("RUNNING"));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[executor]\ncpu_capacity = 2.5\nstep_timeout_secs = 5\n\n[planner]\nhigh_priority_motions = [\"dancing\"]\n"
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.executor.cpu_capacity, 2.5);
        assert_eq!(config.executor.step_timeout(), Duration::from_secs(5));
        assert_eq!(config.executor.gpu_capacity, 4.0);
        assert_eq!(config.planner.high_priority_motions, vec!["dancing".to_string()]);
        assert_eq!(config.bus.capacity, 256);
    }
}
