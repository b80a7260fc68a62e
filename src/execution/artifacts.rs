//! 任务产物持久化
//!
//! 每个任务一个目录：`<root>/<task_id>/animation.json` 与 `<root>/<task_id>/metadata.json`。
//! 产物只写一次；metadata 最后经临时文件 + rename 写入，存在即表示两份文件完整。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::execution::StepData;

pub const ANIMATION_FILE: &str = "animation.json";
pub const METADATA_FILE: &str = "metadata.json";

/// 动画数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationData {
    pub poses: Vec<Vec<f64>>,
    pub fps: f64,
}

/// 产物元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub fps: f64,
    /// 时长（秒）= 帧数 / fps
    pub duration: f64,
    #[serde(default)]
    pub effects: Vec<Value>,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Invalid task id for artifact path: {0:?}")]
    InvalidTaskId(String),
    #[error("Artifacts already exist for task {0}")]
    AlreadyExists(String),
    #[error("No artifacts for task {0}")]
    NotFound(String),
    #[error("Invalid workflow result: {0}")]
    InvalidResult(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 产物存储（根目录下按 task_id 分目录）
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 任务产物目录
    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, ArtifactError> {
        let invalid = task_id.is_empty()
            || task_id == "."
            || task_id.contains("..")
            || task_id.contains(['/', '\\', '\0']);
        if invalid {
            return Err(ArtifactError::InvalidTaskId(task_id.to_string()));
        }
        Ok(self.root.join(task_id))
    }

    /// 保存合并后的工作流结果（需包含 poses 与 fps，effects 可选）
    pub async fn save(&self, task_id: &str, result: &StepData) -> Result<PathBuf, ArtifactError> {
        let dir = self.task_dir(task_id)?;
        let (animation, metadata) = split_result(result)?;

        let metadata_path = dir.join(METADATA_FILE);
        if tokio::fs::try_exists(&metadata_path).await? {
            return Err(ArtifactError::AlreadyExists(task_id.to_string()));
        }

        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(ANIMATION_FILE), serde_json::to_vec(&animation)?).await?;

        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&metadata)?).await?;
        tokio::fs::rename(&tmp, &metadata_path).await?;

        tracing::info!(
            task_id,
            frames = animation.poses.len(),
            duration = metadata.duration,
            path = %dir.display(),
            "Artifacts saved"
        );
        Ok(dir)
    }

    /// 读回产物
    pub async fn load(&self, task_id: &str) -> Result<(AnimationData, ArtifactMetadata), ArtifactError> {
        let dir = self.task_dir(task_id)?;
        let metadata = match tokio::fs::read(dir.join(METADATA_FILE)).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let animation = serde_json::from_slice(&tokio::fs::read(dir.join(ANIMATION_FILE)).await?)?;
        Ok((animation, metadata))
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        match self.task_dir(task_id) {
            Ok(dir) => tokio::fs::try_exists(dir.join(METADATA_FILE))
                .await
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn split_result(result: &StepData) -> Result<(AnimationData, ArtifactMetadata), ArtifactError> {
    let poses: Vec<Vec<f64>> = result
        .get("poses")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ArtifactError::InvalidResult(format!("poses: {}", e)))?
        .ok_or_else(|| ArtifactError::InvalidResult("missing poses".into()))?;

    let fps = result
        .get("fps")
        .and_then(Value::as_f64)
        .ok_or_else(|| ArtifactError::InvalidResult("missing fps".into()))?;
    if !(fps.is_finite() && fps > 0.0) {
        return Err(ArtifactError::InvalidResult(format!("fps must be positive, got {}", fps)));
    }

    let effects = match result.get("effects") {
        Some(Value::Array(effects)) => effects.clone(),
        _ => Vec::new(),
    };

    let metadata = ArtifactMetadata {
        fps,
        duration: poses.len() as f64 / fps,
        effects,
    };
    Ok((AnimationData { poses, fps }, metadata))
}
