//! Agent 状态快照持久化
//!
//! 快照以 JSON 值保存，键为 `agent:<id>:state`。没有快照是正常的冷启动，不是错误。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// 状态快照存储
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;
    async fn save(&self, key: &str, state: &serde_json::Value) -> anyhow::Result<()>;
}

/// Agent 快照键
pub fn state_key(agent_id: &str) -> String {
    format!("agent:{}:state", agent_id)
}

/// 内存版（进程内，测试与未配置 state_dir 时使用）
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, state: &serde_json::Value) -> anyhow::Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }
}

/// 文件版：每个键一个 JSON 文件；目录不存在时自动创建
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, state: &serde_json::Value) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
