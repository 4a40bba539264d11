use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use anyhow::{anyhow, Context};
use tokio::sync::Mutex;
use webnode_common::{
    config::{parse_kv, render_kv},
    ConfigMap,
};

/// Persistence for the WiFi designation as a flat key/value map.
///
/// `load` fails when nothing usable is stored; callers treat that as "start
/// the provisioning access point".
pub trait ConfigStore {
    fn load(&self) -> impl Future<Output = anyhow::Result<ConfigMap>> + Send;
    fn save(&self, map: &ConfigMap) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// `key=value` lines in a single file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileStore {
    async fn load(&self) -> anyhow::Result<ConfigMap> {
        let _guard = self.lock.lock().await;
        let raw = match tokio::fs::read_to_string(self.path.as_ref()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(anyhow!("no config stored at {}", self.path.display()))
            }
            Err(err) => return Err(err.into()),
        };
        parse_kv(&raw).with_context(|| format!("failed to parse {}", self.path.display()))
    }

    async fn save(&self, map: &ConfigMap) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, render_kv(map))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Volatile store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StdMutex<MemoryContents>>,
}

#[derive(Debug, Default)]
struct MemoryContents {
    map: Option<ConfigMap>,
    saves: usize,
}

impl MemoryStore {
    pub fn with_map(map: ConfigMap) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(MemoryContents {
                map: Some(map),
                saves: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> Option<ConfigMap> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map
            .clone()
    }

    pub fn saves(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .saves
    }
}

impl ConfigStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<ConfigMap> {
        self.snapshot().ok_or_else(|| anyhow!("no config stored"))
    }

    async fn save(&self, map: &ConfigMap) -> anyhow::Result<()> {
        let mut contents = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        contents.map = Some(map.clone());
        contents.saves += 1;
        Ok(())
    }
}
