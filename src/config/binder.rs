//! 配置源绑定模块
//!
//! 负责把类型化的默认配置写入配置源、从配置源读取并合并回类型化的值。
//! 所有合并都在自描述的配置树上完成：
//!
//! ```text
//! 默认值 -> 配置源（多个文件/多个KV地址，按顺序逐键合并）-> 环境变量覆盖 -> T
//! ```
//!
//! 任意一步失败都会使整个调用失败，调用方持有的旧值保持不变。

use crate::config::env::{AppliedOverride, EnvOverlay};
use crate::config::format::ConfigFormat;
use crate::config::kv::{KvConnector, KvLocation, KvStore};
use crate::config::source::{FileSource, SourceDescriptor};
use crate::error::{ConfigError, Result, SourceError, VConfigError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct KvBinding {
    location: KvLocation,
    store: Arc<dyn KvStore>,
}

/// 需要监听的目标
pub enum WatchTargets {
    /// 无需监听（纯环境变量模式）
    None,
    /// 配置文件路径
    Files(Vec<PathBuf>),
    /// KV监听目标
    Kv(Vec<KvWatchTarget>),
}

/// 单个KV监听目标
pub struct KvWatchTarget {
    /// 在配置源列表中的位置
    pub index: usize,
    /// 配置键
    pub key: String,
    /// 对应的客户端
    pub store: Arc<dyn KvStore>,
}

/// 配置源绑定器
pub struct SourceBinder {
    descriptor: SourceDescriptor,
    overlay: Option<EnvOverlay>,
    defaults: Value,
    kv: Vec<KvBinding>,
    /// 各KV地址最近一次成功解析的文档
    kv_docs: Mutex<Vec<Value>>,
}

impl SourceBinder {
    /// 绑定配置源并加载初始配置
    ///
    /// 配置源中不存在的文件或键会用默认值创建
    pub async fn bind<T>(
        default: &T,
        descriptor: SourceDescriptor,
        overlay: Option<EnvOverlay>,
        connector: Option<Arc<dyn KvConnector>>,
    ) -> Result<(Self, T)>
    where
        T: Serialize + DeserializeOwned,
    {
        let defaults = serde_json::to_value(default)?;

        let kv = match &descriptor {
            SourceDescriptor::Kv { locations, .. } => {
                let connector = connector.ok_or(ConfigError::MissingKvConnector)?;
                connect_all(connector.as_ref(), locations).await?
            }
            _ => Vec::new(),
        };

        let binder = Self {
            descriptor,
            overlay,
            defaults,
            kv_docs: Mutex::new(vec![Value::Null; kv.len()]),
            kv,
        };

        match binder.load_initial(default).await {
            Ok(value) => {
                info!(kind = binder.descriptor.kind(), "配置源绑定完成");
                Ok((binder, value))
            }
            Err(e) => {
                binder.close().await;
                Err(e)
            }
        }
    }

    async fn load_initial<T>(&self, default: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.descriptor {
            SourceDescriptor::Files(files) => {
                let mut layers = Vec::with_capacity(files.len());
                for file in files {
                    if tokio::fs::try_exists(&file.path)
                        .await
                        .map_err(|e| SourceError::io(&file.path, e))?
                    {
                        layers.push(read_file(file).await?);
                    } else {
                        write_file(file, default).await?;
                        info!(path = %file.path.display(), format = %file.format, "已创建默认配置文件");
                    }
                }
                self.compose(layers)
            }
            SourceDescriptor::Env { .. } => self.compose(Vec::new()),
            SourceDescriptor::Kv { format, .. } => {
                let mut docs = Vec::with_capacity(self.kv.len());
                for binding in &self.kv {
                    let key = &binding.location.key;
                    match binding.store.get(key).await? {
                        Some(bytes) => docs.push(format.decode(&bytes, key)?),
                        None => {
                            binding.store.put(key, format.encode(default)?).await?;
                            info!(key = %key, format = %format, "已写入默认配置到KV存储");
                            docs.push(Value::Null);
                        }
                    }
                }
                let value = self.compose(docs.clone())?;
                *self.kv_docs.lock().await = docs;
                Ok(value)
            }
        }
    }

    /// 重新读取整个配置源
    pub async fn reload<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.descriptor {
            SourceDescriptor::Files(files) => {
                let mut layers = Vec::with_capacity(files.len());
                for file in files {
                    let doc = read_file(file).await?;
                    // 截断写入的中间状态，不能当作"恢复默认值"
                    if doc.is_null() {
                        return Err(SourceError::Decode {
                            format: file.format,
                            origin: file.path.display().to_string(),
                            message: "配置文件为空".to_string(),
                        }
                        .into());
                    }
                    layers.push(doc);
                }
                self.compose(layers)
            }
            SourceDescriptor::Env { .. } => self.compose(Vec::new()),
            SourceDescriptor::Kv { format, .. } => {
                let mut docs = Vec::with_capacity(self.kv.len());
                for binding in &self.kv {
                    let key = &binding.location.key;
                    let doc = match binding.store.get(key).await? {
                        Some(bytes) => format.decode(&bytes, key)?,
                        None => Value::Null,
                    };
                    docs.push(doc);
                }
                let value = self.compose(docs.clone())?;
                *self.kv_docs.lock().await = docs;
                Ok(value)
            }
        }
    }

    /// 使用KV监听推送的新文档重新生成配置，无需再次读取
    pub async fn apply_pushed<T: DeserializeOwned>(&self, index: usize, payload: &[u8]) -> Result<T> {
        let (key, format) = match (&self.descriptor, self.kv.get(index)) {
            (SourceDescriptor::Kv { format, .. }, Some(binding)) => {
                (binding.location.key.as_str(), *format)
            }
            _ => {
                return Err(ConfigError::InvalidOption(format!("不存在的KV配置位置: {index}")).into())
            }
        };

        let doc = format.decode(payload, key)?;
        let mut cached = self.kv_docs.lock().await;
        let mut docs = cached.clone();
        docs[index] = doc;

        let value = self.compose(docs.clone())?;
        *cached = docs;
        Ok(value)
    }

    /// 将配置写回配置源
    ///
    /// 文件模式写入第一个（规范）文件；KV模式写入第一个地址；纯环境变量模式不做任何写入
    pub async fn persist<T: Serialize>(&self, value: &T) -> Result<()> {
        match &self.descriptor {
            SourceDescriptor::Files(files) => {
                if let Some(file) = files.first() {
                    write_file(file, value).await?;
                    debug!(path = %file.path.display(), "配置已写入文件");
                }
            }
            SourceDescriptor::Env { .. } => {
                debug!("纯环境变量模式，跳过持久化");
            }
            SourceDescriptor::Kv { format, .. } => {
                if let Some(binding) = self.kv.first() {
                    let key = &binding.location.key;
                    binding.store.put(key, format.encode(value)?).await?;
                    if let Some(doc) = self.kv_docs.lock().await.first_mut() {
                        *doc = serde_json::to_value(value)?;
                    }
                    debug!(key = %key, "配置已写入KV存储");
                }
            }
        }
        Ok(())
    }

    /// 需要监听的目标
    pub fn watch_targets(&self) -> WatchTargets {
        match &self.descriptor {
            SourceDescriptor::Files(files) => {
                WatchTargets::Files(files.iter().map(|f| f.path.clone()).collect())
            }
            SourceDescriptor::Env { .. } => WatchTargets::None,
            SourceDescriptor::Kv { .. } => WatchTargets::Kv(
                self.kv
                    .iter()
                    .enumerate()
                    .map(|(index, binding)| KvWatchTarget {
                        index,
                        key: binding.location.key.clone(),
                        store: Arc::clone(&binding.store),
                    })
                    .collect(),
            ),
        }
    }

    /// 已解析的配置源
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// 释放配置源资源（关闭KV客户端）
    pub async fn close(&self) {
        for binding in &self.kv {
            binding.store.close().await;
        }
    }

    /// 默认值 + 各层文档 + 环境变量 => T
    fn compose<T: DeserializeOwned>(&self, layers: Vec<Value>) -> Result<T> {
        let mut doc = self.defaults.clone();
        for layer in layers {
            merge_value(&mut doc, layer);
        }

        let overlay = match &self.descriptor {
            SourceDescriptor::Env { prefix } => Some(EnvOverlay::new(prefix.clone())),
            _ => self.overlay.clone(),
        };
        let applied = match overlay {
            Some(overlay) => overlay.apply(&mut doc),
            None => Vec::new(),
        };
        if !applied.is_empty() {
            let vars: Vec<&str> = applied.iter().map(|o| o.var.as_str()).collect();
            debug!(vars = ?vars, "环境变量覆盖已应用");
        }

        let untyped: Vec<&AppliedOverride> = applied.iter().filter(|o| o.untyped).collect();
        if untyped.is_empty() {
            return Ok(serde_json::from_value(doc)?);
        }

        let err = match serde_json::from_value::<T>(doc.clone()) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        debug!(error = %err, "按推断类型转换失败，未知类型的环境变量改按字符串重试");

        // 原值为 null（如值为 None 的 Option 字段）时无法推断类型：
        // 先逐个回退为字符串，再整体回退
        for item in &untyped {
            let mut candidate = doc.clone();
            as_string(&mut candidate, item);
            if let Ok(value) = serde_json::from_value::<T>(candidate) {
                return Ok(value);
            }
        }
        for item in &untyped {
            as_string(&mut doc, item);
        }
        serde_json::from_value(doc).map_err(|_| VConfigError::Convert(err))
    }
}

fn as_string(doc: &mut Value, item: &AppliedOverride) {
    if let Some(slot) = doc.pointer_mut(&item.pointer) {
        *slot = Value::String(item.raw.clone());
    }
}

async fn connect_all(
    connector: &dyn KvConnector,
    locations: &[KvLocation],
) -> Result<Vec<KvBinding>> {
    let mut bindings: Vec<KvBinding> = Vec::with_capacity(locations.len());
    for location in locations {
        match connector.connect(location).await {
            Ok(store) => bindings.push(KvBinding {
                location: location.clone(),
                store,
            }),
            Err(e) => {
                warn!(key = %location.key, error = %e, "连接KV存储失败");
                for binding in &bindings {
                    binding.store.close().await;
                }
                return Err(e.into());
            }
        }
    }
    Ok(bindings)
}

async fn read_file(file: &FileSource) -> Result<Value> {
    let bytes = tokio::fs::read(&file.path)
        .await
        .map_err(|e| SourceError::io(&file.path, e))?;
    let origin = file.path.display().to_string();
    Ok(file.format.decode(&bytes, &origin)?)
}

async fn write_file<T: Serialize + ?Sized>(file: &FileSource, value: &T) -> Result<()> {
    let bytes = file.format.encode(value)?;
    let dir = file.dir();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SourceError::io(dir, e))?;
    tokio::fs::write(&file.path, bytes)
        .await
        .map_err(|e| SourceError::io(&file.path, e))?;
    Ok(())
}

/// 将 `layer` 逐键合并到 `base`
///
/// 两边都是对象时递归合并，否则 `layer` 整体替换；空文档（null）不参与合并
pub fn merge_value(base: &mut Value, layer: Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, layer_child) in layer_map {
                match base_map.get_mut(&key) {
                    Some(base_child) if base_child.is_object() && layer_child.is_object() => {
                        merge_value(base_child, layer_child);
                    }
                    _ => {
                        base_map.insert(key, layer_child);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
