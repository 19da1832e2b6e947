//! KV存储接口模块
//!
//! 配置引擎只依赖分布式KV存储的四个操作：读取、写入、监听与关闭。
//! 具体的集群协议由 [`KvConnector`] 的实现方提供；本模块自带一个进程内的
//! [`MemoryKvBackend`]，用于嵌入式场景与测试。

use crate::error::SourceError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::debug;

/// KV监听流，每个元素是该键最新的完整配置文档
pub type KvWatchStream = BoxStream<'static, Result<Vec<u8>, SourceError>>;

/// KV存储客户端
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 读取键值，键不存在时返回 `None`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SourceError>;

    /// 写入键值
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), SourceError>;

    /// 监听键的写入事件
    async fn watch(&self, key: &str) -> Result<KvWatchStream, SourceError>;

    /// 关闭客户端，结束所有监听流
    async fn close(&self);
}

/// 根据KV地址创建客户端
#[async_trait]
pub trait KvConnector: Send + Sync {
    /// 连接到指定地址
    async fn connect(&self, location: &KvLocation) -> Result<Arc<dyn KvStore>, SourceError>;
}

/// TLS配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvTlsConfig {
    /// 客户端证书
    pub cert_file: PathBuf,
    /// 客户端私钥
    pub key_file: PathBuf,
    /// 受信任的CA证书
    pub trusted_ca_file: Option<PathBuf>,
}

/// KV配置位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvLocation {
    /// 服务器地址列表
    pub endpoints: Vec<String>,
    /// 用户名
    pub username: Option<String>,
    /// 密码
    pub password: Option<String>,
    /// 传输层安全配置
    pub tls: Option<KvTlsConfig>,
    /// 配置键
    pub key: String,
    /// 连接超时
    pub timeout: Duration,
}

impl Default for KvLocation {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            tls: None,
            key: "/config/app".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl KvLocation {
    /// 使用指定的键创建默认地址
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

struct Shared {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<(String, Vec<u8>)>,
}

/// 进程内KV存储
///
/// 所有客户端共享同一份数据；关闭某个客户端只会结束该客户端的监听流
#[derive(Clone)]
pub struct MemoryKvBackend {
    shared: Arc<Shared>,
}

impl MemoryKvBackend {
    /// 创建空的存储
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// 直接读取键值
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.entries.read().await.get(key).cloned()
    }

    /// 直接写入键值并通知监听者
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        self.shared
            .entries
            .write()
            .await
            .insert(key.to_string(), value.clone());
        // 没有监听者时发送失败，可以忽略
        let _ = self.shared.events.send((key.to_string(), value));
    }

    /// 创建新的客户端
    pub fn client(&self) -> MemoryKvClient {
        let (shutdown, _) = watch::channel(false);
        MemoryKvClient {
            backend: self.clone(),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }
}

impl Default for MemoryKvBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvConnector for MemoryKvBackend {
    async fn connect(&self, location: &KvLocation) -> Result<Arc<dyn KvStore>, SourceError> {
        if location.endpoints.is_empty() {
            return Err(SourceError::kv(&location.key, "未配置KV服务器地址"));
        }
        debug!(endpoints = ?location.endpoints, key = %location.key, "连接进程内KV存储");
        Ok(Arc::new(self.client()))
    }
}

/// 进程内KV存储的客户端
pub struct MemoryKvClient {
    backend: MemoryKvBackend,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl MemoryKvClient {
    fn ensure_open(&self, key: &str) -> Result<(), SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::kv(key, "KV客户端已关闭"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SourceError> {
        self.ensure_open(key)?;
        Ok(self.backend.get(key).await)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), SourceError> {
        self.ensure_open(key)?;
        self.backend.put(key, value).await;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<KvWatchStream, SourceError> {
        self.ensure_open(key)?;

        let events = self.backend.shared.events.subscribe();
        let shutdown = self.shutdown.subscribe();
        let key = key.to_string();

        let stream = stream::unfold(
            (events, shutdown, key),
            |(mut events, mut shutdown, key)| async move {
                loop {
                    if *shutdown.borrow() {
                        return None;
                    }

                    tokio::select! {
                        _ = shutdown.changed() => return None,
                        received = events.recv() => match received {
                            Ok((changed_key, value)) if changed_key == key => {
                                return Some((Ok(value), (events, shutdown, key)));
                            }
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                let err = SourceError::kv(
                                    key.clone(),
                                    format!("监听落后，丢失 {skipped} 个事件"),
                                );
                                return Some((Err(err), (events, shutdown, key)));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}
