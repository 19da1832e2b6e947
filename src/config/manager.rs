//! 配置管理器模块
//!
//! 提供线程安全的类型化配置管理与热重载：
//!
//! ```text
//! new:    绑定配置源 -> 环境变量覆盖 -> 快照 #1 -> 启动监控
//! 外部变更: 监控任务 -> 防抖 -> 重新读取 -> 快照 #2 -> diff(#1, #2) -> 回调 -> #1 := #2
//! update: 持久化 -> 记录防抖时间 -> 替换快照 -> diff -> 回调
//! ```
//!
//! 快照与关闭标记属于同一个同步域（`cycle` 互斥锁 + 原子标记），
//! 回调列表使用独立的读写锁，慢回调不会阻塞 `get_data`，
//! 但会阻塞其后的回调与触发它的重载流程。

use crate::config::binder::SourceBinder;
use crate::config::diff::{diff_values, ChangeItem};
use crate::config::source::{ConfigOptions, SourceDescriptor};
use crate::config::watcher::{ChangeSignal, WatchScheduler};
use crate::error::{Result, VConfigError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

/// 可被配置管理器管理的配置类型
pub trait ConfigData: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> ConfigData for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

/// 变更来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// 配置文件被外部修改
    File(PathBuf),
    /// KV存储推送了新配置
    Kv { key: String },
    /// 调用方主动更新
    Update,
}

/// 配置变更事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// 变更来源
    pub source: ChangeSource,
    /// 配置版本号，每次通知递增
    pub version: u64,
    /// 变更时间
    pub timestamp: DateTime<Utc>,
}

/// 配置变更回调
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent, &[ChangeItem]) + Send + Sync>;

/// 回调注册表
///
/// 回调按注册顺序在同一个临界区内同步执行。某个回调阻塞时，
/// 后续回调以及触发通知的重载流程都会被阻塞
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl CallbackRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册回调
    pub async fn register(&self, callback: ChangeCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// 依次调用所有回调，返回被调用的回调数量
    ///
    /// 调用前检查关闭标记，已关闭则放弃通知
    pub async fn dispatch(
        &self,
        event: &ChangeEvent,
        changes: &[ChangeItem],
        closed: &AtomicBool,
    ) -> usize {
        let callbacks = self.callbacks.read().await;
        if closed.load(Ordering::SeqCst) {
            debug!(version = event.version, "配置管理器已关闭，放弃通知");
            return 0;
        }

        for callback in callbacks.iter() {
            callback(event, changes);
        }
        callbacks.len()
    }

    /// 清空所有回调
    pub async fn clear(&self) {
        self.callbacks.write().await.clear();
    }

    /// 已注册的回调数量
    pub async fn len(&self) -> usize {
        self.callbacks.read().await.len()
    }

    /// 是否没有回调
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 配置管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    /// 尚未绑定配置源
    Uninitialized = 0,
    /// 已绑定配置源（纯环境变量模式停留在此状态）
    Bound = 1,
    /// 正在监控配置源
    Watching = 2,
    /// 已关闭
    Closed = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Bound,
            2 => Self::Watching,
            3 => Self::Closed,
            _ => Self::Uninitialized,
        }
    }
}

/// 重载周期状态，持有期间其他重载与更新必须等待
struct CycleState {
    /// 最近一次被接受的重载/更新时间
    last_accepted: Option<Instant>,
    /// 当前版本号
    version: u64,
}

struct Inner<T> {
    binder: SourceBinder,
    snapshot: RwLock<T>,
    cycle: Mutex<CycleState>,
    closed: AtomicBool,
    state: AtomicU8,
    callbacks: CallbackRegistry,
    debounce: Duration,
}

/// 配置管理器
pub struct ConfigManager<T: ConfigData> {
    inner: Arc<Inner<T>>,
    /// 配置源监控器
    watcher: Mutex<Option<WatchScheduler>>,
}

impl<T: ConfigData> ConfigManager<T> {
    /// 创建配置管理器：绑定配置源并开始监控
    ///
    /// # 参数
    /// * `default` - 默认配置，配置源中不存在时写入
    /// * `options` - 构造选项
    ///
    /// # 返回
    /// * `Result<Self>` - 同时指定多种配置源、格式无法识别或绑定失败时返回错误
    pub async fn new(default: T, options: ConfigOptions) -> Result<Self> {
        let descriptor = options.descriptor()?;
        info!(kind = descriptor.kind(), "创建配置管理器");

        let (binder, data) = SourceBinder::bind(
            &default,
            descriptor,
            options.env_overlay(),
            options.kv_connector(),
        )
        .await?;

        let inner = Arc::new(Inner {
            binder,
            snapshot: RwLock::new(data),
            cycle: Mutex::new(CycleState {
                last_accepted: None,
                version: 1,
            }),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(ManagerState::Bound as u8),
            callbacks: CallbackRegistry::new(),
            debounce: options.debounce(),
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let watcher = match WatchScheduler::start(inner.binder.watch_targets(), signal_tx).await {
            Ok(watcher) => watcher,
            Err(e) => {
                inner.binder.close().await;
                return Err(e);
            }
        };

        if watcher.is_some() {
            inner
                .state
                .store(ManagerState::Watching as u8, Ordering::SeqCst);
            Self::start_change_handler(Arc::clone(&inner), signal_rx);
        }

        Ok(Self {
            inner,
            watcher: Mutex::new(watcher),
        })
    }

    /// 启动配置变更处理任务
    ///
    /// 所有监控任务退出后通道关闭，处理任务随之结束
    fn start_change_handler(inner: Arc<Inner<T>>, mut signals: mpsc::UnboundedReceiver<ChangeSignal>) {
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                inner.handle_signal(signal).await;
            }
            debug!("配置变更处理任务已退出");
        });
    }

    /// 获取当前配置的副本
    pub async fn get_data(&self) -> T {
        self.inner.snapshot.read().await.clone()
    }

    /// 更新配置：写回配置源并通知回调
    ///
    /// 本次写入会刷新防抖时间，避免自身的写入被监控器当作外部变更再次处理
    pub async fn update(&self, data: T) -> Result<()> {
        self.ensure_open()?;
        let mut cycle = self.inner.cycle.lock().await;
        self.ensure_open()?;

        self.inner.binder.persist(&data).await?;
        cycle.last_accepted = Some(Instant::now());

        let changes = self
            .inner
            .commit(&mut cycle, data, ChangeSource::Update)
            .await?;
        info!(changes = changes.len(), version = cycle.version, "配置手动更新完成");
        Ok(())
    }

    /// 将当前配置重新写回配置源
    pub async fn save(&self) -> Result<()> {
        self.ensure_open()?;
        let mut cycle = self.inner.cycle.lock().await;
        self.ensure_open()?;

        let data = self.inner.snapshot.read().await.clone();
        self.inner.binder.persist(&data).await?;
        cycle.last_accepted = Some(Instant::now());
        Ok(())
    }

    /// 注册配置变更回调
    ///
    /// 关闭后注册不会生效
    pub async fn on_change<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent, &[ChangeItem]) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("配置管理器已关闭，忽略回调注册");
            return;
        }
        self.inner.callbacks.register(Arc::new(callback)).await;
    }

    /// 当前版本号
    pub async fn version(&self) -> u64 {
        self.inner.cycle.lock().await.version
    }

    /// 当前状态
    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// 已解析的配置源
    pub fn descriptor(&self) -> &SourceDescriptor {
        self.inner.binder.descriptor()
    }

    /// 关闭配置管理器
    ///
    /// 停止监控、释放配置源资源、清空回调并重置快照。重复调用无副作用
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        self.inner.binder.close().await;
        self.inner.callbacks.clear().await;

        // 等待进行中的重载结束后再重置快照
        let _cycle = self.inner.cycle.lock().await;
        *self.inner.snapshot.write().await = T::default();
        self.inner
            .state
            .store(ManagerState::Closed as u8, Ordering::SeqCst);

        info!("配置管理器已关闭");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(VConfigError::Closed);
        }
        Ok(())
    }
}

impl<T: ConfigData> Drop for ConfigManager<T> {
    fn drop(&mut self) {
        // 未调用 close 时也要让后台任务退出
        if let Some(watcher) = self.watcher.get_mut().take() {
            drop(watcher);
        }
    }
}

impl<T: ConfigData> Inner<T> {
    /// 处理外部变更信号
    ///
    /// 后台重载失败只记录日志，继续使用上一次成功加载的配置
    async fn handle_signal(&self, signal: ChangeSignal) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut cycle = self.cycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        if let Some(last) = cycle.last_accepted {
            if now.duration_since(last) < self.debounce {
                debug!(signal = ?signal_label(&signal), "跳过重复事件（防抖动）");
                return;
            }
        }

        let (source, reloaded) = match signal {
            ChangeSignal::File { path } => {
                debug!(path = %path.display(), "重新加载配置文件");
                (ChangeSource::File(path), self.binder.reload::<T>().await)
            }
            ChangeSignal::Kv {
                index,
                key,
                payload,
            } => {
                debug!(key = %key, "应用KV推送的配置");
                let reloaded = self.binder.apply_pushed::<T>(index, &payload).await;
                (ChangeSource::Kv { key }, reloaded)
            }
        };

        // 重载失败不计入防抖窗口，随后的修正写入仍会被处理
        let data = match reloaded {
            Ok(data) => data,
            Err(e) => {
                error!(source = ?source, error = %e, "配置重载失败，继续使用当前配置");
                return;
            }
        };
        cycle.last_accepted = Some(now);

        match self.commit(&mut cycle, data, source).await {
            Ok(changes) => {
                if !changes.is_empty() {
                    info!(changes = changes.len(), version = cycle.version, "配置重载成功");
                }
            }
            Err(e) => error!(error = %e, "配置重载后比较失败"),
        }
    }

    /// 替换快照、计算差异并通知回调，返回差异列表
    async fn commit(
        &self,
        cycle: &mut CycleState,
        data: T,
        source: ChangeSource,
    ) -> Result<Vec<ChangeItem>> {
        let new_tree = serde_json::to_value(&data)?;
        let old_tree = serde_json::to_value(&*self.snapshot.read().await)?;

        *self.snapshot.write().await = data;

        let changes = diff_values(&old_tree, &new_tree, "");
        if changes.is_empty() {
            debug!("配置无实质性变更，跳过通知");
            return Ok(changes);
        }

        cycle.version += 1;
        let event = ChangeEvent {
            source,
            version: cycle.version,
            timestamp: Utc::now(),
        };
        let notified = self
            .callbacks
            .dispatch(&event, &changes, &self.closed)
            .await;
        debug!(changes = changes.len(), callbacks = notified, "配置变更已通知");

        Ok(changes)
    }
}

fn signal_label(signal: &ChangeSignal) -> String {
    match signal {
        ChangeSignal::File { path } => path.display().to_string(),
        ChangeSignal::Kv { key, .. } => key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        port: u16,
    }

    fn test_config() -> TestConfig {
        TestConfig {
            name: "x".to_string(),
            port: 8080,
        }
    }

    fn counting_callback(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(&ChangeEvent, &[ChangeItem]) + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_event: &ChangeEvent, _changes: &[ChangeItem]| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_callback_registry_order_and_closed_flag() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            registry
                .register(Arc::new(move |_event: &ChangeEvent, _changes: &[ChangeItem]| {
                    order.lock().unwrap().push(id);
                }))
                .await;
        }

        let event = ChangeEvent {
            source: ChangeSource::Update,
            version: 2,
            timestamp: Utc::now(),
        };
        let closed = AtomicBool::new(false);
        assert_eq!(registry.dispatch(&event, &[], &closed).await, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        closed.store(true, Ordering::SeqCst);
        assert_eq!(registry.dispatch(&event, &[], &closed).await, 0);
        assert_eq!(order.lock().unwrap().len(), 3);

        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_debounce_drops_second_signal_within_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.json");

        let manager = ConfigManager::new(
            test_config(),
            ConfigOptions::new()
                .with_file(&path)
                .with_debounce(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        manager.on_change(counting_callback(&counter)).await;

        std::fs::write(&path, r#"{"name": "x", "port": 9000}"#).unwrap();
        let signal = ChangeSignal::File { path: path.clone() };
        manager.inner.handle_signal(signal.clone()).await;

        std::fs::write(&path, r#"{"name": "x", "port": 9100}"#).unwrap();
        manager.inner.handle_signal(signal).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_data().await.port, 9000);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.yaml");

        let manager = ConfigManager::new(
            test_config(),
            ConfigOptions::new()
                .with_file(&path)
                .with_debounce(Duration::ZERO),
        )
        .await
        .unwrap();

        std::fs::write(&path, "port: [unclosed").unwrap();
        manager
            .inner
            .handle_signal(ChangeSignal::File { path: path.clone() })
            .await;

        assert_eq!(manager.get_data().await, test_config());
        assert_eq!(manager.version().await, 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_does_not_start_debounce_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.json");

        let manager = ConfigManager::new(
            test_config(),
            ConfigOptions::new()
                .with_file(&path)
                .with_debounce(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        manager.on_change(counting_callback(&counter)).await;

        let signal = ChangeSignal::File { path: path.clone() };
        std::fs::write(&path, "{ broken").unwrap();
        manager.inner.handle_signal(signal.clone()).await;
        assert_eq!(manager.get_data().await, test_config());

        // 紧随其后的修正写入不能被防抖吞掉
        std::fs::write(&path, r#"{"name": "x", "port": 9000}"#).unwrap();
        manager.inner.handle_signal(signal).await;

        assert_eq!(manager.get_data().await.port, 9000);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.version().await, 2);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_file_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();

        for name in ["app.json", "app.yaml", "app.toml"] {
            let path = dir.path().join(name);
            let manager = ConfigManager::new(
                test_config(),
                ConfigOptions::new()
                    .with_file(&path)
                    .with_debounce(Duration::ZERO),
            )
            .await
            .unwrap();

            let mut data = manager.get_data().await;
            data.port = 9000;
            manager.update(data).await.unwrap();

            let counter = Arc::new(AtomicUsize::new(0));
            manager.on_change(counting_callback(&counter)).await;

            std::fs::write(&path, "").unwrap();
            manager
                .inner
                .handle_signal(ChangeSignal::File { path: path.clone() })
                .await;

            assert_eq!(manager.get_data().await.port, 9000, "{name}");
            assert_eq!(counter.load(Ordering::SeqCst), 0, "{name}");
            assert_eq!(manager.version().await, 2, "{name}");

            manager.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.json");

        let manager = Arc::new(
            ConfigManager::new(
                test_config(),
                ConfigOptions::new()
                    .with_file(&path)
                    .with_debounce(Duration::ZERO),
            )
            .await
            .unwrap(),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        manager.on_change(counting_callback(&counter)).await;

        std::fs::write(&path, r#"{"name": "x", "port": 9000}"#).unwrap();

        // 持有周期锁，让重载与关闭都停在锁上
        let guard = manager.inner.cycle.lock().await;

        let inner = Arc::clone(&manager.inner);
        let signal = ChangeSignal::File { path: path.clone() };
        let reload = tokio::spawn(async move { inner.handle_signal(signal).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closer = Arc::clone(&manager);
        let close = tokio::spawn(async move { closer.close().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(guard);
        reload.await.unwrap();
        close.await.unwrap().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ManagerState::Closed);
        assert_eq!(manager.get_data().await, TestConfig::default());
        // 关闭之后的重载不能提交快照
        assert_eq!(manager.version().await, 1);
    }

    #[tokio::test]
    async fn test_update_persist_failure_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        let path = sub.join("app.json");

        let manager = ConfigManager::new(test_config(), ConfigOptions::new().with_file(&path))
            .await
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.on_change(counting_callback(&counter)).await;

        // 父目录被普通文件占据，写回必然失败
        std::fs::remove_dir_all(&sub).unwrap();
        std::fs::write(&sub, "not a directory").unwrap();

        let mut data = manager.get_data().await;
        data.port = 9000;
        let result = manager.update(data).await;

        assert!(matches!(result, Err(VConfigError::Source(_))));
        assert_eq!(manager.get_data().await, test_config());
        assert_eq!(manager.version().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_dispatches_synchronously() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.toml");

        let manager = ConfigManager::new(test_config(), ConfigOptions::new().with_file(&path))
            .await
            .unwrap();
        assert_eq!(manager.state(), ManagerState::Watching);

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        manager
            .on_change(move |event, changes| {
                assert_eq!(event.source, ChangeSource::Update);
                sink.lock().unwrap().extend_from_slice(changes);
            })
            .await;

        let mut data = manager.get_data().await;
        data.port = 9000;
        manager.update(data).await.unwrap();

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].path, "port");
        assert_eq!(manager.version().await, 2);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.json");

        let manager = ConfigManager::new(test_config(), ConfigOptions::new().with_file(&path))
            .await
            .unwrap();

        manager.close().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Closed);
        assert_eq!(manager.get_data().await, TestConfig::default());
        assert!(matches!(
            manager.update(test_config()).await,
            Err(VConfigError::Closed)
        ));
        assert!(matches!(manager.save().await, Err(VConfigError::Closed)));

        manager.on_change(|_, _| {}).await;
        assert!(manager.inner.callbacks.is_empty().await);

        // 重复关闭无副作用
        manager.close().await.unwrap();
    }
}
