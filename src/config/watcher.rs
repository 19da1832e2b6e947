//! 配置源监控模块
//!
//! 为每个配置文件或KV地址启动一个后台任务，检测到外部变更后
//! 通过通道发送 [`ChangeSignal`]，由配置管理器统一执行防抖、重载与分发。

use crate::config::binder::{KvWatchTarget, WatchTargets};
use crate::error::{Result, SourceError};
use futures::StreamExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 文件写入事件后的等待时间，避免读到写了一半的文件
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// 外部变更信号
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeSignal {
    /// 配置文件被写入
    File { path: PathBuf },
    /// KV监听推送了新文档
    Kv {
        index: usize,
        key: String,
        payload: Vec<u8>,
    },
}

/// 配置源监控调度器
pub struct WatchScheduler {
    /// 停止信号
    shutdown: watch::Sender<bool>,
    /// 后台任务
    handles: Vec<JoinHandle<()>>,
}

impl WatchScheduler {
    /// 启动监控
    ///
    /// 纯环境变量模式无需监控，返回 `None`
    pub async fn start(
        targets: WatchTargets,
        signals: mpsc::UnboundedSender<ChangeSignal>,
    ) -> Result<Option<Self>> {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        match targets {
            WatchTargets::None => return Ok(None),
            WatchTargets::Files(paths) => {
                // 先全部创建成功再启动任务，任何一个失败都不会留下后台任务
                let mut prepared = Vec::with_capacity(paths.len());
                for path in paths {
                    prepared.push(Self::prepare_file_watch(&path)?);
                }
                for (target, watcher, events) in prepared {
                    handles.push(tokio::spawn(Self::run_file_watch(
                        target,
                        watcher,
                        events,
                        signals.clone(),
                        shutdown.subscribe(),
                    )));
                }
            }
            WatchTargets::Kv(targets) => {
                let mut prepared = Vec::with_capacity(targets.len());
                for target in targets {
                    let stream = target.store.watch(&target.key).await?;
                    prepared.push((target, stream));
                }
                for (target, stream) in prepared {
                    handles.push(tokio::spawn(Self::run_kv_watch(
                        target,
                        stream,
                        signals.clone(),
                        shutdown.subscribe(),
                    )));
                }
            }
        }

        info!(tasks = handles.len(), "配置源监控已启动");
        Ok(Some(Self { shutdown, handles }))
    }

    /// 创建文件监控器，监控文件所在目录以兼容"写临时文件再重命名"的编辑器
    fn prepare_file_watch(
        path: &Path,
    ) -> Result<(
        PathBuf,
        RecommendedWatcher,
        mpsc::UnboundedReceiver<notify::Result<Event>>,
    )> {
        let target = std::fs::canonicalize(path).map_err(|e| SourceError::io(path, e))?;
        let watch_dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| target.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // 接收端已关闭说明任务已退出
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(SourceError::from)?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(SourceError::from)?;

        debug!(path = %target.display(), dir = %watch_dir.display(), "已监控配置文件");
        Ok((target, watcher, rx))
    }

    /// 文件监控任务
    async fn run_file_watch(
        target: PathBuf,
        watcher: RecommendedWatcher,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
        signals: mpsc::UnboundedSender<ChangeSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // 监控器随任务一起释放
        let _watcher = watcher;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                Ok(event) if is_write_event(&event, &target) => {
                    debug!(path = %target.display(), kind = ?event.kind, "检测到配置文件写入");

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(SETTLE_DELAY) => {}
                    }

                    // 合并等待期间产生的同一批事件
                    while events.try_recv().is_ok() {}

                    if signals
                        .send(ChangeSignal::File {
                            path: target.clone(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => error!(path = %target.display(), error = %e, "文件监控事件错误"),
            }
        }

        debug!(path = %target.display(), "配置文件监控已停止");
    }

    /// KV监听任务
    async fn run_kv_watch(
        target: KvWatchTarget,
        mut stream: crate::config::kv::KvWatchStream,
        signals: mpsc::UnboundedSender<ChangeSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(payload)) => {
                    debug!(key = %target.key, bytes = payload.len(), "收到KV配置推送");
                    let signal = ChangeSignal::Kv {
                        index: target.index,
                        key: target.key.clone(),
                        payload,
                    };
                    if signals.send(signal).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => warn!(key = %target.key, error = %e, "KV监听流错误"),
                None => {
                    debug!(key = %target.key, "KV监听流已结束");
                    break;
                }
            }
        }
    }

    /// 停止所有监控任务并等待其退出
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "监控任务异常退出");
                }
            }
        }
        info!("配置源监控已停止");
    }
}

impl Drop for WatchScheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// 是否为目标文件的写入类事件
fn is_write_event(event: &Event, target: &Path) -> bool {
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) => event.paths.iter().any(|path| {
            path == target
                || std::fs::canonicalize(path)
                    .map(|resolved| resolved == target)
                    .unwrap_or(false)
        }),
        _ => false,
    }
}
