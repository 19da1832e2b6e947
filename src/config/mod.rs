//! 配置管理模块
//!
//! 提供类型化配置的加载、合并、差异比较和热重载功能

pub mod binder;
pub mod diff;
pub mod env;
pub mod format;
pub mod kv;
pub mod manager;
pub mod source;
pub mod watcher;

// 重新导出主要类型
pub use diff::{diff, diff_values, ChangeItem};
pub use env::{AppliedOverride, EnvOverlay};
pub use format::ConfigFormat;
pub use kv::{KvConnector, KvLocation, KvStore, KvTlsConfig, MemoryKvBackend};
pub use manager::{
    CallbackRegistry, ChangeCallback, ChangeEvent, ChangeSource, ConfigData, ConfigManager,
    ManagerState,
};
pub use source::{ConfigOptions, FileSource, SourceDescriptor, DEFAULT_DEBOUNCE};
