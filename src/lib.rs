//! vconfig - 可热重载的类型化配置引擎
//!
//! 将类型化的配置值绑定到外部配置源，并在配置源变化时自动更新：
//! - 配置文件（JSON / YAML / TOML，可叠加多个文件）
//! - 环境变量覆盖与纯环境变量模式
//! - 分布式KV存储（通过 [`config::KvConnector`] 接入）
//! - 结构化差异比较，按路径通知变更回调
//! - 防抖、并发安全的重载与可终止的生命周期
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use vconfig::config::{ConfigManager, ConfigOptions};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct AppConfig {
//!     name: String,
//!     port: u16,
//! }
//!
//! # async fn run() -> vconfig::error::Result<()> {
//! let manager = ConfigManager::new(
//!     AppConfig { name: "demo".into(), port: 8080 },
//!     ConfigOptions::new().with_file("config/app.yaml").with_env_prefix("APP"),
//! )
//! .await?;
//!
//! manager
//!     .on_change(|event, changes| {
//!         for change in changes {
//!             println!("v{} {}", event.version, change);
//!         }
//!     })
//!     .await;
//!
//! let current = manager.get_data().await;
//! println!("port = {}", current.port);
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

// 重新导出主要类型
pub use config::{ChangeEvent, ChangeItem, ChangeSource, ConfigManager, ConfigOptions};
pub use error::VConfigError;

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
