//! 配置源选项模块
//!
//! [`ConfigOptions`] 按调用顺序收集构造选项，
//! [`ConfigOptions::descriptor`] 将其解析为唯一的 [`SourceDescriptor`]。

use crate::config::env::EnvOverlay;
use crate::config::format::ConfigFormat;
use crate::config::kv::{KvConnector, KvLocation};
use crate::error::ConfigError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 默认防抖时间
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// 未显式指定格式时KV存储使用的格式
pub const DEFAULT_KV_FORMAT: ConfigFormat = ConfigFormat::Yaml;

/// 单个配置文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    /// 文件路径
    pub path: PathBuf,
    /// 文件格式
    pub format: ConfigFormat,
}

impl FileSource {
    /// 所在目录
    pub fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// 已解析的配置源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// 一个或多个配置文件，后面的文件逐键覆盖前面的文件
    Files(Vec<FileSource>),
    /// 仅使用环境变量
    Env { prefix: String },
    /// 一个或多个KV地址，统一使用同一种格式
    Kv {
        locations: Vec<KvLocation>,
        format: ConfigFormat,
    },
}

impl SourceDescriptor {
    /// 配置源类型名称
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Files(_) => "file",
            Self::Env { .. } => "env",
            Self::Kv { .. } => "kv",
        }
    }
}

/// 配置管理器的构造选项
#[derive(Clone)]
pub struct ConfigOptions {
    files: Vec<PathBuf>,
    format: Option<ConfigFormat>,
    env_prefix: Option<String>,
    env_enabled: bool,
    env_only: bool,
    debounce: Duration,
    kv_locations: Vec<KvLocation>,
    kv_connector: Option<Arc<dyn KvConnector>>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            format: None,
            env_prefix: None,
            env_enabled: true,
            env_only: false,
            debounce: DEFAULT_DEBOUNCE,
            kv_locations: Vec::new(),
            kv_connector: None,
        }
    }
}

impl fmt::Debug for ConfigOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOptions")
            .field("files", &self.files)
            .field("format", &self.format)
            .field("env_prefix", &self.env_prefix)
            .field("env_enabled", &self.env_enabled)
            .field("env_only", &self.env_only)
            .field("debounce", &self.debounce)
            .field("kv_locations", &self.kv_locations)
            .field("kv_connector", &self.kv_connector.is_some())
            .finish()
    }
}

impl ConfigOptions {
    /// 创建默认选项
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加配置文件
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// 添加多个配置文件，顺序即覆盖优先级
    pub fn with_files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    /// 显式指定配置格式
    pub fn with_format(mut self, format: ConfigFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// 启用环境变量覆盖并设置前缀
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_enabled = true;
        self.env_prefix = Some(prefix.into());
        self
    }

    /// 禁用环境变量覆盖
    pub fn without_env(mut self) -> Self {
        self.env_enabled = false;
        self
    }

    /// 设置防抖时间
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// 添加KV配置位置
    pub fn with_kv(mut self, location: KvLocation) -> Self {
        self.kv_locations.push(location);
        self
    }

    /// 设置KV连接器
    pub fn with_kv_connector(mut self, connector: Arc<dyn KvConnector>) -> Self {
        self.kv_connector = Some(connector);
        self
    }

    /// 仅使用环境变量作为配置源
    pub fn env_only(mut self) -> Self {
        self.env_only = true;
        self
    }

    /// 防抖时间
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub(crate) fn kv_connector(&self) -> Option<Arc<dyn KvConnector>> {
        self.kv_connector.clone()
    }

    /// 环境变量覆盖层
    ///
    /// 仅在设置了前缀且未被禁用时生效；纯环境变量模式由配置源本身处理
    pub fn env_overlay(&self) -> Option<EnvOverlay> {
        if self.env_only || !self.env_enabled {
            return None;
        }
        self.env_prefix.as_deref().map(EnvOverlay::new)
    }

    /// 解析配置源
    pub fn descriptor(&self) -> Result<SourceDescriptor, ConfigError> {
        let has_files = !self.files.is_empty();
        let has_kv = !self.kv_locations.is_empty();

        let selected = [has_files, has_kv, self.env_only]
            .iter()
            .filter(|selected| **selected)
            .count();
        if selected > 1 {
            let mut kinds = Vec::new();
            if has_files {
                kinds.push("file");
            }
            if has_kv {
                kinds.push("kv");
            }
            if self.env_only {
                kinds.push("env");
            }
            return Err(ConfigError::SourceConflict(format!(
                "同时指定了 {} 配置源",
                kinds.join(" + ")
            )));
        }

        if has_files {
            let files = self
                .files
                .iter()
                .map(|path| {
                    let format = match self.format {
                        Some(format) => format,
                        None => ConfigFormat::from_path(path)?,
                    };
                    Ok(FileSource {
                        path: path.clone(),
                        format,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            return Ok(SourceDescriptor::Files(files));
        }

        if has_kv {
            if self.kv_connector.is_none() {
                return Err(ConfigError::MissingKvConnector);
            }
            if let Some(location) = self.kv_locations.iter().find(|l| l.key.is_empty()) {
                return Err(ConfigError::InvalidOption(format!(
                    "KV配置键不能为空: {:?}",
                    location.endpoints
                )));
            }
            return Ok(SourceDescriptor::Kv {
                locations: self.kv_locations.clone(),
                format: self.format.unwrap_or(DEFAULT_KV_FORMAT),
            });
        }

        if self.env_only {
            return Ok(SourceDescriptor::Env {
                prefix: self.env_prefix.clone().unwrap_or_default(),
            });
        }

        Err(ConfigError::NoSource)
    }
}
