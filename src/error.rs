//! 错误处理模块
//!
//! 定义配置引擎的统一错误类型

use crate::config::format::ConfigFormat;
use std::path::PathBuf;
use thiserror::Error;

/// vconfig 的主要错误类型
#[derive(Error, Debug)]
pub enum VConfigError {
    /// 构造阶段的配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 配置源读写错误
    #[error("配置源错误: {0}")]
    Source(#[from] SourceError),

    /// 结构体与配置树之间的转换错误
    #[error("配置结构转换失败: {0}")]
    Convert(#[from] serde_json::Error),

    /// 配置管理器已关闭
    #[error("配置管理器已关闭")]
    Closed,
}

/// 构造配置管理器时的错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 同时指定了多种配置源
    #[error("配置源冲突: {0}")]
    SourceConflict(String),

    /// 未指定任何配置源
    #[error("未指定配置源（文件、环境变量或KV存储）")]
    NoSource,

    /// 不支持的配置格式或文件扩展名
    #[error("不支持的配置格式: {0}")]
    UnsupportedFormat(String),

    /// 配置了KV地址但没有提供连接器
    #[error("已配置KV地址但未提供KV连接器")]
    MissingKvConnector,

    /// 选项取值非法
    #[error("无效的配置选项: {0}")]
    InvalidOption(String),
}

/// 配置源读写错误
#[derive(Error, Debug)]
pub enum SourceError {
    /// 文件读写失败
    #[error("读写文件失败 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 配置内容解析失败
    #[error("解析{format}配置失败 ({origin}): {message}")]
    Decode {
        format: ConfigFormat,
        origin: String,
        message: String,
    },

    /// 配置序列化失败
    #[error("序列化{format}配置失败: {message}")]
    Encode { format: ConfigFormat, message: String },

    /// KV存储访问失败
    #[error("KV存储操作失败 {key}: {message}")]
    Kv { key: String, message: String },

    /// 文件监控器错误
    #[error("文件监控错误: {0}")]
    Watch(#[from] notify::Error),
}

impl SourceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn kv(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Kv {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, VConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_and_display() {
        let err: VConfigError = ConfigError::NoSource.into();
        assert!(matches!(err, VConfigError::Config(ConfigError::NoSource)));
        assert!(err.to_string().contains("未指定配置源"));

        let err: VConfigError = SourceError::kv("/config/app", "connection refused").into();
        assert!(err.to_string().contains("/config/app"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_decode_error_mentions_format() {
        let err = SourceError::Decode {
            format: ConfigFormat::Yaml,
            origin: "app.yaml".to_string(),
            message: "bad indent".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("yaml"));
        assert!(text.contains("app.yaml"));
    }
}
