//! 配置格式模块
//!
//! 支持 JSON、YAML、TOML 三种格式的编解码，以及根据文件扩展名推断格式

use crate::error::{ConfigError, SourceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// 支持的配置格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    /// JSON格式
    Json,
    /// YAML格式
    Yaml,
    /// TOML格式
    Toml,
}

impl ConfigFormat {
    /// 根据扩展名（不含点号，大小写不敏感）获取格式
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    /// 根据文件路径推断格式，无法识别时返回错误
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path.extension().and_then(|ext| ext.to_str()).ok_or_else(|| {
            ConfigError::UnsupportedFormat(format!("文件没有扩展名: {}", path.display()))
        })?;

        Self::from_extension(extension).ok_or_else(|| {
            ConfigError::UnsupportedFormat(format!(
                "无法识别的扩展名 .{} ({})",
                extension,
                path.display()
            ))
        })
    }

    /// 格式名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }

    /// 将类型化的值序列化为该格式的字节
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SourceError> {
        let encoded = match self {
            Self::Json => serde_json::to_vec_pretty(value).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
            Self::Toml => toml::to_string_pretty(value)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
        };

        encoded.map_err(|message| SourceError::Encode {
            format: *self,
            message,
        })
    }

    /// 将该格式的字节解析为自描述的配置树
    ///
    /// 空的 YAML/TOML 文档解析为 `Value::Null`，调用方按"无内容"处理；
    /// 空的 JSON 文档不是合法 JSON，返回解析错误
    pub fn decode(&self, bytes: &[u8], origin: &str) -> Result<Value, SourceError> {
        let decode_error = |message: String| SourceError::Decode {
            format: *self,
            origin: origin.to_string(),
            message,
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return match self {
                Self::Json => Err(decode_error("空的JSON文档".to_string())),
                Self::Yaml | Self::Toml => Ok(Value::Null),
            };
        }

        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| decode_error(e.to_string())),
            Self::Yaml => serde_yaml::from_slice(bytes).map_err(|e| decode_error(e.to_string())),
            Self::Toml => {
                let text = std::str::from_utf8(bytes).map_err(|e| decode_error(e.to_string()))?;
                toml::from_str(text).map_err(|e| decode_error(e.to_string()))
            }
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim_start_matches('.'))
            .ok_or_else(|| ConfigError::UnsupportedFormat(s.to_string()))
    }
}
