//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use crate::config::ConfigFormat;
use crate::logging::LogConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// vconfig - 可热重载的类型化配置引擎
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vconfig",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 日志级别
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        help = "日志级别",
        env = "VCONFIG_LOG_LEVEL",
        global = true
    )]
    pub log_level: LogLevel,

    /// 是否以JSON格式输出日志
    #[arg(long, help = "以JSON格式输出日志", global = true)]
    pub json_logs: bool,

    /// 日志文件路径，指定后不再输出到控制台
    #[arg(long, value_name = "FILE", help = "日志文件路径", global = true)]
    pub log_file: Option<PathBuf>,

    /// 模块级别日志控制，可重复指定
    #[arg(
        long,
        value_name = "MODULE=LEVEL",
        value_parser = parse_module_level,
        help = "模块日志级别，如 vconfig::config=debug",
        global = true
    )]
    pub log_module: Vec<(String, log::LevelFilter)>,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum LogLevel {
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 监控配置源并打印每一批变更，按 Ctrl-C 退出
    Watch {
        /// 配置文件路径，可指定多个，后面的文件覆盖前面的文件
        #[arg(value_name = "FILE", help = "配置文件路径")]
        files: Vec<PathBuf>,

        /// 显式指定配置格式（json/yaml/toml）
        #[arg(short, long, value_name = "FORMAT", help = "配置格式")]
        format: Option<ConfigFormat>,

        /// 环境变量前缀
        #[arg(
            short,
            long,
            value_name = "PREFIX",
            help = "环境变量前缀",
            env = "VCONFIG_ENV_PREFIX"
        )]
        env_prefix: Option<String>,

        /// 仅使用环境变量
        #[arg(long, help = "仅使用环境变量作为配置源", conflicts_with = "files")]
        env_only: bool,

        /// 防抖时间（毫秒）
        #[arg(
            long,
            value_name = "MILLIS",
            default_value = "500",
            help = "防抖时间（毫秒）"
        )]
        debounce_ms: u64,

        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        output: OutputFormat,
    },

    /// 比较两个配置文件并打印差异
    Diff {
        /// 旧配置文件
        #[arg(value_name = "OLD", help = "旧配置文件")]
        old: PathBuf,

        /// 新配置文件
        #[arg(value_name = "NEW", help = "新配置文件")]
        new: PathBuf,

        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        output: OutputFormat,
    },

    /// 显示版本信息
    Version {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text", help = "输出格式")]
        output: OutputFormat,
    },
}

/// 输出格式枚举
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    /// 文本格式
    Text,
    /// JSON格式
    Json,
}

impl Args {
    /// 解析命令行参数
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// 是否启用详细输出
    pub fn is_verbose(&self) -> bool {
        matches!(self.log_level, LogLevel::Debug)
    }

    /// 根据全局参数生成日志配置
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone().into(),
            file_path: self.log_file.clone(),
            console: self.log_file.is_none(),
            json_format: self.json_logs,
            module_levels: self.log_module.iter().cloned().collect(),
        }
    }
}

/// 解析 `模块=级别` 形式的参数
fn parse_module_level(value: &str) -> Result<(String, log::LevelFilter), String> {
    let (module, level) = value
        .split_once('=')
        .ok_or_else(|| format!("缺少 '=': {value}"))?;
    if module.trim().is_empty() {
        return Err(format!("模块名为空: {value}"));
    }
    let level = level
        .trim()
        .parse::<log::LevelFilter>()
        .map_err(|_| format!("无效的日志级别: {level}"))?;
    Ok((module.trim().to_string(), level))
}
