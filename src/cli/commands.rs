//! 命令处理逻辑
//!
//! 实现各种CLI命令的处理逻辑

use crate::cli::args::{Args, Commands, OutputFormat};
use crate::config::{
    diff_values, ChangeEvent, ChangeItem, ConfigFormat, ConfigManager, ConfigOptions,
};
use crate::logging::LoggingSystem;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// 命令处理器trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, args: &Args) -> Result<()>;
}

/// 版本命令
pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Version { output } = &args.command {
            match output {
                OutputFormat::Json => {
                    let version_info = json!({
                        "name": crate::APP_NAME,
                        "version": crate::VERSION,
                        "description": crate::APP_DESCRIPTION
                    });
                    println!("{}", serde_json::to_string_pretty(&version_info)?);
                }
                OutputFormat::Text => {
                    println!("{} v{}", crate::APP_NAME, crate::VERSION);
                    println!("{}", crate::APP_DESCRIPTION);
                }
            }
        }
        Ok(())
    }
}

/// 差异命令
pub struct DiffCommand;

#[async_trait]
impl Command for DiffCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        if let Commands::Diff { old, new, output } = &args.command {
            let old_doc = read_document(old).await?;
            let new_doc = read_document(new).await?;
            let changes = diff_values(&old_doc, &new_doc, "");
            print_changes(None, &changes, *output)?;
        }
        Ok(())
    }
}

/// 读取任意支持格式的配置文件
async fn read_document(path: &Path) -> Result<Value> {
    let format = ConfigFormat::from_path(path)?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
    Ok(format.decode(&bytes, &path.display().to_string())?)
}

/// 打印一批变更
fn print_changes(
    event: Option<&ChangeEvent>,
    changes: &[ChangeItem],
    output: OutputFormat,
) -> Result<()> {
    match output {
        OutputFormat::Json => {
            let entry = json!({ "event": event, "changes": changes });
            println!("{}", serde_json::to_string(&entry)?);
        }
        OutputFormat::Text => {
            if let Some(event) = event {
                println!(
                    "[v{}] {} 来自 {:?}",
                    event.version,
                    event.timestamp.to_rfc3339(),
                    event.source
                );
            }
            if changes.is_empty() {
                println!("无变更");
            }
            for change in changes {
                let marker = if change.is_addition() {
                    '+'
                } else if change.is_removal() {
                    '-'
                } else {
                    '~'
                };
                println!("  {marker} {change}");
            }
        }
    }
    Ok(())
}

/// 监控命令
pub struct WatchCommand {
    logging: Option<LoggingSystem>,
}

impl WatchCommand {
    /// 创建监控命令，`logging` 存在时同时把变更写入日志
    pub fn new(logging: Option<LoggingSystem>) -> Self {
        Self { logging }
    }

    /// 根据命令行参数构造选项
    pub fn options(
        files: &[PathBuf],
        format: Option<ConfigFormat>,
        env_prefix: Option<&str>,
        env_only: bool,
        debounce_ms: u64,
    ) -> ConfigOptions {
        let mut options = ConfigOptions::new()
            .with_files(files.iter().cloned())
            .with_debounce(Duration::from_millis(debounce_ms));
        if let Some(format) = format {
            options = options.with_format(format);
        }
        if let Some(prefix) = env_prefix {
            options = options.with_env_prefix(prefix);
        }
        if env_only {
            options = options.env_only();
        }
        options
    }
}

#[async_trait]
impl Command for WatchCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Watch {
            files,
            format,
            env_prefix,
            env_only,
            debounce_ms,
            output,
        } = &args.command
        else {
            return Ok(());
        };

        let options = Self::options(files, *format, env_prefix.as_deref(), *env_only, *debounce_ms);
        let manager = ConfigManager::new(Value::Object(Map::new()), options)
            .await
            .context("创建配置管理器失败")?;

        let current = manager.get_data().await;
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string(&current)?),
            OutputFormat::Text => println!("{}", serde_json::to_string_pretty(&current)?),
        }

        let output = *output;
        let logging = self.logging.clone();
        manager
            .on_change(move |event, changes| {
                if let Err(e) = print_changes(Some(event), changes, output) {
                    tracing::error!(error = %e, "打印变更失败");
                }
                if let Some(system) = logging.as_ref() {
                    system.config_change_log(event, changes);
                }
            })
            .await;

        info!(kind = manager.descriptor().kind(), "开始监控配置，按 Ctrl-C 退出");
        tokio::signal::ctrl_c()
            .await
            .context("等待退出信号失败")?;

        manager.close().await?;
        info!("配置监控已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceDescriptor;
    use tempfile::tempdir;

    #[test]
    fn test_watch_options() {
        let files = vec![PathBuf::from("base.yaml"), PathBuf::from("local.toml")];
        let options = WatchCommand::options(&files, None, Some("APP"), false, 100);

        assert_eq!(options.debounce(), Duration::from_millis(100));
        assert!(options.env_overlay().is_some());
        match options.descriptor().unwrap() {
            SourceDescriptor::Files(sources) => {
                assert_eq!(sources.len(), 2);
                assert_eq!(sources[1].format, ConfigFormat::Toml);
            }
            other => panic!("expected file descriptor, got {other:?}"),
        }

        let options = WatchCommand::options(&[], None, Some("APP"), true, 500);
        assert!(matches!(
            options.descriptor().unwrap(),
            SourceDescriptor::Env { .. }
        ));
    }

    #[tokio::test]
    async fn test_read_document_across_formats() {
        let dir = tempdir().unwrap();
        let yaml = dir.path().join("old.yaml");
        let toml = dir.path().join("new.toml");
        std::fs::write(&yaml, "app:\n  port: 8080\n  name: x\n").unwrap();
        std::fs::write(&toml, "[app]\nport = 9000\nname = \"x\"\n").unwrap();

        let old = read_document(&yaml).await.unwrap();
        let new = read_document(&toml).await.unwrap();
        let changes = diff_values(&old, &new, "");

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "app.port");
        assert_eq!(changes[0].new_as::<u16>(), Some(9000));

        assert!(read_document(&dir.path().join("missing.json")).await.is_err());
    }
}
