//! vconfig 主程序入口
//!
//! 配置监控与差异比较工具

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};
use vconfig::cli::args::{Args, Commands};
use vconfig::cli::commands::{Command, DiffCommand, VersionCommand, WatchCommand};
use vconfig::logging::LoggingSystem;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging_system =
        LoggingSystem::setup_logging(args.log_config()).context("初始化日志系统失败")?;

    debug!("vconfig v{} 启动", vconfig::VERSION);

    if let Err(e) = execute_command(&args, logging_system).await {
        error!("命令执行失败: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// 执行CLI命令
async fn execute_command(args: &Args, logging_system: LoggingSystem) -> Result<()> {
    let command: Box<dyn Command> = match &args.command {
        Commands::Watch { .. } => {
            // 变更已打印到标准输出，JSON日志模式下再写一份结构化日志
            let logging = args.json_logs.then_some(logging_system);
            Box::new(WatchCommand::new(logging))
        }
        Commands::Diff { .. } => Box::new(DiffCommand),
        Commands::Version { .. } => Box::new(VersionCommand),
    };
    command.execute(args).await
}
