//! Conductor - 流水线编排客户端
//!
//! 入口：初始化日志、加载配置、恢复会话并对账，然后从标准输入读取命令驱动流水线，
//! 每次状态变化以一行 JSON 输出到标准输出。

use std::path::PathBuf;

use anyhow::Context;
use conductor::config::{load_config, AppConfig};
use conductor::core::{create_conductor, Command};
use conductor::core::state::ArtifactStage;
use tokio::io::{AsyncBufReadExt, BufReader};

/// 解析一行命令：plan <任务> | spec | fix <plan|spec> <发现...> | execute | retry <provider> [model] | reconcile | reset | quit
fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match head {
        "plan" if !rest.is_empty() => Some(Command::Plan(rest.to_string())),
        "spec" => Some(Command::Spec),
        "fix" => {
            let (target, findings) = rest.split_once(' ').unwrap_or((rest, ""));
            let target = match target {
                "plan" => ArtifactStage::Plan,
                "spec" | "" => ArtifactStage::Spec,
                _ => return None,
            };
            let findings = findings
                .split(';')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
            Some(Command::Fix { target, findings })
        }
        "execute" => Some(Command::Execute),
        "retry" => {
            let mut parts = rest.split_whitespace();
            let provider = parts.next()?.to_string();
            let model = parts.next().map(String::from);
            Some(Command::Retry { provider, model })
        }
        "reconcile" => Some(Command::Reconcile),
        "reset" => Some(Command::Reset),
        "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        eprintln!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    conductor::observability::init(cfg.feed.diagnostic);

    let orchestrator = create_conductor(&cfg)
        .await
        .context("Failed to create orchestrator")?;
    let (cmd_tx, mut state_rx, handle) = orchestrator.spawn();

    // 状态变化逐行输出
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow_and_update().clone();
            match serde_json::to_string(&state) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Could not encode UI state: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(cmd) => {
                let quit = matches!(cmd, Command::Quit);
                if cmd_tx.send(cmd).is_err() || quit {
                    break;
                }
            }
            None => tracing::warn!("Unknown command: {}", line.trim()),
        }
    }
    drop(cmd_tx);

    handle.await.context("Orchestrator task failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse_command("plan add a login page"), Some(Command::Plan(t)) if t == "add a login page"));
        assert!(parse_command("plan").is_none());
        match parse_command("fix plan missing goal; bad order") {
            Some(Command::Fix { target, findings }) => {
                assert_eq!(target, ArtifactStage::Plan);
                assert_eq!(findings, vec!["missing goal", "bad order"]);
            }
            other => panic!("Expected Fix, got {other:?}"),
        }
        match parse_command("retry mistral") {
            Some(Command::Retry { provider, model }) => {
                assert_eq!(provider, "mistral");
                assert!(model.is_none());
            }
            other => panic!("Expected Retry, got {other:?}"),
        }
        assert!(matches!(parse_command("quit"), Some(Command::Quit)));
        assert!(parse_command("dance").is_none());
    }
}
