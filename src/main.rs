//! swarm：对一条请求跑完整的工具调用循环
//!
//! 用法：`swarm [--config <path>] <message...>`；未给出消息时从 stdin 读取。
//! 过程事件以 JSON 行写到 stderr，最终回复写到 stdout；Ctrl+C 取消当前请求。

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use swarm::{load_config, observability, AgentRuntime, AppConfig};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut config_path: Option<PathBuf> = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = Some(PathBuf::from(args.next().context("--config needs a path")?));
        } else {
            words.push(arg);
        }
    }

    let input = if words.is_empty() {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        words.join(" ")
    };
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("empty request");
    }

    let cfg = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed, using defaults");
            AppConfig::default()
        }
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                eprintln!("{}", line);
            }
        }
    });

    let runtime = AgentRuntime::from_config(&cfg).with_event_tx(event_tx);
    runtime.cancellation().install_ctrl_c();

    let result = runtime
        .process_message(Vec::new(), input)
        .await
        .context("Request failed")?;
    drop(runtime);
    let _ = printer.await;

    println!("{}", result.response);
    Ok(())
}
