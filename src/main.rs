//! cellsync 无界面驱动程序
//!
//! 在内存工作簿上打开会话，从 stdin 逐行读取 JSON 请求，结果逐行写到 stdout：
//! - `{"tool": "set_cell_value", "args": {...}}`：执行工具调用
//! - `{"command": "context"}`：刷新待扫描的结构并输出 `{shape_text, progress_text}`
//! - `{"command": "flush" | "clear_halt" | "dump" | "schema" | "usage"}`
//!
//! 用法：`cellsync [文档名]`，配置见 config/default.toml 与 CELLSYNC__* 环境变量。
//! EOF 或 Ctrl+C 时关闭会话。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use cellsync::backend::{MemoryConnector, OpenTarget};
use cellsync::config::load_config;
use cellsync::tools::{tool_call_schema_json, ToolCallFormat};
use cellsync::{observability, SessionContext};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Tool(ToolCallFormat),
    Command {
        command: String,
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        prompt_tokens: u64,
        #[serde(default)]
        completion_tokens: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let document = std::env::args().nth(1).unwrap_or_else(|| "workbook.xlsx".to_string());

    let connector = Arc::new(MemoryConnector::new());
    let mut session = SessionContext::open(connector, OpenTarget::new(&document), cfg.clone())
        .await
        .context("Failed to open session")?;
    session.supervisor().install_signal_handler();
    let cancel = session.supervisor().cancel_token();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let result: anyhow::Result<()> = async {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line.context("Failed to read stdin")?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let reply = handle(&mut session, &line, &cfg.session.dump_path).await;
            stdout.write_all(format!("{reply}\n").as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok(())
    }
    .await;

    session.close().await.context("Failed to close session")?;
    result
}

async fn handle(session: &mut SessionContext, line: &str, dump_path: &Option<PathBuf>) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return json!({ "success": false, "error": format!("Invalid request: {e}") }),
    };
    match request {
        Request::Tool(call) => session
            .invoke(&call.tool, Value::Object(call.args))
            .await
            .to_json(),
        Request::Command {
            command,
            path,
            prompt_tokens,
            completion_tokens,
        } => match command.as_str() {
            "context" => {
                session.flush_shape().await;
                json!(session.render_context())
            }
            "flush" => json!(session.flush_shape().await),
            "clear_halt" => json!({ "cleared": session.clear_halt() }),
            "dump" => {
                let path = path
                    .or_else(|| dump_path.clone())
                    .unwrap_or_else(|| PathBuf::from("cellsync-state.json"));
                match session.dump_state(&path) {
                    Ok(()) => json!({ "success": true, "data": { "path": path } }),
                    Err(e) => json!({ "success": false, "error": e.to_string() }),
                }
            }
            "schema" => json!({
                "call": serde_json::from_str::<Value>(&tool_call_schema_json()).unwrap_or(Value::Null),
                "tools": serde_json::from_str::<Value>(&session.tool_schema_json()).unwrap_or(Value::Null),
            }),
            "usage" => {
                let cost = session.record_usage(prompt_tokens, completion_tokens);
                json!({ "cost_usd": cost, "metrics": session.metrics() })
            }
            other => json!({ "success": false, "error": format!("Unknown command: {other}") }),
        },
    }
}
