//! 工具调用流水线
//!
//! run(name, args) 依次：校验参数（不合法直接失败，不触达后端）→ 写操作先快照 → 经连接桥执行 →
//! 结果契约检查 → 可自动修复的失败修正后重试一次 → 成功丢弃快照 / 失败回滚 → 审计日志。
//! 任何路径都落到一个 ToolResult，并附带交给会话应用的 StatePatch。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::bridge::ConnectionBridge;
use crate::core::{
    args_digest, ActionLogEntry, ErrorKind, MetricsDelta, OperationId, SnapshotStatus, StatePatch,
};
use crate::snapshot::SnapshotManager;
use crate::tools::registry::missing_required;
use crate::tools::{autofix, Tool, ToolRegistry, ToolResult};

/// 一次调用的结果与状态补丁
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    pub result: ToolResult,
    pub patch: StatePatch,
}

struct Invocation<'a> {
    name: &'a str,
    operation: OperationId,
    args_preview: String,
    timestamp: String,
    started: Instant,
}

impl<'a> Invocation<'a> {
    fn begin(name: &'a str, args: &Value) -> Self {
        Self {
            name,
            operation: OperationId::new(),
            args_preview: args_digest(args),
            timestamp: chrono::Utc::now().to_rfc3339(),
            started: Instant::now(),
        }
    }
}

pub struct ToolPipeline {
    registry: ToolRegistry,
    bridge: Arc<ConnectionBridge>,
    snapshots: Arc<SnapshotManager>,
    coerce: bool,
}

impl ToolPipeline {
    pub fn new(
        registry: ToolRegistry,
        bridge: Arc<ConnectionBridge>,
        snapshots: Arc<SnapshotManager>,
        coerce: bool,
    ) -> Self {
        Self {
            registry,
            bridge,
            snapshots,
            coerce,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 参数校验：未知工具、必填参数、工具自身校验；工具校验 panic 也按校验失败处理
    pub fn prevalidate(&self, name: &str, args: &Value) -> Result<Arc<dyn Tool>, String> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        if !args.is_object() && !args.is_null() {
            return Err("args must be a JSON object".to_string());
        }
        if let Some(key) = missing_required(args, tool.required_args()) {
            return Err(format!("missing required argument '{key}'"));
        }
        match catch_unwind(AssertUnwindSafe(|| tool.validate(args))) {
            Ok(Ok(())) => Ok(tool),
            Ok(Err(msg)) => Err(msg),
            Err(_) => Err("argument validation panicked".to_string()),
        }
    }

    /// 熔断中：不执行，直接生成 CircuitOpen 结果
    pub fn refuse(&self, name: &str, args: &Value, halted: ErrorKind) -> PipelineOutcome {
        let inv = Invocation::begin(name, args);
        let result = ToolResult::failure(
            ErrorKind::CircuitOpen,
            format!("repeated {halted} failures, calls halted until cleared"),
        );
        self.finish(inv, result, SnapshotStatus::NotNeeded, MetricsDelta::default(), None, false)
    }

    pub async fn run(&self, name: &str, args: Value) -> PipelineOutcome {
        let checked = self.prevalidate(name, &args);
        self.run_checked(name, args, checked).await
    }

    /// 与 run 相同，但沿用调用方已经做过的 prevalidate 结果
    pub async fn run_checked(
        &self,
        name: &str,
        args: Value,
        checked: Result<Arc<dyn Tool>, String>,
    ) -> PipelineOutcome {
        let inv = Invocation::begin(name, &args);
        let tool = match checked {
            Ok(t) => t,
            Err(msg) => {
                let result = ToolResult::failure(ErrorKind::Validation, msg);
                return self.finish(inv, result, SnapshotStatus::NotNeeded, MetricsDelta::default(), None, false);
            }
        };

        // 单写者：快照、执行、回滚期间不会有结构扫描插入
        let gate = self.bridge.lock_document().await;
        let retries_before = self.bridge.retries();
        let mut delta = MetricsDelta::default();
        let write = tool.write_kind();

        let mut snapshot = SnapshotStatus::NotNeeded;
        let mut captured = false;
        if write.is_some() {
            let scopes = catch_unwind(AssertUnwindSafe(|| tool.snapshot_scopes(&args))).unwrap_or_default();
            if !scopes.is_empty() {
                match self.snapshots.capture(inv.operation.clone(), scopes).await {
                    Ok(_) => captured = true,
                    Err(e) => {
                        tracing::warn!(tool = name, operation = %inv.operation, error = %e, "snapshot unavailable, write is not revertible");
                        delta.snapshot_failures += 1;
                        snapshot = SnapshotStatus::Unavailable(e.to_string());
                    }
                }
            }
        }

        let args = Arc::new(args);
        let mut result = self.execute(&tool, Arc::clone(&args)).await;
        let mut autofixed = false;
        if let Some(fixed) = result
            .message()
            .filter(|m| autofix::is_fixable(m))
            .and_then(|_| autofix::fix_colors(&args))
        {
            tracing::info!(tool = name, "retrying once with auto-fixed colors");
            delta.autofixes += 1;
            autofixed = true;
            result = self.execute(&tool, Arc::new(fixed)).await;
        }

        if captured {
            if result.is_success() {
                self.snapshots.discard(&inv.operation).await;
                snapshot = SnapshotStatus::Discarded;
            } else {
                match self.snapshots.revert(&inv.operation).await {
                    Ok(()) => {
                        delta.reverts += 1;
                        snapshot = SnapshotStatus::Reverted;
                    }
                    Err(e) => {
                        tracing::error!(tool = name, operation = %inv.operation, error = %e, "revert failed");
                        snapshot = SnapshotStatus::RevertFailed(e.to_string());
                    }
                }
            }
        }
        delta.retries = self.bridge.retries().saturating_sub(retries_before);
        drop(gate);

        // 失败且已回滚时文档未变，不必刷新结构
        let hint = write.filter(|_| result.is_success() || snapshot != SnapshotStatus::Reverted);
        self.finish(inv, result, snapshot, delta, hint, autofixed)
    }

    async fn execute(&self, tool: &Arc<dyn Tool>, args: Arc<Value>) -> ToolResult {
        let tool = Arc::clone(tool);
        match self
            .bridge
            .with_connection(move |b| tool.execute(b, &args))
            .await
        {
            Ok(raw) => ToolResult::from_raw(raw, self.coerce),
            Err(e) => ToolResult::failure(e.kind(), e.to_string()),
        }
    }

    fn finish(
        &self,
        inv: Invocation<'_>,
        result: ToolResult,
        snapshot: SnapshotStatus,
        metrics: MetricsDelta,
        shape_hint: Option<crate::shape::WriteKind>,
        autofixed: bool,
    ) -> PipelineOutcome {
        // 失败消息统一带上工具名与类别；无法撤销的写操作必须让调用方知道
        let result = match result {
            ToolResult::Failure { kind, message } => {
                let mut message = format!("{} failed [{kind}]: {message}", inv.name);
                match &snapshot {
                    SnapshotStatus::Unavailable(reason) => message.push_str(&format!(
                        " [{}] not revertible, document may be partially modified ({reason})",
                        ErrorKind::SnapshotUnavailable
                    )),
                    SnapshotStatus::RevertFailed(reason) => message.push_str(&format!(
                        " [revert_failed] document may be partially modified ({reason})"
                    )),
                    _ => {}
                }
                ToolResult::Failure { kind, message }
            }
            ToolResult::Success { data } => match &snapshot {
                SnapshotStatus::Unavailable(reason) => ToolResult::Success {
                    data: Some(with_warning(
                        data,
                        format!("{}: write applied without a snapshot ({reason})", ErrorKind::SnapshotUnavailable),
                    )),
                },
                _ => ToolResult::Success { data },
            },
        };
        let duration_ms = inv.started.elapsed().as_millis() as u64;
        let kind = result.error_kind();
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": inv.name,
            "operation": inv.operation.as_str(),
            "ok": kind.is_none(),
            "outcome": if kind.is_none() { "ok" } else { "error" },
            "kind": kind,
            "duration_ms": duration_ms,
            "snapshot": &snapshot,
            "autofixed": autofixed,
            "args_preview": &inv.args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let entry = ActionLogEntry {
            seq: 0,
            operation: inv.operation,
            tool: inv.name.to_string(),
            args: inv.args_preview,
            ok: kind.is_none(),
            kind,
            message: result.message().map(str::to_string),
            timestamp: inv.timestamp,
            duration_ms,
            snapshot,
            autofixed,
        };
        PipelineOutcome {
            result,
            patch: StatePatch {
                entry,
                shape_hint,
                metrics,
            },
        }
    }
}

/// 在成功结果的 data 上附加 warning 字段；data 不是对象时包一层
fn with_warning(data: Option<Value>, warning: String) -> Value {
    match data {
        Some(Value::Object(mut map)) => {
            map.insert("warning".to_string(), Value::String(warning));
            Value::Object(map)
        }
        Some(other) => serde_json::json!({ "value": other, "warning": warning }),
        None => serde_json::json!({ "warning": warning }),
    }
}
