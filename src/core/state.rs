//! 会话状态：动作日志、指标、状态补丁与计价
//!
//! 流水线不直接改会话，而是返回 StatePatch（日志条目、结构刷新提示、指标增量），由 SessionContext 统一应用。

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use serde_json::Value;

use crate::core::ErrorKind;
use crate::shape::WriteKind;

/// 操作 ID：一次工具调用的唯一标识，快照记录按它归属
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 参数摘要最长字符数
pub const ARGS_PREVIEW_CHARS: usize = 200;

const REDACTED_KEYS: &[&str] = &["password", "secret", "token", "api_key", "credential"];

/// 参数摘要：敏感字段脱敏后序列化，超长截断
pub fn args_digest(args: &Value) -> String {
    let s = redact(args).to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

fn redact(v: &Value) -> Value {
    match v {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_ascii_lowercase();
                    if REDACTED_KEYS.iter().any(|r| lower.contains(r)) {
                        (k.clone(), Value::String("***".into()))
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// 本次调用的快照处置
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// 只读操作或无可快照的区域
    NotNeeded,
    /// 成功后已丢弃
    Discarded,
    /// 失败后已回滚
    Reverted,
    /// 回滚本身失败
    RevertFailed(String),
    /// 无法捕获，本次写操作不可回滚
    Unavailable(String),
}

impl SnapshotStatus {
    /// 写操作的效果无法撤销（未能快照，或回滚失败）
    pub fn is_unrevertible(&self) -> bool {
        matches!(self, SnapshotStatus::Unavailable(_) | SnapshotStatus::RevertFailed(_))
    }
}

/// 动作日志条目（不可变）
#[derive(Clone, Debug, Serialize)]
pub struct ActionLogEntry {
    pub seq: u64,
    pub operation: OperationId,
    pub tool: String,
    pub args: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339
    pub timestamp: String,
    pub duration_ms: u64,
    pub snapshot: SnapshotStatus,
    pub autofixed: bool,
}

impl ActionLogEntry {
    /// 进度摘要中的一行：`tool → ok` 或 `tool → error(kind)`；不可撤销时附带标注
    pub fn summary_line(&self) -> String {
        let unrevertible = self.snapshot.is_unrevertible();
        match self.kind {
            None if unrevertible => format!("{} → ok, no snapshot", self.tool),
            None => format!("{} → ok", self.tool),
            Some(kind) if unrevertible => format!("{} → error({kind}), not reverted", self.tool),
            Some(kind) => format!("{} → error({kind})", self.tool),
        }
    }
}

/// 只追加的动作日志；超过上限时丢弃最旧的条目，seq 保持单调
#[derive(Debug)]
pub struct ActionLog {
    entries: VecDeque<ActionLogEntry>,
    cap: usize,
    next_seq: u64,
}

impl ActionLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
            next_seq: 1,
        }
    }

    pub fn push(&mut self, mut entry: ActionLogEntry) -> u64 {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionLogEntry> {
        self.entries.iter()
    }

    /// 最近 n 条，按时间顺序
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &ActionLogEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    pub fn last(&self) -> Option<&ActionLogEntry> {
        self.entries.back()
    }
}

/// 一次调用带来的指标增量
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsDelta {
    pub retries: u64,
    pub autofixes: u64,
    pub reverts: u64,
    pub snapshot_failures: u64,
}

/// 流水线返回给会话的状态补丁
#[derive(Clone, Debug)]
pub struct StatePatch {
    pub entry: ActionLogEntry,
    pub shape_hint: Option<WriteKind>,
    pub metrics: MetricsDelta,
}

/// 会话累计指标
#[derive(Clone, Debug, Default, Serialize)]
pub struct Metrics {
    pub invocations: u64,
    pub successes: u64,
    pub failures: BTreeMap<ErrorKind, u64>,
    pub retries: u64,
    pub autofixes: u64,
    pub reverts: u64,
    pub snapshot_failures: u64,
    pub scans: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl Metrics {
    pub fn apply(&mut self, entry: &ActionLogEntry, delta: &MetricsDelta) {
        self.invocations += 1;
        match entry.kind {
            None => self.successes += 1,
            Some(kind) => *self.failures.entry(kind).or_default() += 1,
        }
        self.retries += delta.retries;
        self.autofixes += delta.autofixes;
        self.reverts += delta.reverts;
        self.snapshot_failures += delta.snapshot_failures;
    }

    pub fn failures_total(&self) -> u64 {
        self.failures.values().sum()
    }

    /// 累加调用方上报的 token 用量并换算成美元
    pub fn record_usage(&mut self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        let cost = dollars_for_usage(model, prompt_tokens, completion_tokens);
        self.cost_usd = round_micro(self.cost_usd + cost);
        cost
    }
}

/// 默认计价模型；未知模型按它计价
pub const DEFAULT_PRICING_MODEL: &str = "gpt-4.1-mini";

/// 每千 token 的 (输入, 输出) 美元价格
pub fn price_per_1k(model: &str) -> (f64, f64) {
    match model {
        "gpt-4.1-mini" => (0.01, 0.03),
        "gpt-4o-2025-04-09" => (0.005, 0.015),
        "gpt-4-turbo" => (0.01, 0.03),
        "gpt-4" => (0.03, 0.06),
        "gpt-3.5-turbo" => (0.001, 0.002),
        _ => price_per_1k(DEFAULT_PRICING_MODEL),
    }
}

pub fn dollars_for_usage(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let (input, output) = price_per_1k(model);
    round_micro(prompt_tokens as f64 / 1000.0 * input + completion_tokens as f64 / 1000.0 * output)
}

fn round_micro(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(tool: &str, kind: Option<ErrorKind>) -> ActionLogEntry {
        ActionLogEntry {
            seq: 0,
            operation: OperationId::new(),
            tool: tool.to_string(),
            args: "{}".to_string(),
            ok: kind.is_none(),
            kind,
            message: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_ms: 1,
            snapshot: SnapshotStatus::NotNeeded,
            autofixed: false,
        }
    }

    #[test]
    fn test_action_log_evicts_oldest() {
        let mut log = ActionLog::new(2);
        for t in ["a", "b", "c"] {
            log.push(entry(t, None));
        }
        let tools: Vec<_> = log.iter().map(|e| e.tool.as_str()).collect();
        assert_eq!(tools, vec!["b", "c"]);
        assert_eq!(log.last().map(|e| e.seq), Some(3));
        assert_eq!(log.recent(1).count(), 1);
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(entry("set_cell_value", None).summary_line(), "set_cell_value → ok");
        assert_eq!(
            entry("create_sheet", Some(ErrorKind::BackendPermanent)).summary_line(),
            "create_sheet → error(backend_permanent)"
        );
    }

    #[test]
    fn test_summary_line_flags_unrevertible_writes() {
        let mut failed = entry("set_cell_values", Some(ErrorKind::BackendPermanent));
        failed.snapshot = SnapshotStatus::Unavailable("too large".into());
        assert_eq!(failed.summary_line(), "set_cell_values → error(backend_permanent), not reverted");
        failed.snapshot = SnapshotStatus::RevertFailed("gone".into());
        assert_eq!(failed.summary_line(), "set_cell_values → error(backend_permanent), not reverted");

        let mut ok = entry("set_cell_values", None);
        ok.snapshot = SnapshotStatus::Unavailable("too large".into());
        assert_eq!(ok.summary_line(), "set_cell_values → ok, no snapshot");
    }

    #[test]
    fn test_args_digest_redacts_and_truncates() {
        let d = args_digest(&json!({"api_key": "sk-123", "text": "hi"}));
        assert!(d.contains("***"));
        assert!(!d.contains("sk-123"));
        let long = args_digest(&json!({"text": "x".repeat(500)}));
        assert_eq!(long.chars().count(), ARGS_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_metrics_apply() {
        let mut m = Metrics::default();
        let delta = MetricsDelta {
            retries: 2,
            ..Default::default()
        };
        m.apply(&entry("a", None), &delta);
        m.apply(&entry("b", Some(ErrorKind::Validation)), &MetricsDelta::default());
        assert_eq!(m.invocations, 2);
        assert_eq!(m.successes, 1);
        assert_eq!(m.failures_total(), 1);
        assert_eq!(m.retries, 2);
    }

    #[test]
    fn test_pricing() {
        assert_eq!(dollars_for_usage("gpt-4", 1000, 1000), 0.09);
        assert_eq!(
            dollars_for_usage("some-future-model", 2000, 0),
            dollars_for_usage("gpt-4.1-mini", 2000, 0)
        );
        assert_eq!(dollars_for_usage("gpt-3.5-turbo", 1, 1), 0.000003);
        let mut m = Metrics::default();
        m.record_usage("gpt-4o-2025-04-09", 1000, 0);
        m.record_usage("gpt-4o-2025-04-09", 1000, 0);
        assert_eq!(m.cost_usd, 0.01);
        assert_eq!(m.prompt_tokens, 2000);
    }
}
