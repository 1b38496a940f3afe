//! 会话上下文：聚合根
//!
//! 独占持有连接桥、当前 Shape、动作日志、指标与错误分类器；
//! invoke 把调用交给流水线并应用返回的 StatePatch，render_context 生成每轮注入的文本，
//! close 在所有路径上丢弃快照并释放连接。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::backend::{Connector, DocumentId, OpenTarget};
use crate::bridge::ConnectionBridge;
use crate::config::AppConfig;
use crate::core::{
    ActionLog, ErrorClassifier, ErrorKind, Metrics, SessionError, SessionSupervisor, StatePatch,
};
use crate::shape::{Shape, ShapeSynchronizer, TickOutcome};
use crate::snapshot::SnapshotManager;
use crate::tools::{default_registry, ToolPipeline, ToolRegistry, ToolResult};

/// 每轮注入给调用循环的上下文
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContextPayload {
    pub shape_text: String,
    pub progress_text: String,
}

pub struct SessionContext {
    cfg: AppConfig,
    bridge: Arc<ConnectionBridge>,
    snapshots: Arc<SnapshotManager>,
    shape: Arc<ShapeSynchronizer>,
    pipeline: ToolPipeline,
    log: ActionLog,
    metrics: Metrics,
    classifier: ErrorClassifier,
    state: BTreeMap<String, Value>,
    supervisor: SessionSupervisor,
    closed: bool,
}

impl SessionContext {
    /// 使用内置工具打开会话
    pub async fn open(
        connector: Arc<dyn Connector>,
        target: OpenTarget,
        cfg: AppConfig,
    ) -> Result<Self, SessionError> {
        Self::open_with_registry(connector, target, cfg, default_registry()).await
    }

    /// 获取连接、建立初始 Shape、启动后台 tick
    pub async fn open_with_registry(
        connector: Arc<dyn Connector>,
        target: OpenTarget,
        cfg: AppConfig,
        registry: ToolRegistry,
    ) -> Result<Self, SessionError> {
        let bridge = Arc::new(ConnectionBridge::open(connector, target, cfg.bridge.clone()).await?);
        let snapshots = Arc::new(SnapshotManager::new(Arc::clone(&bridge), cfg.snapshot.clone()));
        let shape = Arc::new(ShapeSynchronizer::new(Arc::clone(&bridge), cfg.shape.clone()));
        if let Err(e) = shape.rescan().await {
            tracing::warn!(error = %e, "initial shape scan failed, starting with an empty shape");
        }
        let pipeline = ToolPipeline::new(
            registry,
            Arc::clone(&bridge),
            Arc::clone(&snapshots),
            cfg.session.coerce_results,
        );
        let supervisor = SessionSupervisor::new();
        supervisor.spawn_shape_ticker(Arc::clone(&shape), Duration::from_millis(cfg.shape.tick_interval_ms));
        tracing::info!(document = %bridge.document(), shape_version = shape.current().version, "session opened");

        Ok(Self {
            log: ActionLog::new(cfg.session.max_actions),
            metrics: Metrics::default(),
            classifier: ErrorClassifier::new(&cfg.breaker),
            state: BTreeMap::new(),
            cfg,
            bridge,
            snapshots,
            shape,
            pipeline,
            supervisor,
            closed: false,
        })
    }

    pub fn document(&self) -> &DocumentId {
        self.bridge.document()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 执行一次工具调用；同一会话同一时刻只有一个调用（&mut self 保证）
    pub async fn invoke(&mut self, name: &str, args: Value) -> ToolResult {
        if self.closed {
            return ToolResult::failure(ErrorKind::BackendPermanent, format!("{name} failed: session is closed"));
        }
        let checked = self.pipeline.prevalidate(name, &args);
        let outcome = match self.classifier.refuses(name, checked.is_err()) {
            Some(halted) => self.pipeline.refuse(name, &args, halted),
            None => self.pipeline.run_checked(name, args, checked).await,
        };
        self.apply(outcome.patch);
        self.classifier.record(name, outcome.result.error_kind());
        outcome.result
    }

    fn apply(&mut self, patch: StatePatch) {
        self.metrics.apply(&patch.entry, &patch.metrics);
        if let Some(kind) = patch.shape_hint {
            self.shape.hint(kind);
        }
        self.log.push(patch.entry);
    }

    /// 当前 Shape 与进度摘要的文本；纯读取，无副作用
    pub fn render_context(&self) -> ContextPayload {
        ContextPayload {
            shape_text: self.shape.render(),
            progress_text: self.render_progress(),
        }
    }

    fn render_progress(&self) -> String {
        let mut lines = vec!["<progress_summary>".to_string()];
        if self.log.is_empty() {
            lines.push("no actions yet".to_string());
        } else {
            lines.extend(self.log.recent(self.cfg.session.summary_lines).map(|e| e.summary_line()));
        }
        let m = &self.metrics;
        lines.push(format!(
            "totals: {} calls, {} ok, {} failed",
            m.invocations,
            m.successes,
            m.failures_total()
        ));
        let halted = self.classifier.halted_kinds();
        if !halted.is_empty() {
            let kinds: Vec<&str> = halted.iter().map(|k| k.as_str()).collect();
            lines.push(format!(
                "HALTED: repeated {} failures; calls of that kind are refused until the halt is cleared",
                kinds.join(", ")
            ));
        }
        lines.push("</progress_summary>".to_string());
        lines.join("\n")
    }

    /// 按防抖策略推进结构同步
    pub async fn tick(&self) -> TickOutcome {
        self.shape.tick().await
    }

    /// 有待扫描提示时立即扫描
    pub async fn flush_shape(&self) -> TickOutcome {
        self.shape.flush().await
    }

    pub fn shape(&self) -> Arc<Shape> {
        self.shape.current()
    }

    pub fn is_halted(&self) -> bool {
        self.classifier.is_halted()
    }

    pub fn clear_halt(&mut self) -> Vec<ErrorKind> {
        self.classifier.clear_halt()
    }

    pub fn state_get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn state_set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.insert(key.into(), value)
    }

    pub fn state_remove(&mut self, key: &str) -> Option<Value> {
        self.state.remove(key)
    }

    /// 累加调用方上报的 token 用量，返回本次费用（美元）
    pub fn record_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let model = self.cfg.pricing.model.clone();
        self.metrics.record_usage(&model, prompt_tokens, completion_tokens)
    }

    pub fn metrics(&self) -> Metrics {
        let mut m = self.metrics.clone();
        m.scans = self.shape.scans();
        m
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.log
    }

    pub fn tool_schema_json(&self) -> String {
        self.pipeline.registry().to_schema_json()
    }

    /// 导出 Shape、状态表、指标与动作日志（调试用）
    pub fn dump_state(&self, path: &Path) -> Result<(), SessionError> {
        let dump = serde_json::json!({
            "document": self.document().to_string(),
            "dumped_at": chrono::Utc::now().to_rfc3339(),
            "shape": self.shape().as_ref(),
            "state": &self.state,
            "metrics": self.metrics(),
            "halted": self.classifier.halted_kinds(),
            "actions": self.log.iter().collect::<Vec<_>>(),
        });
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
        tracing::debug!(path = %path.display(), "session state dumped");
        Ok(())
    }

    /// 关闭会话：停止后台 tick、导出状态（若配置）、丢弃快照、释放连接。
    /// 每一步都会执行，返回遇到的第一个错误；重复调用是 no-op。
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err: Option<SessionError> = None;

        self.supervisor.shutdown(Duration::from_secs(2)).await;

        if let Some(path) = self.cfg.session.dump_path.clone() {
            if let Err(e) = self.dump_state(&path) {
                tracing::warn!(error = %e, "state dump failed during close");
                first_err.get_or_insert(e);
            }
        }

        let discarded = self.snapshots.discard_all().await;

        if let Err(e) = self.bridge.release().await {
            tracing::warn!(error = %e, "connection release failed during close");
            first_err.get_or_insert(SessionError::Backend {
                stage: "release",
                source: e,
            });
        }

        tracing::info!(
            document = %self.bridge.document(),
            invocations = self.metrics.invocations,
            discarded_snapshots = discarded,
            ok = first_err.is_none(),
            "session closed"
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        // 未经 close 的退出：定时器由 supervisor 的 Drop 取消，快照文件由 SnapshotManager 的 Drop 清理
        if !self.closed {
            tracing::warn!(document = %self.bridge.document(), "session dropped without close");
        }
    }
}
