//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CELLSYNC__*` 覆盖（双下划线表示嵌套，如 `CELLSYNC__SHAPE__WRITES_PER_SCAN=5`）。
//! 每个组件只拿到自己的段，由构造函数显式传入。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionSection,
    pub bridge: BridgeSection,
    pub shape: ShapeSection,
    pub breaker: BreakerSection,
    pub snapshot: SnapshotSection,
    pub pricing: PricingSection,
}

/// [session] 段：动作日志、进度摘要、结果契约
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 动作日志保留条数，超出时丢弃最旧的
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    /// 进度摘要中保留的最近结果行数
    #[serde(default = "default_summary_lines")]
    pub summary_lines: usize,
    /// 开发模式：把不合契约的工具返回值强制转成 ToolResult，而不是报 ContractViolation
    #[serde(default)]
    pub coerce_results: bool,
    /// 关闭会话时导出状态 JSON 的路径（调试用）
    pub dump_path: Option<PathBuf>,
}

fn default_max_actions() -> usize {
    200
}

fn default_summary_lines() -> usize {
    30
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_actions: default_max_actions(),
            summary_lines: default_summary_lines(),
            coerce_results: false,
            dump_path: None,
        }
    }
}

/// [bridge] 段：后端调用超时、暂态错误重试、连接获取
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// 单次后端调用超时（毫秒），超时按暂态错误处理
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// 暂态错误的最大重试次数（不含首次调用）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 连续获取连接失败多少次后放弃（连接就此拆除）
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,
    /// 优先新建专用实例，而不是附着到已有实例
    #[serde(default = "default_prefer_dedicated")]
    pub prefer_dedicated: bool,
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_acquire_attempts() -> u32 {
    3
}

fn default_prefer_dedicated() -> bool {
    true
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            acquire_attempts: default_acquire_attempts(),
            prefer_dedicated: default_prefer_dedicated(),
        }
    }
}

/// [shape] 段：结构扫描防抖与摘要上限
#[derive(Debug, Clone, Deserialize)]
pub struct ShapeSection {
    /// 累计多少次写入后即可扫描（只需静默一个 tick 周期，不必等满平静期）
    #[serde(default = "default_writes_per_scan")]
    pub writes_per_scan: u32,
    /// 最后一次写入后经过多久视为突发结束（毫秒）
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// 后台 tick 间隔（毫秒），0 表示不启动定时器，由调用方手动 tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_sheets")]
    pub max_sheets: usize,
    #[serde(default = "default_max_headers_per_sheet")]
    pub max_headers_per_sheet: usize,
    /// 扫描时每张表最多读取的表头列数
    #[serde(default = "default_max_scan_columns")]
    pub max_scan_columns: u32,
    #[serde(default = "default_max_names")]
    pub max_names: usize,
}

fn default_writes_per_scan() -> u32 {
    3
}

fn default_settle_ms() -> u64 {
    750
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_max_sheets() -> usize {
    30
}

fn default_max_headers_per_sheet() -> usize {
    50
}

fn default_max_scan_columns() -> u32 {
    200
}

fn default_max_names() -> usize {
    50
}

impl Default for ShapeSection {
    fn default() -> Self {
        Self {
            writes_per_scan: default_writes_per_scan(),
            settle_ms: default_settle_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            max_sheets: default_max_sheets(),
            max_headers_per_sheet: default_max_headers_per_sheet(),
            max_scan_columns: default_max_scan_columns(),
            max_names: default_max_names(),
        }
    }
}

/// [breaker] 段：同类错误连续多少次后熔断
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_halt_threshold")]
    pub halt_threshold: u32,
}

fn default_halt_threshold() -> u32 {
    2
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            halt_threshold: default_halt_threshold(),
        }
    }
}

/// [snapshot] 段：快照大小上限与落盘目录
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSection {
    /// 单次快照最多捕获的单元格数，超出则本次操作无快照
    #[serde(default = "default_max_cells")]
    pub max_cells: u64,
    /// 设置后快照内容写入该目录（临时文件），关闭会话时清理
    pub spill_dir: Option<PathBuf>,
}

fn default_max_cells() -> u64 {
    10_000
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            max_cells: default_max_cells(),
            spill_dir: None,
        }
    }
}

/// [pricing] 段：调用方上报 token 用量时按哪个模型计价
#[derive(Debug, Clone, Deserialize)]
pub struct PricingSection {
    #[serde(default = "default_pricing_model")]
    pub model: String,
}

fn default_pricing_model() -> String {
    "gpt-4.1-mini".to_string()
}

impl Default for PricingSection {
    fn default() -> Self {
        Self {
            model: default_pricing_model(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CELLSYNC__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CELLSYNC__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CELLSYNC")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.shape.writes_per_scan, 3);
        assert_eq!(cfg.breaker.halt_threshold, 2);
        assert_eq!(cfg.bridge.max_retries, 3);
        assert_eq!(cfg.session.max_actions, 200);
        assert!(!cfg.session.coerce_results);
        assert_eq!(cfg.pricing.model, "gpt-4.1-mini");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cellsync.toml");
        std::fs::write(
            &path,
            "[shape]\nwrites_per_scan = 5\n\n[breaker]\nhalt_threshold = 4\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.shape.writes_per_scan, 5);
        assert_eq!(cfg.shape.max_sheets, 30);
        assert_eq!(cfg.breaker.halt_threshold, 4);
        assert_eq!(cfg.bridge.backoff_base_ms, 100);
    }
}
