//! 会话级集成测试：在内存工作簿上驱动完整的 invoke / tick / render / close 流程

use std::sync::Arc;

use serde_json::json;

use cellsync::backend::{CellValue, DocumentId, MemoryConnector, MemoryWorkbook, OpenTarget};
use cellsync::config::AppConfig;
use cellsync::core::BackendError;
use cellsync::shape::TickOutcome;
use cellsync::{ErrorKind, SessionContext};

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    // 手动 tick；平静期足够长，只由写入计数触发扫描
    cfg.shape.tick_interval_ms = 0;
    cfg.shape.settle_ms = 60_000;
    cfg.bridge.backoff_base_ms = 1;
    cfg.bridge.backoff_max_ms = 5;
    cfg
}

async fn open(connector: &MemoryConnector, cfg: AppConfig) -> SessionContext {
    SessionContext::open(Arc::new(connector.clone()), OpenTarget::new("report.xlsx"), cfg)
        .await
        .unwrap()
}

fn set(addr: &str, value: &str) -> serde_json::Value {
    json!({"sheet_name": "Sheet1", "cell_address": addr, "value": value})
}

#[tokio::test]
async fn burst_of_writes_yields_one_scan_with_last_state() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    let scans_after_open = session.metrics().scans;

    for (addr, v) in [("A1", "x"), ("A2", "y"), ("A3", "z")] {
        assert!(session.invoke("set_cell_value", set(addr, v)).await.is_success());
    }
    assert!(matches!(session.tick().await, TickOutcome::Scanned(_)));
    assert_eq!(session.tick().await, TickOutcome::Idle);
    assert_eq!(session.metrics().scans, scans_after_open + 1);

    let shape = session.shape();
    assert_eq!(shape.sheets[0].used_range.unwrap().to_string(), "A1:A3");
    assert!(session.render_context().shape_text.contains("Sheet1:A1:A3"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn longer_burst_still_scans_once_at_the_boundary() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    let before = session.metrics().scans;
    for row in 1..=7 {
        let addr = format!("B{row}");
        session.invoke("set_cell_value", set(&addr, "v")).await;
    }
    session.tick().await;
    assert_eq!(session.metrics().scans, before + 1);
    assert_eq!(session.shape().sheets[0].used_range.unwrap().to_string(), "B1:B7");
    session.close().await.unwrap();
}

#[tokio::test]
async fn breaker_trips_after_threshold_and_clears() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    let missing = json!({"sheet_name": "Nope"});

    for _ in 0..2 {
        let r = session.invoke("delete_sheet", missing.clone()).await;
        assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));
    }
    assert!(session.is_halted());

    let calls = connector.probe().calls();
    let r = session.invoke("delete_sheet", missing.clone()).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::CircuitOpen));
    assert_eq!(connector.probe().calls(), calls);
    assert!(session.render_context().progress_text.contains("HALTED"));

    // 其它类别不受影响
    assert!(session.invoke("get_sheet_names", json!({})).await.is_success());

    assert_eq!(session.clear_halt(), vec![ErrorKind::BackendPermanent]);
    let r = session.invoke("delete_sheet", missing).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));
    session.close().await.unwrap();
}

#[tokio::test]
async fn success_before_threshold_resets_counter() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    let r = session.invoke("create_sheet", json!({"sheet_name": "Sheet1"})).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));
    assert!(session.invoke("create_sheet", json!({"sheet_name": "Data"})).await.is_success());
    let r = session.invoke("create_sheet", json!({"sheet_name": "Data"})).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));
    assert!(!session.is_halted());
    session.close().await.unwrap();
}

#[tokio::test]
async fn validation_failure_makes_no_backend_calls() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    let calls = connector.probe().calls();
    for args in [
        json!({}),
        json!({"sheet_name": "Sheet1"}),
        json!({"sheet_name": "Sheet1", "cell_address": "ZZZZ1", "value": 1}),
        json!({"sheet_name": "Sheet1", "cell_address": "A1", "value": [1, 2]}),
    ] {
        let r = session.invoke("set_cell_value", args).await;
        assert_eq!(r.error_kind(), Some(ErrorKind::Validation));
    }
    assert_eq!(connector.probe().calls(), calls);
    session.close().await.unwrap();
}

#[tokio::test]
async fn validation_halt_does_not_block_valid_calls() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    session.invoke("set_cell_value", json!({})).await;
    session.invoke("set_cell_value", json!({})).await;
    let r = session.invoke("set_cell_value", json!({})).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::CircuitOpen));
    assert!(session.invoke("set_cell_value", set("C1", "ok")).await.is_success());
    session.close().await.unwrap();
}

#[tokio::test]
async fn render_context_is_stable_without_invocations() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    session.invoke("set_cell_value", set("A1", "x")).await;
    session.invoke("get_sheet_names", json!({})).await;
    let first = session.render_context();
    let second = session.render_context();
    assert_eq!(first, second);
    session.close().await.unwrap();
}

#[tokio::test]
async fn transient_busy_twice_then_success() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    connector.probe().script_writes([
        Some(BackendError::Busy("server busy".into())),
        Some(BackendError::Busy("server busy".into())),
    ]);
    let r = session.invoke("set_cell_value", set("A1", "x")).await;
    assert!(r.is_success(), "{r:?}");
    assert_eq!(session.metrics().retries, 2);
    session.close().await.unwrap();
}

#[tokio::test]
async fn transient_errors_beyond_ceiling_surface() {
    let connector = MemoryConnector::new();
    let mut cfg = config();
    cfg.bridge.max_retries = 2;
    let mut session = open(&connector, cfg).await;
    connector
        .probe()
        .script_writes((0..3).map(|_| Some(BackendError::Busy("busy".into()))));
    let r = session.invoke("set_cell_value", set("A1", "x")).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendTransient));
    assert!(r.message().unwrap().contains("set_cell_value"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn contract_violation_leaves_transient_counter_alone() {
    use cellsync::backend::Backend;
    use cellsync::tools::{default_registry, Tool};

    struct Legacy;
    impl Tool for Legacy {
        fn name(&self) -> &str {
            "legacy"
        }
        fn description(&self) -> &str {
            "returns an off-contract shape"
        }
        fn execute(&self, _b: &mut dyn Backend, _a: &serde_json::Value) -> Result<serde_json::Value, BackendError> {
            Ok(json!({"status": "done"}))
        }
    }

    let connector = MemoryConnector::new();
    let mut registry = default_registry();
    registry.register(Legacy);
    let mut session = SessionContext::open_with_registry(
        Arc::new(connector.clone()),
        OpenTarget::new("report.xlsx"),
        config(),
        registry,
    )
    .await
    .unwrap();

    connector
        .probe()
        .script_writes([Some(BackendError::Busy("busy".into()))]);
    assert!(session.invoke("set_cell_value", set("A1", "x")).await.is_success());

    let r = session.invoke("legacy", json!({})).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::ContractViolation));
    let metrics = session.metrics();
    assert_eq!(metrics.failures.get(&ErrorKind::ContractViolation), Some(&1));
    assert_eq!(metrics.failures.get(&ErrorKind::BackendTransient), None);

    let r = session.invoke("legacy", json!({})).await;
    assert_eq!(r.error_kind(), Some(ErrorKind::ContractViolation));
    assert!(session.is_halted());
    // 熔断的是 contract_violation，set_cell_value 照常执行
    assert!(session.invoke("set_cell_value", set("A2", "y")).await.is_success());
    session.close().await.unwrap();
}

#[tokio::test]
async fn partial_write_failure_is_reverted() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    session.invoke("set_cell_value", set("A1", "keep")).await;

    connector
        .probe()
        .script_writes([None, None, Some(BackendError::Invalid("cell locked".into()))]);
    let r = session
        .invoke(
            "set_cell_values",
            json!({"sheet_name": "Sheet1", "data": {"A1": "a", "A2": "b", "A3": "c"}}),
        )
        .await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));

    let book = connector.book("report.xlsx").unwrap();
    {
        let book = book.lock().unwrap();
        assert_eq!(book.value("Sheet1", "A1"), Some(CellValue::Text("keep".into())));
        assert_eq!(book.value("Sheet1", "A2"), Some(CellValue::Empty));
        assert_eq!(book.value("Sheet1", "A3"), Some(CellValue::Empty));
    }
    assert_eq!(session.metrics().reverts, 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn structural_write_rescans_on_next_tick() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    session
        .invoke("create_sheet", json!({"sheet_name": "Summary"}))
        .await;
    session
        .invoke("set_named_range", json!({"name": "Total", "refers_to": "=Summary!$B$2"}))
        .await;
    assert!(matches!(session.tick().await, TickOutcome::Scanned(_)));
    let text = session.render_context().shape_text;
    assert!(text.contains("Summary:empty"));
    assert!(text.contains("name:Total=Summary!B2"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn attach_to_running_document_by_identity() {
    let connector = MemoryConnector::new();
    connector.register(
        MemoryWorkbook::new(DocumentId::named("Budget.xlsx"))
            .with_value("Sheet1", "A1", CellValue::Text("Item".into())),
    );
    connector.fail_create(BackendError::Unsupported("no dedicated instance".into()));
    let mut session = SessionContext::open(
        Arc::new(connector.clone()),
        OpenTarget::new("budget.xlsx"),
        config(),
    )
    .await
    .unwrap();
    assert!(session.render_context().shape_text.contains("Sheet1:A1"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn open_fails_when_backend_unreachable() {
    let connector = MemoryConnector::new();
    let mut cfg = config();
    cfg.bridge.acquire_attempts = 1;
    connector.fail_create(BackendError::Disconnected("automation server down".into()));
    let err = SessionContext::open(
        Arc::new(connector.clone()),
        OpenTarget::new("missing.xlsx").with_mode(cellsync::backend::AcquireMode::Create),
        cfg,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, cellsync::SessionError::Connection(_)));
}

#[tokio::test]
async fn close_removes_spilled_snapshots_and_releases_connection() {
    let dir = tempfile::tempdir().unwrap();
    let spill = dir.path().join("snapshots");
    let dump = dir.path().join("state.json");
    let mut cfg = config();
    cfg.snapshot.spill_dir = Some(spill.clone());
    cfg.session.dump_path = Some(dump.clone());

    let connector = MemoryConnector::new();
    let mut session = open(&connector, cfg).await;
    session.invoke("set_cell_value", set("A1", "x")).await;
    session.close().await.unwrap();

    let leftovers = std::fs::read_dir(&spill).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
    assert!(dump.exists());
    let r = session.invoke("get_sheet_names", json!({})).await;
    assert!(!r.is_success());
}

#[tokio::test]
async fn background_ticker_scans_a_spread_out_burst_once() {
    let connector = MemoryConnector::new();
    // 默认 tick 周期与平静期，写入间隔短于一个 tick 周期
    let mut session = open(&connector, AppConfig::default()).await;
    let before = session.metrics().scans;
    for row in 1..=9 {
        let addr = format!("A{row}");
        assert!(session.invoke("set_cell_value", set(&addr, "v")).await.is_success());
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
    assert_eq!(session.metrics().scans, before + 1);
    assert_eq!(session.shape().sheets[0].used_range.unwrap().to_string(), "A1:A9");
    session.close().await.unwrap();
}

#[tokio::test]
async fn unrevertible_failure_is_visible_in_progress() {
    let connector = MemoryConnector::new();
    let mut session = open(&connector, config()).await;
    connector
        .probe()
        .script_writes([None, Some(BackendError::Invalid("cell locked".into()))]);
    let r = session
        .invoke(
            "set_cell_values",
            json!({"sheet_name": "Sheet1", "data": {"A1": "a", "Z1000": "b"}}),
        )
        .await;
    assert_eq!(r.error_kind(), Some(ErrorKind::BackendPermanent));
    assert!(r.message().unwrap().contains("not revertible"));
    let progress = session.render_context().progress_text;
    assert!(progress.contains("set_cell_values → error(backend_permanent), not reverted"));
    assert_eq!(session.metrics().snapshot_failures, 1);
    session.close().await.unwrap();
}
