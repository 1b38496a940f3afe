//! 结构同步器：记录写入提示，按防抖策略合并一段突发写入为一次扫描
//!
//! - hint：非阻塞，只更新待扫描计数
//! - tick：无待扫描时什么都不做；距最后一次提示已过 settle_ms，或（写入数达到 writes_per_scan /
//!   有结构性写入）且已静默一个 tick 周期时，做一次完整扫描，整体替换 Shape 并递增版本
//! - 扫描前先获取连接桥的单写者闸门，不会与进行中的写操作交错

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::bridge::ConnectionBridge;
use crate::config::ShapeSection;
use crate::core::BackendError;
use crate::shape::{render_shape, scan_blocking, Shape, WriteKind};

#[derive(Debug, Default)]
struct Pending {
    writes: u32,
    structural: bool,
    last_hint: Option<Instant>,
}

impl Pending {
    fn is_pending(&self) -> bool {
        self.writes > 0 || self.structural
    }
}

/// tick / flush 的结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TickOutcome {
    /// 没有待扫描的提示
    Idle,
    /// 有提示但防抖窗口未结束
    Deferred,
    /// 完成扫描，新版本号
    Scanned(u64),
    /// 扫描失败，提示保留到下次
    Failed(String),
}

pub struct ShapeSynchronizer {
    bridge: Arc<ConnectionBridge>,
    cfg: ShapeSection,
    current: RwLock<Arc<Shape>>,
    pending: Mutex<Pending>,
    scans: AtomicU64,
}

impl ShapeSynchronizer {
    pub fn new(bridge: Arc<ConnectionBridge>, cfg: ShapeSection) -> Self {
        Self {
            bridge,
            cfg,
            current: RwLock::new(Arc::new(Shape::default())),
            pending: Mutex::new(Pending::default()),
            scans: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前 Shape（只读共享）
    pub fn current(&self) -> Arc<Shape> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// 渲染当前 Shape；纯读取
    pub fn render(&self) -> String {
        let shape = self.current();
        render_shape(Some(shape.as_ref()), &self.cfg)
    }

    pub fn is_pending(&self) -> bool {
        self.pending().is_pending()
    }

    /// 已完成的扫描次数
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// 记录一次写入；不触发扫描
    pub fn hint(&self, kind: WriteKind) {
        let mut p = self.pending();
        match kind {
            WriteKind::Value => p.writes = p.writes.saturating_add(1),
            WriteKind::Structural => p.structural = true,
        }
        p.last_hint = Some(Instant::now());
        tracing::debug!(?kind, writes = p.writes, structural = p.structural, "shape refresh hinted");
    }

    fn is_due(&self, p: &Pending) -> bool {
        if !p.is_pending() {
            return false;
        }
        let idle = p.last_hint.map_or(Duration::MAX, |t| t.elapsed());
        if idle >= Duration::from_millis(self.cfg.settle_ms) {
            return true;
        }
        // 计数 / 结构触发也要求至少静默一个 tick 周期，进行中的突发不会被切成多次扫描
        let quiet = idle >= Duration::from_millis(self.cfg.tick_interval_ms);
        quiet && (p.structural || p.writes >= self.cfg.writes_per_scan.max(1))
    }

    /// 按防抖策略决定是否扫描
    pub async fn tick(&self) -> TickOutcome {
        {
            let p = self.pending();
            if !p.is_pending() {
                return TickOutcome::Idle;
            }
            if !self.is_due(&p) {
                return TickOutcome::Deferred;
            }
        }
        self.scan_pending().await
    }

    /// 忽略防抖窗口，有待扫描提示就立即扫描
    pub async fn flush(&self) -> TickOutcome {
        if !self.is_pending() {
            return TickOutcome::Idle;
        }
        self.scan_pending().await
    }

    async fn scan_pending(&self) -> TickOutcome {
        let _gate = self.bridge.lock_document().await;
        // 等闸门期间可能已被另一路 tick 扫描过
        let taken = std::mem::take(&mut *self.pending());
        if !taken.is_pending() {
            return TickOutcome::Idle;
        }
        match self.scan_locked().await {
            Ok(shape) => TickOutcome::Scanned(shape.version),
            Err(e) => {
                let mut p = self.pending();
                p.writes = p.writes.saturating_add(taken.writes);
                p.structural |= taken.structural;
                p.last_hint = p.last_hint.or(taken.last_hint);
                tracing::warn!(error = %e, "shape scan failed, hint kept");
                TickOutcome::Failed(e.to_string())
            }
        }
    }

    /// 无条件扫描一次（会话打开时建立初始 Shape）
    pub async fn rescan(&self) -> Result<Arc<Shape>, BackendError> {
        let _gate = self.bridge.lock_document().await;
        *self.pending() = Pending::default();
        self.scan_locked().await
    }

    /// 调用方须已持有单写者闸门
    async fn scan_locked(&self) -> Result<Arc<Shape>, BackendError> {
        let cfg = self.cfg.clone();
        let started = Instant::now();
        let mut shape = self
            .bridge
            .with_connection(move |b| scan_blocking(b, &cfg))
            .await?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        shape.version = current.version + 1;
        let shape = Arc::new(shape);
        *current = Arc::clone(&shape);
        drop(current);
        self.scans.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            version = shape.version,
            sheets = shape.sheets.len(),
            names = shape.names.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "workbook shape rescanned"
        );
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CellRef, CellValue, MemoryConnector, OpenTarget};
    use crate::config::BridgeSection;

    async fn setup(cfg: ShapeSection) -> (ShapeSynchronizer, Arc<ConnectionBridge>, MemoryConnector) {
        let connector = MemoryConnector::new();
        let bridge = Arc::new(
            ConnectionBridge::open(
                Arc::new(connector.clone()),
                OpenTarget::new("shape.xlsx"),
                BridgeSection::default(),
            )
            .await
            .unwrap(),
        );
        (ShapeSynchronizer::new(Arc::clone(&bridge), cfg), bridge, connector)
    }

    fn quiet() -> ShapeSection {
        ShapeSection {
            settle_ms: 60_000,
            tick_interval_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tick_without_hint_is_noop() {
        let (sync, _bridge, connector) = setup(quiet()).await;
        let before = connector.probe().calls();
        assert_eq!(sync.tick().await, TickOutcome::Idle);
        assert_eq!(connector.probe().calls(), before);
        assert_eq!(sync.scans(), 0);
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_scan() {
        let (sync, bridge, _connector) = setup(quiet()).await;
        for (row, v) in [(1, "x"), (2, "y")] {
            bridge
                .with_connection(move |b| b.set_value("Sheet1", CellRef::new(row, 1), &CellValue::Text(v.into())))
                .await
                .unwrap();
            sync.hint(WriteKind::Value);
            assert_eq!(sync.tick().await, TickOutcome::Deferred);
        }
        bridge
            .with_connection(|b| b.set_value("Sheet1", CellRef::new(3, 1), &CellValue::Text("z".into())))
            .await
            .unwrap();
        sync.hint(WriteKind::Value);
        assert_eq!(sync.tick().await, TickOutcome::Scanned(1));
        assert_eq!(sync.tick().await, TickOutcome::Idle);
        assert_eq!(sync.scans(), 1);
        let shape = sync.current();
        assert_eq!(shape.sheets[0].used_range.unwrap().to_string(), "A1:A3");
    }

    #[tokio::test]
    async fn test_count_trigger_waits_for_quiet_tick_period() {
        let cfg = ShapeSection {
            settle_ms: 60_000,
            tick_interval_ms: 50,
            ..Default::default()
        };
        let (sync, _bridge, _connector) = setup(cfg).await;
        for _ in 0..4 {
            sync.hint(WriteKind::Value);
        }
        // 写入数已够，但突发仍在进行
        assert_eq!(sync.tick().await, TickOutcome::Deferred);
        sync.hint(WriteKind::Structural);
        assert_eq!(sync.tick().await, TickOutcome::Deferred);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sync.tick().await, TickOutcome::Scanned(1));
        assert_eq!(sync.scans(), 1);
    }

    #[tokio::test]
    async fn test_scan_waits_for_in_flight_write() {
        let (sync, bridge, connector) = setup(quiet()).await;
        let sync = Arc::new(sync);
        let probe = connector.probe();

        // 模拟进行中的写操作：持有单写者闸门
        let gate = bridge.lock_document().await;
        sync.hint(WriteKind::Structural);
        let ticker = tokio::spawn({
            let sync = Arc::clone(&sync);
            async move { sync.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!ticker.is_finished());

        probe.set_latency(Duration::from_millis(100));
        let c3 = CellRef::parse("C3").unwrap();
        bridge
            .with_connection(move |b| b.set_value("Sheet1", c3, &CellValue::Number(7.0)))
            .await
            .unwrap();
        probe.set_latency(Duration::ZERO);
        assert_eq!(sync.scans(), 0);
        assert!(!ticker.is_finished());
        drop(gate);

        assert_eq!(ticker.await.unwrap(), TickOutcome::Scanned(1));
        let shape = sync.current();
        assert_eq!(shape.sheets[0].used_range.unwrap().to_string(), "C3");
    }

    #[tokio::test]
    async fn test_structural_hint_scans_immediately() {
        let (sync, _bridge, _connector) = setup(quiet()).await;
        sync.hint(WriteKind::Structural);
        assert_eq!(sync.tick().await, TickOutcome::Scanned(1));
    }

    #[tokio::test]
    async fn test_settle_time_elapses() {
        let cfg = ShapeSection {
            settle_ms: 20,
            tick_interval_ms: 0,
            ..Default::default()
        };
        let (sync, _bridge, _connector) = setup(cfg).await;
        sync.hint(WriteKind::Value);
        assert_eq!(sync.tick().await, TickOutcome::Deferred);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sync.tick().await, TickOutcome::Scanned(1));
    }

    #[tokio::test]
    async fn test_flush_ignores_debounce_and_version_increases() {
        let (sync, _bridge, _connector) = setup(quiet()).await;
        sync.rescan().await.unwrap();
        sync.hint(WriteKind::Value);
        assert_eq!(sync.flush().await, TickOutcome::Scanned(2));
        assert_eq!(sync.current().version, 2);
        assert!(sync.render().starts_with("<workbook_shape v=2>"));
    }

    #[tokio::test]
    async fn test_failed_scan_keeps_hint() {
        let (sync, _bridge, connector) = setup(quiet()).await;
        connector
            .probe()
            .script_reads([Some(BackendError::NotFound("gone".into()))]);
        sync.hint(WriteKind::Structural);
        assert!(matches!(sync.tick().await, TickOutcome::Failed(_)));
        assert!(sync.is_pending());
        assert_eq!(sync.tick().await, TickOutcome::Scanned(1));
    }
}
