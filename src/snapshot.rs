//! 快照管理：在有风险的写操作之前捕获受影响区域，失败时回滚，成功时丢弃
//!
//! 记录按操作 ID 归属，由 SnapshotManager 独占持有；调用方只拿到回执。
//! 配置了 spill_dir 时快照内容写入临时文件，丢弃 / 回滚 / 关闭（包括 Drop）时删除。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CellRecord, RangeRef, SheetRange};
use crate::bridge::ConnectionBridge;
use crate::config::SnapshotSection;
use crate::core::{BackendError, OperationId, SnapshotError};

/// 需要捕获的区域
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotScope {
    /// 某张表上的矩形区域
    Cells(SheetRange),
    /// 整张表：是否存在、位置、已用区域内容
    Sheet(String),
    /// 命名区域的定义
    Name(String),
}

impl SnapshotScope {
    pub fn describe(&self) -> String {
        match self {
            SnapshotScope::Cells(r) => r.to_string(),
            SnapshotScope::Sheet(s) => format!("sheet:{s}"),
            SnapshotScope::Name(n) => format!("name:{n}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
enum RegionCapture {
    Cells {
        sheet: String,
        cells: Vec<CellRecord>,
    },
    Sheet {
        name: String,
        index: Option<usize>,
        cells: Vec<CellRecord>,
    },
    Name {
        name: String,
        refers_to: Option<String>,
    },
}

enum CaptureOutcome {
    Captured(Vec<RegionCapture>),
    TooLarge { cells: u64, limit: u64 },
}

enum Payload {
    Inline(Vec<RegionCapture>),
    Spilled(PathBuf),
}

/// 快照记录（仅由管理器持有）
struct SnapshotRecord {
    addresses: Vec<String>,
    created_at_ms: i64,
    payload: Payload,
}

/// capture 成功后交给调用方的回执
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotReceipt {
    pub operation: OperationId,
    pub addresses: Vec<String>,
    pub cells: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 快照管理器
pub struct SnapshotManager {
    bridge: Arc<ConnectionBridge>,
    cfg: SnapshotSection,
    records: Mutex<HashMap<OperationId, SnapshotRecord>>,
}

impl SnapshotManager {
    pub fn new(bridge: Arc<ConnectionBridge>, cfg: SnapshotSection) -> Self {
        Self {
            bridge,
            cfg,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// 当前持有的快照数
    pub fn live_records(&self) -> usize {
        lock(&self.records).len()
    }

    /// 捕获 scopes 覆盖的区域，归属到 operation
    pub async fn capture(
        &self,
        operation: OperationId,
        scopes: Vec<SnapshotScope>,
    ) -> Result<SnapshotReceipt, SnapshotError> {
        let limit = self.cfg.max_cells;
        for scope in &scopes {
            if let SnapshotScope::Cells(r) = scope {
                if r.range.cell_count() > limit {
                    return Err(SnapshotError::TooLarge {
                        cells: r.range.cell_count(),
                        limit,
                    });
                }
            }
        }
        let addresses: Vec<String> = scopes.iter().map(SnapshotScope::describe).collect();
        let outcome = self
            .bridge
            .with_connection(move |b| capture_blocking(b, &scopes, limit))
            .await?;
        let captures = match outcome {
            CaptureOutcome::Captured(c) => c,
            CaptureOutcome::TooLarge { cells, limit } => {
                return Err(SnapshotError::TooLarge { cells, limit })
            }
        };
        let cells = captures
            .iter()
            .map(|c| match c {
                RegionCapture::Cells { cells, .. } | RegionCapture::Sheet { cells, .. } => cells.len(),
                RegionCapture::Name { .. } => 0,
            })
            .sum();

        let payload = match &self.cfg.spill_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(format!("cellsync-snapshot-{operation}.json"));
                tokio::fs::write(&path, serde_json::to_vec(&captures)?).await?;
                Payload::Spilled(path)
            }
            None => Payload::Inline(captures),
        };
        tracing::debug!(%operation, cells, addresses = ?addresses, "snapshot captured");
        lock(&self.records).insert(
            operation.clone(),
            SnapshotRecord {
                addresses: addresses.clone(),
                created_at_ms: chrono::Utc::now().timestamp_millis(),
                payload,
            },
        );
        Ok(SnapshotReceipt {
            operation,
            addresses,
            cells,
        })
    }

    /// 把 operation 的快照写回文档，然后释放记录
    pub async fn revert(&self, operation: &OperationId) -> Result<(), SnapshotError> {
        let record = lock(&self.records)
            .remove(operation)
            .ok_or_else(|| SnapshotError::UnknownRecord(operation.to_string()))?;
        let captures = match &record.payload {
            Payload::Inline(c) => Ok(c.clone()),
            Payload::Spilled(path) => match tokio::fs::read(path).await {
                Ok(bytes) => serde_json::from_slice::<Vec<RegionCapture>>(&bytes).map_err(SnapshotError::from),
                Err(e) => Err(SnapshotError::from(e)),
            },
        };
        release_payload(&record.payload).await;
        let captures = captures?;
        let age_ms = chrono::Utc::now().timestamp_millis() - record.created_at_ms;
        self.bridge
            .with_connection(move |b| restore_blocking(b, &captures))
            .await?;
        tracing::info!(%operation, addresses = ?record.addresses, age_ms, "snapshot reverted");
        Ok(())
    }

    /// 丢弃 operation 的快照（操作成功或不再需要回滚）；不存在时为 no-op
    pub async fn discard(&self, operation: &OperationId) {
        let record = lock(&self.records).remove(operation);
        if let Some(record) = record {
            release_payload(&record.payload).await;
            tracing::debug!(%operation, "snapshot discarded");
        }
    }

    /// 丢弃全部快照（会话关闭时调用）
    pub async fn discard_all(&self) -> usize {
        let drained: Vec<SnapshotRecord> = lock(&self.records).drain().map(|(_, r)| r).collect();
        for record in &drained {
            release_payload(&record.payload).await;
        }
        drained.len()
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        // 未经 close 的退出路径：同步删除残留的临时文件
        for record in lock(&self.records).values() {
            if let Payload::Spilled(path) = &record.payload {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

async fn release_payload(payload: &Payload) {
    if let Payload::Spilled(path) = payload {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove snapshot file");
        }
    }
}

fn capture_blocking(
    b: &mut dyn Backend,
    scopes: &[SnapshotScope],
    limit: u64,
) -> Result<CaptureOutcome, BackendError> {
    let mut out = Vec::with_capacity(scopes.len());
    for scope in scopes {
        match scope {
            SnapshotScope::Cells(r) => out.push(RegionCapture::Cells {
                sheet: r.sheet.clone(),
                cells: b.read_cells(&r.sheet, &r.range)?,
            }),
            SnapshotScope::Sheet(name) => {
                let names = b.sheet_names()?;
                let index = names.iter().position(|n| n.eq_ignore_ascii_case(name));
                let cells = match index {
                    Some(_) => match b.used_range(name)? {
                        Some(used) if used.cell_count() > limit => {
                            return Ok(CaptureOutcome::TooLarge {
                                cells: used.cell_count(),
                                limit,
                            })
                        }
                        Some(used) => b.read_cells(name, &used)?,
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                out.push(RegionCapture::Sheet {
                    name: name.clone(),
                    index,
                    cells,
                });
            }
            SnapshotScope::Name(name) => {
                let names = b.named_ranges()?;
                out.push(RegionCapture::Name {
                    name: name.clone(),
                    refers_to: names.get(name).cloned(),
                });
            }
        }
    }
    Ok(CaptureOutcome::Captured(out))
}

fn restore_blocking(b: &mut dyn Backend, captures: &[RegionCapture]) -> Result<(), BackendError> {
    for capture in captures {
        match capture {
            RegionCapture::Cells { sheet, cells } => b.write_cells(sheet, cells)?,
            RegionCapture::Sheet { name, index, cells } => {
                let exists = b.sheet_names()?.iter().any(|n| n.eq_ignore_ascii_case(name));
                match (index, exists) {
                    (None, true) => b.delete_sheet(name)?,
                    (None, false) => {}
                    (Some(idx), exists) => {
                        if !exists {
                            b.create_sheet(name, Some(*idx))?;
                        }
                        restore_sheet_cells(b, name, cells)?;
                    }
                }
            }
            RegionCapture::Name { name, refers_to } => match refers_to {
                Some(r) => b.set_named_range(name, r)?,
                None => b.remove_named_range(name)?,
            },
        }
    }
    Ok(())
}

/// 清掉捕获之后新写入的单元格，再写回捕获内容
fn restore_sheet_cells(b: &mut dyn Backend, sheet: &str, cells: &[CellRecord]) -> Result<(), BackendError> {
    let mut records: Vec<CellRecord> = Vec::new();
    if let Some(current) = b.used_range(sheet)? {
        let captured: Option<RangeRef> = cells
            .iter()
            .map(|c| RangeRef::single(c.cell))
            .reduce(|a, r| a.union(&r));
        records.extend(
            current
                .cells()
                .filter(|c| captured.map_or(true, |r| !r.contains(*c)))
                .map(CellRecord::blank),
        );
    }
    records.extend(cells.iter().cloned());
    b.write_cells(sheet, &records)
}
