//! 结构扫描：枚举工作表、已用区域、表头行与命名区域

use crate::backend::{Backend, CellRef, RangeRef};
use crate::config::ShapeSection;
use crate::core::BackendError;
use crate::shape::{NamedRegion, Shape, SheetDescriptor};

/// 在阻塞线程中做一次完整扫描；返回的 Shape 版本为 0，由同步器赋值
pub fn scan_blocking(b: &mut dyn Backend, cfg: &ShapeSection) -> Result<Shape, BackendError> {
    let mut sheets = Vec::new();
    for name in b.sheet_names()? {
        let used_range = b.used_range(&name)?;
        let mut desc = SheetDescriptor {
            name,
            used_range,
            ..Default::default()
        };
        if let Some(used) = used_range {
            let last_col = used
                .end
                .col
                .min(used.start.col.saturating_add(cfg.max_scan_columns.max(1) - 1));
            let header_row = RangeRef::new(used.start, CellRef::new(used.start.row, last_col));
            desc.headers = b
                .read_cells(&desc.name, &header_row)?
                .iter()
                .map(|c| c.value.display())
                .collect();
            desc.has_sample_row = used.rows() > 1;
        }
        sheets.push(desc);
    }
    let names = b
        .named_ranges()?
        .into_iter()
        .map(|(name, refers_to)| NamedRegion { name, refers_to })
        .collect();
    Ok(Shape {
        version: 0,
        sheets,
        names,
    })
}
