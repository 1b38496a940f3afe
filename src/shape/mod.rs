//! 工作簿结构摘要（Shape）：模型、扫描、渲染与防抖同步
//!
//! Shape 是不可变值，只由 ShapeSynchronizer 整体替换；读取方拿到 `Arc<Shape>` 即可自由共享。

pub mod render;
pub mod scan;
pub mod sync;

use serde::Serialize;

use crate::backend::RangeRef;

pub use render::{compact_headers, render_shape};
pub use scan::scan_blocking;
pub use sync::{ShapeSynchronizer, TickOutcome};

/// 写操作分类：决定是否需要快照、以及结构扫描的紧迫程度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// 单元格 / 区域的值、公式、格式
    Value,
    /// 工作表、表格、命名区域等结构变化
    Structural,
}

/// 单张工作表的描述
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SheetDescriptor {
    pub name: String,
    /// 已用区域；空表为 None
    pub used_range: Option<RangeRef>,
    /// 表头行（已用区域第一行）的显示值，空单元格为空串
    pub headers: Vec<String>,
    /// 表头下方是否还有数据行
    pub has_sample_row: bool,
}

impl SheetDescriptor {
    pub fn rows(&self) -> u32 {
        self.used_range.map_or(0, |r| r.rows())
    }

    pub fn cols(&self) -> u32 {
        self.used_range.map_or(0, |r| r.cols())
    }
}

/// 命名区域
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NamedRegion {
    pub name: String,
    pub refers_to: String,
}

/// 文档结构摘要；version 单调递增，0 表示尚未扫描
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Shape {
    pub version: u64,
    pub sheets: Vec<SheetDescriptor>,
    pub names: Vec<NamedRegion>,
}

impl Shape {
    pub fn sheet(&self, name: &str) -> Option<&SheetDescriptor> {
        self.sheets.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }
}
