//! 文档后端抽象
//!
//! Backend 是对电子表格自动化 API 的同步封装（COM / AppleScript / 文件 I/O 都是阻塞调用），
//! 只能在 ConnectionBridge 的工作线程中被调用；Connector 负责获取连接（新建专用实例或附着到已有实例）。

pub mod address;
pub mod memory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use address::{column_index, column_letters, CellRef, RangeRef, SheetRange};
pub use memory::{MemoryBackend, MemoryConnector, MemoryProbe, MemoryWorkbook};

use crate::core::BackendError;

/// 单元格值
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    /// 从 JSON 标量转换；数组 / 对象不是合法的单元格值
    pub fn from_json(v: &Value) -> Result<Self, String> {
        match v {
            Value::Null => Ok(CellValue::Empty),
            Value::Bool(b) => Ok(CellValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(CellValue::Number)
                .ok_or_else(|| format!("Unsupported number {n}")),
            Value::String(s) if s.is_empty() => Ok(CellValue::Empty),
            Value::String(s) => Ok(CellValue::Text(s.clone())),
            other => Err(format!("Unsupported cell value {other}")),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// 渲染表头等文本时使用的显示形式
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FontStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underline: Option<String>,
    /// ARGB，例如 FF3366CC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FillStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_color: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignmentStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrap_text: Option<bool>,
}

/// 单元格样式；只包含要修改的属性，apply 时按字段覆盖
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font: Option<FontStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<FillStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
}

fn overlay<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}

impl CellStyle {
    pub fn is_default(&self) -> bool {
        *self == CellStyle::default()
    }

    /// 把 patch 中出现的字段叠加到 self
    pub fn merge(&mut self, patch: &CellStyle) {
        if let Some(pf) = &patch.font {
            let f = self.font.get_or_insert_with(FontStyle::default);
            overlay(&mut f.name, &pf.name);
            overlay(&mut f.size, &pf.size);
            overlay(&mut f.bold, &pf.bold);
            overlay(&mut f.italic, &pf.italic);
            overlay(&mut f.underline, &pf.underline);
            overlay(&mut f.color, &pf.color);
        }
        if let Some(pf) = &patch.fill {
            let f = self.fill.get_or_insert_with(FillStyle::default);
            overlay(&mut f.fill_type, &pf.fill_type);
            overlay(&mut f.start_color, &pf.start_color);
            overlay(&mut f.end_color, &pf.end_color);
        }
        if let Some(pa) = &patch.alignment {
            let a = self.alignment.get_or_insert_with(AlignmentStyle::default);
            overlay(&mut a.horizontal, &pa.horizontal);
            overlay(&mut a.vertical, &pa.vertical);
            overlay(&mut a.wrap_text, &pa.wrap_text);
        }
        overlay(&mut self.number_format, &patch.number_format);
    }

    /// 样式中出现的所有颜色值
    pub fn colors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(c) = self.font.as_ref().and_then(|f| f.color.as_deref()) {
            out.push(c);
        }
        if let Some(fill) = &self.fill {
            out.extend(fill.start_color.as_deref());
            out.extend(fill.end_color.as_deref());
        }
        out
    }
}

/// 单元格的完整内容（值、公式、样式），快照与回滚以它为单位
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub cell: CellRef,
    #[serde(default)]
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "CellStyle::is_default")]
    pub style: CellStyle,
}

impl CellRecord {
    pub fn blank(cell: CellRef) -> Self {
        Self {
            cell,
            value: CellValue::Empty,
            formula: None,
            style: CellStyle::default(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.value.is_empty() && self.formula.is_none() && self.style.is_default()
    }
}

/// 文档的稳定标识：名称与（可选的）路径。
///
/// 自动化层会在每次调用时重建包装对象，所以判断「是不是同一个文档」只能比较标识，不能比较对象。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentId {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl DocumentId {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    /// 由路径或裸名称构造；名称取文件名部分
    pub fn from_target(target: &str) -> Self {
        let p = Path::new(target);
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| target.to_string());
        let path = (p.components().count() > 1).then(|| p.to_path_buf());
        Self { name, path }
    }

    /// 按键比较：两边都有路径时比较路径，否则名称忽略大小写比较
    pub fn matches(&self, other: &DocumentId) -> bool {
        match (&self.path, &other.path) {
            (Some(a), Some(b)) => a == b,
            _ => self.name.eq_ignore_ascii_case(&other.name),
        }
    }

    /// 注册表等场景使用的查找键
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}", p.display()),
            None => f.write_str(&self.name),
        }
    }
}

/// 连接获取方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// 优先新建专用实例，失败时附着到已有实例
    #[default]
    Auto,
    /// 只新建专用实例
    Create,
    /// 只附着到已运行的实例（需校验文档标识）
    Attach,
}

/// 打开会话的目标文档
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenTarget {
    pub document: DocumentId,
    pub mode: AcquireMode,
}

impl OpenTarget {
    pub fn new(document: &str) -> Self {
        Self {
            document: DocumentId::from_target(document),
            mode: AcquireMode::Auto,
        }
    }

    pub fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }
}

/// 电子表格后端：所有方法都是阻塞调用
pub trait Backend: Send {
    /// 当前连接所指文档的稳定标识
    fn document_id(&self) -> DocumentId;

    fn sheet_names(&mut self) -> Result<Vec<String>, BackendError>;

    /// 工作表已使用区域；空表返回 None
    fn used_range(&mut self, sheet: &str) -> Result<Option<RangeRef>, BackendError>;

    /// 读取区域内每个单元格（包括空单元格）
    fn read_cells(&mut self, sheet: &str, range: &RangeRef) -> Result<Vec<CellRecord>, BackendError>;

    /// 按记录原样写回（空记录表示清空该单元格），用于回滚
    fn write_cells(&mut self, sheet: &str, cells: &[CellRecord]) -> Result<(), BackendError>;

    fn set_value(&mut self, sheet: &str, cell: CellRef, value: &CellValue) -> Result<(), BackendError>;

    fn set_formula(&mut self, sheet: &str, cell: CellRef, formula: &str) -> Result<(), BackendError>;

    fn apply_style(&mut self, sheet: &str, range: &RangeRef, style: &CellStyle) -> Result<(), BackendError>;

    fn create_sheet(&mut self, name: &str, index: Option<usize>) -> Result<(), BackendError>;

    fn delete_sheet(&mut self, name: &str) -> Result<(), BackendError>;

    /// 名称 -> 引用地址
    fn named_ranges(&mut self) -> Result<BTreeMap<String, String>, BackendError>;

    fn set_named_range(&mut self, name: &str, refers_to: &str) -> Result<(), BackendError>;

    fn remove_named_range(&mut self, name: &str) -> Result<(), BackendError>;

    /// 释放连接；之后的调用应返回 Disconnected
    fn close(&mut self) -> Result<(), BackendError>;
}

/// 连接器：新建专用实例或附着到已运行实例
pub trait Connector: Send + Sync {
    /// 新建专用后端实例并打开目标文档（不会混入用户的其它文档）
    fn create(&self, target: &OpenTarget) -> Result<Box<dyn Backend>, BackendError>;

    /// 附着到已运行实例中的目标文档
    fn attach(&self, target: &OpenTarget) -> Result<Box<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_value_from_json() {
        assert_eq!(CellValue::from_json(&json!("x")).unwrap(), CellValue::Text("x".into()));
        assert_eq!(CellValue::from_json(&json!("")).unwrap(), CellValue::Empty);
        assert_eq!(CellValue::from_json(&json!(3)).unwrap(), CellValue::Number(3.0));
        assert!(CellValue::from_json(&json!([1, 2])).is_err());
        assert_eq!(CellValue::Number(42.0).display(), "42");
    }

    #[test]
    fn test_style_merge_keeps_untouched_fields() {
        let mut base: CellStyle =
            serde_json::from_value(json!({"font": {"bold": true, "color": "FF000000"}})).unwrap();
        let patch: CellStyle =
            serde_json::from_value(json!({"font": {"color": "FFFF0000"}, "number_format": "0.00"}))
                .unwrap();
        base.merge(&patch);
        let font = base.font.as_ref().unwrap();
        assert_eq!(font.bold, Some(true));
        assert_eq!(font.color.as_deref(), Some("FFFF0000"));
        assert_eq!(base.number_format.as_deref(), Some("0.00"));
    }

    #[test]
    fn test_style_rejects_unknown_fields() {
        let r: Result<CellStyle, _> = serde_json::from_value(json!({"colour": "red"}));
        assert!(r.is_err());
    }

    #[test]
    fn test_document_id_matches_by_key() {
        let a = DocumentId::from_target("Budget.xlsx");
        let b = DocumentId::named("budget.XLSX");
        assert!(a.matches(&b));
        let p1 = DocumentId::from_target("/tmp/a/Budget.xlsx");
        let p2 = DocumentId::from_target("/tmp/b/Budget.xlsx");
        assert!(!p1.matches(&p2));
        assert!(p1.matches(&a));
    }
}
