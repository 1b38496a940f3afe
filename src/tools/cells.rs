//! 单元格读写工具：set_cell_value / set_cell_values / set_cell_formula / get_cell_value / get_range_values

use serde_json::{json, Map, Value};

use crate::backend::{Backend, CellRef, CellValue, RangeRef, SheetRange};
use crate::core::BackendError;
use crate::shape::WriteKind;
use crate::snapshot::SnapshotScope;
use crate::tools::registry::{ok, range_arg, sheet_range, str_arg};
use crate::tools::Tool;

/// get_range_values 一次最多读取的单元格数
const MAX_READ_CELLS: u64 = 10_000;

fn cell_arg(args: &Value, key: &str) -> Result<CellRef, BackendError> {
    CellRef::parse(str_arg(args, key).map_err(BackendError::Invalid)?).map_err(BackendError::Invalid)
}

fn value_arg(args: &Value) -> Result<CellValue, String> {
    let v = args.get("value").ok_or("'value' is required")?;
    CellValue::from_json(v)
}

fn cell_map(args: &Value) -> Result<Vec<(CellRef, CellValue)>, String> {
    let data = args
        .get("data")
        .and_then(Value::as_object)
        .ok_or("'data' must be an object of address -> value")?;
    data.iter()
        .map(|(addr, v)| -> Result<(CellRef, CellValue), String> {
            Ok((CellRef::parse(addr)?, CellValue::from_json(v)?))
        })
        .collect()
}

/// 写入单个单元格
pub struct SetCellValueTool;

impl Tool for SetCellValueTool {
    fn name(&self) -> &str {
        "set_cell_value"
    }

    fn description(&self) -> &str {
        "Write one value into a cell. Args: {\"sheet_name\": \"Sheet1\", \"cell_address\": \"A1\", \"value\": 42}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sheet_name": {"type": "string"},
                "cell_address": {"type": "string", "description": "A1-style address"},
                "value": {"description": "String, number, boolean or null"}
            },
            "required": ["sheet_name", "cell_address", "value"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "cell_address"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Value)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        sheet_range(args, "cell_address")
            .map(SnapshotScope::Cells)
            .into_iter()
            .collect()
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        CellRef::parse(str_arg(args, "cell_address")?)?;
        value_arg(args).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let cell = cell_arg(args, "cell_address")?;
        let value = value_arg(args).map_err(BackendError::Invalid)?;
        backend.set_value(sheet, cell, &value)?;
        ok(json!({ "cell": cell.to_string() }))
    }
}

/// 批量写入：data 为 地址 -> 值
pub struct SetCellValuesTool;

impl Tool for SetCellValuesTool {
    fn name(&self) -> &str {
        "set_cell_values"
    }

    fn description(&self) -> &str {
        "Write many cells at once. Args: {\"sheet_name\": \"Sheet1\", \"data\": {\"A1\": \"x\", \"B2\": 3}}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sheet_name": {"type": "string"},
                "data": {"type": "object", "additionalProperties": true}
            },
            "required": ["sheet_name", "data"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "data"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Value)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        let Some(sheet) = args.get("sheet_name").and_then(Value::as_str) else {
            return Vec::new();
        };
        let bounds = cell_map(args).ok().and_then(|cells| {
            cells
                .iter()
                .map(|(c, _)| RangeRef::single(*c))
                .reduce(|a, r| a.union(&r))
        });
        bounds
            .map(|r| SnapshotScope::Cells(SheetRange::new(sheet, r)))
            .into_iter()
            .collect()
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        cell_map(args).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let cells = cell_map(args).map_err(BackendError::Invalid)?;
        for (cell, value) in &cells {
            backend.set_value(sheet, *cell, value)?;
        }
        ok(json!({ "written": cells.len() }))
    }
}

/// 写入公式（缺少前导 '=' 时补上）
pub struct SetCellFormulaTool;

impl Tool for SetCellFormulaTool {
    fn name(&self) -> &str {
        "set_cell_formula"
    }

    fn description(&self) -> &str {
        "Write a formula into a cell. Args: {\"sheet_name\": \"Sheet1\", \"cell_address\": \"C1\", \"formula\": \"=A1+B1\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sheet_name": {"type": "string"},
                "cell_address": {"type": "string"},
                "formula": {"type": "string"}
            },
            "required": ["sheet_name", "cell_address", "formula"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "cell_address", "formula"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Value)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        sheet_range(args, "cell_address")
            .map(SnapshotScope::Cells)
            .into_iter()
            .collect()
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        CellRef::parse(str_arg(args, "cell_address")?).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let cell = cell_arg(args, "cell_address")?;
        let raw = str_arg(args, "formula").map_err(BackendError::Invalid)?.trim();
        let formula = if raw.starts_with('=') {
            raw.to_string()
        } else {
            format!("={raw}")
        };
        backend.set_formula(sheet, cell, &formula)?;
        ok(json!({ "cell": cell.to_string(), "formula": formula }))
    }
}

pub struct GetCellValueTool;

impl Tool for GetCellValueTool {
    fn name(&self) -> &str {
        "get_cell_value"
    }

    fn description(&self) -> &str {
        "Read one cell. Args: {\"sheet_name\": \"Sheet1\", \"cell_address\": \"A1\"}"
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "cell_address"]
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        CellRef::parse(str_arg(args, "cell_address")?).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let cell = cell_arg(args, "cell_address")?;
        let record = backend
            .read_cells(sheet, &RangeRef::single(cell))?
            .into_iter()
            .next();
        let mut data = Map::new();
        data.insert("cell".into(), json!(cell.to_string()));
        data.insert(
            "value".into(),
            record.as_ref().map_or(Value::Null, |r| r.value.to_json()),
        );
        if let Some(f) = record.and_then(|r| r.formula) {
            data.insert("formula".into(), json!(f));
        }
        ok(Value::Object(data))
    }
}

/// 读取区域，返回按行排列的二维数组
pub struct GetRangeValuesTool;

impl Tool for GetRangeValuesTool {
    fn name(&self) -> &str {
        "get_range_values"
    }

    fn description(&self) -> &str {
        "Read a rectangular range as rows. Args: {\"sheet_name\": \"Sheet1\", \"range_address\": \"A1:C10\"}"
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "range_address"]
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        let range = RangeRef::parse(str_arg(args, "range_address")?)?;
        if range.cell_count() > MAX_READ_CELLS {
            return Err(format!(
                "range {range} has {} cells, read at most {MAX_READ_CELLS} at a time",
                range.cell_count()
            ));
        }
        Ok(())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let range = range_arg(args, "range_address")?;
        let records = backend.read_cells(sheet, &range)?;
        let width = range.cols() as usize;
        let rows: Vec<Value> = records
            .chunks(width.max(1))
            .map(|row| Value::Array(row.iter().map(|r| r.value.to_json()).collect()))
            .collect();
        ok(json!({ "range": range.to_string(), "values": rows }))
    }
}
