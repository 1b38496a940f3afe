//! 工作表与命名区域工具：get_sheet_names / create_sheet / delete_sheet / set_named_range

use serde_json::{json, Value};

use crate::backend::{Backend, SheetRange};
use crate::core::BackendError;
use crate::shape::WriteKind;
use crate::snapshot::SnapshotScope;
use crate::tools::registry::{ok, str_arg};
use crate::tools::Tool;

/// 工作表名不能包含的字符
const FORBIDDEN_SHEET_CHARS: &[char] = &[':', '\\', '/', '?', '*', '[', ']'];

fn sheet_name_arg(args: &Value) -> Result<&str, String> {
    let name = str_arg(args, "sheet_name")?.trim();
    if name.chars().count() > 31 {
        return Err(format!("sheet name '{name}' is longer than 31 characters"));
    }
    if name.contains(FORBIDDEN_SHEET_CHARS) {
        return Err(format!("sheet name '{name}' contains a forbidden character"));
    }
    Ok(name)
}

fn sheet_scope(args: &Value) -> Vec<SnapshotScope> {
    args.get("sheet_name")
        .and_then(Value::as_str)
        .map(|s| SnapshotScope::Sheet(s.trim().to_string()))
        .into_iter()
        .collect()
}

pub struct GetSheetNamesTool;

impl Tool for GetSheetNamesTool {
    fn name(&self) -> &str {
        "get_sheet_names"
    }

    fn description(&self) -> &str {
        "List worksheet names in workbook order. Args: {}"
    }

    fn execute(&self, backend: &mut dyn Backend, _args: &Value) -> Result<Value, BackendError> {
        ok(json!(backend.sheet_names()?))
    }
}

pub struct CreateSheetTool;

impl Tool for CreateSheetTool {
    fn name(&self) -> &str {
        "create_sheet"
    }

    fn description(&self) -> &str {
        "Add a worksheet, optionally at a 0-based position. Args: {\"sheet_name\": \"Summary\", \"index\": 0}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sheet_name": {"type": "string"},
                "index": {"type": "integer", "minimum": 0}
            },
            "required": ["sheet_name"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Structural)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        sheet_scope(args)
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        sheet_name_arg(args)?;
        match args.get("index") {
            None | Some(Value::Null) => Ok(()),
            Some(v) if v.as_u64().is_some() => Ok(()),
            Some(v) => Err(format!("'index' must be a non-negative integer, got {v}")),
        }
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let name = sheet_name_arg(args).map_err(BackendError::Invalid)?;
        let index = args.get("index").and_then(Value::as_u64).map(|i| i as usize);
        backend.create_sheet(name, index)?;
        ok(json!({ "sheet": name }))
    }
}

pub struct DeleteSheetTool;

impl Tool for DeleteSheetTool {
    fn name(&self) -> &str {
        "delete_sheet"
    }

    fn description(&self) -> &str {
        "Delete a worksheet and its contents. Args: {\"sheet_name\": \"Scratch\"}"
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Structural)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        sheet_scope(args)
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let name = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?.trim();
        backend.delete_sheet(name)?;
        ok(json!({ "deleted": name }))
    }
}

/// 定义（或覆盖）命名区域；refers_to 形如 `Sheet1!$A$1:$B$5`，前导 '=' 可有可无
pub struct SetNamedRangeTool;

impl SetNamedRangeTool {
    fn target(args: &Value) -> Result<SheetRange, String> {
        let raw = str_arg(args, "refers_to")?;
        SheetRange::parse(&raw.trim().trim_start_matches('=').replace('$', ""))
    }
}

impl Tool for SetNamedRangeTool {
    fn name(&self) -> &str {
        "set_named_range"
    }

    fn description(&self) -> &str {
        "Create or update a workbook-level named range. Args: {\"name\": \"Totals\", \"refers_to\": \"Sheet1!$B$2:$B$9\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "refers_to": {"type": "string"}
            },
            "required": ["name", "refers_to"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["name", "refers_to"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Structural)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        args.get("name")
            .and_then(Value::as_str)
            .map(|n| SnapshotScope::Name(n.to_string()))
            .into_iter()
            .collect()
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        let name = str_arg(args, "name")?;
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(format!("'{name}' is not a valid range name"));
        }
        Self::target(args).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let name = str_arg(args, "name").map_err(BackendError::Invalid)?;
        let target = Self::target(args).map_err(BackendError::Invalid)?;
        backend.set_named_range(name, &target.to_string())?;
        ok(json!({ "name": name, "refers_to": target.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentId, MemoryBackend, MemoryProbe, MemoryWorkbook};
    use std::sync::{Arc, Mutex};

    fn backend() -> MemoryBackend {
        let book = MemoryWorkbook::new(DocumentId::named("sheets.xlsx"));
        MemoryBackend::new(Arc::new(Mutex::new(book)), MemoryProbe::new())
    }

    #[test]
    fn test_create_and_list() {
        let mut b = backend();
        CreateSheetTool
            .execute(&mut b, &json!({"sheet_name": "Summary", "index": 0}))
            .unwrap();
        let out = GetSheetNamesTool.execute(&mut b, &json!({})).unwrap();
        assert_eq!(out["data"], json!(["Summary", "Sheet1"]));
    }

    #[test]
    fn test_sheet_name_rules() {
        assert!(CreateSheetTool.validate(&json!({"sheet_name": "a/b"})).is_err());
        assert!(CreateSheetTool
            .validate(&json!({"sheet_name": "x".repeat(32)}))
            .is_err());
        assert!(CreateSheetTool
            .validate(&json!({"sheet_name": "ok", "index": -1}))
            .is_err());
        assert!(CreateSheetTool.validate(&json!({"sheet_name": "ok"})).is_ok());
    }

    #[test]
    fn test_named_range_normalized() {
        let mut b = backend();
        let args = json!({"name": "Totals", "refers_to": "=Sheet1!$B$2:$B$9"});
        SetNamedRangeTool.validate(&args).unwrap();
        let out = SetNamedRangeTool.execute(&mut b, &args).unwrap();
        assert_eq!(out["data"]["refers_to"], json!("Sheet1!B2:B9"));
        assert!(SetNamedRangeTool
            .validate(&json!({"name": "1bad", "refers_to": "Sheet1!A1"}))
            .is_err());
    }

    #[test]
    fn test_delete_last_sheet_is_rejected() {
        let err = DeleteSheetTool
            .execute(&mut backend(), &json!({"sheet_name": "Sheet1"}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::BackendPermanent);
    }
}
