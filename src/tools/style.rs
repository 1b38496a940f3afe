//! 区域格式工具：set_range_style

use serde_json::{json, Value};

use crate::backend::{Backend, CellStyle, RangeRef};
use crate::core::BackendError;
use crate::shape::WriteKind;
use crate::snapshot::SnapshotScope;
use crate::tools::registry::{ok, range_arg, sheet_range, str_arg};
use crate::tools::Tool;

fn style_arg(args: &Value) -> Result<CellStyle, String> {
    let raw = args.get("style").cloned().unwrap_or(Value::Null);
    let style: CellStyle = serde_json::from_value(raw).map_err(|e| format!("invalid 'style': {e}"))?;
    if style.is_default() {
        return Err("'style' sets no properties".to_string());
    }
    Ok(style)
}

pub struct SetRangeStyleTool;

impl Tool for SetRangeStyleTool {
    fn name(&self) -> &str {
        "set_range_style"
    }

    fn description(&self) -> &str {
        "Apply font/fill/alignment/number format to a range. Colors are aRGB hex (FFRRGGBB). \
         Args: {\"sheet_name\": \"Sheet1\", \"range_address\": \"A1:C1\", \"style\": {\"font\": {\"bold\": true}}}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sheet_name": {"type": "string"},
                "range_address": {"type": "string"},
                "style": {
                    "type": "object",
                    "properties": {
                        "font": {"type": "object"},
                        "fill": {"type": "object"},
                        "alignment": {"type": "object"},
                        "number_format": {"type": "string"}
                    }
                }
            },
            "required": ["sheet_name", "range_address", "style"]
        })
    }

    fn required_args(&self) -> &[&str] {
        &["sheet_name", "range_address", "style"]
    }

    fn write_kind(&self) -> Option<WriteKind> {
        Some(WriteKind::Value)
    }

    fn snapshot_scopes(&self, args: &Value) -> Vec<SnapshotScope> {
        sheet_range(args, "range_address")
            .map(SnapshotScope::Cells)
            .into_iter()
            .collect()
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        RangeRef::parse(str_arg(args, "range_address")?)?;
        style_arg(args).map(|_| ())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError> {
        let sheet = str_arg(args, "sheet_name").map_err(BackendError::Invalid)?;
        let range = range_arg(args, "range_address")?;
        let style = style_arg(args).map_err(BackendError::Invalid)?;
        backend.apply_style(sheet, &range, &style)?;
        ok(json!({ "range": range.to_string(), "cells": range.cell_count() }))
    }
}
