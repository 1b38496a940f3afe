//! 工具结果契约
//!
//! 跨越流水线边界的只有 ToolResult：`Success{data?}` 或 `Failure{kind, message}`。
//! 工具的原始返回值必须是 `{"success": true, "data": ...}` 或 `{"success": false, "error": "..."}`，
//! 其它形状一律判为 ContractViolation；coerce 仅供开发调试时宽松转换。

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::ErrorKind;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl ToolResult {
    pub fn success(data: Option<Value>) -> Self {
        ToolResult::Success { data }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ToolResult::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ToolResult::Success { .. } => None,
            ToolResult::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ToolResult::Success { .. } => None,
            ToolResult::Failure { message, .. } => Some(message),
        }
    }

    /// 回给调用方的 JSON 形式
    pub fn to_json(&self) -> Value {
        match self {
            ToolResult::Success { data } => json!({ "success": true, "data": data }),
            ToolResult::Failure { kind, message } => {
                json!({ "success": false, "error": message, "kind": kind })
            }
        }
    }

    /// 把工具原始返回值转为 ToolResult
    pub fn from_raw(raw: Value, coerce: bool) -> Self {
        match strict(&raw) {
            Some(r) => r,
            None if coerce => coerced(raw),
            None => ToolResult::failure(
                ErrorKind::ContractViolation,
                format!("result outside {{success, data|error}} contract: {}", preview(&raw)),
            ),
        }
    }
}

fn strict(raw: &Value) -> Option<ToolResult> {
    let obj = raw.as_object()?;
    match obj.get("success")?.as_bool()? {
        true => Some(ToolResult::success(
            obj.get("data").filter(|d| !d.is_null()).cloned(),
        )),
        false => {
            let error = obj.get("error")?.as_str().filter(|e| !e.trim().is_empty())?;
            let kind = obj
                .get("kind")
                .and_then(|k| serde_json::from_value::<ErrorKind>(k.clone()).ok())
                .unwrap_or(ErrorKind::Unknown);
            Some(ToolResult::failure(kind, error))
        }
    }
}

/// 开发模式的宽松转换
fn coerced(raw: Value) -> ToolResult {
    match raw {
        Value::Object(mut obj) => match obj.get("success").and_then(Value::as_bool) {
            Some(true) => ToolResult::success(obj.remove("data").filter(|d| !d.is_null())),
            Some(false) => ToolResult::failure(
                ErrorKind::Unknown,
                obj.get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.is_empty())
                    .unwrap_or("Operation failed without explicit error message."),
            ),
            None => match obj.remove("error").filter(|e| !e.is_null()) {
                Some(e) => ToolResult::failure(
                    ErrorKind::Unknown,
                    e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()),
                ),
                None => ToolResult::success(Some(Value::Object(obj))),
            },
        },
        Value::Null => ToolResult::success(None),
        Value::Bool(false) => ToolResult::failure(ErrorKind::Unknown, "Operation returned False"),
        other => ToolResult::success(Some(other)),
    }
}

fn preview(v: &Value) -> String {
    let s = v.to_string();
    if s.len() > 120 {
        format!("{}...", s.chars().take(120).collect::<String>())
    } else {
        s
    }
}
