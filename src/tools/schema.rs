//! 调用请求 JSON Schema 生成（schemars）
//!
//! 与驱动程序读取的 `{"tool": "...", "args": {...}}` 一致，可拼入 system prompt 减少格式错误。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::{Map, Value};

/// 工具调用请求
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ToolCallFormat {
    /// 工具名，如 set_cell_value、create_sheet
    pub tool: String,
    /// 工具参数，依工具不同而不同（sheet_name、cell_address、value 等）
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_fields() {
        let schema: Value = serde_json::from_str(&tool_call_schema_json()).unwrap();
        let props = &schema["properties"];
        assert!(props.get("tool").is_some());
        assert!(props.get("args").is_some());
        assert_eq!(schema["required"], serde_json::json!(["tool"]));
    }
}
