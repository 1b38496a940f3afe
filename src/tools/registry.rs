//! 工具注册表
//!
//! 所有工具实现 Tool trait（名称、描述、参数 schema、必填参数、写分类、快照范围、执行），
//! 由 ToolRegistry 按名注册与查找；ToolPipeline 负责校验、快照、执行与结果契约。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::{Backend, RangeRef, SheetRange};
use crate::core::BackendError;
use crate::shape::WriteKind;
use crate::snapshot::SnapshotScope;

/// 工具 trait：execute 在阻塞工作线程中运行，直接操作后端连接
///
/// execute 的 Ok 值是原始结果，须符合 `{success, data|error}` 契约；Err 表示后端调用失败（按 ErrorKind 分类）。
pub trait Tool: Send + Sync {
    /// 工具名称（调用请求中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": self.required_args(),
        })
    }

    /// 必填参数：缺失、null、空串或空数组都在到达后端前被拒绝
    fn required_args(&self) -> &[&str] {
        &[]
    }

    /// 写分类；None 表示只读
    fn write_kind(&self) -> Option<WriteKind> {
        None
    }

    /// 写操作前需要快照的区域
    fn snapshot_scopes(&self, _args: &Value) -> Vec<SnapshotScope> {
        Vec::new()
    }

    /// 工具自身的参数校验（地址格式等）
    fn validate(&self, _args: &Value) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, backend: &mut dyn Backend, args: &Value) -> Result<Value, BackendError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }

    /// 注册工具的 schema JSON（名称、描述、参数）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

/// 必填参数检查：返回第一个缺失或为空的参数名
pub fn missing_required(args: &Value, required: &[&str]) -> Option<String> {
    required
        .iter()
        .find(|key| match args.get(**key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Object(o)) => o.is_empty(),
            Some(_) => false,
        })
        .map(|k| k.to_string())
}

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("'{key}' must be a string"))
}

/// 单元格 / 区域地址参数；BackendError 形式供 execute 使用
pub(crate) fn range_arg(args: &Value, key: &str) -> Result<RangeRef, BackendError> {
    let s = str_arg(args, key).map_err(BackendError::Invalid)?;
    RangeRef::parse(s).map_err(BackendError::Invalid)
}

pub(crate) fn sheet_range(args: &Value, key: &str) -> Option<SheetRange> {
    let sheet = args.get("sheet_name")?.as_str()?;
    let range = RangeRef::parse(args.get(key)?.as_str()?).ok()?;
    Some(SheetRange::new(sheet, range))
}

pub(crate) fn ok(data: Value) -> Result<Value, BackendError> {
    Ok(serde_json::json!({ "success": true, "data": data }))
}
