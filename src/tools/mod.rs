//! 工具层：Tool trait 与注册表、结果契约、调用流水线、自动修复、内置工具、调用 Schema

pub mod autofix;
pub mod cells;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod schema;
pub mod sheets;
pub mod style;

pub use cells::{GetCellValueTool, GetRangeValuesTool, SetCellFormulaTool, SetCellValueTool, SetCellValuesTool};
pub use pipeline::{PipelineOutcome, ToolPipeline};
pub use registry::{Tool, ToolRegistry};
pub use result::ToolResult;
pub use schema::{tool_call_schema_json, ToolCallFormat};
pub use sheets::{CreateSheetTool, DeleteSheetTool, GetSheetNamesTool, SetNamedRangeTool};
pub use style::SetRangeStyleTool;

/// 注册全部内置工具
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SetCellValueTool);
    registry.register(SetCellValuesTool);
    registry.register(SetCellFormulaTool);
    registry.register(GetCellValueTool);
    registry.register(GetRangeValuesTool);
    registry.register(GetSheetNamesTool);
    registry.register(SetRangeStyleTool);
    registry.register(CreateSheetTool);
    registry.register(DeleteSheetTool);
    registry.register(SetNamedRangeTool);
    registry
}
