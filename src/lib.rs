//! cellsync - 调用循环与在线电子表格之间的会话状态同步引擎
//!
//! 模块划分：
//! - **backend**: Backend / Connector trait、单元格地址模型、内存工作簿后端
//! - **bridge**: 连接桥（连接获取、阻塞工作线程执行、暂态错误退避重试、单写者闸门）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、熔断、动作日志与指标、会话上下文、会话监管
//! - **observability**: tracing 初始化
//! - **shape**: 工作簿结构摘要的扫描、渲染与防抖同步
//! - **snapshot**: 写操作前的区域快照与回滚
//! - **tools**: 工具注册表、结果契约、调用流水线、内置工具

pub mod backend;
pub mod bridge;
pub mod config;
pub mod core;
pub mod observability;
pub mod shape;
pub mod snapshot;
pub mod tools;

pub use crate::core::{ContextPayload, ErrorKind, SessionContext, SessionError};
pub use crate::tools::ToolResult;
