//! 错误类型与错误分类
//!
//! ErrorKind 是面向调用循环的封闭分类（熔断计数、日志、Failure 结果都以它为键）；
//! BackendError / SnapshotError / SessionError 是各组件内部的具体错误。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类：每个 Failure 都恰好落在其中一类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 参数不合法，永远不会到达后端
    Validation,
    /// 后端暂时不可用（忙、超时），可按策略重试
    BackendTransient,
    /// 后端明确拒绝，不重试
    BackendPermanent,
    /// 工具返回了 Success/Failure 之外的结构
    ContractViolation,
    /// 本次操作无法回滚（快照不可用）
    SnapshotUnavailable,
    /// 同类错误连续过多，熔断中
    CircuitOpen,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BackendTransient => "backend_transient",
            ErrorKind::BackendPermanent => "backend_permanent",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::SnapshotUnavailable => "snapshot_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// 是否参与熔断计数（CircuitOpen 与 SnapshotUnavailable 是派生状态，不计数）
    pub fn is_counted(&self) -> bool {
        !matches!(self, ErrorKind::CircuitOpen | ErrorKind::SnapshotUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 后端调用错误；每个变体唯一对应一个 ErrorKind，调用方不会把它们压成一类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend busy: {0}")]
    Busy(String),

    #[error("Backend call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Backend disconnected: {0}")]
    Disconnected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// 工作线程在执行后端调用时 panic
    #[error("Backend worker panicked: {0}")]
    Panicked(String),

    #[error("Backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Busy(_) | BackendError::Timeout(_) => ErrorKind::BackendTransient,
            BackendError::Disconnected(_)
            | BackendError::NotFound(_)
            | BackendError::Invalid(_)
            | BackendError::Unsupported(_) => ErrorKind::BackendPermanent,
            BackendError::Panicked(_) | BackendError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// 仅「忙」与超时属于可重试的暂态错误
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::BackendTransient
    }
}

/// 快照捕获 / 回滚错误
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Region unreadable: {0}")]
    Unreadable(#[from] BackendError),

    #[error("Region too large to snapshot: {cells} cells (limit {limit})")]
    TooLarge { cells: u64, limit: u64 },

    #[error("Unknown snapshot record: {0}")]
    UnknownRecord(String),

    #[error("Snapshot storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// 会话级错误：打开、关闭、导出
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Document identity mismatch: expected '{expected}', found '{found}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Backend error during {stage}: {source}")]
    Backend {
        stage: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session already closed")]
    Closed,
}
