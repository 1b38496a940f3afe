//! 核心层：错误分类、熔断、会话状态、会话上下文与监管

pub mod breaker;
pub mod error;
pub mod session;
pub mod state;
pub mod supervisor;

pub use breaker::{BreakerEvent, ErrorClassifier};
pub use error::{BackendError, ErrorKind, SessionError, SnapshotError};
pub use session::{ContextPayload, SessionContext};
pub use state::{
    args_digest, dollars_for_usage, ActionLog, ActionLogEntry, Metrics, MetricsDelta, OperationId,
    SnapshotStatus, StatePatch,
};
pub use supervisor::SessionSupervisor;
