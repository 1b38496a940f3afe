//! 会话监管：取消令牌与后台结构刷新定时器
//!
//! 定时器按 tick_interval 调用 ShapeSynchronizer::tick，扫描与写操作共用连接桥的单写者闸门；
//! 关闭会话或 Ctrl+C 时取消令牌，定时器随之退出。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::shape::{ShapeSynchronizer, TickOutcome};

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 启动后台 tick；period 为 0 时不启动，由调用方手动 tick
    pub fn spawn_shape_ticker(&self, sync: Arc<ShapeSynchronizer>, period: Duration) {
        if period.is_zero() {
            return;
        }
        let token = self.child_token();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let TickOutcome::Failed(e) = sync.tick().await {
                            tracing::debug!(error = %e, "background shape tick failed");
                        }
                    }
                }
            }
            tracing::debug!("shape ticker stopped");
        });
        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(old) = previous {
            old.abort();
        }
    }

    /// 取消并等待定时器退出（最多 timeout）
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel();
        let handle = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("shape ticker did not stop in time");
            }
        }
    }

    /// Ctrl+C 时取消令牌
    pub fn install_signal_handler(&self) {
        let token = self.cancel_token();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, closing session...");
                token.cancel();
            }
        });
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
