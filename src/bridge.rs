//! 连接桥：独占持有后端连接
//!
//! - 获取连接：优先新建专用实例；附着时按文档标识（名称 / 路径）校验，不比较包装对象
//! - with_connection：在阻塞工作线程中执行后端调用，施加超时；仅对暂态错误（忙、超时）做有界指数退避重试
//! - lock_document：单写者闸门，写操作与结构扫描互斥
//! - 连接只在连续多次重新获取失败后才拆除，单次超时不会断开

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::backend::{AcquireMode, Backend, Connector, DocumentId, OpenTarget};
use crate::config::BridgeSection;
use crate::core::{BackendError, SessionError};

type Slot = Arc<Mutex<Option<Box<dyn Backend>>>>;

fn lock_slot(slot: &Mutex<Option<Box<dyn Backend>>>) -> MutexGuard<'_, Option<Box<dyn Backend>>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// 第 attempt 次重试前的等待时间：base * 2^attempt，封顶 max
pub fn backoff_delay(cfg: &BridgeSection, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
    let ms = cfg
        .backoff_base_ms
        .saturating_mul(factor)
        .min(cfg.backoff_max_ms);
    Duration::from_millis(ms)
}

/// 连接桥（每个会话恰好一个）
pub struct ConnectionBridge {
    connector: Arc<dyn Connector>,
    target: OpenTarget,
    document: DocumentId,
    slot: Slot,
    gate: Arc<tokio::sync::Mutex<()>>,
    cfg: BridgeSection,
    live: AtomicBool,
    acquire_failures: AtomicU32,
    retries: AtomicU64,
}

impl ConnectionBridge {
    /// 获取连接；连续 acquire_attempts 次失败返回 SessionError::Connection
    pub async fn open(
        connector: Arc<dyn Connector>,
        target: OpenTarget,
        cfg: BridgeSection,
    ) -> Result<Self, SessionError> {
        let mut last_err = None;
        let attempts = cfg.acquire_attempts.max(1);
        for attempt in 0..attempts {
            match acquire(Arc::clone(&connector), target.clone(), cfg.prefer_dedicated).await {
                Ok(backend) => {
                    let document = backend.document_id();
                    tracing::info!(document = %document, attempt, "backend connection acquired");
                    return Ok(Self {
                        connector,
                        target,
                        document,
                        slot: Arc::new(Mutex::new(Some(backend))),
                        gate: Arc::new(tokio::sync::Mutex::new(())),
                        cfg,
                        live: AtomicBool::new(true),
                        acquire_failures: AtomicU32::new(0),
                        retries: AtomicU64::new(0),
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "backend acquisition failed");
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(backoff_delay(&cfg, attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SessionError::Connection("no acquisition attempted".into())))
    }

    /// 已连接文档的稳定标识
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// 因暂态错误发生的重试总次数
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// 单写者闸门：持有期间没有其它写操作或结构扫描会触达文档
    pub async fn lock_document(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    /// 在工作线程执行后端操作；暂态错误按退避策略重试，其余错误原样返回
    pub async fn with_connection<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: Fn(&mut dyn Backend) -> Result<T, BackendError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt: u32 = 0;
        loop {
            match self.call_once(Arc::clone(&op)).await {
                Err(e) if e.is_transient() && attempt < self.cfg.max_retries => {
                    let delay = backoff_delay(&self.cfg, attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient backend error, retrying");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(BackendError::Disconnected(msg)) if attempt < self.cfg.max_retries => {
                    tracing::warn!(error = %msg, "backend disconnected, reacquiring");
                    self.reconnect().await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn call_once<T, F>(&self, op: Arc<F>) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: Fn(&mut dyn Backend) -> Result<T, BackendError> + Send + Sync + 'static,
    {
        if !self.is_live() {
            return Err(BackendError::Disconnected("connection released".to_string()));
        }
        let slot = Arc::clone(&self.slot);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = lock_slot(&slot);
            match guard.as_mut() {
                Some(backend) => op(&mut **backend),
                None => Err(BackendError::Disconnected("connection released".to_string())),
            }
        });
        let timeout = Duration::from_millis(self.cfg.call_timeout_ms);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(BackendError::Panicked(join.to_string())),
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    /// 重新获取同一文档的连接；连续失败达到上限后拆除连接
    async fn reconnect(&self) -> Result<(), BackendError> {
        if !self.is_live() {
            return Err(BackendError::Disconnected("connection released".to_string()));
        }
        let target = OpenTarget {
            document: self.document.clone(),
            mode: self.target.mode,
        };
        match acquire(Arc::clone(&self.connector), target, self.cfg.prefer_dedicated).await {
            Ok(backend) => {
                let slot = Arc::clone(&self.slot);
                let _ = tokio::task::spawn_blocking(move || {
                    *lock_slot(&slot) = Some(backend);
                })
                .await;
                self.acquire_failures.store(0, Ordering::SeqCst);
                tracing::info!(document = %self.document, "backend connection reacquired");
                Ok(())
            }
            Err(e) => {
                let failures = self.acquire_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(failures, error = %e, "backend reacquisition failed");
                if failures >= self.cfg.acquire_attempts.max(1) {
                    self.live.store(false, Ordering::SeqCst);
                    tracing::error!(document = %self.document, "connection torn down after repeated acquisition failures");
                }
                Err(BackendError::Disconnected(e.to_string()))
            }
        }
    }

    /// 释放连接（幂等）；之后的 with_connection 返回 Disconnected
    pub async fn release(&self) -> Result<(), BackendError> {
        if !self.live.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let slot = Arc::clone(&self.slot);
        let handle = tokio::task::spawn_blocking(move || match lock_slot(&slot).take() {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        });
        let timeout = Duration::from_millis(self.cfg.call_timeout_ms);
        let result = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(r)) => r,
            Ok(Err(join)) => Err(BackendError::Panicked(join.to_string())),
            Err(_) => Err(BackendError::Timeout(timeout)),
        };
        tracing::info!(document = %self.document, ok = result.is_ok(), "backend connection released");
        result
    }
}

/// 在工作线程中按策略获取一次连接
async fn acquire(
    connector: Arc<dyn Connector>,
    target: OpenTarget,
    prefer_dedicated: bool,
) -> Result<Box<dyn Backend>, SessionError> {
    tokio::task::spawn_blocking(move || acquire_blocking(connector.as_ref(), &target, prefer_dedicated))
        .await
        .map_err(|e| SessionError::Connection(format!("acquisition worker failed: {e}")))?
}

fn acquire_blocking(
    connector: &dyn Connector,
    target: &OpenTarget,
    prefer_dedicated: bool,
) -> Result<Box<dyn Backend>, SessionError> {
    let create = || {
        connector
            .create(target)
            .map_err(|e| SessionError::Connection(format!("create failed: {e}")))
    };
    let attach = || {
        let backend = connector
            .attach(target)
            .map_err(|e| SessionError::Connection(format!("attach failed: {e}")))?;
        verify_identity(backend, &target.document)
    };
    match target.mode {
        AcquireMode::Create => create(),
        AcquireMode::Attach => attach(),
        AcquireMode::Auto if prefer_dedicated => create().or_else(|e| {
            tracing::debug!(error = %e, "dedicated instance unavailable, attaching");
            attach()
        }),
        AcquireMode::Auto => attach().or_else(|e| {
            tracing::debug!(error = %e, "attach failed, creating dedicated instance");
            create()
        }),
    }
}

/// 附着到的实例必须打开的是目标文档（按标识比较）
fn verify_identity(
    backend: Box<dyn Backend>,
    expected: &DocumentId,
) -> Result<Box<dyn Backend>, SessionError> {
    let found = backend.document_id();
    if found.matches(expected) {
        Ok(backend)
    } else {
        Err(SessionError::IdentityMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}
