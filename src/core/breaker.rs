//! 错误分类与熔断
//!
//! 按 ErrorKind（而不是错误文本）统计连续失败次数；某类达到阈值即熔断该类，
//! 会话拒绝再执行属于该类的调用，直到显式 clear_halt。
//! 一次调用属于哪一类：参数校验不过即为 validation；否则取该工具最近一次失败的类别。
//! 某工具成功时清零它最近一次失败类别的计数；其它类别的计数不受影响。

use std::collections::{BTreeSet, HashMap};

use crate::config::BreakerSection;
use crate::core::ErrorKind;

/// record 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerEvent {
    /// 成功或未计数的失败
    Steady,
    /// 计数增加但未达阈值
    Counted { kind: ErrorKind, count: u32 },
    /// 本次失败触发熔断
    Tripped(ErrorKind),
}

#[derive(Debug)]
pub struct ErrorClassifier {
    threshold: u32,
    counts: HashMap<ErrorKind, u32>,
    halted: BTreeSet<ErrorKind>,
    last_failure: HashMap<String, ErrorKind>,
}

impl ErrorClassifier {
    pub fn new(cfg: &BreakerSection) -> Self {
        Self {
            threshold: cfg.halt_threshold.max(1),
            counts: HashMap::new(),
            halted: BTreeSet::new(),
            last_failure: HashMap::new(),
        }
    }

    pub fn count(&self, kind: ErrorKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_halted(&self) -> bool {
        !self.halted.is_empty()
    }

    pub fn halted_kinds(&self) -> Vec<ErrorKind> {
        self.halted.iter().copied().collect()
    }

    /// 这次调用预计属于的类别
    pub fn predicted_kind(&self, tool: &str, validation_failed: bool) -> Option<ErrorKind> {
        if validation_failed {
            Some(ErrorKind::Validation)
        } else {
            self.last_failure.get(tool).copied()
        }
    }

    /// 该调用是否应被拒绝；返回被熔断的类别
    pub fn refuses(&self, tool: &str, validation_failed: bool) -> Option<ErrorKind> {
        self.predicted_kind(tool, validation_failed)
            .filter(|k| self.halted.contains(k))
    }

    /// 记录一次调用结果；outcome 为 None 表示成功
    pub fn record(&mut self, tool: &str, outcome: Option<ErrorKind>) -> BreakerEvent {
        let kind = match outcome {
            None => {
                // 通过了校验并成功：validation 计数与该工具上次失败类别的计数清零
                self.counts.remove(&ErrorKind::Validation);
                if let Some(prev) = self.last_failure.remove(tool) {
                    self.counts.remove(&prev);
                }
                return BreakerEvent::Steady;
            }
            Some(k) if !k.is_counted() => return BreakerEvent::Steady,
            Some(k) => k,
        };
        if kind != ErrorKind::Validation {
            self.last_failure.insert(tool.to_string(), kind);
        }
        let count = self.counts.entry(kind).or_default();
        *count += 1;
        let count = *count;
        if count >= self.threshold && self.halted.insert(kind) {
            tracing::warn!(%kind, count, tool, "circuit breaker tripped");
            return BreakerEvent::Tripped(kind);
        }
        BreakerEvent::Counted { kind, count }
    }

    /// 清除熔断标志及对应计数
    pub fn clear_halt(&mut self) -> Vec<ErrorKind> {
        let cleared: Vec<ErrorKind> = std::mem::take(&mut self.halted).into_iter().collect();
        for kind in &cleared {
            self.counts.remove(kind);
        }
        if !cleared.is_empty() {
            tracing::info!(kinds = ?cleared, "circuit breaker cleared");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(&BreakerSection { halt_threshold: 2 })
    }

    #[test]
    fn test_trips_at_threshold() {
        let mut c = classifier();
        assert_eq!(
            c.record("t", Some(ErrorKind::BackendPermanent)),
            BreakerEvent::Counted { kind: ErrorKind::BackendPermanent, count: 1 }
        );
        assert_eq!(c.refuses("t", false), None);
        assert_eq!(
            c.record("t", Some(ErrorKind::BackendPermanent)),
            BreakerEvent::Tripped(ErrorKind::BackendPermanent)
        );
        assert_eq!(c.refuses("t", false), Some(ErrorKind::BackendPermanent));
        // 从未失败过的工具不属于任何熔断类别
        assert_eq!(c.refuses("other", false), None);
    }

    #[test]
    fn test_success_resets_own_kind_only() {
        let mut c = classifier();
        c.record("a", Some(ErrorKind::BackendTransient));
        c.record("b", Some(ErrorKind::ContractViolation));
        c.record("a", None);
        assert_eq!(c.count(ErrorKind::BackendTransient), 0);
        assert_eq!(c.count(ErrorKind::ContractViolation), 1);
        c.record("a", Some(ErrorKind::BackendTransient));
        assert!(!c.is_halted());
    }

    #[test]
    fn test_other_kind_does_not_reset() {
        let mut c = classifier();
        c.record("a", Some(ErrorKind::Validation));
        c.record("b", Some(ErrorKind::BackendPermanent));
        assert_eq!(c.count(ErrorKind::Validation), 1);
        assert_eq!(
            c.record("c", Some(ErrorKind::Validation)),
            BreakerEvent::Tripped(ErrorKind::Validation)
        );
        assert_eq!(c.refuses("a", true), Some(ErrorKind::Validation));
        // 参数合法的调用不属于 validation 类
        assert_eq!(c.refuses("a", false), None);
    }

    #[test]
    fn test_circuit_open_not_counted_and_clear() {
        let mut c = classifier();
        c.record("t", Some(ErrorKind::Unknown));
        c.record("t", Some(ErrorKind::Unknown));
        assert_eq!(c.record("t", Some(ErrorKind::CircuitOpen)), BreakerEvent::Steady);
        assert_eq!(c.clear_halt(), vec![ErrorKind::Unknown]);
        assert!(!c.is_halted());
        assert_eq!(c.count(ErrorKind::Unknown), 0);
        assert_eq!(c.refuses("t", false), None);
    }
}
