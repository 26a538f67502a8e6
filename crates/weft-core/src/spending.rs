//! Running USD spend per invocation with a global soft cap.
//!
//! The tracker is the one legitimate piece of process-wide state; it is
//! always reached through the [`SpendingTracker`] interface so tests can
//! substitute a deterministic instance.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Outcome of a cap check. A single AI or tool call must not be issued
/// once `Exceeded` is returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpendCheck {
    Ok,
    Exceeded { limit: f64, total: f64 },
}

impl SpendCheck {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, SpendCheck::Exceeded { .. })
    }
}

/// Per-invocation spend accounting.
pub trait SpendingTracker: Send + Sync {
    /// Record AI/tool spend against an invocation.
    fn add_cost(&self, invocation_id: Uuid, usd: f64);

    /// Record direct-SDK spend; tracked separately for reporting.
    fn add_sdk_cost(&self, invocation_id: Uuid, usd: f64);

    /// Total spend (AI + SDK) for an invocation.
    fn total(&self, invocation_id: Uuid) -> f64;

    /// SDK-only portion of the spend.
    fn sdk_total(&self, invocation_id: Uuid) -> f64;

    /// Check the invocation's total against the configured cap.
    fn check(&self, invocation_id: Uuid) -> SpendCheck;

    /// Test hook: drop all recorded spend for an invocation.
    fn reset(&self, invocation_id: Uuid);
}

#[derive(Debug, Default, Clone, Copy)]
struct Spend {
    ai_usd: f64,
    sdk_usd: f64,
}

impl Spend {
    fn total(&self) -> f64 {
        self.ai_usd + self.sdk_usd
    }
}

/// Mutex-guarded ledger keyed by invocation id, with a soft USD cap
/// configured at startup.
#[derive(Debug)]
pub struct CostLedger {
    cap_usd: f64,
    spend: Mutex<HashMap<Uuid, Spend>>,
}

impl CostLedger {
    pub fn new(cap_usd: f64) -> Self {
        Self {
            cap_usd,
            spend: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap_usd(&self) -> f64 {
        self.cap_usd
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Spend>> {
        // Poisoning only happens if a holder panicked; the map itself is
        // still structurally sound, so keep going with the inner value.
        self.spend.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SpendingTracker for CostLedger {
    fn add_cost(&self, invocation_id: Uuid, usd: f64) {
        if usd <= 0.0 {
            return;
        }
        self.lock().entry(invocation_id).or_default().ai_usd += usd;
    }

    fn add_sdk_cost(&self, invocation_id: Uuid, usd: f64) {
        if usd <= 0.0 {
            return;
        }
        self.lock().entry(invocation_id).or_default().sdk_usd += usd;
    }

    fn total(&self, invocation_id: Uuid) -> f64 {
        self.lock()
            .get(&invocation_id)
            .map(Spend::total)
            .unwrap_or(0.0)
    }

    fn sdk_total(&self, invocation_id: Uuid) -> f64 {
        self.lock()
            .get(&invocation_id)
            .map(|s| s.sdk_usd)
            .unwrap_or(0.0)
    }

    fn check(&self, invocation_id: Uuid) -> SpendCheck {
        let total = self.total(invocation_id);
        if total >= self.cap_usd {
            SpendCheck::Exceeded {
                limit: self.cap_usd,
                total,
            }
        } else {
            SpendCheck::Ok
        }
    }

    fn reset(&self, invocation_id: Uuid) {
        self.lock().remove(&invocation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_invocation_has_zero_spend() {
        let ledger = CostLedger::new(1.0);
        let id = Uuid::new_v4();
        assert_eq!(ledger.total(id), 0.0);
        assert_eq!(ledger.check(id), SpendCheck::Ok);
    }

    #[test]
    fn costs_accumulate_per_invocation() {
        let ledger = CostLedger::new(1.0);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        ledger.add_cost(a, 0.10);
        ledger.add_cost(a, 0.05);
        ledger.add_cost(b, 0.01);

        assert!((ledger.total(a) - 0.15).abs() < 1e-9);
        assert!((ledger.total(b) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn sdk_costs_tracked_separately_but_count_toward_total() {
        let ledger = CostLedger::new(1.0);
        let id = Uuid::new_v4();

        ledger.add_cost(id, 0.10);
        ledger.add_sdk_cost(id, 0.20);

        assert!((ledger.total(id) - 0.30).abs() < 1e-9);
        assert!((ledger.sdk_total(id) - 0.20).abs() < 1e-9);
    }

    #[test]
    fn cap_exceeded_at_limit() {
        let ledger = CostLedger::new(0.01);
        let id = Uuid::new_v4();

        ledger.add_cost(id, 0.01);
        match ledger.check(id) {
            SpendCheck::Exceeded { limit, total } => {
                assert_eq!(limit, 0.01);
                assert!((total - 0.01).abs() < 1e-9);
            }
            SpendCheck::Ok => panic!("expected exceeded"),
        }
    }

    #[test]
    fn negative_and_zero_costs_ignored() {
        let ledger = CostLedger::new(1.0);
        let id = Uuid::new_v4();
        ledger.add_cost(id, 0.0);
        ledger.add_cost(id, -5.0);
        assert_eq!(ledger.total(id), 0.0);
    }

    #[test]
    fn reset_drops_spend() {
        let ledger = CostLedger::new(0.01);
        let id = Uuid::new_v4();
        ledger.add_cost(id, 5.0);
        assert!(ledger.check(id).is_exceeded());

        ledger.reset(id);
        assert_eq!(ledger.total(id), 0.0);
        assert_eq!(ledger.check(id), SpendCheck::Ok);
    }

    #[test]
    fn additions_are_atomic_across_threads() {
        use std::sync::Arc;

        let ledger = Arc::new(CostLedger::new(f64::MAX));
        let id = Uuid::new_v4();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    ledger.add_cost(id, 0.001);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!((ledger.total(id) - 8.0).abs() < 1e-6);
    }
}
