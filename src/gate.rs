// src/gate.rs

//! Resource gate: per-account usage counters checked before any new unit of
//! work (scan, test, case run, flow run) is created.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{FlowError, Result};
use crate::store::{Account, Store};
use crate::types::{AccountTier, UsageKind};

/// External billing collaborator notified about metered overage.
pub trait BillingMeter: Send + Sync + Debug {
    fn record_overage(&self, account_id: &str, kind: UsageKind, used: u64, allowed: u64);
}

/// Meter that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMeter;

impl BillingMeter for LogMeter {
    fn record_overage(&self, account_id: &str, kind: UsageKind, used: u64, allowed: u64) {
        info!(account_id, %kind, used, allowed, "metered usage over allowance");
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    /// The account is inactive (unfunded).
    Inactive,
    /// Capped account at its allowance.
    Exhausted { allowed: u64 },
}

impl GateDecision {
    pub fn is_allowed(self) -> bool {
        self == GateDecision::Allowed
    }
}

#[derive(Debug, Clone)]
pub struct ResourceGate {
    store: Arc<dyn Store>,
    meter: Arc<dyn BillingMeter>,
}

impl ResourceGate {
    pub fn new(store: Arc<dyn Store>, meter: Arc<dyn BillingMeter>) -> Self {
        Self { store, meter }
    }

    /// Check the allowance and, if allowed, consume one unit of `kind`.
    pub fn check(&self, account_id: &str, kind: UsageKind) -> Result<GateDecision> {
        let mut decision = GateDecision::Allowed;
        let mut overage = None;

        self.store.update_account(account_id, &mut |account: &mut Account| {
            decision = GateDecision::Allowed;
            overage = None;

            if !account.active {
                decision = GateDecision::Inactive;
                return Ok(());
            }

            let tier = account.tier;
            let usage = account.usage.entry(kind).or_default();
            match tier {
                AccountTier::Metered => {
                    if usage.used >= usage.allowed {
                        overage = Some((usage.used + 1, usage.allowed));
                    }
                    usage.used += 1;
                }
                AccountTier::Capped => {
                    if usage.used + 1 > usage.allowed {
                        decision = GateDecision::Exhausted {
                            allowed: usage.allowed,
                        };
                        return Ok(());
                    }
                    usage.used += 1;
                }
            }
            Ok(())
        })?;

        if let Some((used, allowed)) = overage {
            self.meter.record_overage(account_id, kind, used, allowed);
        }

        debug!(account_id, %kind, ?decision, "resource gate checked");
        Ok(decision)
    }

    /// `true` if a new unit of `kind` may be created (and was counted).
    pub fn try_consume(&self, account_id: &str, kind: UsageKind) -> Result<bool> {
        Ok(self.check(account_id, kind)?.is_allowed())
    }

    /// Like [`try_consume`](Self::try_consume) but refusals become
    /// [`FlowError::QuotaExhausted`].
    pub fn require(&self, account_id: &str, kind: UsageKind) -> Result<()> {
        let reason = match self.check(account_id, kind)? {
            GateDecision::Allowed => return Ok(()),
            GateDecision::Inactive => "account is inactive".to_string(),
            GateDecision::Exhausted { allowed } => {
                format!("max {kind} reached ({allowed} allowed)")
            }
        };
        warn!(account_id, %kind, %reason, "resource gate refused");
        Err(FlowError::QuotaExhausted {
            account_id: account_id.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn gate_with(account: Account) -> (ResourceGate, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.upsert_account(account).unwrap();
        (ResourceGate::new(Arc::clone(&store), Arc::new(LogMeter)), store)
    }

    #[test]
    fn capped_account_stops_at_allowance() {
        let (gate, store) =
            gate_with(Account::new("a", AccountTier::Capped).with_allowance(UsageKind::Scans, 2));

        assert!(gate.try_consume("a", UsageKind::Scans).unwrap());
        assert!(gate.try_consume("a", UsageKind::Scans).unwrap());
        assert!(!gate.try_consume("a", UsageKind::Scans).unwrap());

        let usage = store.get_account("a").unwrap().usage[&UsageKind::Scans];
        assert_eq!(usage.used, 2);
    }

    #[test]
    fn metered_account_keeps_counting_past_allowance() {
        let (gate, store) =
            gate_with(Account::new("a", AccountTier::Metered).with_allowance(UsageKind::Tests, 1));

        for _ in 0..3 {
            assert!(gate.try_consume("a", UsageKind::Tests).unwrap());
        }
        assert_eq!(store.get_account("a").unwrap().usage[&UsageKind::Tests].used, 3);
    }

    #[test]
    fn inactive_account_is_refused_with_typed_error() {
        let mut account = Account::new("a", AccountTier::Metered);
        account.active = false;
        let (gate, _) = gate_with(account);

        let err = gate.require("a", UsageKind::FlowRuns).unwrap_err();
        assert!(matches!(err, FlowError::QuotaExhausted { .. }));
    }

    #[test]
    fn unknown_account_is_an_error() {
        let (gate, _) = gate_with(Account::new("a", AccountTier::Capped));
        assert!(matches!(
            gate.try_consume("b", UsageKind::Scans),
            Err(FlowError::AccountNotFound(_))
        ));
    }
}
