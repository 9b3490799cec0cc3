//! Budget ledger - per-tier capacity with reservation and settlement.

use std::collections::HashMap;

use constellation_core::{
    BreakerStatus, LedgerSnapshot, Reservation, ReservationId, TaskId, TierConfig, TierEntry,
    TierName, TierStatus, Time,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors raised by the ledger.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    /// Tier is not configured
    #[error("unknown tier: {0}")]
    UnknownTier(TierName),

    /// Tier cannot cover the requested amount
    #[error("tier {tier} has {available} available, {requested} requested")]
    InsufficientCapacity {
        /// Tier
        tier: TierName,
        /// Amount asked for
        requested: f64,
        /// Amount available
        available: f64,
    },

    /// Tier already holds its maximum number of open reservations
    #[error("tier {tier} already holds {open} open reservations")]
    ReservationLimit {
        /// Tier
        tier: TierName,
        /// Open reservations
        open: usize,
    },

    /// Reservation was settled or released before
    #[error("reservation {0} already settled")]
    AlreadySettled(ReservationId),

    /// Negative or non-finite amount
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),
}

impl LedgerError {
    /// Expected, recoverable refusals the dispatcher retries next cycle.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. } | Self::ReservationLimit { .. })
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// A change in a tier's breaker status.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerChange {
    /// Tier
    pub tier: TierName,
    /// Previous status
    pub from: BreakerStatus,
    /// New status
    pub to: BreakerStatus,
    /// Drawdown from initial at the time of change
    pub drawdown_from_initial: f64,
    /// Drawdown from peak at the time of change
    pub drawdown_from_peak: f64,
}

/// Tier balance after a settlement or release.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// Tier
    pub tier: TierName,
    /// New allocated
    pub allocated: f64,
    /// New peak
    pub peak: f64,
}

/// Whether a tier admits new capital-consuming dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchGate {
    /// Dispatch allowed
    Open,
    /// Refused by a tripped breaker
    Halted {
        /// Tier whose breaker caused the halt
        by: TierName,
        /// Its status
        status: BreakerStatus,
    },
}

#[derive(Default)]
struct LedgerState {
    tiers: Vec<TierEntry>,
    open: HashMap<ReservationId, Reservation>,
    changes: Vec<BreakerChange>,
}

impl LedgerState {
    fn entry(&self, tier: &TierName) -> Result<&TierEntry> {
        self.tiers
            .iter()
            .find(|e| &e.config.name == tier)
            .ok_or_else(|| LedgerError::UnknownTier(tier.clone()))
    }

    fn entry_mut(&mut self, tier: &TierName) -> Result<&mut TierEntry> {
        self.tiers
            .iter_mut()
            .find(|e| &e.config.name == tier)
            .ok_or_else(|| LedgerError::UnknownTier(tier.clone()))
    }

    fn open_for(&self, tier: &TierName) -> impl Iterator<Item = &Reservation> {
        let tier = tier.clone();
        self.open.values().filter(move |r| r.tier == tier)
    }

    /// Record a breaker transition for `tier` if its status moved.
    fn observe(&mut self, tier: &TierName) -> Result<()> {
        let entry = self.entry_mut(tier)?;
        let now = entry.breaker_status();
        if now == entry.last_breaker {
            return Ok(());
        }
        let change = BreakerChange {
            tier: tier.clone(),
            from: entry.last_breaker,
            to: now,
            drawdown_from_initial: entry.drawdown_from_initial(),
            drawdown_from_peak: entry.drawdown_from_peak(),
        };
        entry.last_breaker = now;
        self.changes.push(change);
        Ok(())
    }
}

/// Per-tier capacity ledger.
///
/// Capacity moves through reservations: [`reserve`](Self::reserve) debits
/// up front, [`settle`](Self::settle) applies the reported delta and
/// [`release`](Self::release) returns an unused reservation unchanged.
/// Every operation holds the ledger lock for its full duration, so debits on
/// a tier are applied in the order they are granted.
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// Fresh ledger, every tier at its initial capacity.
    pub fn new(tiers: impl IntoIterator<Item = TierConfig>) -> Self {
        let tiers = tiers.into_iter().map(TierEntry::new).collect();
        Self {
            state: Mutex::new(LedgerState { tiers, ..Default::default() }),
        }
    }

    /// Rebuild from a persisted snapshot, reconciled against the current
    /// tier configuration. Configured tiers missing from the snapshot start
    /// fresh; tiers no longer configured are dropped with their reservations.
    pub fn from_snapshot(snapshot: LedgerSnapshot, tiers: impl IntoIterator<Item = TierConfig>) -> Self {
        let mut stored: HashMap<TierName, TierEntry> = snapshot
            .tiers
            .into_iter()
            .map(|e| (e.config.name.clone(), e))
            .collect();

        let mut entries = Vec::new();
        for config in tiers {
            match stored.remove(&config.name) {
                Some(mut entry) => {
                    entry.config = config;
                    entries.push(entry);
                }
                None => entries.push(TierEntry::new(config)),
            }
        }
        for name in stored.keys() {
            warn!("Dropping ledger tier '{}' which is no longer configured", name);
        }

        let open = snapshot
            .open
            .into_iter()
            .filter(|r| entries.iter().any(|e| e.config.name == r.tier))
            .map(|r| (r.id, r))
            .collect();

        Self {
            state: Mutex::new(LedgerState { tiers: entries, open, changes: Vec::new() }),
        }
    }

    /// Image of the ledger for persistence.
    pub async fn snapshot(&self, now: Time) -> LedgerSnapshot {
        let state = self.state.lock().await;
        let mut open: Vec<Reservation> = state.open.values().cloned().collect();
        open.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        LedgerSnapshot {
            tiers: state.tiers.clone(),
            open,
            taken_at: Some(now),
        }
    }

    /// Debit `amount` from `tier` and return a reservation handle.
    pub async fn reserve(
        &self,
        tier: &TierName,
        amount: f64,
        task_id: Option<&TaskId>,
        now: Time,
    ) -> Result<Reservation> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut state = self.state.lock().await;
        let entry = state.entry(tier)?;
        if let Some(max) = entry.config.max_open_reservations {
            let open = state.open_for(tier).count();
            if open >= max as usize {
                return Err(LedgerError::ReservationLimit { tier: tier.clone(), open });
            }
        }
        let entry = state.entry_mut(tier)?;
        if entry.allocated < amount {
            return Err(LedgerError::InsufficientCapacity {
                tier: tier.clone(),
                requested: amount,
                available: entry.allocated,
            });
        }

        entry.allocated -= amount;
        let reservation = Reservation {
            id: ReservationId::new(),
            tier: tier.clone(),
            amount,
            task_id: task_id.cloned(),
            reserved_at: now,
        };
        debug!(
            "Reserved {} from tier {} ({} left) as {}",
            amount, tier, entry.allocated, reservation.id
        );
        state.open.insert(reservation.id, reservation.clone());
        state.observe(tier)?;
        Ok(reservation)
    }

    /// Close a reservation, applying `capital_delta` to its tier.
    ///
    /// The delta is applied as reported, even if the tier ends up negative.
    pub async fn settle(&self, handle: &Reservation, capital_delta: f64) -> Result<Settlement> {
        if !capital_delta.is_finite() {
            return Err(LedgerError::InvalidAmount(capital_delta));
        }

        let mut state = self.state.lock().await;
        if state.open.remove(&handle.id).is_none() {
            return Err(LedgerError::AlreadySettled(handle.id));
        }

        let entry = state.entry_mut(&handle.tier)?;
        entry.allocated += capital_delta;
        if entry.allocated > entry.peak {
            entry.peak = entry.allocated;
        }
        if entry.allocated < 0.0 {
            warn!(
                "Tier {} went negative ({}) settling {}",
                handle.tier, entry.allocated, handle.id
            );
        }
        let settlement = Settlement {
            tier: handle.tier.clone(),
            allocated: entry.allocated,
            peak: entry.peak,
        };
        info!(
            "Settled {} on tier {} with delta {:+} -> allocated {}",
            handle.id, handle.tier, capital_delta, settlement.allocated
        );
        state.observe(&handle.tier)?;
        Ok(settlement)
    }

    /// Return an unused reservation to its tier unchanged.
    pub async fn release(&self, handle: &Reservation) -> Result<Settlement> {
        let mut state = self.state.lock().await;
        let Some(reservation) = state.open.remove(&handle.id) else {
            return Err(LedgerError::AlreadySettled(handle.id));
        };

        let entry = state.entry_mut(&reservation.tier)?;
        entry.allocated += reservation.amount;
        if entry.allocated > entry.peak {
            entry.peak = entry.allocated;
        }
        let settlement = Settlement {
            tier: reservation.tier.clone(),
            allocated: entry.allocated,
            peak: entry.peak,
        };
        debug!("Released {} back to tier {}", reservation.id, reservation.tier);
        state.observe(&reservation.tier)?;
        Ok(settlement)
    }

    /// Evaluate the drawdown thresholds of `tier`. Pure read.
    pub async fn check_circuit_breakers(&self, tier: &TierName) -> Result<BreakerStatus> {
        let state = self.state.lock().await;
        Ok(state.entry(tier)?.breaker_status())
    }

    /// Whether a capital-consuming task on `tier` may be dispatched.
    ///
    /// `halt_all` on the tier itself refuses; an aggressive tier is also
    /// refused while any tier is at `halt_new_aggressive` or worse.
    pub async fn dispatch_gate(&self, tier: &TierName) -> Result<DispatchGate> {
        let state = self.state.lock().await;
        let entry = state.entry(tier)?;

        let own = entry.breaker_status();
        if own == BreakerStatus::HaltAll {
            return Ok(DispatchGate::Halted { by: tier.clone(), status: own });
        }
        if entry.config.aggressive {
            let worst = state
                .tiers
                .iter()
                .map(|e| (e.breaker_status(), &e.config.name))
                .max_by_key(|(status, _)| *status);
            if let Some((status, by)) = worst {
                if status >= BreakerStatus::HaltNewAggressive {
                    return Ok(DispatchGate::Halted { by: by.clone(), status });
                }
            }
        }
        Ok(DispatchGate::Open)
    }

    /// Operator reset: rebase `initial`, `peak` and `allocated`.
    pub async fn reset_tier(&self, tier: &TierName, new_allocated: f64) -> Result<TierStatus> {
        if !new_allocated.is_finite() || new_allocated < 0.0 {
            return Err(LedgerError::InvalidAmount(new_allocated));
        }

        let mut state = self.state.lock().await;
        let entry = state.entry_mut(tier)?;
        entry.initial = new_allocated;
        entry.peak = new_allocated;
        entry.allocated = new_allocated;
        info!("Tier {} reset to {}", tier, new_allocated);
        state.observe(tier)?;
        let entry = state.entry(tier)?;
        Ok(tier_status(entry, state.open_for(tier)))
    }

    /// Administrative status of every tier, in configuration order.
    pub async fn status(&self) -> Vec<TierStatus> {
        let state = self.state.lock().await;
        state
            .tiers
            .iter()
            .map(|e| tier_status(e, state.open_for(&e.config.name)))
            .collect()
    }

    /// Status of a single tier.
    pub async fn tier_status(&self, tier: &TierName) -> Result<TierStatus> {
        let state = self.state.lock().await;
        let entry = state.entry(tier)?;
        Ok(tier_status(entry, state.open_for(tier)))
    }

    /// Drain breaker transitions observed since the last call.
    pub async fn take_breaker_changes(&self) -> Vec<BreakerChange> {
        std::mem::take(&mut self.state.lock().await.changes)
    }

    /// Whether a reservation is still open.
    pub async fn is_open(&self, id: ReservationId) -> bool {
        self.state.lock().await.open.contains_key(&id)
    }

    /// Reservations not yet settled or released, oldest first.
    pub async fn open_reservations(&self) -> Vec<Reservation> {
        let state = self.state.lock().await;
        let mut open: Vec<Reservation> = state.open.values().cloned().collect();
        open.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        open
    }

    /// Re-register a reservation the ledger lost track of (e.g. the process
    /// stopped before its snapshot was written), debiting it again.
    /// Returns `false` if it is already open.
    pub async fn adopt(&self, reservation: &Reservation) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.open.contains_key(&reservation.id) {
            return Ok(false);
        }
        let entry = state.entry_mut(&reservation.tier)?;
        entry.allocated -= reservation.amount;
        warn!(
            "Re-adopted reservation {} of {} on tier {}",
            reservation.id, reservation.amount, reservation.tier
        );
        state.open.insert(reservation.id, reservation.clone());
        state.observe(&reservation.tier)?;
        Ok(true)
    }
}

fn tier_status<'a>(entry: &TierEntry, open: impl Iterator<Item = &'a Reservation>) -> TierStatus {
    let (count, reserved) = open.fold((0usize, 0.0f64), |(n, sum), r| (n + 1, sum + r.amount));
    TierStatus {
        name: entry.config.name.clone(),
        allocated: entry.allocated,
        peak: entry.peak,
        initial: entry.initial,
        drawdown_from_initial: entry.drawdown_from_initial(),
        drawdown_from_peak: entry.drawdown_from_peak(),
        breaker_status: entry.breaker_status(),
        open_reservations: count,
        reserved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conservative() -> TierName {
        TierName::new("conservative")
    }

    fn ledger() -> BudgetLedger {
        BudgetLedger::new([TierConfig::new("conservative", 40.0).with_breakers(Some(0.30), None)])
    }

    #[tokio::test]
    async fn test_drawdown_scenario_trips_halt_all() {
        let ledger = ledger();
        let tier = conservative();
        let now = Utc::now();

        let r1 = ledger.reserve(&tier, 10.0, None, now).await.unwrap();
        assert_eq!(ledger.tier_status(&tier).await.unwrap().allocated, 30.0);

        let s1 = ledger.settle(&r1, 2.0).await.unwrap();
        assert_eq!(s1.allocated, 32.0);
        assert_eq!(s1.peak, 40.0);

        let r2 = ledger.reserve(&tier, 10.0, None, now).await.unwrap();
        assert_eq!(ledger.tier_status(&tier).await.unwrap().allocated, 22.0);

        let s2 = ledger.settle(&r2, -10.0).await.unwrap();
        assert_eq!(s2.allocated, 12.0);

        let status = ledger.tier_status(&tier).await.unwrap();
        assert!((status.drawdown_from_initial - 0.70).abs() < 1e-9);
        assert_eq!(
            ledger.check_circuit_breakers(&tier).await.unwrap(),
            BreakerStatus::HaltAll
        );
    }

    #[tokio::test]
    async fn test_reserve_rejects_instead_of_clamping() {
        let ledger = ledger();
        let tier = conservative();
        let err = ledger.reserve(&tier, 40.5, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCapacity { .. }));
        assert!(err.is_capacity());
        assert_eq!(ledger.tier_status(&tier).await.unwrap().allocated, 40.0);

        // Exactly the available amount is fine.
        ledger.reserve(&tier, 40.0, None, Utc::now()).await.unwrap();
        assert_eq!(ledger.tier_status(&tier).await.unwrap().allocated, 0.0);
    }

    #[tokio::test]
    async fn test_double_settle_fails() {
        let ledger = ledger();
        let r = ledger.reserve(&conservative(), 5.0, None, Utc::now()).await.unwrap();
        ledger.settle(&r, 5.0).await.unwrap();
        assert_eq!(
            ledger.settle(&r, 5.0).await.unwrap_err(),
            LedgerError::AlreadySettled(r.id)
        );
        assert!(matches!(ledger.release(&r).await, Err(LedgerError::AlreadySettled(_))));
    }

    #[tokio::test]
    async fn test_release_restores_unchanged() {
        let ledger = ledger();
        let tier = conservative();
        let r = ledger.reserve(&tier, 15.0, None, Utc::now()).await.unwrap();
        let s = ledger.release(&r).await.unwrap();
        assert_eq!(s.allocated, 40.0);
        assert_eq!(s.peak, 40.0);
        assert!(!ledger.is_open(r.id).await);
    }

    #[tokio::test]
    async fn test_conservation_over_sequence() {
        let ledger = BudgetLedger::new([TierConfig::new("t", 100.0)]);
        let tier = TierName::new("t");
        let steps = [(10.0, 12.5), (20.0, 0.0), (5.0, 5.0), (30.0, 31.0), (25.0, -3.0)];

        let mut expected = 100.0;
        for (reserve, delta) in steps {
            let r = ledger.reserve(&tier, reserve, None, Utc::now()).await.unwrap();
            let status = ledger.tier_status(&tier).await.unwrap();
            assert!(status.allocated >= 0.0);
            ledger.settle(&r, delta).await.unwrap();
            expected += delta - reserve;
        }

        let status = ledger.tier_status(&tier).await.unwrap();
        assert!((status.allocated - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_peak_tracks_gains() {
        let ledger = ledger();
        let tier = conservative();
        let r = ledger.reserve(&tier, 10.0, None, Utc::now()).await.unwrap();
        let s = ledger.settle(&r, 25.0).await.unwrap();
        assert_eq!(s.allocated, 55.0);
        assert_eq!(s.peak, 55.0);
    }

    #[tokio::test]
    async fn test_reservation_limit() {
        let ledger = BudgetLedger::new([TierConfig::new("t", 10.0).with_max_open_reservations(1)]);
        let tier = TierName::new("t");
        let r = ledger.reserve(&tier, 1.0, None, Utc::now()).await.unwrap();
        let err = ledger.reserve(&tier, 1.0, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::ReservationLimit { open: 1, .. }));

        ledger.release(&r).await.unwrap();
        ledger.reserve(&tier, 1.0, None, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tier_and_bad_amounts() {
        let ledger = ledger();
        let err = ledger.reserve(&TierName::new("nope"), 1.0, None, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownTier(_)));
        assert!(matches!(
            ledger.reserve(&conservative(), -1.0, None, Utc::now()).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.reset_tier(&conservative(), f64::NAN).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_breaker_changes_are_reported_once() {
        let ledger = ledger();
        let tier = conservative();
        let r = ledger.reserve(&tier, 20.0, None, Utc::now()).await.unwrap();
        ledger.settle(&r, 0.0).await.unwrap();

        let changes = ledger.take_breaker_changes().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from, BreakerStatus::Normal);
        assert_eq!(changes[0].to, BreakerStatus::HaltAll);
        assert!(ledger.take_breaker_changes().await.is_empty());

        let status = ledger.reset_tier(&tier, 20.0).await.unwrap();
        assert_eq!(status.breaker_status, BreakerStatus::Normal);
        assert_eq!(status.peak, 20.0);
        let changes = ledger.take_breaker_changes().await;
        assert_eq!(changes[0].to, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_aggressive_gate_follows_any_tier() {
        let ledger = BudgetLedger::new([
            TierConfig::new("conservative", 40.0).with_breakers(None, Some(0.10)),
            TierConfig::new("moderate", 40.0),
            TierConfig::new("aggressive", 40.0).aggressive(),
        ]);
        let now = Utc::now();
        assert_eq!(ledger.dispatch_gate(&"aggressive".into()).await.unwrap(), DispatchGate::Open);

        let r = ledger.reserve(&conservative(), 8.0, None, now).await.unwrap();
        ledger.settle(&r, 0.0).await.unwrap();

        assert_eq!(
            ledger.dispatch_gate(&"aggressive".into()).await.unwrap(),
            DispatchGate::Halted { by: conservative(), status: BreakerStatus::HaltNewAggressive }
        );
        // Non-aggressive tiers keep dispatching under halt_new_aggressive.
        assert_eq!(ledger.dispatch_gate(&"moderate".into()).await.unwrap(), DispatchGate::Open);
        assert_eq!(ledger.dispatch_gate(&conservative()).await.unwrap(), DispatchGate::Open);
    }

    #[tokio::test]
    async fn test_snapshot_restores_open_reservations() {
        let ledger = ledger();
        let tier = conservative();
        let r = ledger.reserve(&tier, 10.0, None, Utc::now()).await.unwrap();
        let snapshot = ledger.snapshot(Utc::now()).await;

        let restored = BudgetLedger::from_snapshot(
            snapshot,
            [
                TierConfig::new("conservative", 40.0).with_breakers(Some(0.30), None),
                TierConfig::new("fresh", 5.0),
            ],
        );
        assert_eq!(restored.tier_status(&tier).await.unwrap().allocated, 30.0);
        assert_eq!(restored.tier_status(&"fresh".into()).await.unwrap().allocated, 5.0);

        let s = restored.release(&r).await.unwrap();
        assert_eq!(s.allocated, 40.0);
    }

    #[tokio::test]
    async fn test_adopt_restores_lost_reservation() {
        let ledger = ledger();
        let tier = conservative();
        let r = ledger.reserve(&tier, 10.0, None, Utc::now()).await.unwrap();
        assert_eq!(ledger.open_reservations().await, vec![r.clone()]);
        assert!(!ledger.adopt(&r).await.unwrap());

        let fresh = BudgetLedger::new([TierConfig::new("conservative", 40.0)]);
        assert!(fresh.adopt(&r).await.unwrap());
        assert_eq!(fresh.tier_status(&tier).await.unwrap().allocated, 30.0);
        assert!(fresh.is_open(r.id).await);
        assert_eq!(fresh.release(&r).await.unwrap().allocated, 40.0);
    }
}
