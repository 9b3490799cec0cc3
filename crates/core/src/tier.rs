//! Capacity tiers, reservations and circuit-breaker status.

use serde::{Deserialize, Serialize};

use crate::id::{ReservationId, TaskId, TierName};
use crate::Time;

/// Configuration of one capacity tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name
    pub name: TierName,

    /// Capacity the tier starts with
    pub initial_capacity: f64,

    /// Halt all capital-consuming dispatch at this drawdown from initial (fraction)
    #[serde(default)]
    pub max_drawdown_from_initial_pct: Option<f64>,

    /// Halt new aggressive dispatch at this drawdown from peak (fraction)
    #[serde(default)]
    pub max_drawdown_from_peak_pct: Option<f64>,

    /// Whether the tier is stopped by `halt_new_aggressive`
    #[serde(default)]
    pub aggressive: bool,

    /// Cap on concurrently open reservations
    #[serde(default)]
    pub max_open_reservations: Option<u32>,
}

impl TierConfig {
    /// A tier with no breakers and no reservation cap.
    pub fn new(name: impl Into<TierName>, initial_capacity: f64) -> Self {
        Self {
            name: name.into(),
            initial_capacity,
            max_drawdown_from_initial_pct: None,
            max_drawdown_from_peak_pct: None,
            aggressive: false,
            max_open_reservations: None,
        }
    }

    /// Set both drawdown thresholds.
    pub fn with_breakers(mut self, from_initial: Option<f64>, from_peak: Option<f64>) -> Self {
        self.max_drawdown_from_initial_pct = from_initial;
        self.max_drawdown_from_peak_pct = from_peak;
        self
    }

    /// Mark the tier aggressive.
    pub fn aggressive(mut self) -> Self {
        self.aggressive = true;
        self
    }

    /// Cap concurrently open reservations.
    pub fn with_max_open_reservations(mut self, max: u32) -> Self {
        self.max_open_reservations = Some(max);
        self
    }
}

/// Circuit-breaker status of a tier. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    /// Dispatch allowed
    Normal,
    /// New dispatch to aggressive tiers refused
    HaltNewAggressive,
    /// All capital-consuming dispatch from this tier refused
    HaltAll,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::HaltNewAggressive => "halt_new_aggressive",
            Self::HaltAll => "halt_all",
        };
        f.write_str(s)
    }
}

/// Ledger state of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierEntry {
    /// Tier configuration
    pub config: TierConfig,

    /// Baseline for drawdown_from_initial (rebased by reset)
    pub initial: f64,

    /// Capacity currently available
    pub allocated: f64,

    /// Highest allocated observed since the last reset
    pub peak: f64,

    /// Breaker status last reported to the alert channel
    pub last_breaker: BreakerStatus,
}

impl TierEntry {
    /// Fresh entry at the configured initial capacity.
    pub fn new(config: TierConfig) -> Self {
        let initial = config.initial_capacity;
        Self {
            config,
            initial,
            allocated: initial,
            peak: initial,
            last_breaker: BreakerStatus::Normal,
        }
    }

    /// `(initial - allocated) / initial`, zero when initial is not positive.
    pub fn drawdown_from_initial(&self) -> f64 {
        ratio(self.initial - self.allocated, self.initial)
    }

    /// `(peak - allocated) / peak`, zero when peak is not positive.
    pub fn drawdown_from_peak(&self) -> f64 {
        ratio(self.peak - self.allocated, self.peak)
    }

    /// Evaluate the drawdown thresholds.
    pub fn breaker_status(&self) -> BreakerStatus {
        if let Some(limit) = self.config.max_drawdown_from_initial_pct {
            if self.drawdown_from_initial() >= limit {
                return BreakerStatus::HaltAll;
            }
        }
        if let Some(limit) = self.config.max_drawdown_from_peak_pct {
            if self.drawdown_from_peak() >= limit {
                return BreakerStatus::HaltNewAggressive;
            }
        }
        BreakerStatus::Normal
    }
}

fn ratio(num: f64, base: f64) -> f64 {
    if base > 0.0 {
        num / base
    } else {
        0.0
    }
}

/// A provisional debit held against a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Handle id
    pub id: ReservationId,
    /// Tier debited
    pub tier: TierName,
    /// Amount debited
    pub amount: f64,
    /// Task the reservation was taken for
    pub task_id: Option<TaskId>,
    /// When it was granted
    pub reserved_at: Time,
}

/// Serializable image of the whole ledger, including open reservations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Tier entries in configuration order
    pub tiers: Vec<TierEntry>,
    /// Reservations not yet settled or released
    pub open: Vec<Reservation>,
    /// When the snapshot was taken
    pub taken_at: Option<Time>,
}

/// Administrative view of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStatus {
    /// Tier name
    pub name: TierName,
    /// Available capacity
    pub allocated: f64,
    /// Peak since last reset
    pub peak: f64,
    /// Baseline
    pub initial: f64,
    /// Derived drawdown from baseline
    pub drawdown_from_initial: f64,
    /// Derived drawdown from peak
    pub drawdown_from_peak: f64,
    /// Current breaker evaluation
    pub breaker_status: BreakerStatus,
    /// Number of open reservations
    pub open_reservations: usize,
    /// Sum of open reservation amounts
    pub reserved: f64,
}
