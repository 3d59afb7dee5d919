//! Domain model for gas fee estimation data.
//!
//! All fee amounts are denominated in wei. Decimal gwei strings coming from
//! external sources get converted with exact integer arithmetic at the wire
//! boundary, so no stringly typed numbers or floats survive past parsing.

use {
    alloy_primitives::{
        U256,
        utils::{ParseUnits, parse_units},
    },
    anyhow::{Context, Result, bail},
    derive_more::{Display, From, Into},
    std::time::Duration,
};

/// A fee per unit of gas, denominated in wei.
#[derive(Clone, Copy, Debug, Default, Display, Eq, From, Into, Ord, PartialEq, PartialOrd)]
pub struct FeePerGas(pub U256);

impl FeePerGas {
    /// Parses a decimal gwei amount (like "40" or "1.8") into an exact wei
    /// value.
    pub fn from_gwei(gwei: &str) -> Result<Self> {
        let parsed = parse_units(gwei, "gwei")
            .with_context(|| format!("malformed gwei amount {gwei:?}"))?;
        match parsed {
            ParseUnits::U256(wei) => Ok(Self(wei)),
            ParseUnits::I256(_) => bail!("negative gwei amount {gwei:?}"),
        }
    }

    pub(crate) fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

/// Expected confirmation behavior for one fee tier.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeeTierEstimate {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub suggested_max_priority_fee_per_gas: FeePerGas,
    pub suggested_max_fee_per_gas: FeePerGas,
}

/// A full EIP-1559 estimate set as served by the fee API.
///
/// Tier priority fees are assumed to be ordered low < medium < high.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Eip1559Estimates {
    pub low: FeeTierEstimate,
    pub medium: FeeTierEstimate,
    pub high: FeeTierEstimate,
    pub estimated_base_fee: FeePerGas,
}

/// Estimates for networks or accounts without EIP-1559 support.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LegacyEstimates {
    pub gas_price: FeePerGas,
}

/// The estimate data currently held by the watcher. The variant is decided
/// once, by whichever fetch produced the data.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum GasFeeEstimates {
    /// No fetch succeeded yet, or polling stopped and the state was reset.
    #[default]
    Empty,
    Legacy(LegacyEstimates),
    Eip1559(Eip1559Estimates),
}

/// Estimated confirmation time window for a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeBounds {
    /// The offered priority fee is below the lowest known tier; confirmation
    /// cannot be bounded.
    Unbounded,
    /// Confirmation is expected within this window.
    Window { lower: Duration, upper: Duration },
}

/// Snapshot of everything the watcher currently knows.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GasFeeState {
    pub estimates: GasFeeEstimates,
    /// Confirmation window for the medium tier. Only present while
    /// `estimates` holds the EIP-1559 variant.
    pub time_bounds: Option<TimeBounds>,
}

impl GasFeeState {
    pub fn diff(&self, new: &Self) -> StateDiff {
        StateDiff {
            estimates_changed: self.estimates != new.estimates,
            time_bounds_changed: self.time_bounds != new.time_bounds,
        }
    }
}

/// Which parts of the state changed in one update.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StateDiff {
    pub estimates_changed: bool,
    pub time_bounds_changed: bool,
}

/// One published state update.
///
/// All-false diffs still get published so subscribers can observe completed
/// update cycles.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateChange {
    pub state: GasFeeState,
    pub diff: StateDiff,
}

/// Fixtures shared by tests across the crate.
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;

    pub fn gwei(amount: &str) -> FeePerGas {
        FeePerGas::from_gwei(amount).unwrap()
    }

    pub fn tier(
        min_wait: Duration,
        max_wait: Duration,
        priority: &str,
        max: &str,
    ) -> FeeTierEstimate {
        FeeTierEstimate {
            min_wait,
            max_wait,
            suggested_max_priority_fee_per_gas: gwei(priority),
            suggested_max_fee_per_gas: gwei(max),
        }
    }

    /// Tier priority fees 1 < 2 < 3 gwei on a 30 gwei base fee.
    pub fn estimates() -> Eip1559Estimates {
        Eip1559Estimates {
            low: tier(Duration::from_secs(120), Duration::from_secs(300), "1", "35"),
            medium: tier(Duration::ZERO, Duration::from_secs(30), "2", "40"),
            high: tier(Duration::ZERO, Duration::from_secs(150), "3", "60"),
            estimated_base_fee: gwei("30"),
        }
    }
}
