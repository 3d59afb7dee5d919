//! Confirmation time estimation for EIP-1559 fee suggestions.

use {
    crate::estimates::{Eip1559Estimates, FeePerGas, FeeTierEstimate, TimeBounds},
    std::time::Duration,
};

/// Buckets the offered fees against the tiers of `estimates` and returns the
/// expected confirmation window.
///
/// The effective priority fee is the smaller of the offered priority fee and
/// what remains of the fee cap once the current base fee is paid. Buckets are
/// half open: a fee equal to a tier's suggestion belongs to that tier, and
/// only fees strictly above the high tier get the "faster than high" window.
pub fn estimate_time_bounds(
    max_priority_fee_per_gas: FeePerGas,
    max_fee_per_gas: FeePerGas,
    estimates: &Eip1559Estimates,
) -> TimeBounds {
    let Some(cap) = max_fee_per_gas.checked_sub(estimates.estimated_base_fee) else {
        // The fee cap does not even cover the base fee.
        return TimeBounds::Unbounded;
    };
    let effective_priority_fee = std::cmp::min(max_priority_fee_per_gas, cap);

    if effective_priority_fee < estimates.low.suggested_max_priority_fee_per_gas {
        TimeBounds::Unbounded
    } else if effective_priority_fee < estimates.medium.suggested_max_priority_fee_per_gas {
        window(&estimates.low)
    } else if effective_priority_fee < estimates.high.suggested_max_priority_fee_per_gas {
        window(&estimates.medium)
    } else if effective_priority_fee == estimates.high.suggested_max_priority_fee_per_gas {
        window(&estimates.high)
    } else {
        TimeBounds::Window {
            lower: Duration::ZERO,
            upper: estimates.high.max_wait,
        }
    }
}

fn window(tier: &FeeTierEstimate) -> TimeBounds {
    TimeBounds::Window {
        lower: tier.min_wait,
        upper: tier.max_wait,
    }
}
