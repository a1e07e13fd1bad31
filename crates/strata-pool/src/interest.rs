//! Default interest pricing.

use strata_core::constants::{BPS_PRECISION, FIXED_POINT_SCALE};
use strata_core::error::LoanError;
use strata_core::tick::Tick;
use strata_core::traits::{InterestRateModel, Pricing};

/// Simple interest at each tick's rate class.
///
/// Per node: `interest = used * rate * duration`, of which `admin_fee_bps`
/// goes to the admin and the rest is owed back to the node on top of `used`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickRateModel;

fn overflow() -> LoanError {
    LoanError::ArithmeticOverflow
}

impl InterestRateModel for TickRateModel {
    fn price(
        &self,
        duration: u64,
        plan: &[(Tick, u64)],
        rates: &[u128],
        admin_fee_bps: u64,
    ) -> Result<Pricing, LoanError> {
        let mut repayment = 0u64;
        let mut admin_fee = 0u64;
        let mut pending = Vec::with_capacity(plan.len());

        for &(tick, used) in plan {
            let params = tick
                .decode()
                .map_err(|e| LoanError::ParameterOutOfBounds(format!("tick {tick}: {e}")))?;
            let rate = *rates.get(params.rate_class as usize).ok_or_else(|| {
                LoanError::ParameterOutOfBounds(format!("rate class {}", params.rate_class))
            })?;

            let interest = (used as u128)
                .checked_mul(rate)
                .and_then(|v| v.checked_mul(duration as u128))
                .ok_or_else(overflow)?
                / FIXED_POINT_SCALE;
            let interest = u64::try_from(interest).map_err(|_| overflow())?;
            let fee = (interest as u128 * admin_fee_bps as u128 / BPS_PRECISION as u128) as u64;

            pending.push(used.checked_add(interest - fee).ok_or_else(overflow)?);
            repayment = repayment
                .checked_add(used)
                .and_then(|v| v.checked_add(interest))
                .ok_or_else(overflow)?;
            admin_fee += fee;
        }

        Ok(Pricing { repayment, admin_fee, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::constants::{SECONDS_PER_YEAR, UNIT};
    use strata_core::tick::TickParams;

    fn tick(limit: u64, rate_class: u8) -> Tick {
        Tick::encode(&TickParams::absolute(limit, 0, rate_class)).unwrap()
    }

    fn per_second(bps: u64) -> u128 {
        bps as u128 * FIXED_POINT_SCALE / BPS_PRECISION as u128 / SECONDS_PER_YEAR as u128
    }

    #[test]
    fn zero_rate_costs_nothing() {
        let pricing = TickRateModel.price(SECONDS_PER_YEAR, &[(tick(10, 0), 5 * UNIT)], &[0], 500).unwrap();
        assert_eq!(pricing, Pricing { repayment: 5 * UNIT, admin_fee: 0, pending: vec![5 * UNIT] });
    }

    #[test]
    fn interest_follows_rate_class() {
        let rates = [per_second(1_000), per_second(2_000)];
        let plan = [(tick(10, 0), 10 * UNIT), (tick(20, 1), 10 * UNIT)];
        let pricing = TickRateModel.price(SECONDS_PER_YEAR, &plan, &rates, 0).unwrap();
        // 10% and 20% over one year, rounded down by the per-second conversion.
        assert!(pricing.pending[0].abs_diff(11 * UNIT) <= 1);
        assert!(pricing.pending[1].abs_diff(12 * UNIT) <= 1);
        assert_eq!(pricing.repayment, pricing.pending.iter().sum::<u64>());
    }

    #[test]
    fn admin_fee_is_carved_from_interest() {
        let rates = [per_second(1_000)];
        let plan = [(tick(10, 0), 100 * UNIT)];
        let pricing = TickRateModel.price(SECONDS_PER_YEAR, &plan, &rates, 1_000).unwrap();
        let interest = pricing.repayment - 100 * UNIT;
        assert_eq!(pricing.admin_fee, interest / 10);
        assert_eq!(pricing.pending[0] + pricing.admin_fee, pricing.repayment);
    }

    #[test]
    fn unknown_rate_class_is_rejected() {
        let err = TickRateModel.price(100, &[(tick(10, 3), 1)], &[0], 0).unwrap_err();
        assert!(matches!(err, LoanError::ParameterOutOfBounds(_)));
    }
}
