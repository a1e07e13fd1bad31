//! Shared test helpers: collaborators, tick builders and pool setup.

use std::sync::Arc;

use parking_lot::Mutex;

use strata_core::constants::{SECONDS_PER_DAY, UNIT};
use strata_core::error::LoanError;
use strata_core::receipt::LoanReceipt;
use strata_core::tick::{Tick, TickParams};
use strata_core::traits::{CollateralFilter, CollateralLiquidator, CollateralWrapper, PriceOracle};
use strata_core::types::{AccountId, Hash256};
use strata_pool::{BorrowRequest, Pool, PoolConfig};

/// Arbitrary genesis timestamp.
pub const T0: u64 = 1_700_000_000;

pub const DAYS_30: u64 = 30 * SECONDS_PER_DAY;

pub fn account(label: &str) -> AccountId {
    AccountId::from_label(label)
}

pub fn collection() -> AccountId {
    account("collection")
}

pub fn bundle_token() -> AccountId {
    account("bundle")
}

pub fn liquidator_id() -> AccountId {
    account("liquidator")
}

/// Absolute tick with a limit in whole units.
pub fn abs_tick(limit: u64, duration_class: u8, rate_class: u8) -> Tick {
    Tick::encode(&TickParams::absolute(limit * UNIT, duration_class, rate_class)).unwrap()
}

/// Ratio tick `limit / 10^scale` of the collateral price.
pub fn ratio_tick(limit: u64, scale: u8, duration_class: u8, rate_class: u8) -> Tick {
    Tick::encode(&TickParams::ratio(limit, scale, duration_class, rate_class)).unwrap()
}

/// Accepts the test collection only.
pub struct CollectionFilter;

impl CollateralFilter for CollectionFilter {
    fn is_supported(&self, token: &AccountId, _: u128, _: &[u8]) -> bool {
        *token == collection()
    }
}

/// Bundles collection items listed in the context as big-endian u128 ids.
pub struct BundleWrapper;

impl CollateralWrapper for BundleWrapper {
    fn token(&self) -> AccountId {
        bundle_token()
    }

    fn enumerate(&self, _token_id: u128, context: &[u8]) -> Result<Vec<(AccountId, u128)>, LoanError> {
        if context.len() % 16 != 0 {
            return Err(LoanError::UnsupportedCollateral("malformed bundle context".into()));
        }
        Ok(context
            .chunks_exact(16)
            .map(|c| {
                let mut id = [0u8; 16];
                id.copy_from_slice(c);
                (collection(), u128::from_be_bytes(id))
            })
            .collect())
    }
}

/// Encode bundle ids as a wrapper context.
pub fn bundle_context(ids: &[u128]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

/// Constant oracle price.
pub struct FixedOracle(pub u64);

impl PriceOracle for FixedOracle {
    fn price(&self, _: &AccountId, _: &AccountId, _: &[u128], _: &[u64], _: &[u8]) -> Result<u64, LoanError> {
        Ok(self.0)
    }
}

/// Liquidator that queues seized loans for the test to settle.
#[derive(Clone, Default)]
pub struct QueueLiquidator {
    pub seized: Arc<Mutex<Vec<(Hash256, LoanReceipt)>>>,
}

impl CollateralLiquidator for QueueLiquidator {
    fn id(&self) -> AccountId {
        liquidator_id()
    }

    fn liquidate(&self, receipt_hash: &Hash256, receipt: &LoanReceipt) -> Result<(), LoanError> {
        self.seized.lock().push((*receipt_hash, receipt.clone()));
        Ok(())
    }
}

/// Durations 7/14/30 days; rates 0%, 10%, 20%, 40%; admin fee 5%.
pub fn test_config() -> PoolConfig {
    PoolConfig {
        rates_bps: vec![0, 1_000, 2_000, 4_000],
        ..PoolConfig::default()
    }
}

/// A pool accepting the test collection and bundles of it, with a handle on
/// the liquidator queue.
pub fn test_pool() -> (Pool, QueueLiquidator) {
    let liquidator = QueueLiquidator::default();
    let pool = Pool::new(test_config(), CollectionFilter, liquidator.clone())
        .unwrap()
        .with_wrapper(BundleWrapper)
        .with_oracle(FixedOracle(100 * UNIT));
    (pool, liquidator)
}

/// A 30-day borrow of collection item 1 with no repayment cap.
pub fn borrow_request(borrower: &str, principal: u64, ticks: Vec<Tick>) -> BorrowRequest {
    BorrowRequest {
        borrower: account(borrower),
        principal,
        duration: DAYS_30,
        collateral_token: collection(),
        collateral_token_id: 1,
        collateral_wrapper_context: Vec::new(),
        ticks,
        max_repayment: u64::MAX,
        min_rate_class: None,
    }
}

/// Pool cash equals what nodes, parked redemptions and admin fees account for.
pub fn assert_conserved(pool: &Pool) {
    assert_eq!(pool.cash(), pool.accounted_cash(), "cash not conserved");
}
