//! Thread-safe pool handle.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use strata_core::error::StrataError;

use crate::pool::Pool;

/// Cloneable handle serializing all access to one [`Pool`].
///
/// Callers are admitted in lock order; each call is one transaction.
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<Mutex<Pool>>,
}

impl SharedPool {
    pub fn new(pool: Pool) -> Self {
        Self { inner: Arc::new(Mutex::new(pool)) }
    }

    /// Run `op` as a single transaction under the lock.
    pub fn transact<T>(&self, op: impl FnOnce(&mut Pool) -> Result<T, StrataError>) -> Result<T, StrataError> {
        self.inner.lock().atomically(op)
    }

    /// Read-only access under the lock.
    pub fn read<T>(&self, op: impl FnOnce(&Pool) -> T) -> T {
        op(&self.inner.lock())
    }

    /// Hold the lock across several calls.
    pub fn lock(&self) -> MutexGuard<'_, Pool> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use strata_core::constants::UNIT;
    use strata_core::error::{LiquidityError, LoanError};
    use strata_core::receipt::LoanReceipt;
    use strata_core::tick::{Tick, TickParams};
    use strata_core::traits::{CollateralFilter, CollateralLiquidator};
    use strata_core::types::{AccountId, Hash256};

    use crate::config::PoolConfig;

    struct AllowAll;

    impl CollateralFilter for AllowAll {
        fn is_supported(&self, _: &AccountId, _: u128, _: &[u8]) -> bool {
            true
        }
    }

    struct NoopLiquidator;

    impl CollateralLiquidator for NoopLiquidator {
        fn id(&self) -> AccountId {
            AccountId::ZERO
        }

        fn liquidate(&self, _: &Hash256, _: &LoanReceipt) -> Result<(), LoanError> {
            Ok(())
        }
    }

    fn shared() -> SharedPool {
        SharedPool::new(Pool::new(PoolConfig::default(), AllowAll, NoopLiquidator).unwrap())
    }

    #[test]
    fn concurrent_deposits_are_serialized() {
        let pool = shared();
        let t = Tick::encode(&TickParams::absolute(10 * UNIT, 0, 0)).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let account = AccountId::from_label(&format!("lender-{i}"));
                    for _ in 0..10 {
                        pool.transact(|p| p.deposit(&account, t, UNIT, 0, 1_000)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let node = pool.read(|p| p.liquidity_node(t)).unwrap();
        assert_eq!(node.value, 80 * UNIT);
        assert_eq!(node.shares, 80 * UNIT);
        assert_eq!(pool.read(|p| p.cash()), 80 * UNIT);
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let pool = shared();
        let t = Tick::encode(&TickParams::absolute(10 * UNIT, 0, 0)).unwrap();
        let account = AccountId::from_label("lender");
        let err = pool
            .transact(|p| {
                p.deposit(&account, t, UNIT, 0, 1_000)?;
                p.redeem(&account, t, 2 * UNIT, 1_000)
            })
            .unwrap_err();
        assert!(matches!(err, StrataError::Liquidity(LiquidityError::RedemptionExceedsShares { .. })));
        assert!(pool.lock().liquidity_node(t).is_none());
    }
}
