//! Pool state persistence.
//!
//! The mutable [`PoolState`](crate::pool::PoolState) is encoded with bincode's
//! standard configuration. Configuration and collaborators are not part of a
//! snapshot; they are supplied again when the pool is rebuilt.

use std::path::Path;

use tracing::info;

use strata_core::error::StrataError;

use crate::pool::{Pool, PoolState};

fn snapshot_error(e: impl ToString) -> StrataError {
    StrataError::Snapshot(e.to_string())
}

impl Pool {
    /// Encode the pool state.
    pub fn snapshot(&self) -> Result<Vec<u8>, StrataError> {
        bincode::encode_to_vec(&self.state, bincode::config::standard()).map_err(snapshot_error)
    }

    /// Replace the pool state with a decoded snapshot.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), StrataError> {
        let (state, read): (PoolState, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(snapshot_error)?;
        if read != bytes.len() {
            return Err(StrataError::Snapshot(format!("{} trailing bytes", bytes.len() - read)));
        }
        self.state = state;
        Ok(())
    }

    /// Write a snapshot to `path`.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StrataError> {
        let bytes = self.snapshot()?;
        std::fs::write(path, &bytes).map_err(snapshot_error)?;
        info!(path = %path.display(), bytes = bytes.len(), "saved pool snapshot");
        Ok(())
    }

    /// Load a snapshot from `path`.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<(), StrataError> {
        let bytes = std::fs::read(path).map_err(snapshot_error)?;
        self.restore_snapshot(&bytes)?;
        info!(path = %path.display(), "loaded pool snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strata_core::constants::{SECONDS_PER_DAY, UNIT};
    use strata_core::error::{LoanError, StrataError};
    use strata_core::receipt::LoanReceipt;
    use strata_core::tick::{Tick, TickParams};
    use strata_core::traits::{CollateralFilter, CollateralLiquidator};
    use strata_core::types::{AccountId, Hash256};

    use crate::config::PoolConfig;
    use crate::pool::{BorrowRequest, LoanStatus, Pool};

    struct AllowAll;

    impl CollateralFilter for AllowAll {
        fn is_supported(&self, _: &AccountId, _: u128, _: &[u8]) -> bool {
            true
        }
    }

    struct NoopLiquidator;

    impl CollateralLiquidator for NoopLiquidator {
        fn id(&self) -> AccountId {
            AccountId::from_label("liquidator")
        }

        fn liquidate(&self, _: &Hash256, _: &LoanReceipt) -> Result<(), LoanError> {
            Ok(())
        }
    }

    fn pool() -> Pool {
        Pool::new(PoolConfig::default(), AllowAll, NoopLiquidator).unwrap()
    }

    fn populated() -> (Pool, Hash256, Vec<u8>) {
        let mut pool = pool();
        let lender = AccountId::from_label("lender");
        let borrower = AccountId::from_label("borrower");
        let t = Tick::encode(&TickParams::absolute(10 * UNIT, 2, 1)).unwrap();
        pool.deposit(&lender, t, 20 * UNIT, 0, 1_000).unwrap();
        let loan = pool
            .borrow(
                &BorrowRequest {
                    borrower,
                    principal: 5 * UNIT,
                    duration: 30 * SECONDS_PER_DAY,
                    collateral_token: AccountId::from_label("collection"),
                    collateral_token_id: 9,
                    collateral_wrapper_context: Vec::new(),
                    ticks: vec![t],
                    max_repayment: u64::MAX,
                    min_rate_class: None,
                },
                1_000,
            )
            .unwrap();
        (pool, loan.receipt_hash, loan.encoded_receipt)
    }

    #[test]
    fn snapshot_restores_full_state() {
        let (original, hash, encoded) = populated();
        let bytes = original.snapshot().unwrap();

        let mut restored = pool();
        restored.restore_snapshot(&bytes).unwrap();
        assert_eq!(restored.cash(), original.cash());
        assert_eq!(restored.events(), original.events());
        assert_eq!(restored.loan_status(&hash), Some(LoanStatus::Active));
        assert_eq!(
            restored.liquidity_nodes(Tick::HEAD, Tick::TAIL),
            original.liquidity_nodes(Tick::HEAD, Tick::TAIL)
        );

        // The restored pool keeps working.
        let borrower = AccountId::from_label("borrower");
        restored.repay(&borrower, &encoded, 2_000).unwrap();
        assert_eq!(restored.loan_status(&hash), Some(LoanStatus::Repaid));
    }

    #[test]
    fn snapshot_file_round_trip() {
        let (original, hash, _) = populated();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.snapshot");
        original.save_snapshot(&path).unwrap();

        let mut restored = pool();
        restored.load_snapshot(&path).unwrap();
        assert_eq!(restored.loan_status(&hash), Some(LoanStatus::Active));
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let (original, _, _) = populated();
        let mut bytes = original.snapshot().unwrap();
        bytes.truncate(bytes.len() / 2);
        let mut restored = pool();
        assert!(matches!(restored.restore_snapshot(&bytes), Err(StrataError::Snapshot(_))));
        assert_eq!(restored.cash(), 0);

        let mut padded = original.snapshot().unwrap();
        padded.push(0);
        assert!(matches!(restored.restore_snapshot(&padded), Err(StrataError::Snapshot(_))));
    }
}
