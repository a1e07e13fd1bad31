//! Trait interfaces for the pool's external collaborators.
//!
//! The engine never decides collateral admission, valuation or disposal on its
//! own; it consults these seams:
//! - [`CollateralFilter`]: is this collateral accepted at all
//! - [`CollateralWrapper`]: bundles of several collateral items under one id
//! - [`PriceOracle`]: collateral price used to resolve ratio ticks
//! - [`CollateralLiquidator`]: receives seized collateral, reports proceeds later
//! - [`InterestRateModel`]: turns a funding plan into node repayments

use crate::error::LoanError;
use crate::receipt::LoanReceipt;
use crate::tick::Tick;
use crate::types::{AccountId, Hash256};

/// Collateral admission test, consulted once per borrow.
pub trait CollateralFilter: Send + Sync {
    /// Whether `token_id` of `token` may back a loan.
    fn is_supported(&self, token: &AccountId, token_id: u128, context: &[u8]) -> bool;
}

/// A token whose ids stand for bundles of underlying collateral.
pub trait CollateralWrapper: Send + Sync {
    /// The wrapper token this implementation is responsible for.
    fn token(&self) -> AccountId;

    /// Underlying `(token, token_id)` pairs bundled under `token_id`.
    ///
    /// `context` is the wrapper context the borrower supplied; it is embedded
    /// verbatim in the loan receipt.
    fn enumerate(&self, token_id: u128, context: &[u8]) -> Result<Vec<(AccountId, u128)>, LoanError>;

    /// Number of underlying items, used as the allocator's cap multiplier.
    ///
    /// Default implementation counts [`enumerate`](Self::enumerate).
    fn count(&self, token_id: u128, context: &[u8]) -> Result<u64, LoanError> {
        Ok(self.enumerate(token_id, context)?.len() as u64)
    }
}

/// Collateral price source for ratio ticks.
pub trait PriceOracle: Send + Sync {
    /// Price of one unit of `base` collateral in `quote` currency base units.
    ///
    /// `ids` and `counts` describe the collateral items being priced.
    fn price(
        &self,
        base: &AccountId,
        quote: &AccountId,
        ids: &[u128],
        counts: &[u64],
        context: &[u8],
    ) -> Result<u64, LoanError>;
}

/// Disposer of seized collateral.
///
/// Liquidation is two-phase: the pool hands over the collateral through
/// [`liquidate`](Self::liquidate), and the liquidator later reports sale
/// proceeds back to the pool under its own [`id`](Self::id).
pub trait CollateralLiquidator: Send + Sync {
    /// Account the liquidator reports proceeds from.
    fn id(&self) -> AccountId;

    /// Take custody of the collateral backing `receipt`.
    fn liquidate(&self, receipt_hash: &Hash256, receipt: &LoanReceipt) -> Result<(), LoanError>;
}

/// Outcome of pricing a funding plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pricing {
    /// Total repayment owed by the borrower at maturity.
    pub repayment: u64,
    /// Portion of `repayment` owed to the pool admin.
    pub admin_fee: u64,
    /// Amount owed back to each node, in plan order.
    pub pending: Vec<u64>,
}

/// Interest pricing of a funding plan.
pub trait InterestRateModel: Send + Sync {
    /// Price a plan of `(tick, used)` pairs for a loan of `duration` seconds.
    ///
    /// `rates` are the pool's per-second rates scaled by
    /// [`FIXED_POINT_SCALE`](crate::constants::FIXED_POINT_SCALE), indexed by
    /// rate class. `admin_fee_bps` is the admin share of interest.
    fn price(
        &self,
        duration: u64,
        plan: &[(Tick, u64)],
        rates: &[u128],
        admin_fee_bps: u64,
    ) -> Result<Pricing, LoanError>;
}
