//! # strata-liquidity
//! Tick-indexed liquidity for the Strata lending pool.
//!
//! - [`node`]: sorted node store, share accounting and interest accrual
//! - [`redemption`]: FIFO redemption queue and its settlement ledger
//! - [`source`]: allocator drawing loan principal across ticks

pub mod node;
pub mod redemption;
pub mod source;

pub use node::{AccrualInfo, LiquidityNode, LiquidityStore, StoreTotals};
pub use redemption::{DepositPosition, RedemptionTicket};
pub use source::{NodeSource, SourceRequest};
