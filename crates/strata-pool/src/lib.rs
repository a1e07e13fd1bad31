//! # strata-pool
//! Loan lifecycle orchestration for the Strata lending pool.
//!
//! - [`config`]: pool parameters, loaded from file and environment
//! - [`interest`]: default per-tick interest pricing
//! - [`pool`]: deposits, redemptions, borrow/repay/refinance/liquidate
//! - [`events`]: record of committed transitions
//! - [`shared`]: lock-serialized handle
//! - [`snapshot`]: bincode persistence of pool state

pub mod config;
pub mod events;
pub mod interest;
pub mod pool;
pub mod shared;
pub mod snapshot;

pub use config::PoolConfig;
pub use events::PoolEvent;
pub use interest::TickRateModel;
pub use pool::{BorrowRequest, LoanStatus, Originated, Pool, PoolState, Quote, RefinanceRequest};
pub use shared::SharedPool;
