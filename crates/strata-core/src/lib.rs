//! # strata-core
//! Foundation types for the Strata lending pool: the tick codec, loan receipt
//! layout, error taxonomy and the traits through which the pool talks to its
//! external collaborators.

pub mod constants;
pub mod error;
pub mod receipt;
pub mod tick;
pub mod traits;
pub mod types;

pub use error::StrataError;
pub use receipt::{LoanReceipt, NodeReceipt};
pub use tick::{LimitType, Tick, TickParams};
pub use types::{AccountId, Hash256};
