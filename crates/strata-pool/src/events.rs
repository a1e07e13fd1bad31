//! Pool events, recorded for every committed state transition.

use serde::{Deserialize, Serialize};

use strata_core::tick::Tick;
use strata_core::types::{AccountId, Hash256};

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Deposited { account: AccountId, tick: Tick, amount: u64, shares: u64 },
    Redeemed { account: AccountId, tick: Tick, shares: u64, index: u64, target: u64 },
    Withdrawn { account: AccountId, tick: Tick, shares: u64, amount: u64 },
    LoanOriginated { receipt_hash: Hash256, borrower: AccountId, principal: u64, repayment: u64 },
    LoanRepaid { receipt_hash: Hash256, repayment: u64 },
    LoanRefinanced { receipt_hash: Hash256, new_receipt_hash: Hash256 },
    LoanLiquidated { receipt_hash: Hash256 },
    CollateralLiquidated { receipt_hash: Hash256, proceeds: u64 },
    NodeImpaired { tick: Tick },
    AdminFeesWithdrawn { recipient: AccountId, amount: u64 },
}

impl PoolEvent {
    /// Short name, as used in the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "deposited",
            Self::Redeemed { .. } => "redeemed",
            Self::Withdrawn { .. } => "withdrawn",
            Self::LoanOriginated { .. } => "loan_originated",
            Self::LoanRepaid { .. } => "loan_repaid",
            Self::LoanRefinanced { .. } => "loan_refinanced",
            Self::LoanLiquidated { .. } => "loan_liquidated",
            Self::CollateralLiquidated { .. } => "collateral_liquidated",
            Self::NodeImpaired { .. } => "node_impaired",
            Self::AdminFeesWithdrawn { .. } => "admin_fees_withdrawn",
        }
    }
}
