//! Error types for the Strata lending pool.
use thiserror::Error;

use crate::tick::Tick;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("invalid limit type discriminant: {0}")] InvalidLimitType(u8),
    #[error("invalid ratio scale: {0}")] InvalidScale(u8),
    #[error("non-zero reserved bits")] ReservedBits,
    #[error("{kind} class {index} out of range")] ClassOutOfRange { kind: &'static str, index: u8 },
    #[error("ratio tick requires a collateral price")] MissingPrice,
    #[error("effective limit overflow")] LimitOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("truncated receipt: need {needed} bytes, have {remaining}")] Truncated { needed: usize, remaining: usize },
    #[error("unsupported receipt version: {0}")] UnsupportedVersion(u8),
    #[error("trailing bytes after receipt: {0}")] TrailingBytes(usize),
    #[error("wrapper context too long: {0} bytes")] ContextTooLong(usize),
    #[error("receipt has no node receipts")] NoNodeReceipts,
    #[error("too many node receipts: {0}")] TooManyNodeReceipts(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiquidityError {
    #[error("invalid tick {tick}: {reason}")] InvalidTick { tick: Tick, reason: String },
    #[error("insufficient spacing between tick {tick} and {neighbor}")] InsufficientTickSpacing { tick: Tick, neighbor: Tick },
    #[error("inactive liquidity at tick {0}")] InactiveLiquidity(Tick),
    #[error("insufficient liquidity: sourced {sourced}, needed {needed}")] InsufficientLiquidity { sourced: u64, needed: u64 },
    #[error("insufficient shares: minted {minted}, minimum {minimum}")] InsufficientShares { minted: u64, minimum: u64 },
    #[error("redemption of {requested} shares exceeds redeemable {redeemable}")] RedemptionExceedsShares { requested: u64, redeemable: u64 },
    #[error("unknown liquidity node: {0}")] UnknownNode(Tick),
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoanError {
    #[error("invalid loan receipt: {0}")] InvalidLoanReceipt(String),
    #[error("invalid caller: {0}")] InvalidCaller(String),
    #[error("repayment too high: {repayment} > {max}")] RepaymentTooHigh { repayment: u64, max: u64 },
    #[error("parameter out of bounds: {0}")] ParameterOutOfBounds(String),
    #[error("unsupported collateral: {0}")] UnsupportedCollateral(String),
    #[error("loan expired: {0}")] LoanExpired(String),
    #[error("loan not expired: {0}")] LoanNotExpired(String),
    #[error("collaborator failure: {0}")] Collaborator(String),
    #[error("arithmetic overflow")] ArithmeticOverflow,
    #[error(transparent)] Receipt(#[from] ReceiptError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")] Load(String),
    #[error("invalid durations: {0}")] InvalidDurations(String),
    #[error("invalid rates: {0}")] InvalidRates(String),
    #[error("invalid {field}: {value}")] OutOfRange { field: &'static str, value: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrataError {
    #[error(transparent)] Tick(#[from] TickError),
    #[error(transparent)] Receipt(#[from] ReceiptError),
    #[error(transparent)] Liquidity(#[from] LiquidityError),
    #[error(transparent)] Loan(#[from] LoanError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("snapshot: {0}")] Snapshot(String),
}
