//! Scenario execution against an in-process pool.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strata_core::constants::{FIXED_POINT_SCALE, SECONDS_PER_DAY, UNIT};
use strata_core::error::{LoanError, StrataError};
use strata_core::receipt::LoanReceipt;
use strata_core::traits::{CollateralFilter, CollateralLiquidator, CollateralWrapper, PriceOracle};
use strata_core::types::{AccountId, Hash256};
use strata_pool::{BorrowRequest, Pool, PoolConfig, PoolEvent, RefinanceRequest};

use crate::scenario::{parse_tick, parse_ticks, units, Action, Scenario, Step};

/// Label of the bundle wrapper token.
pub const BUNDLE_TOKEN: &str = "bundle";
/// Label the simulated liquidator reports proceeds from.
pub const LIQUIDATOR: &str = "liquidator";

struct LabelFilter(HashSet<AccountId>);

impl CollateralFilter for LabelFilter {
    fn is_supported(&self, token: &AccountId, _: u128, _: &[u8]) -> bool {
        self.0.contains(token)
    }
}

/// Bundles items of one collection, listed in the context as big-endian u128 ids.
struct BundleWrapper {
    collection: AccountId,
}

impl CollateralWrapper for BundleWrapper {
    fn token(&self) -> AccountId {
        AccountId::from_label(BUNDLE_TOKEN)
    }

    fn enumerate(&self, _: u128, context: &[u8]) -> Result<Vec<(AccountId, u128)>, LoanError> {
        if context.len() % 16 != 0 {
            return Err(LoanError::UnsupportedCollateral("malformed bundle context".into()));
        }
        Ok(context
            .chunks_exact(16)
            .map(|c| {
                let mut id = [0u8; 16];
                id.copy_from_slice(c);
                (self.collection, u128::from_be_bytes(id))
            })
            .collect())
    }
}

struct FixedOracle(u64);

impl PriceOracle for FixedOracle {
    fn price(&self, _: &AccountId, _: &AccountId, _: &[u128], _: &[u64], _: &[u8]) -> Result<u64, LoanError> {
        Ok(self.0)
    }
}

/// Records seized loans; proceeds arrive later as scenario steps.
#[derive(Clone, Default)]
struct QueueLiquidator {
    seized: Arc<Mutex<Vec<Hash256>>>,
}

impl CollateralLiquidator for QueueLiquidator {
    fn id(&self) -> AccountId {
        AccountId::from_label(LIQUIDATOR)
    }

    fn liquidate(&self, receipt_hash: &Hash256, _: &LoanReceipt) -> Result<(), LoanError> {
        self.seized.lock().push(*receipt_hash);
        Ok(())
    }
}

/// Simulator bookkeeping saved next to the pool snapshot.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct Sidecar {
    now: u64,
    /// Loan name to hex-encoded receipt.
    loans: BTreeMap<String, String>,
}

fn sidecar_path(state: &Path) -> PathBuf {
    let mut name = state.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// A pool plus the scenario's clock and named loans.
pub struct Runner {
    pool: Pool,
    liquidator: QueueLiquidator,
    collection: AccountId,
    loans: BTreeMap<String, Vec<u8>>,
    now: u64,
}

impl Runner {
    pub fn new(config: PoolConfig, scenario: &Scenario) -> Result<Self> {
        let accepted: HashSet<AccountId> =
            scenario.collections.iter().map(|c| AccountId::from_label(c)).collect();
        let collection = AccountId::from_label(&scenario.collections[0]);
        let liquidator = QueueLiquidator::default();

        let mut pool = Pool::new(config, LabelFilter(accepted), liquidator.clone())
            .context("Invalid pool configuration")?
            .with_wrapper(BundleWrapper { collection });
        if let Some(price) = scenario.oracle_price {
            pool = pool.with_oracle(FixedOracle(units(price)?));
        }

        Ok(Self { pool, liquidator, collection, loans: BTreeMap::new(), now: scenario.start })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Loans handed to the liquidator so far.
    pub fn seized(&self) -> usize {
        self.liquidator.seized.lock().len()
    }

    /// Resume from a snapshot written by [`save`](Self::save). Returns
    /// `false` if there is nothing to resume from.
    pub fn resume(&mut self, state: &Path) -> Result<bool> {
        if !state.exists() {
            return Ok(false);
        }
        self.pool
            .load_snapshot(state)
            .with_context(|| format!("Failed to load snapshot {}", state.display()))?;

        let sidecar = sidecar_path(state);
        let json = std::fs::read_to_string(&sidecar)
            .with_context(|| format!("Failed to read {}", sidecar.display()))?;
        let saved: Sidecar = serde_json::from_str(&json).context("Invalid simulator state")?;
        self.now = self.now.max(saved.now);
        for (name, receipt) in saved.loans {
            let bytes = hex::decode(&receipt).with_context(|| format!("Loan {name}: bad receipt hex"))?;
            self.loans.insert(name, bytes);
        }
        info!(state = %state.display(), now = self.now, loans = self.loans.len(), "resumed");
        Ok(true)
    }

    pub fn save(&self, state: &Path) -> Result<()> {
        self.pool
            .save_snapshot(state)
            .with_context(|| format!("Failed to save snapshot {}", state.display()))?;
        let sidecar = Sidecar {
            now: self.now,
            loans: self.loans.iter().map(|(k, v)| (k.clone(), hex::encode(v))).collect(),
        };
        let json = serde_json::to_string_pretty(&sidecar)?;
        std::fs::write(sidecar_path(state), json)?;
        info!(state = %state.display(), "saved");
        Ok(())
    }

    /// Replay `steps` in order, stopping at the first unexpected outcome.
    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            match (self.apply(&step.action)?, step.expect_error) {
                (Ok(summary), false) => debug!(step = i, %summary, "ok"),
                (Err(e), true) => debug!(step = i, error = %e, "rejected as expected"),
                (Ok(summary), true) => bail!("Step {i} ({summary}) succeeded but was expected to fail"),
                (Err(e), false) => {
                    return Err(anyhow::Error::new(e).context(format!("Step {i} failed: {:?}", step.action)));
                }
            }
        }
        Ok(())
    }

    fn receipt(&self, name: &str) -> Result<Vec<u8>> {
        self.loans.get(name).cloned().ok_or_else(|| anyhow!("Unknown loan {name}"))
    }

    /// Apply one action. The outer error is a malformed step, the inner one
    /// the pool's verdict.
    fn apply(&mut self, action: &Action) -> Result<Result<String, StrataError>> {
        let now = self.now;
        let account = |label: &str| AccountId::from_label(label);

        let outcome = match action {
            Action::Deposit { account: who, tick, amount, min_shares } => {
                let tick = parse_tick(tick)?;
                self.pool
                    .deposit(&account(who), tick, units(*amount)?, units(*min_shares)?, now)
                    .map(|shares| format!("{who} deposited {amount} at {tick} for {shares} shares"))
            }
            Action::Redeem { account: who, tick, shares } => {
                let tick = parse_tick(tick)?;
                let shares = match shares {
                    Some(s) => units(*s)?,
                    None => self
                        .pool
                        .deposit_position(&account(who), tick)
                        .map_or(0, |p| p.redeemable()),
                };
                self.pool
                    .redeem(&account(who), tick, shares, now)
                    .map(|t| format!("{who} queued {shares} shares at {tick} (index {}, target {})", t.index, t.target))
            }
            Action::Withdraw { account: who, tick } => {
                let tick = parse_tick(tick)?;
                self.pool
                    .withdraw(&account(who), tick)
                    .map(|(shares, amount)| format!("{who} withdrew {amount} for {shares} shares at {tick}"))
            }
            Action::Rebalance { account: who, from, to, min_shares } => {
                let (from, to) = (parse_tick(from)?, parse_tick(to)?);
                self.pool
                    .rebalance(&account(who), from, to, units(*min_shares)?, now)
                    .map(|(amount, shares)| format!("{who} moved {amount} from {from} to {to} for {shares} shares"))
            }
            Action::Borrow {
                loan,
                borrower,
                amount,
                duration_days,
                ticks,
                collection,
                token_id,
                bundle,
                max_repayment,
                min_rate_class,
            } => {
                if self.loans.contains_key(loan) {
                    bail!("Loan {loan} already exists");
                }
                let (collateral_token, collateral_wrapper_context) = if bundle.is_empty() {
                    let token = collection.as_deref().map_or(self.collection, account);
                    (token, Vec::new())
                } else {
                    let context = bundle.iter().flat_map(|&id| (id as u128).to_be_bytes()).collect();
                    (account(BUNDLE_TOKEN), context)
                };
                let request = BorrowRequest {
                    borrower: account(borrower),
                    principal: units(*amount)?,
                    duration: duration_days * SECONDS_PER_DAY,
                    collateral_token,
                    collateral_token_id: *token_id as u128,
                    collateral_wrapper_context,
                    ticks: parse_ticks(ticks)?,
                    max_repayment: max_repayment.map(units).transpose()?.unwrap_or(u64::MAX),
                    min_rate_class: *min_rate_class,
                };
                self.pool.borrow(&request, now).map(|originated| {
                    self.loans.insert(loan.clone(), originated.encoded_receipt);
                    format!(
                        "{loan}: {borrower} borrowed {amount}, owes {} by {}",
                        originated.receipt.repayment, originated.receipt.maturity
                    )
                })
            }
            Action::Repay { loan } => {
                let receipt = self.receipt(loan)?;
                let borrower = LoanReceipt::decode(&receipt)?.borrower;
                self.pool
                    .repay(&borrower, &receipt, now)
                    .map(|paid| format!("{loan} repaid {paid}"))
            }
            Action::Refinance { loan, new_loan, amount, duration_days, ticks, max_repayment } => {
                if self.loans.contains_key(new_loan) {
                    bail!("Loan {new_loan} already exists");
                }
                let receipt = self.receipt(loan)?;
                let borrower = LoanReceipt::decode(&receipt)?.borrower;
                let request = RefinanceRequest {
                    principal: units(*amount)?,
                    duration: duration_days * SECONDS_PER_DAY,
                    ticks: parse_ticks(ticks)?,
                    max_repayment: max_repayment.map(units).transpose()?.unwrap_or(u64::MAX),
                    min_rate_class: None,
                };
                self.pool.refinance(&borrower, &receipt, &request, now).map(|originated| {
                    self.loans.insert(new_loan.clone(), originated.encoded_receipt);
                    format!("{loan} refinanced into {new_loan}, owes {}", originated.receipt.repayment)
                })
            }
            Action::Liquidate { loan } => {
                let receipt = self.receipt(loan)?;
                self.pool.liquidate(&receipt, now).map(|hash| format!("{loan} ({hash}) liquidated"))
            }
            Action::Proceeds { loan, amount } => {
                let receipt = self.receipt(loan)?;
                let liquidator = self.liquidator.id();
                self.pool
                    .on_collateral_liquidated(&liquidator, &receipt, units(*amount)?, now)
                    .map(|()| format!("{loan} proceeds {amount} applied"))
            }
            Action::WithdrawFees { recipient, amount } => {
                let amount = match amount {
                    Some(a) => units(*a)?,
                    None => self.pool.admin_fee_balance(),
                };
                let admin = self.pool.config().admin();
                self.pool
                    .withdraw_admin_fees(&admin, &account(recipient), amount)
                    .map(|()| format!("{amount} admin fees to {recipient}"))
            }
            Action::Wait { days, seconds } => {
                self.now = days
                    .checked_mul(SECONDS_PER_DAY)
                    .and_then(|d| d.checked_add(*seconds))
                    .and_then(|d| self.now.checked_add(d))
                    .ok_or_else(|| anyhow!("Clock overflow"))?;
                Ok(format!("clock at {}", self.now))
            }
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "pool rejected step");
        }
        Ok(outcome)
    }

    /// Events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<PoolEvent> {
        self.pool.drain_events()
    }

    /// Node table, one row per linked node.
    pub fn node_table(&self) -> String {
        let mut out = format!(
            "{:<28} {:>16} {:>16} {:>16} {:>16} {:>12}\n",
            "tick", "value", "shares", "available", "pending", "price"
        );
        for node in self.pool.liquidity().iter() {
            let price = node.share_price(self.now) as f64 / FIXED_POINT_SCALE as f64;
            out.push_str(&format!(
                "{:<28} {:>16.8} {:>16.8} {:>16.8} {:>16.8} {:>12.6}\n",
                node.tick.to_string(),
                node.value as f64 / UNIT as f64,
                node.shares as f64 / UNIT as f64,
                node.available as f64 / UNIT as f64,
                node.pending as f64 / UNIT as f64,
                price,
            ));
        }
        out
    }
}
