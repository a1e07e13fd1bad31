//! Loan lifecycle.
//!
//! [`Pool`] owns the liquidity store, depositor positions and the loan status
//! table, and drives them through borrow → repay / refinance / liquidate.
//! Every public mutation runs as a transaction: the live state is
//! checkpointed first and restored if any step fails, so an error never leaves
//! a partial mutation behind. The loan status table and the event log only
//! grow, so they are journaled instead of copied: a rollback undoes the
//! status changes and truncates the events written since the checkpoint.
//!
//! Loans are identified solely by the hash of their encoded receipt. The
//! receipt bytes are handed to the borrower on origination and must be
//! presented verbatim on every later lifecycle call.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strata_core::constants::{FIXED_POINT_SCALE, LOAN_RECEIPT_VERSION};
use strata_core::error::{LiquidityError, LoanError, StrataError};
use strata_core::receipt::{hash_encoded, LoanReceipt, NodeReceipt};
use strata_core::tick::{LimitType, Tick};
use strata_core::traits::{
    CollateralFilter, CollateralLiquidator, CollateralWrapper, InterestRateModel, PriceOracle,
    Pricing,
};
use strata_core::types::{AccountId, Hash256};
use strata_liquidity::{
    AccrualInfo, DepositPosition, LiquidityNode, LiquidityStore, NodeSource, RedemptionTicket,
    SourceRequest,
};

use crate::config::PoolConfig;
use crate::events::PoolEvent;
use crate::interest::TickRateModel;

/// Lifecycle state of a loan receipt.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Repaid,
    Refinanced,
    /// Collateral handed to the liquidator, proceeds not yet reported.
    Liquidating,
    Liquidated,
}

/// Parameters of a new loan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BorrowRequest {
    pub borrower: AccountId,
    pub principal: u64,
    /// Loan duration in seconds.
    pub duration: u64,
    pub collateral_token: AccountId,
    pub collateral_token_id: u128,
    /// Opaque context for a collateral wrapper; embedded in the receipt.
    pub collateral_wrapper_context: Vec<u8>,
    /// Candidate ticks, strictly increasing by effective limit.
    pub ticks: Vec<Tick>,
    /// Borrow fails if the repayment would exceed this.
    pub max_repayment: u64,
    /// Optional floor on the rate class of sourced ticks.
    pub min_rate_class: Option<u8>,
}

/// Terms of a new loan against an existing loan's collateral.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefinanceRequest {
    pub principal: u64,
    pub duration: u64,
    pub ticks: Vec<Tick>,
    pub max_repayment: u64,
    pub min_rate_class: Option<u8>,
}

/// Funding plan and price of a prospective loan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quote {
    pub repayment: u64,
    pub admin_fee: u64,
    pub plan: Vec<NodeSource>,
}

/// Result of a successful borrow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Originated {
    pub receipt_hash: Hash256,
    /// Receipt bytes to present on repay, refinance or liquidation.
    pub encoded_receipt: Vec<u8>,
    pub receipt: LoanReceipt,
}

/// Collaborators and derived configuration. Never mutated by transactions.
struct PoolEnv {
    config: PoolConfig,
    rates: Vec<u128>,
    currency: AccountId,
    admin: AccountId,
    filter: Box<dyn CollateralFilter>,
    wrappers: HashMap<AccountId, Box<dyn CollateralWrapper>>,
    oracle: Option<Box<dyn PriceOracle>>,
    liquidator: Box<dyn CollateralLiquidator>,
    rate_model: Box<dyn InterestRateModel>,
}

/// Status of every loan ever originated, with an undo journal for the
/// transaction in progress.
#[derive(Debug, Default, bincode::Encode, bincode::Decode)]
pub(crate) struct LoanBook {
    statuses: HashMap<Hash256, LoanStatus>,
    journal: Vec<(Hash256, Option<LoanStatus>)>,
}

impl LoanBook {
    pub(crate) fn get(&self, hash: &Hash256) -> Option<LoanStatus> {
        self.statuses.get(hash).copied()
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.statuses.contains_key(hash)
    }

    fn set(&mut self, hash: Hash256, status: LoanStatus) {
        let previous = self.statuses.insert(hash, status);
        self.journal.push((hash, previous));
    }

    fn undo(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some((hash, previous)) = self.journal.pop() else { break };
            match previous {
                Some(status) => self.statuses.insert(hash, status),
                None => self.statuses.remove(&hash),
            };
        }
    }

    fn commit(&mut self) {
        self.journal.clear();
    }
}

/// Mutable pool state, checkpointed around every transaction.
#[derive(Debug, bincode::Encode, bincode::Decode)]
pub struct PoolState {
    pub(crate) liquidity: LiquidityStore,
    pub(crate) deposits: HashMap<(AccountId, Tick), DepositPosition>,
    pub(crate) loans: LoanBook,
    /// Currency held by the pool.
    pub(crate) cash: u64,
    pub(crate) admin_fee_balance: u64,
    pub(crate) events: Vec<PoolEvent>,
}

/// Rollback point: copies of the live state plus journal marks.
struct Checkpoint {
    liquidity: LiquidityStore,
    deposits: HashMap<(AccountId, Tick), DepositPosition>,
    cash: u64,
    admin_fee_balance: u64,
    loans: usize,
    events: usize,
}

impl PoolState {
    fn new(spacing_bps: u64) -> Self {
        Self {
            liquidity: LiquidityStore::with_spacing(spacing_bps),
            deposits: HashMap::new(),
            loans: LoanBook::default(),
            cash: 0,
            admin_fee_balance: 0,
            events: Vec::new(),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            liquidity: self.liquidity.clone(),
            deposits: self.deposits.clone(),
            cash: self.cash,
            admin_fee_balance: self.admin_fee_balance,
            loans: self.loans.journal.len(),
            events: self.events.len(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.liquidity = checkpoint.liquidity;
        self.deposits = checkpoint.deposits;
        self.cash = checkpoint.cash;
        self.admin_fee_balance = checkpoint.admin_fee_balance;
        self.loans.undo(checkpoint.loans);
        self.events.truncate(checkpoint.events);
    }
}

fn overflow() -> LoanError {
    LoanError::ArithmeticOverflow
}

fn prorate(amount: u64, proration: u128) -> u64 {
    (amount as u128 * proration / FIXED_POINT_SCALE) as u64
}

impl PoolEnv {
    /// Underlying collateral items, after admission.
    fn collateral(
        &self,
        token: &AccountId,
        token_id: u128,
        context: &[u8],
    ) -> Result<Vec<(AccountId, u128)>, LoanError> {
        match self.wrappers.get(token) {
            Some(wrapper) => {
                let items = wrapper.enumerate(token_id, context)?;
                if items.is_empty() {
                    return Err(LoanError::UnsupportedCollateral(format!("empty bundle {token}/{token_id}")));
                }
                for (t, id) in &items {
                    if !self.filter.is_supported(t, *id, &[]) {
                        return Err(LoanError::UnsupportedCollateral(format!("{t}/{id}")));
                    }
                }
                Ok(items)
            }
            None => {
                if !self.filter.is_supported(token, token_id, context) {
                    return Err(LoanError::UnsupportedCollateral(format!("{token}/{token_id}")));
                }
                Ok(vec![(*token, token_id)])
            }
        }
    }

    /// Oracle price per collateral item, fetched only when a ratio tick needs it.
    fn price(
        &self,
        ticks: &[Tick],
        items: &[(AccountId, u128)],
        context: &[u8],
    ) -> Result<Option<u64>, LoanError> {
        let needs_price = ticks
            .iter()
            .any(|t| t.decode().is_ok_and(|p| p.limit_type == LimitType::Ratio));
        let (Some(oracle), true) = (&self.oracle, needs_price) else {
            return Ok(None);
        };
        let base = items.first().map_or(AccountId::ZERO, |(t, _)| *t);
        let ids: Vec<u128> = items.iter().map(|(_, id)| *id).collect();
        let counts = vec![1u64; ids.len()];
        oracle.price(&base, &self.currency, &ids, &counts, context).map(Some)
    }
}

impl PoolState {
    /// Source and price a loan without touching state.
    fn plan(
        &self,
        env: &PoolEnv,
        request: &BorrowRequest,
    ) -> Result<(Vec<NodeSource>, Pricing), StrataError> {
        if request.principal == 0 {
            return Err(LoanError::ParameterOutOfBounds("zero principal".into()).into());
        }
        if request.duration == 0 {
            return Err(LoanError::ParameterOutOfBounds("zero duration".into()).into());
        }
        let duration_class = env.config.duration_class(request.duration).ok_or_else(|| {
            LoanError::ParameterOutOfBounds(format!("unsupported duration {}", request.duration))
        })?;

        let items = env.collateral(
            &request.collateral_token,
            request.collateral_token_id,
            &request.collateral_wrapper_context,
        )?;
        let price = env.price(&request.ticks, &items, &request.collateral_wrapper_context)?;

        let sources = self.liquidity.source(&SourceRequest {
            amount: request.principal,
            ticks: &request.ticks,
            multiplier: items.len() as u64,
            min_duration_class: duration_class,
            min_rate_class: request.min_rate_class,
            price,
            max_nodes: env.config.max_node_receipts,
        })?;

        let plan: Vec<(Tick, u64)> = sources.iter().map(|s| (s.tick, s.used)).collect();
        let pricing = env.rate_model.price(
            request.duration,
            &plan,
            &env.rates,
            env.config.admin_fee_bps,
        )?;
        if pricing.pending.len() != sources.len() {
            return Err(LoanError::Collaborator(format!(
                "rate model priced {} of {} nodes",
                pricing.pending.len(),
                sources.len()
            ))
            .into());
        }
        Ok((sources, pricing))
    }

    fn borrow(
        &mut self,
        env: &PoolEnv,
        request: &BorrowRequest,
        now: u64,
    ) -> Result<Originated, StrataError> {
        let (sources, pricing) = self.plan(env, request)?;
        if pricing.repayment > request.max_repayment {
            return Err(LoanError::RepaymentTooHigh {
                repayment: pricing.repayment,
                max: request.max_repayment,
            }
            .into());
        }
        let maturity = now.checked_add(request.duration).ok_or_else(overflow)?;

        // Draw from each node.
        let mut node_receipts = Vec::with_capacity(sources.len());
        for (source, &pending) in sources.iter().zip(&pricing.pending) {
            self.liquidity
                .use_liquidity(source.tick, source.used, pending, request.duration, now)?;
            node_receipts.push(NodeReceipt { tick: source.tick, used: source.used, pending });
        }

        let receipt = LoanReceipt {
            version: LOAN_RECEIPT_VERSION,
            principal: request.principal,
            repayment: pricing.repayment,
            admin_fee: pricing.admin_fee,
            borrower: request.borrower,
            maturity,
            duration: request.duration,
            collateral_token: request.collateral_token,
            collateral_token_id: request.collateral_token_id,
            collateral_wrapper_context: request.collateral_wrapper_context.clone(),
            node_receipts,
        };
        let encoded_receipt = receipt.encode().map_err(LoanError::from)?;
        let receipt_hash = hash_encoded(&encoded_receipt);

        // Reject receipts already recorded, whatever their status.
        if self.loans.contains(&receipt_hash) {
            warn!(%receipt_hash, "duplicate loan receipt rejected");
            return Err(LoanError::InvalidLoanReceipt(format!("{receipt_hash} already recorded")).into());
        }
        self.loans.set(receipt_hash, LoanStatus::Active);
        self.cash = self
            .cash
            .checked_sub(request.principal)
            .ok_or(LiquidityError::ArithmeticOverflow)?;

        self.events.push(PoolEvent::LoanOriginated {
            receipt_hash,
            borrower: request.borrower,
            principal: request.principal,
            repayment: pricing.repayment,
        });
        info!(
            %receipt_hash,
            principal = request.principal,
            repayment = pricing.repayment,
            nodes = receipt.node_receipts.len(),
            maturity,
            "loan originated"
        );
        Ok(Originated { receipt_hash, encoded_receipt, receipt })
    }

    /// Decode a receipt and look up its status.
    fn loan(&self, encoded: &[u8]) -> Result<(Hash256, LoanReceipt, LoanStatus), LoanError> {
        let receipt = LoanReceipt::decode(encoded)
            .map_err(|e| LoanError::InvalidLoanReceipt(e.to_string()))?;
        let hash = hash_encoded(encoded);
        let status = self
            .loans
            .get(&hash)
            .ok_or_else(|| LoanError::InvalidLoanReceipt(format!("unknown receipt {hash}")))?;
        Ok((hash, receipt, status))
    }

    fn expect_status(
        &self,
        encoded: &[u8],
        expected: LoanStatus,
    ) -> Result<(Hash256, LoanReceipt), LoanError> {
        let (hash, receipt, status) = self.loan(encoded)?;
        if status != expected {
            return Err(LoanError::InvalidLoanReceipt(format!("loan {hash} is {status:?}")));
        }
        Ok((hash, receipt))
    }

    fn restore_node(
        &mut self,
        node: &NodeReceipt,
        restored: u64,
        duration: u64,
        elapsed: u64,
        now: u64,
    ) -> Result<(), StrataError> {
        if self.liquidity.restore(node, restored, duration, elapsed, now)? {
            self.events.push(PoolEvent::NodeImpaired { tick: node.tick });
        }
        Ok(())
    }

    /// Settle an active loan early or at maturity; returns `(hash, receipt, paid)`.
    ///
    /// Interest and admin fee are prorated by elapsed time.
    fn settle(
        &mut self,
        caller: &AccountId,
        encoded: &[u8],
        now: u64,
    ) -> Result<(Hash256, LoanReceipt, u64), StrataError> {
        let (hash, receipt) = self.expect_status(encoded, LoanStatus::Active)?;
        if *caller != receipt.borrower {
            return Err(LoanError::InvalidCaller(format!("{caller} is not the borrower")).into());
        }
        if now > receipt.maturity {
            return Err(LoanError::LoanExpired(hash.to_string()).into());
        }

        let elapsed = now.saturating_sub(receipt.origination());
        let proration = if receipt.duration == 0 {
            FIXED_POINT_SCALE
        } else {
            (elapsed as u128 * FIXED_POINT_SCALE / receipt.duration as u128).min(FIXED_POINT_SCALE)
        };

        let mut paid = 0u64;
        for node in &receipt.node_receipts {
            let interest = node.pending.saturating_sub(node.used);
            let restored = node.used + prorate(interest, proration);
            self.restore_node(node, restored, receipt.duration, elapsed, now)?;
            paid = paid.checked_add(restored).ok_or_else(overflow)?;
        }
        let fee = prorate(receipt.admin_fee, proration);
        self.admin_fee_balance = self.admin_fee_balance.checked_add(fee).ok_or_else(overflow)?;
        paid = paid.checked_add(fee).ok_or_else(overflow)?;
        self.cash = self.cash.checked_add(paid).ok_or_else(overflow)?;

        Ok((hash, receipt, paid))
    }

    fn repay(&mut self, caller: &AccountId, encoded: &[u8], now: u64) -> Result<u64, StrataError> {
        let (receipt_hash, _, paid) = self.settle(caller, encoded, now)?;
        self.loans.set(receipt_hash, LoanStatus::Repaid);
        self.events.push(PoolEvent::LoanRepaid { receipt_hash, repayment: paid });
        info!(%receipt_hash, repayment = paid, "loan repaid");
        Ok(paid)
    }

    fn refinance(
        &mut self,
        env: &PoolEnv,
        caller: &AccountId,
        encoded: &[u8],
        request: &RefinanceRequest,
        now: u64,
    ) -> Result<Originated, StrataError> {
        let (receipt_hash, old, _) = self.settle(caller, encoded, now)?;
        self.loans.set(receipt_hash, LoanStatus::Refinanced);

        let originated = self.borrow(
            env,
            &BorrowRequest {
                borrower: old.borrower,
                principal: request.principal,
                duration: request.duration,
                collateral_token: old.collateral_token,
                collateral_token_id: old.collateral_token_id,
                collateral_wrapper_context: old.collateral_wrapper_context,
                ticks: request.ticks.clone(),
                max_repayment: request.max_repayment,
                min_rate_class: request.min_rate_class,
            },
            now,
        )?;
        self.events.push(PoolEvent::LoanRefinanced {
            receipt_hash,
            new_receipt_hash: originated.receipt_hash,
        });
        info!(%receipt_hash, new_receipt_hash = %originated.receipt_hash, "loan refinanced");
        Ok(originated)
    }

    fn liquidate(&mut self, env: &PoolEnv, encoded: &[u8], now: u64) -> Result<Hash256, StrataError> {
        let (receipt_hash, receipt) = self.expect_status(encoded, LoanStatus::Active)?;
        if now <= receipt.maturity {
            return Err(LoanError::LoanNotExpired(receipt_hash.to_string()).into());
        }
        self.loans.set(receipt_hash, LoanStatus::Liquidating);
        env.liquidator.liquidate(&receipt_hash, &receipt)?;

        self.events.push(PoolEvent::LoanLiquidated { receipt_hash });
        info!(%receipt_hash, overdue = now - receipt.maturity, "loan liquidated");
        Ok(receipt_hash)
    }

    /// Apply sale proceeds: each node up to its pending amount from the lowest
    /// tick upward, the last node takes the remainder.
    fn on_collateral_liquidated(
        &mut self,
        env: &PoolEnv,
        caller: &AccountId,
        encoded: &[u8],
        proceeds: u64,
        now: u64,
    ) -> Result<(), StrataError> {
        if *caller != env.liquidator.id() {
            return Err(LoanError::InvalidCaller(format!("{caller} is not the liquidator")).into());
        }
        let (receipt_hash, receipt) = self.expect_status(encoded, LoanStatus::Liquidating)?;
        let elapsed = now.saturating_sub(receipt.origination());

        let Some((last, rest)) = receipt.node_receipts.split_last() else {
            return Err(LoanError::InvalidLoanReceipt(format!("loan {receipt_hash} has no node receipts")).into());
        };
        let mut remaining = proceeds;
        for node in rest {
            let restored = remaining.min(node.pending);
            remaining -= restored;
            self.restore_node(node, restored, receipt.duration, elapsed, now)?;
        }
        self.restore_node(last, remaining, receipt.duration, elapsed, now)?;
        self.cash = self.cash.checked_add(proceeds).ok_or_else(overflow)?;
        self.loans.set(receipt_hash, LoanStatus::Liquidated);

        self.events.push(PoolEvent::CollateralLiquidated { receipt_hash, proceeds });
        info!(%receipt_hash, proceeds, repayment = receipt.repayment, "collateral proceeds applied");
        Ok(())
    }

    fn deposit(
        &mut self,
        account: &AccountId,
        tick: Tick,
        amount: u64,
        min_shares: u64,
        now: u64,
    ) -> Result<u64, StrataError> {
        self.liquidity.instantiate(tick)?;
        let shares = self.liquidity.deposit(tick, amount, now)?;
        if shares < min_shares {
            return Err(LiquidityError::InsufficientShares { minted: shares, minimum: min_shares }.into());
        }
        let position = self.deposits.entry((*account, tick)).or_default();
        position.shares = position.shares.checked_add(shares).ok_or(LiquidityError::ArithmeticOverflow)?;
        self.cash = self.cash.checked_add(amount).ok_or(LiquidityError::ArithmeticOverflow)?;

        self.events.push(PoolEvent::Deposited { account: *account, tick, amount, shares });
        info!(%account, %tick, amount, shares, "deposited");
        Ok(shares)
    }

    fn redeem(
        &mut self,
        account: &AccountId,
        tick: Tick,
        shares: u64,
        now: u64,
    ) -> Result<RedemptionTicket, StrataError> {
        let position = self
            .deposits
            .get_mut(&(*account, tick))
            .ok_or(LiquidityError::RedemptionExceedsShares { requested: shares, redeemable: 0 })?;
        let ticket = self.liquidity.redeem(tick, position, shares, now)?;

        self.events.push(PoolEvent::Redeemed {
            account: *account,
            tick,
            shares,
            index: ticket.index,
            target: ticket.target,
        });
        info!(%account, %tick, shares, index = ticket.index, "redemption queued");
        Ok(ticket)
    }

    fn withdraw(&mut self, account: &AccountId, tick: Tick) -> Result<(u64, u64), StrataError> {
        let key = (*account, tick);
        let Some(position) = self.deposits.get_mut(&key) else {
            return Ok((0, 0));
        };
        let (shares, amount) = self.liquidity.withdraw(tick, position)?;
        if position.is_empty() {
            self.deposits.remove(&key);
        }
        if shares == 0 {
            return Ok((0, 0));
        }
        self.cash = self.cash.checked_sub(amount).ok_or(LiquidityError::ArithmeticOverflow)?;

        self.events.push(PoolEvent::Withdrawn { account: *account, tick, shares, amount });
        info!(%account, %tick, shares, amount, "withdrawn");
        Ok((shares, amount))
    }

    fn withdraw_admin_fees(
        &mut self,
        env: &PoolEnv,
        caller: &AccountId,
        recipient: &AccountId,
        amount: u64,
    ) -> Result<(), StrataError> {
        if *caller != env.admin {
            return Err(LoanError::InvalidCaller(format!("{caller} is not the admin")).into());
        }
        if amount > self.admin_fee_balance {
            return Err(LoanError::ParameterOutOfBounds(format!(
                "admin fee withdrawal {amount} exceeds balance {}",
                self.admin_fee_balance
            ))
            .into());
        }
        self.admin_fee_balance -= amount;
        self.cash = self.cash.checked_sub(amount).ok_or_else(overflow)?;
        self.events.push(PoolEvent::AdminFeesWithdrawn { recipient: *recipient, amount });
        info!(%recipient, amount, "admin fees withdrawn");
        Ok(())
    }
}

/// A lending pool: configuration, collaborators and transactional state.
pub struct Pool {
    env: PoolEnv,
    pub(crate) state: PoolState,
    /// Nesting of [`Pool::atomically`] calls in progress.
    depth: usize,
}

impl Pool {
    /// Create an empty pool with the default interest model and no oracle.
    pub fn new(
        config: PoolConfig,
        filter: impl CollateralFilter + 'static,
        liquidator: impl CollateralLiquidator + 'static,
    ) -> Result<Self, StrataError> {
        config.validate()?;
        let state = PoolState::new(config.tick_spacing_bps);
        Ok(Self {
            env: PoolEnv {
                rates: config.rates(),
                currency: config.currency_token(),
                admin: config.admin(),
                config,
                filter: Box::new(filter),
                wrappers: HashMap::new(),
                oracle: None,
                liquidator: Box::new(liquidator),
                rate_model: Box::new(TickRateModel),
            },
            state,
            depth: 0,
        })
    }

    pub fn with_oracle(mut self, oracle: impl PriceOracle + 'static) -> Self {
        self.env.oracle = Some(Box::new(oracle));
        self
    }

    /// Register a collateral wrapper under its own token.
    pub fn with_wrapper(mut self, wrapper: impl CollateralWrapper + 'static) -> Self {
        self.env.wrappers.insert(wrapper.token(), Box::new(wrapper));
        self
    }

    pub fn with_rate_model(mut self, model: impl InterestRateModel + 'static) -> Self {
        self.env.rate_model = Box::new(model);
        self
    }

    fn transact<T>(
        &mut self,
        op: impl FnOnce(&PoolEnv, &mut PoolState) -> Result<T, StrataError>,
    ) -> Result<T, StrataError> {
        let checkpoint = self.state.checkpoint();
        let result = op(&self.env, &mut self.state);
        self.finish(checkpoint, result)
    }

    fn finish<T>(&mut self, checkpoint: Checkpoint, result: Result<T, StrataError>) -> Result<T, StrataError> {
        match result {
            Ok(value) => {
                if self.depth == 0 {
                    self.state.loans.commit();
                }
                Ok(value)
            }
            Err(e) => {
                self.state.rollback(checkpoint);
                debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Run several operations as one transaction.
    pub fn atomically<T>(
        &mut self,
        op: impl FnOnce(&mut Pool) -> Result<T, StrataError>,
    ) -> Result<T, StrataError> {
        let checkpoint = self.state.checkpoint();
        self.depth += 1;
        let result = op(self);
        self.depth -= 1;
        self.finish(checkpoint, result)
    }

    // --- depositor operations ---

    /// Deposit `amount` at `tick`, creating the node if needed.
    ///
    /// Fails with `InsufficientShares` if fewer than `min_shares` are minted.
    pub fn deposit(
        &mut self,
        account: &AccountId,
        tick: Tick,
        amount: u64,
        min_shares: u64,
        now: u64,
    ) -> Result<u64, StrataError> {
        self.transact(|_, state| state.deposit(account, tick, amount, min_shares, now))
    }

    /// Queue `shares` of the caller's position at `tick` for redemption.
    pub fn redeem(
        &mut self,
        account: &AccountId,
        tick: Tick,
        shares: u64,
        now: u64,
    ) -> Result<RedemptionTicket, StrataError> {
        self.transact(|_, state| state.redeem(account, tick, shares, now))
    }

    /// Shares and currency of the caller's redemptions ready to withdraw.
    pub fn redemption_available(&self, account: &AccountId, tick: Tick) -> Result<(u64, u64), StrataError> {
        let Some(position) = self.state.deposits.get(&(*account, tick)) else {
            return Ok((0, 0));
        };
        let mut shares = 0u64;
        let mut amount = 0u64;
        for ticket in &position.tickets {
            let (s, a) =
                self.state.liquidity.redemption_available(tick, ticket.pending, ticket.index, ticket.target)?;
            shares += s;
            amount = amount.checked_add(a).ok_or(LiquidityError::ArithmeticOverflow)?;
        }
        Ok((shares, amount))
    }

    /// Settle the caller's resolved redemptions at `tick`. No-op when none are.
    pub fn withdraw(&mut self, account: &AccountId, tick: Tick) -> Result<(u64, u64), StrataError> {
        self.transact(|_, state| state.withdraw(account, tick))
    }

    /// Move the resolved part of a position's redemptions from `src` to `dst`.
    ///
    /// Returns `(amount moved, shares minted at dst)`.
    pub fn rebalance(
        &mut self,
        account: &AccountId,
        src: Tick,
        dst: Tick,
        min_shares: u64,
        now: u64,
    ) -> Result<(u64, u64), StrataError> {
        self.transact(|_, state| {
            let (_, amount) = state.withdraw(account, src)?;
            if amount == 0 {
                return Err(LiquidityError::InvalidAmount("nothing to rebalance".into()).into());
            }
            let shares = state.deposit(account, dst, amount, min_shares, now)?;
            Ok((amount, shares))
        })
    }

    // --- borrower operations ---

    /// Price a loan without originating it.
    pub fn quote(&self, request: &BorrowRequest) -> Result<Quote, StrataError> {
        let (plan, pricing) = self.state.plan(&self.env, request)?;
        Ok(Quote { repayment: pricing.repayment, admin_fee: pricing.admin_fee, plan })
    }

    pub fn borrow(&mut self, request: &BorrowRequest, now: u64) -> Result<Originated, StrataError> {
        self.transact(|env, state| state.borrow(env, request, now))
    }

    /// Repay an active loan before maturity. Returns the amount paid.
    pub fn repay(&mut self, caller: &AccountId, encoded_receipt: &[u8], now: u64) -> Result<u64, StrataError> {
        self.transact(|_, state| state.repay(caller, encoded_receipt, now))
    }

    /// Repay an active loan and originate a new one on the same collateral.
    pub fn refinance(
        &mut self,
        caller: &AccountId,
        encoded_receipt: &[u8],
        request: &RefinanceRequest,
        now: u64,
    ) -> Result<Originated, StrataError> {
        self.transact(|env, state| state.refinance(env, caller, encoded_receipt, request, now))
    }

    /// Hand an expired loan's collateral to the liquidator.
    pub fn liquidate(&mut self, encoded_receipt: &[u8], now: u64) -> Result<Hash256, StrataError> {
        self.transact(|env, state| state.liquidate(env, encoded_receipt, now))
    }

    /// Proceeds report from the liquidator.
    pub fn on_collateral_liquidated(
        &mut self,
        caller: &AccountId,
        encoded_receipt: &[u8],
        proceeds: u64,
        now: u64,
    ) -> Result<(), StrataError> {
        self.transact(|env, state| {
            state.on_collateral_liquidated(env, caller, encoded_receipt, proceeds, now)
        })
    }

    // --- admin ---

    pub fn withdraw_admin_fees(
        &mut self,
        caller: &AccountId,
        recipient: &AccountId,
        amount: u64,
    ) -> Result<(), StrataError> {
        self.transact(|env, state| state.withdraw_admin_fees(env, caller, recipient, amount))
    }

    // --- views ---

    pub fn config(&self) -> &PoolConfig {
        &self.env.config
    }

    pub fn liquidity(&self) -> &LiquidityStore {
        &self.state.liquidity
    }

    /// Linked nodes with ticks in `[start, end]`, in list order.
    pub fn liquidity_nodes(&self, start: Tick, end: Tick) -> Vec<LiquidityNode> {
        self.state.liquidity.liquidity_nodes(start, end).into_iter().cloned().collect()
    }

    pub fn liquidity_node(&self, tick: Tick) -> Option<LiquidityNode> {
        self.state.liquidity.node(tick).cloned()
    }

    pub fn accrual(&self, tick: Tick, now: u64) -> AccrualInfo {
        self.state.liquidity.accrual(tick, now)
    }

    pub fn deposit_position(&self, account: &AccountId, tick: Tick) -> Option<&DepositPosition> {
        self.state.deposits.get(&(*account, tick))
    }

    pub fn loan_status(&self, receipt_hash: &Hash256) -> Option<LoanStatus> {
        self.state.loans.get(receipt_hash)
    }

    pub fn cash(&self) -> u64 {
        self.state.cash
    }

    pub fn admin_fee_balance(&self) -> u64 {
        self.state.admin_fee_balance
    }

    /// Cash the pool can account for: node cash, parked redemptions, swept
    /// residuals and admin fees. Always equal to [`cash`](Self::cash).
    pub fn accounted_cash(&self) -> u64 {
        let liquidity = &self.state.liquidity;
        liquidity
            .totals()
            .available
            .saturating_add(liquidity.reserved())
            .saturating_add(liquidity.orphaned())
            .saturating_add(self.state.admin_fee_balance)
    }

    pub fn events(&self) -> &[PoolEvent] {
        &self.state.events
    }

    /// Take all recorded events.
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.state.events)
    }
}
