//! Redemption queue.
//!
//! Each node keeps one FIFO queue of redeeming shares per *generation*
//! (`redemptions.index`). A ticket records the cumulative shares queued ahead
//! of it (`target`) in its generation. Whenever a node has cash, the oldest
//! queued shares are resolved at the current share price and the currency is
//! parked in the store's `reserved` balance. The resolutions are kept in a
//! ledger so a ticket can be settled after the node itself is gone.
//!
//! When a generation is fully resolved the index advances and `target`
//! restarts at zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use strata_core::error::LiquidityError;
use strata_core::tick::Tick;

use crate::node::{mul_div, to_u64, LiquidityStore};

/// Running totals after one resolution step.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Fulfillment {
    /// Shares resolved in the generation up to and including this step.
    pub shares: u64,
    /// Currency those shares resolved for.
    pub amount: u64,
}

/// One redemption generation of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
struct Generation {
    /// Shares queued by tickets.
    queued: u64,
    /// Shares settled back to their owners.
    settled: u64,
    /// Prefix totals, one per resolution step.
    steps: Vec<Fulfillment>,
}

impl Generation {
    fn resolved(&self) -> Fulfillment {
        self.steps.last().copied().unwrap_or(Fulfillment { shares: 0, amount: 0 })
    }
}

/// Resolution history keyed by `(tick, generation)`.
///
/// A generation is dropped once every share queued in it has been settled.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct RedemptionLedger {
    generations: HashMap<(Tick, u64), Generation>,
    next_index: HashMap<Tick, u64>,
}

impl RedemptionLedger {
    pub(crate) fn queue(&mut self, tick: Tick, index: u64, shares: u64) {
        let generation = self.generations.entry((tick, index)).or_default();
        generation.queued = generation.queued.saturating_add(shares);
    }

    pub(crate) fn record(&mut self, tick: Tick, index: u64, shares: u64, amount: u64) {
        let generation = self.generations.entry((tick, index)).or_default();
        let total = generation.resolved();
        generation.steps.push(Fulfillment {
            shares: total.shares.saturating_add(shares),
            amount: total.amount.saturating_add(amount),
        });
    }

    pub(crate) fn settle(&mut self, tick: Tick, index: u64, shares: u64) {
        let key = (tick, index);
        let Some(generation) = self.generations.get_mut(&key) else {
            return;
        };
        generation.settled = generation.settled.saturating_add(shares);
        if generation.settled >= generation.queued {
            self.generations.remove(&key);
            debug!(%tick, index, "redemption generation settled");
        }
    }

    /// Whether a generation still has unsettled shares.
    pub fn is_open(&self, tick: Tick, index: u64) -> bool {
        self.generations.contains_key(&(tick, index))
    }

    /// Number of generations still tracked.
    pub fn open_generations(&self) -> usize {
        self.generations.len()
    }

    /// Total shares resolved so far in a generation.
    pub fn resolved_shares(&self, tick: Tick, index: u64) -> u64 {
        self.generations.get(&(tick, index)).map_or(0, |g| g.resolved().shares)
    }

    /// Currency owed for the resolved shares `[start, start + len)` of a generation.
    ///
    /// Each resolution step pays its shares pro rata, rounded down.
    pub fn amount(&self, tick: Tick, index: u64, start: u64, len: u64) -> Result<u64, LiquidityError> {
        let Some(generation) = self.generations.get(&(tick, index)) else {
            return Ok(0);
        };
        let end = start.saturating_add(len);
        let first = generation.steps.partition_point(|f| f.shares <= start);
        let mut previous = match first {
            0 => Fulfillment { shares: 0, amount: 0 },
            i => generation.steps[i - 1],
        };
        let mut total = 0u128;
        for step in &generation.steps[first..] {
            let shares = step.shares - previous.shares;
            let lo = start.max(previous.shares);
            let hi = end.min(step.shares);
            if hi > lo && shares > 0 {
                let amount = step.amount - previous.amount;
                total += mul_div(amount as u128, (hi - lo) as u128, shares as u128)?;
            }
            if step.shares >= end {
                break;
            }
            previous = *step;
        }
        to_u64(total)
    }

    /// Generation a newly created node at `tick` starts from.
    pub fn next_index(&self, tick: Tick) -> u64 {
        self.next_index.get(&tick).copied().unwrap_or(0)
    }

    /// Remember where a deleted node's generations ended.
    pub(crate) fn retire(&mut self, tick: Tick, index: u64) {
        let next = self.next_index.entry(tick).or_insert(0);
        *next = (*next).max(index);
    }
}

/// A queued redemption of `pending` shares.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RedemptionTicket {
    /// Generation the ticket was queued in.
    pub index: u64,
    /// Cumulative shares ahead of the ticket's first unsettled share.
    pub target: u64,
    /// Shares still waiting to be settled.
    pub pending: u64,
}

/// A depositor's holding in one node.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct DepositPosition {
    /// Shares owned, including those queued for redemption.
    pub shares: u64,
    /// Outstanding redemption tickets, oldest first.
    pub tickets: Vec<RedemptionTicket>,
}

impl DepositPosition {
    /// Shares queued for redemption.
    pub fn redemption_pending(&self) -> u64 {
        self.tickets.iter().map(|t| t.pending).sum()
    }

    /// Shares that may still be queued for redemption.
    pub fn redeemable(&self) -> u64 {
        self.shares.saturating_sub(self.redemption_pending())
    }

    pub fn is_empty(&self) -> bool {
        self.shares == 0 && self.tickets.is_empty()
    }
}

impl LiquidityStore {
    /// Queue `shares` of `position` for redemption.
    ///
    /// Redemptions are resolved immediately as far as the node's cash allows.
    /// The returned ticket reflects the queue state at the time of the call.
    ///
    /// # Errors
    ///
    /// - [`LiquidityError::InvalidAmount`] for zero shares
    /// - [`LiquidityError::RedemptionExceedsShares`] if the position lacks unqueued shares
    /// - [`LiquidityError::UnknownNode`] if no node exists at `tick`
    pub fn redeem(
        &mut self,
        tick: Tick,
        position: &mut DepositPosition,
        shares: u64,
        now: u64,
    ) -> Result<RedemptionTicket, LiquidityError> {
        if shares == 0 {
            return Err(LiquidityError::InvalidAmount("zero redemption".into()));
        }
        let redeemable = position.redeemable();
        if shares > redeemable {
            return Err(LiquidityError::RedemptionExceedsShares { requested: shares, redeemable });
        }
        let node = self.node_mut(tick)?;
        if shares > node.shares.saturating_sub(node.redemptions.pending) {
            return Err(LiquidityError::RedemptionExceedsShares {
                requested: shares,
                redeemable: node.shares.saturating_sub(node.redemptions.pending),
            });
        }

        let ticket = RedemptionTicket {
            index: node.redemptions.index,
            target: node.redemptions.target + node.redemptions.pending,
            pending: shares,
        };
        node.redemptions.pending += shares;
        position.tickets.push(ticket);
        self.ledger.queue(tick, ticket.index, shares);

        debug!(%tick, shares, index = ticket.index, target = ticket.target, "redeem");
        self.process_redemptions(tick, now)?;
        self.garbage_collect(tick);
        Ok(ticket)
    }

    /// Shares and currency of a ticket that are ready to withdraw.
    pub fn redemption_available(
        &self,
        tick: Tick,
        shares: u64,
        index: u64,
        target: u64,
    ) -> Result<(u64, u64), LiquidityError> {
        let resolved = self.ledger.resolved_shares(tick, index);
        let ready = resolved.saturating_sub(target).min(shares);
        if ready == 0 {
            return Ok((0, 0));
        }
        let amount = self.ledger.amount(tick, index, target, ready)?;
        Ok((ready, amount))
    }

    /// Settle every resolved share of `position`, returning `(shares, amount)`.
    ///
    /// Settled shares are burned from the position and fully settled tickets
    /// are dropped.
    pub fn withdraw(
        &mut self,
        tick: Tick,
        position: &mut DepositPosition,
    ) -> Result<(u64, u64), LiquidityError> {
        let mut shares = 0u64;
        let mut amount = 0u64;
        for ticket in position.tickets.iter_mut() {
            let (s, a) = self.redemption_available(tick, ticket.pending, ticket.index, ticket.target)?;
            if s == 0 {
                continue;
            }
            ticket.pending -= s;
            ticket.target += s;
            shares += s;
            amount = amount.checked_add(a).ok_or(LiquidityError::ArithmeticOverflow)?;
            self.ledger.settle(tick, ticket.index, s);
        }
        position.tickets.retain(|t| t.pending > 0);
        position.shares = position.shares.saturating_sub(shares);
        self.reserved = self.reserved.saturating_sub(amount);

        if shares > 0 {
            debug!(%tick, shares, amount, "withdraw");
        }
        Ok((shares, amount))
    }

    /// Resolve queued shares against the node's cash.
    ///
    /// An insolvent node resolves its whole queue at zero.
    pub(crate) fn process_redemptions(&mut self, tick: Tick, now: u64) -> Result<(), LiquidityError> {
        let node = self.node_mut(tick)?;
        let pending = node.redemptions.pending;
        if pending == 0 {
            return Ok(());
        }

        let (shares, amount) = if node.is_insolvent() {
            (pending, 0)
        } else {
            if node.available == 0 {
                return Ok(());
            }
            let total = node.total_value(now);
            let max_shares = to_u64(mul_div(node.available as u128, node.shares as u128, total)?)?;
            let shares = pending.min(max_shares);
            if shares == 0 {
                return Ok(());
            }
            let amount = to_u64(mul_div(shares as u128, total, node.shares as u128)?)?;
            (shares, amount.min(node.available))
        };

        node.shares -= shares;
        node.value -= amount;
        node.available -= amount;
        node.redemptions.pending -= shares;
        node.redemptions.target += shares;
        let index = node.redemptions.index;
        if node.redemptions.pending == 0 {
            node.redemptions.index += 1;
            node.redemptions.target = 0;
        }

        self.ledger.record(tick, index, shares, amount);
        self.reserved = self.reserved.checked_add(amount).ok_or(LiquidityError::ArithmeticOverflow)?;
        debug!(%tick, shares, amount, index, "resolved redemptions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strata_core::constants::{SECONDS_PER_DAY, UNIT};
    use strata_core::receipt::NodeReceipt;
    use strata_core::tick::TickParams;

    const T0: u64 = 1_700_000_000;
    const DAYS_30: u64 = 30 * SECONDS_PER_DAY;

    fn tick(limit: u64) -> Tick {
        Tick::encode(&TickParams::absolute(limit, 0, 0)).unwrap()
    }

    fn deposit(store: &mut LiquidityStore, t: Tick, amount: u64, now: u64) -> DepositPosition {
        store.instantiate(t).unwrap();
        let shares = store.deposit(t, amount, now).unwrap();
        DepositPosition { shares, tickets: Vec::new() }
    }

    #[test]
    fn idle_node_redeems_immediately() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut pos = deposit(&mut store, t, 5 * UNIT, T0);

        let ticket = store.redeem(t, &mut pos, 2 * UNIT, T0).unwrap();
        assert_eq!(ticket, RedemptionTicket { index: 0, target: 0, pending: 2 * UNIT });
        assert_eq!(store.redemption_available(t, 2 * UNIT, 0, 0).unwrap(), (2 * UNIT, 2 * UNIT));
        assert_eq!(store.reserved(), 2 * UNIT);

        let node = store.node(t).unwrap();
        assert_eq!(node.shares, 3 * UNIT);
        assert_eq!(node.value, 3 * UNIT);
        assert_eq!(node.redemptions.index, 1);
        assert_eq!(node.redemptions.target, 0);

        assert!(store.ledger.is_open(t, 0));
        assert_eq!(store.withdraw(t, &mut pos).unwrap(), (2 * UNIT, 2 * UNIT));
        assert_eq!(pos.shares, 3 * UNIT);
        assert!(pos.tickets.is_empty());
        assert_eq!(store.reserved(), 0);
        assert!(!store.ledger.is_open(t, 0));
    }

    #[test]
    fn generation_is_dropped_after_its_last_settlement() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut alice = deposit(&mut store, t, 5 * UNIT, T0);
        let mut bob = DepositPosition { shares: store.deposit(t, 5 * UNIT, T0).unwrap(), ..Default::default() };
        store.use_liquidity(t, 10 * UNIT, 10 * UNIT, DAYS_30, T0).unwrap();
        store.redeem(t, &mut alice, 5 * UNIT, T0).unwrap();
        store.redeem(t, &mut bob, 5 * UNIT, T0).unwrap();

        // Partial cash: alice settles part of her ticket.
        let part = NodeReceipt { tick: t, used: 3 * UNIT, pending: 3 * UNIT };
        store.restore(&part, 3 * UNIT, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
        assert_eq!(store.withdraw(t, &mut alice).unwrap(), (3 * UNIT, 3 * UNIT));
        assert!(store.ledger.is_open(t, 0));

        let rest = NodeReceipt { tick: t, used: 7 * UNIT, pending: 7 * UNIT };
        store.restore(&rest, 7 * UNIT, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
        assert_eq!(store.withdraw(t, &mut alice).unwrap(), (2 * UNIT, 2 * UNIT));
        assert!(store.ledger.is_open(t, 0));
        assert_eq!(store.withdraw(t, &mut bob).unwrap(), (5 * UNIT, 5 * UNIT));
        assert!(!store.ledger.is_open(t, 0));
        assert_eq!(store.ledger.open_generations(), 0);

        // A new generation starts empty and settles the same way.
        let mut carol = DepositPosition { shares: store.deposit(t, 4 * UNIT, T0 + DAYS_30).unwrap(), ..Default::default() };
        let ticket = store.redeem(t, &mut carol, 4 * UNIT, T0 + DAYS_30).unwrap();
        assert_eq!(ticket.index, 1);
        assert_eq!(store.withdraw(t, &mut carol).unwrap(), (4 * UNIT, 4 * UNIT));
        assert_eq!(store.ledger.open_generations(), 0);
    }

    #[test]
    fn redeem_rejects_excess_and_zero() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut pos = deposit(&mut store, t, 5 * UNIT, T0);
        store.use_liquidity(t, 5 * UNIT, 6 * UNIT, DAYS_30, T0).unwrap();
        store.redeem(t, &mut pos, 4 * UNIT, T0).unwrap();
        assert_eq!(
            store.redeem(t, &mut pos, 2 * UNIT, T0),
            Err(LiquidityError::RedemptionExceedsShares { requested: 2 * UNIT, redeemable: UNIT })
        );
        assert!(matches!(store.redeem(t, &mut pos, 0, T0), Err(LiquidityError::InvalidAmount(_))));
    }

    #[test]
    fn queue_resolves_fifo_as_cash_returns() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut alice = deposit(&mut store, t, 5 * UNIT, T0);
        let mut bob = DepositPosition { shares: store.deposit(t, 5 * UNIT, T0).unwrap(), ..Default::default() };
        store.use_liquidity(t, 10 * UNIT, 10 * UNIT, DAYS_30, T0).unwrap();

        let a = store.redeem(t, &mut alice, 5 * UNIT, T0).unwrap();
        let b = store.redeem(t, &mut bob, 5 * UNIT, T0).unwrap();
        assert_eq!(a.target, 0);
        assert_eq!(b.target, 5 * UNIT);
        assert_eq!(store.redemption_available(t, a.pending, a.index, a.target).unwrap(), (0, 0));

        let loan = NodeReceipt { tick: t, used: 10 * UNIT, pending: 10 * UNIT };
        store.restore(&loan, 10 * UNIT, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();

        assert_eq!(store.withdraw(t, &mut alice).unwrap(), (5 * UNIT, 5 * UNIT));
        assert_eq!(store.withdraw(t, &mut bob).unwrap(), (5 * UNIT, 5 * UNIT));
        // Drained but still linked, so the node stays in place.
        let node = store.node(t).unwrap();
        assert_eq!((node.shares, node.value), (0, 0));
        assert!(node.is_linked());
        assert_eq!(store.reserved(), 0);
    }

    #[test]
    fn earlier_tickets_fill_first() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut alice = deposit(&mut store, t, 5 * UNIT, T0);
        let mut bob = DepositPosition { shares: store.deposit(t, 5 * UNIT, T0).unwrap(), ..Default::default() };
        store.use_liquidity(t, 6 * UNIT, 6 * UNIT, DAYS_30, T0).unwrap();
        store.use_liquidity(t, 4 * UNIT, 4 * UNIT, DAYS_30, T0).unwrap();

        store.redeem(t, &mut alice, 5 * UNIT, T0).unwrap();
        store.redeem(t, &mut bob, 5 * UNIT, T0).unwrap();

        // Only 4 units come back: all of it goes to alice.
        let small = NodeReceipt { tick: t, used: 4 * UNIT, pending: 4 * UNIT };
        store.restore(&small, 4 * UNIT, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
        assert_eq!(store.withdraw(t, &mut alice).unwrap(), (4 * UNIT, 4 * UNIT));
        assert_eq!(store.withdraw(t, &mut bob).unwrap(), (0, 0));
        assert_eq!(alice.redemption_pending(), UNIT);

        let large = NodeReceipt { tick: t, used: 6 * UNIT, pending: 6 * UNIT };
        store.restore(&large, 6 * UNIT, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
        assert_eq!(store.withdraw(t, &mut alice).unwrap(), (UNIT, UNIT));
        assert_eq!(store.withdraw(t, &mut bob).unwrap(), (5 * UNIT, 5 * UNIT));
        assert!(alice.is_empty());
        assert!(bob.is_empty());
    }

    #[test]
    fn impaired_node_redeems_at_reduced_price_then_recycles() {
        let mut store = LiquidityStore::new();
        let t = tick(100 * UNIT);
        let mut pos = deposit(&mut store, t, 10 * UNIT, T0);

        let loan_a = NodeReceipt { tick: t, used: 96 * UNIT / 10, pending: 10 * UNIT };
        let loan_b = NodeReceipt { tick: t, used: 4 * UNIT / 10, pending: 45 * UNIT / 100 };
        store.use_liquidity(t, loan_a.used, loan_a.pending, DAYS_30, T0).unwrap();
        store.use_liquidity(t, loan_b.used, loan_b.pending, DAYS_30, T0).unwrap();

        // Loan A defaults with nothing recovered: price falls below 5% of par.
        assert!(store.restore(&loan_a, 0, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap());
        assert!(store.node(t).unwrap().is_impaired());

        let ticket = store.redeem(t, &mut pos, 10 * UNIT, T0 + DAYS_30).unwrap();
        assert_eq!(store.redemption_available(t, ticket.pending, ticket.index, ticket.target).unwrap(), (0, 0));

        // Loan B repays in full and the queue resolves at the reduced price.
        store.restore(&loan_b, loan_b.pending, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
        assert_eq!(
            store.redemption_available(t, ticket.pending, ticket.index, ticket.target).unwrap(),
            (10 * UNIT, 45 * UNIT / 100)
        );
        assert!(store.node(t).is_none());

        assert_eq!(store.withdraw(t, &mut pos).unwrap(), (10 * UNIT, 45 * UNIT / 100));
        assert!(pos.is_empty());

        // The tick is usable again and starts a fresh generation.
        store.instantiate(t).unwrap();
        assert_eq!(store.node(t).unwrap().redemptions.index, 1);
        assert_eq!(store.deposit(t, UNIT, T0 + DAYS_30).unwrap(), UNIT);
    }

    #[test]
    fn insolvent_node_resolves_at_zero() {
        let mut store = LiquidityStore::new();
        let t = tick(10 * UNIT);
        let mut pos = deposit(&mut store, t, 5 * UNIT, T0);
        let loan = NodeReceipt { tick: t, used: 5 * UNIT, pending: 6 * UNIT };
        store.use_liquidity(t, loan.used, loan.pending, DAYS_30, T0).unwrap();
        store.restore(&loan, 0, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();

        store.redeem(t, &mut pos, 5 * UNIT, T0 + DAYS_30).unwrap();
        assert!(store.node(t).is_none());
        assert_eq!(store.withdraw(t, &mut pos).unwrap(), (5 * UNIT, 0));
        assert!(pos.is_empty());
    }

    #[test]
    fn ledger_amount_spans_segments() {
        let mut ledger = RedemptionLedger::default();
        let t = tick(1);
        ledger.record(t, 0, 100, 100);
        ledger.record(t, 0, 100, 50);
        assert_eq!(ledger.resolved_shares(t, 0), 200);
        assert_eq!(ledger.amount(t, 0, 50, 100).unwrap(), 75);
        assert_eq!(ledger.amount(t, 0, 150, 100).unwrap(), 25);
        assert_eq!(ledger.amount(t, 1, 0, 100).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn settled_amounts_never_exceed_reserved(
            deposits in proptest::collection::vec(1u64..100 * UNIT, 1..6),
            redeem_pct in proptest::collection::vec(1u64..=100, 1..6),
            lent_pct in 0u64..=100,
        ) {
            let mut store = LiquidityStore::new();
            let t = tick(1_000 * UNIT);
            store.instantiate(t).unwrap();
            let mut positions: Vec<DepositPosition> = deposits
                .iter()
                .map(|&a| DepositPosition { shares: store.deposit(t, a, T0).unwrap(), ..Default::default() })
                .collect();

            let available = store.node(t).unwrap().available;
            let used = available * lent_pct / 100;
            if used > 0 {
                store.use_liquidity(t, used, used, DAYS_30, T0).unwrap();
            }
            for (pos, pct) in positions.iter_mut().zip(redeem_pct.iter().cycle()) {
                let shares = pos.shares * pct / 100;
                if shares > 0 {
                    store.redeem(t, pos, shares, T0).unwrap();
                }
            }
            if used > 0 {
                let r = NodeReceipt { tick: t, used, pending: used };
                store.restore(&r, used, DAYS_30, DAYS_30, T0 + DAYS_30).unwrap();
            }

            let reserved = store.reserved();
            let mut paid = 0u64;
            for pos in positions.iter_mut() {
                let (_, amount) = store.withdraw(t, pos).unwrap();
                paid += amount;
                prop_assert_eq!(pos.redemption_pending(), 0);
            }
            prop_assert!(paid <= reserved);
            prop_assert_eq!(store.ledger.open_generations(), 0);
        }
    }
}
