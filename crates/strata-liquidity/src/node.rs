//! Liquidity node store.
//!
//! Nodes live in an arena keyed by tick and are threaded into a sorted
//! doubly-linked list between the [`Tick::HEAD`] and [`Tick::TAIL`] sentinels.
//! `prev`/`next` are tick keys, not references; a node whose `prev` and `next`
//! are both [`Tick::HEAD`] is delinked: it takes no deposits and is never
//! selected by the allocator, but its shares stay redeemable.
//!
//! Accounting per node:
//! - `value`: realized capital, excluding unrealized interest
//! - `available`: cash on hand, `available <= value`
//! - `pending`: gross amount expected back from outstanding loans
//! - `value - available`: principal currently lent out
//!
//! Interest accrues linearly per loan and is aggregated into a single
//! per-node rate, so pricing a deposit never has to walk individual loans.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_core::constants::{
    BPS_PRECISION, FIXED_POINT_SCALE, IMPAIRED_PRICE_THRESHOLD, TICK_LIMIT_SPACING_BPS,
};
use strata_core::error::LiquidityError;
use strata_core::receipt::NodeReceipt;
use strata_core::tick::Tick;

use crate::redemption::RedemptionLedger;

/// Compute `a * b / d` with a u128 intermediate.
pub(crate) fn mul_div(a: u128, b: u128, d: u128) -> Result<u128, LiquidityError> {
    if d == 0 {
        return Err(LiquidityError::ArithmeticOverflow);
    }
    a.checked_mul(b)
        .map(|p| p / d)
        .ok_or(LiquidityError::ArithmeticOverflow)
}

pub(crate) fn to_u64(v: u128) -> Result<u64, LiquidityError> {
    u64::try_from(v).map_err(|_| LiquidityError::ArithmeticOverflow)
}

fn invalid_tick(tick: Tick, reason: impl ToString) -> LiquidityError {
    LiquidityError::InvalidTick { tick, reason: reason.to_string() }
}

/// Aggregate linear interest accrual of a node's outstanding loans.
///
/// Each loan adds its rate on use and schedules the same rate to drop out at
/// its maturity, so an overdue loan stops accruing.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Accrual {
    /// Interest accrued up to `timestamp`, scaled by `FIXED_POINT_SCALE`.
    pub accrued: u128,
    /// Interest per second at `timestamp`, scaled by `FIXED_POINT_SCALE`.
    pub rate: u128,
    /// Last time `accrued` was brought up to date.
    pub timestamp: u64,
    /// Pending rate drops as `(maturity, rate)`, earliest first.
    pub expiries: Vec<(u64, u128)>,
}

impl Accrual {
    /// Walk the schedule up to `now`: `(accrued, rate, expiries passed)`.
    fn advance(&self, now: u64) -> (u128, u128, usize) {
        let mut accrued = self.accrued;
        let mut rate = self.rate;
        let mut at = self.timestamp;
        let mut passed = 0;
        for &(maturity, drop) in &self.expiries {
            if maturity > now {
                break;
            }
            let dt = maturity.saturating_sub(at) as u128;
            accrued = accrued.saturating_add(rate.saturating_mul(dt));
            at = at.max(maturity);
            rate = rate.saturating_sub(drop);
            passed += 1;
        }
        let dt = now.saturating_sub(at) as u128;
        (accrued.saturating_add(rate.saturating_mul(dt)), rate, passed)
    }

    fn accrued_at(&self, now: u64) -> u128 {
        self.advance(now).0
    }

    fn rate_at(&self, now: u64) -> u128 {
        self.advance(now).1
    }

    fn flush(&mut self, now: u64) {
        let (accrued, rate, passed) = self.advance(now);
        self.accrued = accrued;
        self.rate = rate;
        self.expiries.drain(..passed);
        self.timestamp = self.timestamp.max(now);
    }

    /// Start accruing `rate` until `maturity`. Call after [`flush`](Self::flush).
    fn add(&mut self, rate: u128, maturity: u64) {
        self.rate = self.rate.saturating_add(rate);
        let at = self.expiries.partition_point(|&(m, _)| m <= maturity);
        self.expiries.insert(at, (maturity, rate));
    }

    /// Remove a loan's rate and the interest it accrued over `earned` seconds.
    /// Call after [`flush`](Self::flush).
    fn remove(&mut self, rate: u128, maturity: u64, earned: u64) {
        self.accrued = self.accrued.saturating_sub(rate.saturating_mul(earned as u128));
        if let Some(at) = self.expiries.iter().position(|&e| e == (maturity, rate)) {
            self.expiries.remove(at);
            self.rate = self.rate.saturating_sub(rate);
        }
    }
}

/// Read-only accrual view of a node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccrualInfo {
    /// Interest earned but not yet realized, in base units.
    pub accrued: u64,
    /// Interest per second, scaled by `FIXED_POINT_SCALE`.
    pub rate: u128,
}

/// Redemption queue counters of a node.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct NodeRedemptions {
    /// Shares queued for redemption and not yet resolved.
    pub pending: u64,
    /// Current redemption generation.
    pub index: u64,
    /// Shares resolved so far in the current generation.
    pub target: u64,
}

/// One liquidity node.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct LiquidityNode {
    pub tick: Tick,
    pub value: u64,
    pub shares: u64,
    pub available: u64,
    pub pending: u64,
    pub redemptions: NodeRedemptions,
    pub prev: Tick,
    pub next: Tick,
    pub accrual: Accrual,
}

impl LiquidityNode {
    fn new(tick: Tick, redemption_index: u64) -> Self {
        Self {
            tick,
            value: 0,
            shares: 0,
            available: 0,
            pending: 0,
            redemptions: NodeRedemptions { index: redemption_index, ..Default::default() },
            prev: Tick::HEAD,
            next: Tick::HEAD,
            accrual: Accrual::default(),
        }
    }

    /// Whether the node is threaded into the list.
    pub fn is_linked(&self) -> bool {
        self.prev != Tick::HEAD || self.next != Tick::HEAD
    }

    /// Shares outstanding but realized value below 5% of par.
    pub fn is_impaired(&self) -> bool {
        self.shares != 0
            && (self.value as u128) * FIXED_POINT_SCALE
                < (self.shares as u128) * IMPAIRED_PRICE_THRESHOLD
    }

    /// Shares outstanding with nothing left to back them.
    pub fn is_insolvent(&self) -> bool {
        self.shares != 0 && self.value == 0 && self.pending == 0
    }

    /// Principal currently lent out.
    pub fn outstanding_principal(&self) -> u64 {
        self.value.saturating_sub(self.available)
    }

    /// Interest still expected from outstanding loans.
    pub fn outstanding_interest(&self) -> u64 {
        self.pending.saturating_sub(self.outstanding_principal())
    }

    /// Unrealized interest at `now`, capped at the outstanding expected interest.
    pub fn accrued(&self, now: u64) -> u64 {
        let accrued = self.accrual.accrued_at(now) / FIXED_POINT_SCALE;
        accrued.min(self.outstanding_interest() as u128) as u64
    }

    /// `value + accrued`, the amount backing the node's shares.
    pub fn total_value(&self, now: u64) -> u128 {
        self.value as u128 + self.accrued(now) as u128
    }

    /// Share price scaled by `FIXED_POINT_SCALE`. Par for an empty node.
    pub fn share_price(&self, now: u64) -> u128 {
        if self.shares == 0 {
            return FIXED_POINT_SCALE;
        }
        self.total_value(now) * FIXED_POINT_SCALE / self.shares as u128
    }
}

/// Aggregates over every node in the store, linked or not.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreTotals {
    pub value: u64,
    pub shares: u64,
    pub available: u64,
    pub pending: u64,
}

/// Sorted registry of liquidity nodes.
///
/// Not thread-safe; the pool serializes access.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct LiquidityStore {
    /// Arena: tick → node, including both sentinels.
    pub(crate) nodes: HashMap<Tick, LiquidityNode>,
    /// Resolved redemptions by generation.
    pub(crate) ledger: RedemptionLedger,
    /// Minimum relative limit spacing within a partition, in bps.
    spacing_bps: u64,
    /// Currency resolved for redemptions and not yet withdrawn.
    pub(crate) reserved: u64,
    /// Residual value of nodes deleted without shares.
    orphaned: u64,
}

impl Default for LiquidityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiquidityStore {
    /// Create an empty store with the default tick spacing.
    pub fn new() -> Self {
        Self::with_spacing(TICK_LIMIT_SPACING_BPS)
    }

    /// Create an empty store with a custom tick spacing in bps.
    pub fn with_spacing(spacing_bps: u64) -> Self {
        let mut nodes = HashMap::new();
        let mut head = LiquidityNode::new(Tick::HEAD, 0);
        head.next = Tick::TAIL;
        let mut tail = LiquidityNode::new(Tick::TAIL, 0);
        tail.next = Tick::TAIL;
        nodes.insert(Tick::HEAD, head);
        nodes.insert(Tick::TAIL, tail);
        Self {
            nodes,
            ledger: RedemptionLedger::default(),
            spacing_bps,
            reserved: 0,
            orphaned: 0,
        }
    }

    /// Look up a node (linked or delinked).
    pub fn node(&self, tick: Tick) -> Option<&LiquidityNode> {
        if tick.is_reserved() {
            return None;
        }
        self.nodes.get(&tick)
    }

    /// Linked nodes in list order.
    pub fn iter(&self) -> LinkedNodes<'_> {
        let cursor = self.nodes.get(&Tick::HEAD).map_or(Tick::TAIL, |h| h.next);
        LinkedNodes { store: self, cursor }
    }

    /// Linked nodes with `start <= tick <= end`, in list order.
    pub fn liquidity_nodes(&self, start: Tick, end: Tick) -> Vec<&LiquidityNode> {
        self.iter()
            .skip_while(|n| n.tick < start)
            .take_while(|n| n.tick <= end)
            .collect()
    }

    /// Delinked nodes still carrying shares or pending loans.
    pub fn delinked(&self) -> Vec<&LiquidityNode> {
        let mut out: Vec<&LiquidityNode> = self
            .nodes
            .values()
            .filter(|n| !n.tick.is_reserved() && !n.is_linked())
            .collect();
        out.sort_by_key(|n| n.tick);
        out
    }

    /// Sums over every non-sentinel node.
    pub fn totals(&self) -> StoreTotals {
        self.nodes
            .values()
            .filter(|n| !n.tick.is_reserved())
            .fold(StoreTotals::default(), |acc, n| StoreTotals {
                value: acc.value.saturating_add(n.value),
                shares: acc.shares.saturating_add(n.shares),
                available: acc.available.saturating_add(n.available),
                pending: acc.pending.saturating_add(n.pending),
            })
    }

    /// Currency resolved for redemptions but not yet withdrawn.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Residual value swept out of deleted nodes.
    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }

    /// Configured tick spacing in bps.
    pub fn spacing_bps(&self) -> u64 {
        self.spacing_bps
    }

    /// Accrual view of a node. Zero for unknown ticks.
    pub fn accrual(&self, tick: Tick, now: u64) -> AccrualInfo {
        match self.node(tick) {
            Some(node) => AccrualInfo { accrued: node.accrued(now), rate: node.accrual.rate_at(now) },
            None => AccrualInfo::default(),
        }
    }

    /// Ensure a linked node exists for `tick`.
    ///
    /// No-op for an existing linked node. Inserts a fresh node between its
    /// neighbors otherwise.
    ///
    /// # Errors
    ///
    /// - [`LiquidityError::InactiveLiquidity`] for a sentinel, or a delinked
    ///   node that still carries shares or loans
    /// - [`LiquidityError::InvalidTick`] if the tick does not decode or has a zero limit
    /// - [`LiquidityError::InsufficientTickSpacing`] if a linked tick of the same
    ///   partition lies within the spacing percentage
    pub fn instantiate(&mut self, tick: Tick) -> Result<(), LiquidityError> {
        if tick.is_reserved() {
            return Err(LiquidityError::InactiveLiquidity(tick));
        }
        let params = tick.decode().map_err(|e| invalid_tick(tick, e))?;
        if params.limit == 0 {
            return Err(invalid_tick(tick, "zero limit"));
        }
        if let Some(node) = self.nodes.get(&tick) {
            if node.is_linked() {
                return Ok(());
            }
            return Err(LiquidityError::InactiveLiquidity(tick));
        }

        self.check_spacing(tick)?;

        // Walk from the head to the last node ordered before `tick`.
        let mut prev = Tick::HEAD;
        loop {
            let next = self.link_of(prev)?.next;
            if next == Tick::TAIL || next > tick {
                break;
            }
            prev = next;
        }
        let next = self.link_of(prev)?.next;

        let mut node = LiquidityNode::new(tick, self.ledger.next_index(tick));
        node.prev = prev;
        node.next = next;
        self.nodes.insert(tick, node);
        self.link_of_mut(prev)?.next = tick;
        self.link_of_mut(next)?.prev = tick;

        debug!(%tick, %prev, %next, "instantiated liquidity node");
        Ok(())
    }

    fn check_spacing(&self, tick: Tick) -> Result<(), LiquidityError> {
        let partition = tick.partition().map_err(|e| invalid_tick(tick, e))?;
        let magnitude = tick.normalized_limit().map_err(|e| invalid_tick(tick, e))?;

        let mut lower: Option<(u128, Tick)> = None;
        let mut upper: Option<(u128, Tick)> = None;
        for node in self.iter() {
            if node.tick.partition().ok() != Some(partition) {
                continue;
            }
            let other = match node.tick.normalized_limit() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if other == magnitude {
                return Err(LiquidityError::InsufficientTickSpacing { tick, neighbor: node.tick });
            }
            if other < magnitude && lower.is_none_or(|(m, _)| other > m) {
                lower = Some((other, node.tick));
            }
            if other > magnitude && upper.is_none_or(|(m, _)| other < m) {
                upper = Some((other, node.tick));
            }
        }

        if let Some((m, neighbor)) = lower {
            if magnitude < self.spaced(m) {
                return Err(LiquidityError::InsufficientTickSpacing { tick, neighbor });
            }
        }
        if let Some((m, neighbor)) = upper {
            if m < self.spaced(magnitude) {
                return Err(LiquidityError::InsufficientTickSpacing { tick, neighbor });
            }
        }
        Ok(())
    }

    /// `x * (1 + spacing)` without overflowing u128.
    fn spaced(&self, x: u128) -> u128 {
        let bps = BPS_PRECISION as u128;
        let spacing = self.spacing_bps as u128;
        x.saturating_add((x / bps) * spacing + (x % bps) * spacing / bps)
    }

    fn link_of(&self, tick: Tick) -> Result<&LiquidityNode, LiquidityError> {
        self.nodes.get(&tick).ok_or(LiquidityError::UnknownNode(tick))
    }

    fn link_of_mut(&mut self, tick: Tick) -> Result<&mut LiquidityNode, LiquidityError> {
        self.nodes.get_mut(&tick).ok_or(LiquidityError::UnknownNode(tick))
    }

    pub(crate) fn node_mut(&mut self, tick: Tick) -> Result<&mut LiquidityNode, LiquidityError> {
        if tick.is_reserved() {
            return Err(LiquidityError::InactiveLiquidity(tick));
        }
        self.link_of_mut(tick)
    }

    fn unlink(&mut self, tick: Tick) -> Result<(), LiquidityError> {
        let (prev, next) = {
            let node = self.link_of(tick)?;
            (node.prev, node.next)
        };
        self.link_of_mut(prev)?.next = next;
        self.link_of_mut(next)?.prev = prev;
        let node = self.link_of_mut(tick)?;
        node.prev = Tick::HEAD;
        node.next = Tick::HEAD;
        Ok(())
    }

    /// Delete a delinked node once nothing references it any more.
    pub(crate) fn garbage_collect(&mut self, tick: Tick) {
        let collectable = self
            .node(tick)
            .is_some_and(|n| !n.is_linked() && n.shares == 0 && n.pending == 0);
        if !collectable {
            return;
        }
        if let Some(node) = self.nodes.remove(&tick) {
            self.orphaned = self.orphaned.saturating_add(node.value);
            self.ledger.retire(tick, node.redemptions.index);
            debug!(%tick, residual = node.value, "deleted drained liquidity node");
        }
    }

    /// Deposit `amount` into a linked node, returning the shares minted.
    ///
    /// Shares are priced at `(value + accrued) / shares`, or par for an empty
    /// node. Queued redemptions are processed against the new cash.
    ///
    /// # Errors
    ///
    /// - [`LiquidityError::InactiveLiquidity`] for unknown, sentinel, delinked,
    ///   impaired or insolvent nodes
    /// - [`LiquidityError::InvalidAmount`] for a zero amount or zero shares minted
    pub fn deposit(&mut self, tick: Tick, amount: u64, now: u64) -> Result<u64, LiquidityError> {
        if amount == 0 {
            return Err(LiquidityError::InvalidAmount("zero deposit".into()));
        }
        let node = self
            .node_mut(tick)
            .map_err(|_| LiquidityError::InactiveLiquidity(tick))?;
        if !node.is_linked() || node.is_impaired() || node.is_insolvent() {
            return Err(LiquidityError::InactiveLiquidity(tick));
        }

        let shares = if node.shares == 0 {
            amount
        } else {
            let total = node.total_value(now);
            if total == 0 {
                return Err(LiquidityError::InactiveLiquidity(tick));
            }
            to_u64(mul_div(amount as u128, node.shares as u128, total)?)?
        };
        if shares == 0 {
            return Err(LiquidityError::InvalidAmount("deposit mints zero shares".into()));
        }

        node.value = node.value.checked_add(amount).ok_or(LiquidityError::ArithmeticOverflow)?;
        node.available = node
            .available
            .checked_add(amount)
            .ok_or(LiquidityError::ArithmeticOverflow)?;
        node.shares = node.shares.checked_add(shares).ok_or(LiquidityError::ArithmeticOverflow)?;

        debug!(%tick, amount, shares, "deposit");
        self.process_redemptions(tick, now)?;
        Ok(shares)
    }

    /// Lend `used` out of a node that expects `pending` back after `duration` seconds.
    ///
    /// `value` is unchanged; the interest `pending - used` starts accruing linearly.
    pub fn use_liquidity(
        &mut self,
        tick: Tick,
        used: u64,
        pending: u64,
        duration: u64,
        now: u64,
    ) -> Result<(), LiquidityError> {
        if used == 0 || pending < used {
            return Err(LiquidityError::InvalidAmount(format!("used {used}, pending {pending}")));
        }
        if duration == 0 {
            return Err(LiquidityError::InvalidAmount("zero duration".into()));
        }
        let node = self.node_mut(tick)?;
        if !node.is_linked() {
            return Err(LiquidityError::InactiveLiquidity(tick));
        }
        if node.available < used {
            return Err(LiquidityError::InsufficientLiquidity {
                sourced: node.available,
                needed: used,
            });
        }

        node.available -= used;
        node.pending = node.pending.checked_add(pending).ok_or(LiquidityError::ArithmeticOverflow)?;
        let rate = mul_div((pending - used) as u128, FIXED_POINT_SCALE, duration as u128)?;
        node.accrual.flush(now);
        node.accrual.add(rate, now.saturating_add(duration));

        debug!(%tick, used, pending, duration, "use");
        Ok(())
    }

    /// Settle one node's share of a loan.
    ///
    /// `value` moves by `restored - used`, `pending` drops by the receipt's
    /// pending amount and the loan's accrual is removed. A node left impaired
    /// or insolvent is delinked. Returns `true` when this call delinked it.
    pub fn restore(
        &mut self,
        receipt: &NodeReceipt,
        restored: u64,
        duration: u64,
        elapsed: u64,
        now: u64,
    ) -> Result<bool, LiquidityError> {
        let tick = receipt.tick;
        let node = self.node_mut(tick)?;

        node.value = node
            .value
            .checked_sub(receipt.used)
            .and_then(|v| v.checked_add(restored))
            .ok_or(LiquidityError::ArithmeticOverflow)?;
        node.available = node
            .available
            .checked_add(restored)
            .ok_or(LiquidityError::ArithmeticOverflow)?;
        node.pending = node
            .pending
            .checked_sub(receipt.pending)
            .ok_or(LiquidityError::ArithmeticOverflow)?;

        node.accrual.flush(now);
        if node.pending == 0 {
            node.accrual = Accrual { timestamp: now, ..Default::default() };
        } else if duration > 0 {
            let rate = mul_div(
                receipt.pending.saturating_sub(receipt.used) as u128,
                FIXED_POINT_SCALE,
                duration as u128,
            )?;
            let maturity = now.saturating_sub(elapsed).saturating_add(duration);
            node.accrual.remove(rate, maturity, elapsed.min(duration));
        }

        let delink = node.is_linked() && (node.is_impaired() || node.is_insolvent());
        debug!(
            %tick,
            used = receipt.used,
            pending = receipt.pending,
            restored,
            value = node.value,
            "restore"
        );
        if delink {
            warn!(%tick, value = node.value, shares = node.shares, "liquidity node impaired, delinking");
            self.unlink(tick)?;
        }

        self.process_redemptions(tick, now)?;
        self.garbage_collect(tick);
        Ok(delink)
    }
}

/// Iterator over linked nodes in list order.
pub struct LinkedNodes<'a> {
    store: &'a LiquidityStore,
    cursor: Tick,
}

impl<'a> Iterator for LinkedNodes<'a> {
    type Item = &'a LiquidityNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == Tick::TAIL {
            return None;
        }
        let node = self.store.nodes.get(&self.cursor)?;
        self.cursor = node.next;
        Some(node)
    }
}
