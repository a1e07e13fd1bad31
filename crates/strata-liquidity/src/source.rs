//! Liquidity sourcing.
//!
//! The borrower supplies candidate ticks in strictly increasing effective
//! limit order. Walking them in order, each node may contribute only up to
//! the point where the cumulative amount sourced reaches its limit times the
//! collateral multiplier, so cheaper (lower-limit) capital is always consumed
//! first and a lender's limit is never exceeded.

use tracing::debug;

use strata_core::error::LiquidityError;
use strata_core::tick::Tick;

use crate::node::LiquidityStore;

/// Parameters of one sourcing pass.
#[derive(Clone, Copy, Debug)]
pub struct SourceRequest<'a> {
    /// Principal to source.
    pub amount: u64,
    /// Candidate ticks, strictly increasing by effective limit.
    pub ticks: &'a [Tick],
    /// Number of collateral items backing the loan.
    pub multiplier: u64,
    /// Candidates with a shorter duration class are rejected.
    pub min_duration_class: u8,
    /// Candidates with a lower rate class are rejected, if set.
    pub min_rate_class: Option<u8>,
    /// Collateral price resolving ratio ticks.
    pub price: Option<u64>,
    /// Maximum number of contributing nodes.
    pub max_nodes: usize,
}

/// One node's contribution to a loan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSource {
    pub tick: Tick,
    pub used: u64,
}

fn reject(tick: Tick, reason: impl ToString) -> LiquidityError {
    LiquidityError::InvalidTick { tick, reason: reason.to_string() }
}

impl LiquidityStore {
    /// Plan how `request.amount` is drawn from the candidate ticks.
    ///
    /// Read-only: the same request against the same store yields the same plan.
    ///
    /// # Errors
    ///
    /// - [`LiquidityError::InvalidTick`] if a candidate is a sentinel, does not
    ///   decode, has a zero limit, falls below the duration or rate minimum,
    ///   cannot be priced, or breaks the increasing order
    /// - [`LiquidityError::InsufficientLiquidity`] if the candidates cannot
    ///   cover the amount within `max_nodes` contributions
    pub fn source(&self, request: &SourceRequest<'_>) -> Result<Vec<NodeSource>, LiquidityError> {
        if request.amount == 0 {
            return Err(LiquidityError::InvalidAmount("zero principal".into()));
        }

        let mut limits = Vec::with_capacity(request.ticks.len());
        let mut last: Option<u64> = None;
        for &tick in request.ticks {
            if tick.is_reserved() {
                return Err(reject(tick, "reserved tick"));
            }
            let params = tick.decode().map_err(|e| reject(tick, e))?;
            if params.limit == 0 {
                return Err(reject(tick, "zero limit"));
            }
            if params.duration_class < request.min_duration_class {
                return Err(reject(tick, "duration class below loan duration"));
            }
            if let Some(min_rate) = request.min_rate_class {
                if params.rate_class < min_rate {
                    return Err(reject(tick, "rate class below minimum"));
                }
            }
            let limit = tick.effective_limit(request.price).map_err(|e| reject(tick, e))?;
            if last.is_some_and(|prev| limit <= prev) {
                return Err(reject(tick, "ticks not strictly increasing"));
            }
            last = Some(limit);
            limits.push(limit);
        }

        let mut plan = Vec::new();
        let mut taken = 0u64;
        for (&tick, &limit) in request.ticks.iter().zip(&limits) {
            if taken == request.amount || plan.len() == request.max_nodes {
                break;
            }
            let Some(node) = self.node(tick) else { continue };
            if !node.is_linked() || node.is_impaired() {
                continue;
            }
            let cap = limit.saturating_mul(request.multiplier).saturating_sub(taken);
            let used = cap.min(node.available).min(request.amount - taken);
            if used == 0 {
                continue;
            }
            taken += used;
            plan.push(NodeSource { tick, used });
        }

        if taken < request.amount {
            return Err(LiquidityError::InsufficientLiquidity { sourced: taken, needed: request.amount });
        }
        debug!(amount = request.amount, nodes = plan.len(), "sourced liquidity");
        Ok(plan)
    }
}
