//! Scenario files: a JSON list of pool operations replayed in order.
//!
//! Amounts are given in whole currency units and may be fractional. Ticks
//! use the same notation the pool logs them in, with absolute limits in
//! whole units:
//!
//! ```text
//! abs:10/d2/r1        absolute limit of 10 units, duration class 2, rate class 1
//! ratio:25e-2/d2/r0   25% of the collateral price
//! ```

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use strata_core::constants::UNIT;
use strata_core::tick::{Tick, TickParams};

/// Default scenario start, in seconds.
pub const DEFAULT_START: u64 = 1_700_000_000;

#[derive(Deserialize, Debug)]
pub struct Scenario {
    /// Clock value of the first step.
    #[serde(default = "default_start")]
    pub start: u64,
    /// Collateral collections the pool accepts. The first is the default
    /// for borrows and the collection bundles are made of.
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// Fixed collateral price in units, for ratio ticks.
    #[serde(default)]
    pub oracle_price: Option<f64>,
    pub steps: Vec<Step>,
}

fn default_start() -> u64 {
    DEFAULT_START
}

fn default_collections() -> Vec<String> {
    vec!["collection".to_string()]
}

#[derive(Deserialize, Debug)]
pub struct Step {
    /// The pool must reject this step.
    #[serde(default)]
    pub expect_error: bool,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    Deposit {
        account: String,
        tick: String,
        amount: f64,
        #[serde(default)]
        min_shares: f64,
    },
    /// Redeem `shares`, or everything still redeemable.
    Redeem {
        account: String,
        tick: String,
        #[serde(default)]
        shares: Option<f64>,
    },
    Withdraw {
        account: String,
        tick: String,
    },
    Rebalance {
        account: String,
        from: String,
        to: String,
        #[serde(default)]
        min_shares: f64,
    },
    /// Originate a loan and remember its receipt under `loan`.
    Borrow {
        loan: String,
        borrower: String,
        amount: f64,
        duration_days: u64,
        ticks: Vec<String>,
        #[serde(default)]
        collection: Option<String>,
        #[serde(default)]
        token_id: u64,
        /// Item ids of the default collection, borrowed against as one bundle.
        #[serde(default)]
        bundle: Vec<u64>,
        #[serde(default)]
        max_repayment: Option<f64>,
        #[serde(default)]
        min_rate_class: Option<u8>,
    },
    Repay {
        loan: String,
    },
    Refinance {
        loan: String,
        new_loan: String,
        amount: f64,
        duration_days: u64,
        ticks: Vec<String>,
        #[serde(default)]
        max_repayment: Option<f64>,
    },
    Liquidate {
        loan: String,
    },
    /// Liquidator reports sale proceeds for `loan`.
    Proceeds {
        loan: String,
        amount: f64,
    },
    /// Admin withdraws `amount`, or the whole fee balance.
    WithdrawFees {
        recipient: String,
        #[serde(default)]
        amount: Option<f64>,
    },
    Wait {
        #[serde(default)]
        days: u64,
        #[serde(default)]
        seconds: u64,
    },
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(json).context("Invalid scenario")?;
        if scenario.collections.is_empty() {
            bail!("Scenario must accept at least one collection");
        }
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_json(&json)
    }
}

/// Whole units to base units.
pub fn units(amount: f64) -> Result<u64> {
    if !amount.is_finite() || amount < 0.0 {
        bail!("Invalid amount {amount}");
    }
    let base = (amount * UNIT as f64).round();
    if base > u64::MAX as f64 {
        bail!("Amount {amount} out of range");
    }
    Ok(base as u64)
}

fn class(part: Option<&str>, prefix: char, notation: &str) -> Result<u8> {
    part.and_then(|p| p.strip_prefix(prefix))
        .ok_or_else(|| anyhow!("Tick {notation}: expected {prefix}<class>"))?
        .parse()
        .with_context(|| format!("Tick {notation}: bad {prefix} class"))
}

/// Parse a tick in `abs:<units>/d<n>/r<n>` or `ratio:<n>e-<scale>/d<n>/r<n>` form.
pub fn parse_tick(notation: &str) -> Result<Tick> {
    let (kind, rest) = notation
        .split_once(':')
        .ok_or_else(|| anyhow!("Tick {notation}: expected <kind>:<limit>/d<n>/r<n>"))?;
    let mut parts = rest.split('/');
    let limit = parts.next().unwrap_or_default();
    let duration_class = class(parts.next(), 'd', notation)?;
    let rate_class = class(parts.next(), 'r', notation)?;
    if parts.next().is_some() {
        bail!("Tick {notation}: trailing fields");
    }

    let params = match kind {
        "abs" => {
            let limit: f64 = limit.parse().with_context(|| format!("Tick {notation}: bad limit"))?;
            TickParams::absolute(units(limit)?, duration_class, rate_class)
        }
        "ratio" => {
            let (numerator, scale) = limit.split_once("e-").unwrap_or((limit, "0"));
            TickParams::ratio(
                numerator.parse().with_context(|| format!("Tick {notation}: bad ratio"))?,
                scale.parse().with_context(|| format!("Tick {notation}: bad scale"))?,
                duration_class,
                rate_class,
            )
        }
        other => bail!("Tick {notation}: unknown kind {other}"),
    };
    Tick::encode(&params).with_context(|| format!("Tick {notation}"))
}

pub fn parse_ticks(specs: &[String]) -> Result<Vec<Tick>> {
    specs.iter().map(|s| parse_tick(s)).collect()
}
