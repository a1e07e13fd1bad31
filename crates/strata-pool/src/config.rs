//! Pool configuration.
//!
//! [`PoolConfig`] is loaded from an optional TOML file layered over the
//! defaults, with `STRATA_`-prefixed environment variables on top:
//!
//! ```text
//! STRATA_ADMIN_FEE_BPS=250
//! STRATA_DURATIONS=604800,2592000
//! ```

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use strata_core::constants::{
    BPS_PRECISION, DEFAULT_ADMIN_FEE_BPS, FIXED_POINT_SCALE, MAX_DURATION_CLASSES,
    MAX_NODE_RECEIPTS, MAX_RATE_CLASSES, SECONDS_PER_DAY, SECONDS_PER_YEAR,
    TICK_LIMIT_SPACING_BPS,
};
use strata_core::error::ConfigError;
use strata_core::types::AccountId;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "STRATA";

/// Static parameters of one pool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Loan duration classes in seconds, strictly ascending.
    pub durations: Vec<u64>,
    /// Annual interest rate classes in bps, ascending.
    pub rates_bps: Vec<u64>,
    /// Admin share of interest, in bps.
    pub admin_fee_bps: u64,
    /// Minimum relative spacing between ticks of one partition, in bps.
    pub tick_spacing_bps: u64,
    /// Maximum nodes a single loan may draw from.
    pub max_node_receipts: usize,
    /// Currency token, as hex or a label.
    pub currency_token: String,
    /// Account allowed to withdraw admin fees, as hex or a label.
    pub admin: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            durations: vec![7 * SECONDS_PER_DAY, 14 * SECONDS_PER_DAY, 30 * SECONDS_PER_DAY],
            rates_bps: vec![1_000, 2_000, 3_000],
            admin_fee_bps: DEFAULT_ADMIN_FEE_BPS,
            tick_spacing_bps: TICK_LIMIT_SPACING_BPS,
            max_node_receipts: MAX_NODE_RECEIPTS,
            currency_token: "currency".to_string(),
            admin: "admin".to_string(),
        }
    }
}

fn account(s: &str) -> AccountId {
    AccountId::from_hex(s).unwrap_or_else(|| AccountId::from_label(s))
}

impl PoolConfig {
    /// Load from defaults, an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("durations")
            .with_list_parse_key("rates_bps");
        Self::load_with(path, env)
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&Self::default()).map_err(|e| ConfigError::Load(e.to_string()))?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Self = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.durations.is_empty() || self.durations.len() > MAX_DURATION_CLASSES {
            return Err(ConfigError::InvalidDurations(format!(
                "expected 1..={MAX_DURATION_CLASSES} classes, got {}",
                self.durations.len()
            )));
        }
        if self.durations[0] == 0 {
            return Err(ConfigError::InvalidDurations("zero duration".into()));
        }
        if self.durations.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::InvalidDurations("not strictly ascending".into()));
        }

        if self.rates_bps.is_empty() || self.rates_bps.len() > MAX_RATE_CLASSES {
            return Err(ConfigError::InvalidRates(format!(
                "expected 1..={MAX_RATE_CLASSES} classes, got {}",
                self.rates_bps.len()
            )));
        }
        if self.rates_bps.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::InvalidRates("not ascending".into()));
        }

        if self.admin_fee_bps > BPS_PRECISION {
            return Err(ConfigError::OutOfRange { field: "admin_fee_bps", value: self.admin_fee_bps });
        }
        if self.tick_spacing_bps > BPS_PRECISION {
            return Err(ConfigError::OutOfRange { field: "tick_spacing_bps", value: self.tick_spacing_bps });
        }
        if self.max_node_receipts == 0 || self.max_node_receipts > MAX_NODE_RECEIPTS {
            return Err(ConfigError::OutOfRange {
                field: "max_node_receipts",
                value: self.max_node_receipts as u64,
            });
        }
        Ok(())
    }

    /// Per-second rates scaled by `FIXED_POINT_SCALE`, indexed by rate class.
    pub fn rates(&self) -> Vec<u128> {
        self.rates_bps
            .iter()
            .map(|&bps| {
                bps as u128 * FIXED_POINT_SCALE / BPS_PRECISION as u128 / SECONDS_PER_YEAR as u128
            })
            .collect()
    }

    /// Shortest duration class covering `duration`.
    pub fn duration_class(&self, duration: u64) -> Option<u8> {
        self.durations
            .iter()
            .position(|&d| d >= duration)
            .map(|i| i as u8)
    }

    pub fn currency_token(&self) -> AccountId {
        account(&self.currency_token)
    }

    pub fn admin(&self) -> AccountId {
        account(&self.admin)
    }
}
