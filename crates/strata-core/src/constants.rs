//! Protocol constants. All currency amounts are in base units (1 UNIT = 10^8 base units).

/// Base units per whole currency unit.
pub const UNIT: u64 = 100_000_000;

/// Fixed-point scale for share prices and per-second rates (1.0 = 10^18).
pub const FIXED_POINT_SCALE: u128 = 1_000_000_000_000_000_000;

/// Basis-point denominator (100% = 10_000 bps).
pub const BPS_PRECISION: u64 = 10_000;

/// Seconds in a 365-day year, used to convert annual rates to per-second rates.
pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;

/// Seconds in one day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Minimum relative spacing between two ticks of the same partition, in bps.
///
/// A new tick whose limit lies within 10% of an existing tick's limit (same
/// limit type, duration class and rate class) is rejected.
pub const TICK_LIMIT_SPACING_BPS: u64 = 1_000;

/// Share price below which a node with outstanding shares is impaired (5% of par).
pub const IMPAIRED_PRICE_THRESHOLD: u128 = FIXED_POINT_SCALE / 20;

/// Maximum number of node receipts a single loan may draw from.
pub const MAX_NODE_RECEIPTS: usize = 16;

/// Maximum number of duration classes (3-bit index).
pub const MAX_DURATION_CLASSES: usize = 8;

/// Maximum number of rate classes (3-bit index).
pub const MAX_RATE_CLASSES: usize = 8;

/// Decimal scale of every encoded ratio tick (`ratio = limit / 10^scale`).
///
/// Ratio parameters given at a smaller scale are rescaled on encode, so the
/// largest representable ratio is `u64::MAX / 10^18`, about 18.4.
pub const MAX_RATIO_SCALE: u8 = 18;

/// Current loan receipt layout version.
pub const LOAN_RECEIPT_VERSION: u8 = 2;

/// Maximum length of the collateral wrapper context embedded in a receipt.
pub const MAX_WRAPPER_CONTEXT_LEN: usize = u16::MAX as usize;

/// Default admin fee share of interest, in bps.
pub const DEFAULT_ADMIN_FEE_BPS: u64 = 500;
