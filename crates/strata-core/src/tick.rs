//! Tick codec.
//!
//! A tick is a 128-bit key identifying one liquidity node. It packs the
//! node's risk limit together with the loan classes it accepts:
//!
//! ```text
//! +------------------------------------------------------------------------+
//! |  127..64   |  63..16   |  15..8  |   7..5    |   4..2     |    1..0    |
//! |   limit    | reserved  |  scale  | duration  |   rate     | limit type |
//! |   (u64)    |  (zero)   |  (u8)   |  (3 bits) |  (3 bits)  |  (2 bits)  |
//! +------------------------------------------------------------------------+
//! ```
//!
//! Absolute ticks carry their limit in currency base units and must have a
//! zero scale. Ratio ticks carry `limit / 10^scale` as a fraction of the
//! collateral price reported by an oracle; their effective limit is only known
//! once a price is supplied.
//!
//! Ratio ticks are always stored at scale [`MAX_RATIO_SCALE`]: encoding
//! rescales the numerator and decoding rejects any other scale, so each ratio
//! has exactly one key. Because the limit occupies the high bits, raw ordering
//! of two ticks with the same limit type then agrees with their
//! effective-limit ordering under any price.
//! Raw value `0` and `u128::MAX` are reserved for the node list sentinels.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::constants::{MAX_DURATION_CLASSES, MAX_RATE_CLASSES, MAX_RATIO_SCALE};
use crate::error::TickError;

const LIMIT_SHIFT: u32 = 64;
const SCALE_SHIFT: u32 = 8;
const DURATION_SHIFT: u32 = 5;
const RATE_SHIFT: u32 = 2;

const RESERVED_MASK: u128 = ((1u128 << 48) - 1) << 16;
const SCALE_MASK: u128 = 0xff;
const CLASS_MASK: u128 = 0x7;
const TYPE_MASK: u128 = 0x3;

/// How a tick's limit is interpreted.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LimitType {
    /// Limit is an amount of currency base units.
    Absolute = 0,
    /// Limit is a fraction of the collateral price.
    Ratio = 1,
}

impl TryFrom<u8> for LimitType {
    type Error = TickError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Absolute),
            1 => Ok(Self::Ratio),
            other => Err(TickError::InvalidLimitType(other)),
        }
    }
}

/// Decoded tick fields.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TickParams {
    /// Limit magnitude: base units (absolute) or ratio numerator (ratio).
    pub limit: u64,
    /// Index into the pool's duration classes.
    pub duration_class: u8,
    /// Index into the pool's rate classes.
    pub rate_class: u8,
    /// Interpretation of `limit`.
    pub limit_type: LimitType,
    /// Decimal scale of a ratio limit. Zero for absolute ticks.
    #[serde(default)]
    pub scale: u8,
}

impl TickParams {
    /// Absolute tick parameters.
    pub fn absolute(limit: u64, duration_class: u8, rate_class: u8) -> Self {
        Self {
            limit,
            duration_class,
            rate_class,
            limit_type: LimitType::Absolute,
            scale: 0,
        }
    }

    /// Ratio tick parameters: the limit is `limit / 10^scale` of the collateral price.
    pub fn ratio(limit: u64, scale: u8, duration_class: u8, rate_class: u8) -> Self {
        Self {
            limit,
            duration_class,
            rate_class,
            limit_type: LimitType::Ratio,
            scale,
        }
    }

    fn validate(&self) -> Result<(), TickError> {
        if self.duration_class as usize >= MAX_DURATION_CLASSES {
            return Err(TickError::ClassOutOfRange { kind: "duration", index: self.duration_class });
        }
        if self.rate_class as usize >= MAX_RATE_CLASSES {
            return Err(TickError::ClassOutOfRange { kind: "rate", index: self.rate_class });
        }
        match self.limit_type {
            LimitType::Absolute if self.scale != 0 => Err(TickError::InvalidScale(self.scale)),
            LimitType::Ratio if self.scale > MAX_RATIO_SCALE => Err(TickError::InvalidScale(self.scale)),
            _ => Ok(()),
        }
    }

    /// The single encodable form of these parameters.
    ///
    /// Ratio limits are rescaled to [`MAX_RATIO_SCALE`]; absolute parameters
    /// are returned unchanged.
    pub fn canonical(&self) -> Result<Self, TickError> {
        self.validate()?;
        match self.limit_type {
            LimitType::Absolute => Ok(*self),
            LimitType::Ratio => {
                let factor = 10u64.pow((MAX_RATIO_SCALE - self.scale) as u32);
                let limit = self.limit.checked_mul(factor).ok_or(TickError::LimitOverflow)?;
                Ok(Self { limit, scale: MAX_RATIO_SCALE, ..*self })
            }
        }
    }
}

/// Encoded tick key. Ordered by raw value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Tick(pub u128);

impl Tick {
    /// Head sentinel of the node list.
    pub const HEAD: Self = Self(0);
    /// Tail sentinel of the node list.
    pub const TAIL: Self = Self(u128::MAX);

    /// Pack tick parameters into a key.
    ///
    /// Ratio parameters are stored in [canonical](TickParams::canonical) form;
    /// fails with [`TickError::LimitOverflow`] when rescaling overflows.
    pub fn encode(params: &TickParams) -> Result<Self, TickError> {
        let params = params.canonical()?;
        Ok(Self(
            (params.limit as u128) << LIMIT_SHIFT
                | (params.scale as u128) << SCALE_SHIFT
                | (params.duration_class as u128) << DURATION_SHIFT
                | (params.rate_class as u128) << RATE_SHIFT
                | params.limit_type as u128,
        ))
    }

    /// Unpack the key.
    ///
    /// Fails on a non-zero reserved field, an unknown limit type discriminant,
    /// or a scale that is invalid for the limit type. Ratio keys must carry
    /// scale [`MAX_RATIO_SCALE`].
    pub fn decode(self) -> Result<TickParams, TickError> {
        if self.0 & RESERVED_MASK != 0 {
            return Err(TickError::ReservedBits);
        }
        let params = TickParams {
            limit: (self.0 >> LIMIT_SHIFT) as u64,
            scale: ((self.0 >> SCALE_SHIFT) & SCALE_MASK) as u8,
            duration_class: ((self.0 >> DURATION_SHIFT) & CLASS_MASK) as u8,
            rate_class: ((self.0 >> RATE_SHIFT) & CLASS_MASK) as u8,
            limit_type: LimitType::try_from((self.0 & TYPE_MASK) as u8)?,
        };
        params.validate()?;
        if params.limit_type == LimitType::Ratio && params.scale != MAX_RATIO_SCALE {
            return Err(TickError::InvalidScale(params.scale));
        }
        Ok(params)
    }

    /// Whether this is one of the list sentinels.
    pub fn is_reserved(self) -> bool {
        self == Self::HEAD || self == Self::TAIL
    }

    /// Limit in currency base units.
    ///
    /// Absolute ticks ignore `price`. Ratio ticks compute
    /// `price * limit / 10^scale` and fail without a price.
    pub fn effective_limit(self, price: Option<u64>) -> Result<u64, TickError> {
        let params = self.decode()?;
        match params.limit_type {
            LimitType::Absolute => Ok(params.limit),
            LimitType::Ratio => {
                let price = price.ok_or(TickError::MissingPrice)?;
                let denom = 10u128.pow(params.scale as u32);
                let limit = (price as u128)
                    .checked_mul(params.limit as u128)
                    .ok_or(TickError::LimitOverflow)?
                    / denom;
                u64::try_from(limit).map_err(|_| TickError::LimitOverflow)
            }
        }
    }

    /// Price-independent magnitude for comparing ticks of the same limit type:
    /// base units for absolute ticks, the ratio at `MAX_RATIO_SCALE` decimals
    /// for ratio ticks.
    pub fn normalized_limit(self) -> Result<u128, TickError> {
        Ok(self.decode()?.limit as u128)
    }

    /// Spacing partition: ticks only compete for spacing within the same
    /// limit type, duration class and rate class.
    pub fn partition(self) -> Result<(LimitType, u8, u8), TickError> {
        let params = self.decode()?;
        Ok((params.limit_type, params.duration_class, params.rate_class))
    }

    /// Total order over effective limits under one price, ties broken by raw value.
    pub fn cmp_effective(self, other: Self, price: Option<u64>) -> Result<Ordering, TickError> {
        let a = self.effective_limit(price)?;
        let b = other.effective_limit(price)?;
        Ok(a.cmp(&b).then(self.0.cmp(&other.0)))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(p) if !self.is_reserved() => match p.limit_type {
                LimitType::Absolute => {
                    write!(f, "abs:{}/d{}/r{}", p.limit, p.duration_class, p.rate_class)
                }
                LimitType::Ratio => {
                    let (mut limit, mut scale) = (p.limit, p.scale);
                    while scale > 0 && limit % 10 == 0 {
                        limit /= 10;
                        scale -= 1;
                    }
                    write!(f, "ratio:{limit}e-{scale}/d{}/r{}", p.duration_class, p.rate_class)
                }
            },
            _ => write!(f, "{:#x}", self.0),
        }
    }
}

impl From<u128> for Tick {
    fn from(raw: u128) -> Self {
        Self(raw)
    }
}
