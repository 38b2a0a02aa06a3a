//! Exact rational quantities with tracked display precision.
//!
//! A [`Quantity`] wraps a canonical `BigRational` together with the number
//! of fractional digits intended for display. Arithmetic never rounds the
//! underlying value; only [`Quantity::round`] does, and printing rounds a
//! copy. The display precision widens through arithmetic so that derived
//! values keep showing the digits that went into them.

use std::cmp::Ordering;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};
use rust_decimal::Decimal;

use crate::amount::{AmountError, AmountResult};

/// Precision type for tracking decimal places.
pub type Precision = u16;

/// Number of extra digits of precision carried through division so that
/// chained calculations do not visibly lose precision.
pub const EXTEND_BY_DIGITS: Precision = 6;

/// An arbitrary-precision signed rational with display precision.
#[derive(Debug, Clone)]
pub struct Quantity {
    value: BigRational,
    precision: Precision,
    keep_precision: bool,
}

impl Quantity {
    /// An exact zero with no fractional digits.
    pub fn zero() -> Self {
        Self::from_rational(BigRational::zero())
    }

    /// Wrap an already-canonical rational. Display precision starts at 0.
    pub fn from_rational(value: BigRational) -> Self {
        Self { value, precision: 0, keep_precision: false }
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_rational(BigRational::from_integer(BigInt::from(value)))
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_rational(BigRational::from_integer(BigInt::from(value)))
    }

    /// Convert from a double. The conversion is exact: the decimal digits
    /// of the source value are preserved without further rounding.
    pub fn from_f64(value: f64) -> AmountResult<Self> {
        if !value.is_finite() {
            return Err(AmountError::InvalidConversion(format!(
                "cannot create a quantity from non-finite value {}",
                value
            )));
        }
        let decimal = Decimal::try_from(value)
            .map_err(|e| AmountError::InvalidConversion(e.to_string()))?;
        Ok(Self::from_decimal(decimal))
    }

    /// Convert from a `rust_decimal::Decimal` via mantissa and scale.
    pub fn from_decimal(decimal: Decimal) -> Self {
        let numer = BigInt::from(decimal.mantissa());
        let denom = BigInt::from(10u32).pow(decimal.scale());
        Self {
            value: BigRational::new(numer, denom),
            precision: decimal.scale() as Precision,
            keep_precision: false,
        }
    }

    /// Parse a plain decimal string: optional sign, digits, optional
    /// fractional part. Separators are handled by the amount parser, not
    /// here. The display precision is the count of fractional digits.
    pub fn parse(text: &str) -> AmountResult<Self> {
        let trimmed = text.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Syntax(format!("no digits in quantity {:?}", text)));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(AmountError::Syntax(format!("invalid quantity {:?}", text)));
        }

        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        let numer = BigInt::parse_bytes(digits.as_bytes(), 10)
            .ok_or_else(|| AmountError::Syntax(format!("invalid quantity {:?}", text)))?;
        let denom = BigInt::from(10u32).pow(frac_part.len() as u32);

        let mut value = BigRational::new(numer, denom);
        if negative {
            value = -value;
        }
        Ok(Self { value, precision: frac_part.len() as Precision, keep_precision: false })
    }

    pub fn value(&self) -> &BigRational {
        &self.value
    }

    pub fn into_rational(self) -> BigRational {
        self.value
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    /// Whether printing should ignore commodity display precision and show
    /// the full internal precision instead.
    pub fn keeps_precision(&self) -> bool {
        self.keep_precision
    }

    pub fn set_keep_precision(&mut self, keep: bool) {
        self.keep_precision = keep;
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn is_integer(&self) -> bool {
        self.value.is_integer()
    }

    /// Returns -1, 0 or 1.
    pub fn sign(&self) -> i32 {
        if self.value.is_zero() {
            0
        } else if self.value.is_positive() {
            1
        } else {
            -1
        }
    }

    pub fn add(&self, other: &Quantity) -> Quantity {
        Quantity {
            value: &self.value + &other.value,
            precision: self.precision.max(other.precision),
            keep_precision: self.keep_precision || other.keep_precision,
        }
    }

    pub fn sub(&self, other: &Quantity) -> Quantity {
        Quantity {
            value: &self.value - &other.value,
            precision: self.precision.max(other.precision),
            keep_precision: self.keep_precision || other.keep_precision,
        }
    }

    pub fn mul(&self, other: &Quantity) -> Quantity {
        Quantity {
            value: &self.value * &other.value,
            precision: self.precision.saturating_add(other.precision),
            keep_precision: self.keep_precision || other.keep_precision,
        }
    }

    pub fn div(&self, other: &Quantity) -> AmountResult<Quantity> {
        if other.value.is_zero() {
            return Err(AmountError::DivisionByZero);
        }
        Ok(Quantity {
            value: &self.value / &other.value,
            precision: self.precision.saturating_add(EXTEND_BY_DIGITS),
            keep_precision: self.keep_precision || other.keep_precision,
        })
    }

    pub fn negated(&self) -> Quantity {
        Quantity { value: -self.value.clone(), ..self.clone() }
    }

    pub fn negate(&mut self) {
        self.value = -std::mem::replace(&mut self.value, BigRational::zero());
    }

    pub fn abs(&self) -> Quantity {
        Quantity { value: self.value.abs(), ..self.clone() }
    }

    /// Exact total order on the underlying rational values.
    pub fn compare(&self, other: &Quantity) -> Ordering {
        self.value.cmp(&other.value)
    }

    /// Round half-away-from-zero to `precision` fractional digits. The
    /// result's display precision equals `precision` and the underlying
    /// value is changed, unlike printing which rounds a copy.
    pub fn round(&self, precision: Precision) -> Quantity {
        let scale = BigInt::from(10u32).pow(precision as u32);
        let scaled = &self.value * BigRational::from_integer(scale.clone());
        let half = BigRational::new(BigInt::one(), BigInt::from(2));
        let shifted = if scaled.is_negative() { scaled - half } else { scaled + half };
        Quantity {
            value: BigRational::new(shifted.to_integer(), scale),
            precision,
            keep_precision: false,
        }
    }

    /// Lossy conversion to a double.
    pub fn to_f64(&self) -> AmountResult<f64> {
        self.value.to_f64().ok_or_else(|| {
            AmountError::InvalidConversion("quantity does not fit in an f64".to_string())
        })
    }

    /// Truncates toward zero.
    pub fn to_i64(&self) -> AmountResult<i64> {
        self.value.to_integer().to_i64().ok_or_else(|| {
            AmountError::InvalidConversion("quantity does not fit in an i64".to_string())
        })
    }
}

// Display precision is presentation state: two quantities are the same
// number even when they print differently.
impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Quantity {}
