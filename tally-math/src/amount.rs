//! Commoditized arbitrary-precision amounts.
//!
//! An [`Amount`] couples an exact rational [`Quantity`] with an optional
//! commodity reference. Amounts parse from and print back to the textual
//! forms users write (`$1,234.56`, `10 AAPL {$20}`), do exact arithmetic,
//! convert along commodity scaling links, and value themselves against a
//! commodity's price history.
//!
//! Internal precision always exceeds display precision: arithmetic never
//! rounds, printing rounds a copy, and only [`Amount::rounded`] and
//! friends change the value itself.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use bitflags::bitflags;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commodity::{Annotation, CommodityFlags, CommodityRef, KeepDetails};
use crate::datetime::{parse_date, Moment};
use crate::formatting::render_quantity;
use crate::pool::CommodityPool;
use crate::quantity::{Precision, Quantity, EXTEND_BY_DIGITS};

/// Errors surfaced by amount and commodity operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Cannot perform operation on amounts with different commodities")]
    CommodityMismatch,
    #[error("Syntax error: {0}")]
    Syntax(String),
    #[error("Invalid commodity symbol: {0}")]
    InvalidSymbol(String),
    #[error("Commodity already exists: {0}")]
    DuplicateCommodity(String),
    #[error("Unknown commodity ident {0}")]
    UnknownCommodity(u32),
    #[error("Corrupt serialized amount: {0}")]
    Corrupt(String),
    #[error("Amounts are not related by a scaling conversion")]
    NotReducible,
    #[error("Invalid numeric conversion: {0}")]
    InvalidConversion(String),
    #[error("Amount is null (uninitialized)")]
    NullAmount,
}

impl From<io::Error> for AmountError {
    fn from(err: io::Error) -> Self {
        AmountError::Corrupt(err.to_string())
    }
}

/// Result type for amount operations.
pub type AmountResult<T> = Result<T, AmountError>;

bitflags! {
    /// Flags controlling [`Amount::parse`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParseFlags: u8 {
        /// Do not widen the commodity's display precision to the parsed
        /// precision.
        const NO_MIGRATE = 0x01;
        /// Do not reduce the result along commodity scaling links.
        const NO_REDUCE  = 0x02;
    }
}

// Binary serialization tag bits. Readers reject anything else.
const TAG_HAS_QUANTITY: u8 = 0x01;
const TAG_HAS_COMMODITY: u8 = 0x02;
const TAG_ANNOTATED: u8 = 0x04;
const TAG_KNOWN: u8 = TAG_HAS_QUANTITY | TAG_HAS_COMMODITY | TAG_ANNOTATED;

const MAX_MAGNITUDE_BYTES: u64 = 1 << 16;
const MAX_PRECISION: Precision = 1024;

/// An arbitrary-precision signed quantity, optionally bearing a commodity.
///
/// A default-constructed amount is *null*: it has neither quantity nor
/// commodity, behaves as zero in arithmetic, and compares equal to zero.
/// The null commodity sentinel of a pool counts as "no commodity".
#[derive(Clone)]
pub struct Amount {
    quantity: Option<Quantity>,
    commodity: Option<CommodityRef>,
}

impl Amount {
    /// The null amount: no quantity, no commodity.
    pub fn null() -> Self {
        Self { quantity: None, commodity: None }
    }

    pub fn from_quantity(quantity: Quantity) -> Self {
        Self { quantity: Some(quantity), commodity: None }
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_quantity(Quantity::from_i64(value))
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_quantity(Quantity::from_u64(value))
    }

    /// Exact conversion from a double; fails on non-finite input.
    pub fn from_f64(value: f64) -> AmountResult<Self> {
        Ok(Self::from_quantity(Quantity::from_f64(value)?))
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Self::from_quantity(Quantity::from_decimal(value))
    }

    /// Parse an amount whose display precision is never truncated, even
    /// though its commodity normally rounds on display. The commodity's
    /// own display precision is left untouched.
    pub fn exact(pool: &mut CommodityPool, text: &str) -> AmountResult<Self> {
        let mut amount = Self::parse(pool, text, ParseFlags::NO_MIGRATE)?;
        if let Some(quantity) = &mut amount.quantity {
            quantity.set_keep_precision(true);
        }
        Ok(amount)
    }

    pub fn quantity(&self) -> Option<&Quantity> {
        self.quantity.as_ref()
    }

    /// The amount's commodity. A pool's null commodity sentinel is
    /// reported as `None`.
    pub fn commodity(&self) -> Option<&CommodityRef> {
        self.commodity.as_ref().filter(|c| !c.is_null())
    }

    pub fn has_commodity(&self) -> bool {
        self.commodity().is_some()
    }

    /// Attach a commodity. A null amount gains a zero quantity so the
    /// result is a well-formed commoditized zero.
    pub fn set_commodity(&mut self, commodity: CommodityRef) {
        if self.quantity.is_none() {
            self.quantity = Some(Quantity::zero());
        }
        self.commodity = Some(commodity);
    }

    pub fn clear_commodity(&mut self) {
        self.commodity = None;
    }

    /// A commodity-stripped copy: just the numeric portion.
    pub fn number(&self) -> Self {
        Self { quantity: self.quantity.clone(), commodity: None }
    }

    pub fn is_null(&self) -> bool {
        self.quantity.is_none() && !self.has_commodity()
    }

    /// True if the actual internal value is zero.
    pub fn is_realzero(&self) -> bool {
        self.quantity.as_ref().map_or(true, Quantity::is_zero)
    }

    /// True if the display value is zero: `$0.0001` is zero at a display
    /// precision of 2, but not realzero.
    pub fn is_zero(&self) -> bool {
        let Some(quantity) = &self.quantity else { return true };
        if quantity.keeps_precision() {
            return quantity.is_zero();
        }
        match self.commodity() {
            Some(commodity) => quantity.round(commodity.precision()).is_zero(),
            None => quantity.is_zero(),
        }
    }

    pub fn is_nonzero(&self) -> bool {
        !self.is_zero()
    }

    /// Returns -1, 0 or 1 from the actual internal value.
    pub fn sign(&self) -> i32 {
        self.quantity.as_ref().map_or(0, Quantity::sign)
    }

    pub fn to_i64(&self) -> AmountResult<i64> {
        match &self.quantity {
            None => Ok(0),
            Some(quantity) => quantity.to_i64(),
        }
    }

    pub fn to_f64(&self) -> AmountResult<f64> {
        match &self.quantity {
            None => Ok(0.0),
            Some(quantity) => quantity.to_f64(),
        }
    }

    pub fn in_place_negate(&mut self) {
        if let Some(quantity) = &mut self.quantity {
            quantity.negate();
        }
    }

    pub fn negated(&self) -> Self {
        let mut result = self.clone();
        result.in_place_negate();
        result
    }

    pub fn abs(&self) -> Self {
        if self.sign() < 0 {
            self.negated()
        } else {
            self.clone()
        }
    }

    /// Total order on the numeric values. Fails with `CommodityMismatch`
    /// when both operands are commoditized with different commodities; a
    /// null or unitless side compares as a plain number.
    pub fn compare(&self, other: &Amount) -> AmountResult<Ordering> {
        if let (Some(a), Some(b)) = (self.commodity(), other.commodity()) {
            if **a != **b {
                return Err(AmountError::CommodityMismatch);
            }
        }
        Ok(match (&self.quantity, &other.quantity) {
            (None, None) => Ordering::Equal,
            (Some(a), None) => a.compare(&Quantity::zero()),
            (None, Some(b)) => Quantity::zero().compare(b),
            (Some(a), Some(b)) => a.compare(b),
        })
    }

    fn combined_commodity(
        &self,
        other: &Amount,
        keep: &KeepDetails,
    ) -> AmountResult<Option<CommodityRef>> {
        match (self.commodity(), other.commodity()) {
            (None, None) => Ok(None),
            (Some(c), None) | (None, Some(c)) => Ok(Some(c.clone())),
            (Some(a), Some(b)) => {
                if **a == **b {
                    return Ok(Some(a.clone()));
                }
                if keep.keep_any() {
                    return Err(AmountError::CommodityMismatch);
                }
                // With no lot details kept, annotated lots degrade to
                // their referent, so `10 AAPL {$20} + 10 AAPL` is `20 AAPL`.
                let a = strip_for_arithmetic(a);
                let b = strip_for_arithmetic(b);
                if a.shares_base_with(&b) {
                    Ok(Some(a))
                } else {
                    Err(AmountError::CommodityMismatch)
                }
            }
        }
    }

    /// In-place addition honouring `keep`: lot annotations not kept are
    /// stripped when that makes the commodities agree.
    pub fn add_with(&mut self, other: &Amount, keep: &KeepDetails) -> AmountResult<()> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            *self = other.clone();
            return Ok(());
        }
        let commodity = self.combined_commodity(other, keep)?;
        let lhs = self.quantity.take().unwrap_or_else(Quantity::zero);
        let rhs = other.quantity.clone().unwrap_or_else(Quantity::zero);
        self.quantity = Some(lhs.add(&rhs));
        self.commodity = commodity;
        Ok(())
    }

    /// In-place addition with the default keep-nothing policy.
    pub fn add_amount(&mut self, other: &Amount) -> AmountResult<()> {
        self.add_with(other, &KeepDetails::default())
    }

    /// In-place subtraction honouring `keep`.
    pub fn sub_with(&mut self, other: &Amount, keep: &KeepDetails) -> AmountResult<()> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            *self = other.negated();
            return Ok(());
        }
        let commodity = self.combined_commodity(other, keep)?;
        let lhs = self.quantity.take().unwrap_or_else(Quantity::zero);
        let rhs = other.quantity.clone().unwrap_or_else(Quantity::zero);
        self.quantity = Some(lhs.sub(&rhs));
        self.commodity = commodity;
        Ok(())
    }

    /// In-place subtraction with the default keep-nothing policy.
    pub fn sub_amount(&mut self, other: &Amount) -> AmountResult<()> {
        self.sub_with(other, &KeepDetails::default())
    }

    /// In-place multiplication. A null operand nullifies the result. When
    /// both sides are commoditized the left commodity wins; precision is
    /// additive, capped at the commodity's display precision plus six.
    pub fn mul_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if self.is_null() || other.is_null() {
            *self = Amount::null();
            return Ok(());
        }
        let lhs = self.quantity.take().unwrap_or_else(Quantity::zero);
        let rhs = other.quantity.clone().unwrap_or_else(Quantity::zero);
        let mut product = lhs.mul(&rhs);
        let commodity = self
            .commodity()
            .cloned()
            .or_else(|| other.commodity().cloned());
        cap_display_precision(&mut product, commodity.as_deref());
        self.quantity = Some(product);
        self.commodity = commodity;
        Ok(())
    }

    /// In-place division. An exactly-zero (or null) divisor fails with
    /// `DivisionByZero`; a very small divisor succeeds and yields a large
    /// precise result. Precision extends by six digits.
    pub fn div_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if other.is_realzero() {
            return Err(AmountError::DivisionByZero);
        }
        if self.is_null() {
            return Ok(());
        }
        let lhs = self.quantity.take().unwrap_or_else(Quantity::zero);
        let rhs = other.quantity.clone().unwrap_or_else(Quantity::zero);
        self.quantity = Some(lhs.div(&rhs)?);
        if self.commodity().is_none() {
            self.commodity = other.commodity().cloned();
        }
        Ok(())
    }

    /// Round the value to the commodity's display precision. A unitless
    /// amount is returned unchanged.
    pub fn rounded(&self) -> Self {
        match self.commodity() {
            Some(commodity) => self.roundto(commodity.precision()),
            None => self.clone(),
        }
    }

    pub fn in_place_round(&mut self) {
        *self = self.rounded();
    }

    /// Round the value to `precision` fractional digits.
    pub fn roundto(&self, precision: Precision) -> Self {
        let mut result = self.clone();
        if let Some(quantity) = &mut result.quantity {
            *quantity = quantity.round(precision);
        }
        result
    }

    /// A copy whose display precision is unbounded: printing shows the
    /// full internal precision regardless of the commodity.
    pub fn unrounded(&self) -> Self {
        let mut result = self.clone();
        result.in_place_unround();
        result
    }

    pub fn in_place_unround(&mut self) {
        if let Some(quantity) = &mut self.quantity {
            quantity.set_keep_precision(true);
        }
    }

    /// Convert to the most basic commodity along `smaller` links: `1h`
    /// reduces to `3600s` once hours and minutes have been registered
    /// with [`Amount::parse_conversion`].
    pub fn in_place_reduce(&mut self) {
        if self.quantity.is_none() {
            return;
        }
        while let Some(commodity) = self.commodity().cloned() {
            let Some(smaller) = commodity.smaller() else { break };
            let (Some(step), Some(next)) = (smaller.quantity(), smaller.commodity()) else {
                break;
            };
            if let Some(quantity) = self.quantity.take() {
                self.quantity = Some(quantity.mul(step));
            }
            self.commodity = Some(next.clone());
        }
    }

    pub fn reduced(&self) -> Self {
        let mut result = self.clone();
        result.in_place_reduce();
        result
    }

    /// Convert to the most compact scaled form not below one unit:
    /// `3599s` unreduces to about `59.98m`, `3601s` to just over `1h`.
    pub fn in_place_unreduce(&mut self) {
        let Some(mut quantity) = self.quantity.clone() else { return };
        let Some(mut commodity) = self.commodity().cloned() else { return };
        let one = Quantity::from_i64(1);
        let mut shifted = false;

        loop {
            let Some(larger) = commodity.larger() else { break };
            let (Some(step), Some(next)) = (larger.quantity(), larger.commodity()) else {
                break;
            };
            let Ok(scaled) = quantity.div(step) else { break };
            if scaled.abs().compare(&one) == Ordering::Less {
                break;
            }
            quantity = scaled;
            commodity = next.clone();
            shifted = true;
        }

        if shifted {
            self.quantity = Some(quantity);
            self.commodity = Some(commodity);
        }
    }

    pub fn unreduced(&self) -> Self {
        let mut result = self.clone();
        result.in_place_unreduce();
        result
    }

    /// Historical value of this amount in its commodity's pricing
    /// commodity at `at` (most recent price when `at` is `None`). Unitless
    /// amounts have no market value.
    pub fn value(&self, pool: &CommodityPool, at: Option<Moment>) -> Option<Amount> {
        let commodity = self.commodity()?;
        let quantity = self.quantity.as_ref()?;
        let price = commodity.value(pool, at)?;
        let price_quantity = price.quantity()?;

        let mut valued = quantity.mul(price_quantity);
        let price_commodity = price.commodity().cloned();
        cap_display_precision(&mut valued, price_commodity.as_deref());
        Some(Amount { quantity: Some(valued), commodity: price_commodity })
    }

    /// Replace this amount's commodity with the interned annotated
    /// variant carrying `details`.
    pub fn annotate_commodity(
        &mut self,
        pool: &mut CommodityPool,
        details: Annotation,
    ) -> AmountResult<()> {
        let Some(commodity) = self.commodity() else {
            return Err(AmountError::NullAmount);
        };
        let symbol = commodity.base_symbol();
        self.commodity = Some(pool.find_or_create_annotated(&symbol, details)?);
        Ok(())
    }

    pub fn commodity_annotated(&self) -> bool {
        self.commodity().map_or(false, |c| c.is_annotated())
    }

    pub fn annotation_details(&self) -> Option<Annotation> {
        self.commodity().and_then(|c| c.annotation().cloned())
    }

    /// A copy whose commodity keeps only the lot details selected by
    /// `keep`. Stripping everything yields the bare referent; stripping
    /// an unannotated amount is the identity.
    pub fn strip_annotations(
        &self,
        pool: &mut CommodityPool,
        keep: &KeepDetails,
    ) -> AmountResult<Amount> {
        let Some(commodity) = self.commodity() else { return Ok(self.clone()) };
        let Some(annotated) = commodity.as_annotated() else { return Ok(self.clone()) };

        let details = annotated.details();
        let kept = Annotation {
            price: if keep.keep_price { details.price.clone() } else { None },
            date: if keep.keep_date { details.date } else { None },
            tag: if keep.keep_tag { details.tag.clone() } else { None },
        };

        let mut result = self.clone();
        result.commodity = Some(if kept.is_present() {
            pool.find_or_create_annotated(&annotated.referent().base_symbol(), kept)?
        } else {
            annotated.referent().clone()
        });
        Ok(result)
    }

    /// Null amounts are valid; otherwise the precision must be sane and
    /// any commodity internally coherent.
    pub fn valid(&self) -> bool {
        match (&self.quantity, &self.commodity) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(quantity), commodity) => {
                quantity.precision() <= MAX_PRECISION
                    && commodity.as_ref().map_or(true, |c| c.valid())
            }
        }
    }

    /// Render this amount. `omit_commodity` prints only the numeric
    /// portion (still at the commodity's display precision);
    /// `full_precision` shows the internal precision instead.
    pub fn print<W: fmt::Write>(
        &self,
        out: &mut W,
        omit_commodity: bool,
        full_precision: bool,
    ) -> fmt::Result {
        let Some(quantity) = &self.quantity else {
            return out.write_str("<null>");
        };
        let commodity = self.commodity();

        let precision = if full_precision || quantity.keeps_precision() {
            quantity.precision()
        } else {
            match commodity {
                Some(c) => c.precision(),
                None => quantity.precision(),
            }
        };

        let (thousands, european, suffixed, separated) = match commodity {
            Some(c) => {
                let flags = c.flags();
                (
                    flags.contains(CommodityFlags::STYLE_THOUSANDS),
                    flags.contains(CommodityFlags::STYLE_EUROPEAN),
                    flags.contains(CommodityFlags::STYLE_SUFFIXED),
                    flags.contains(CommodityFlags::STYLE_SEPARATED),
                )
            }
            None => (false, false, false, false),
        };

        let digits = render_quantity(quantity.value(), precision, thousands, european);
        match commodity {
            Some(commodity) if !omit_commodity => {
                let symbol = commodity.symbol();
                if suffixed {
                    out.write_str(&digits)?;
                    if separated {
                        out.write_char(' ')?;
                    }
                    out.write_str(&symbol)?;
                } else {
                    out.write_str(&symbol)?;
                    if separated {
                        out.write_char(' ')?;
                    }
                    out.write_str(&digits)?;
                }
                if let Some(annotated) = commodity.as_annotated() {
                    annotated.write_annotations(out)?;
                }
                Ok(())
            }
            _ => out.write_str(&digits),
        }
    }

    /// The full-internal-precision string.
    pub fn to_fullstring(&self) -> String {
        let mut out = String::new();
        let _ = self.print(&mut out, false, true);
        out
    }

    /// The display string without the commodity (its display precision
    /// still applies).
    pub fn quantity_string(&self) -> String {
        let mut out = String::new();
        let _ = self.print(&mut out, true, false);
        out
    }

    /// Parse an amount, registering commodity details against `pool`.
    ///
    /// The grammar accepts an optional sign, a commodity symbol before or
    /// after the quantity (double-quoted when it contains reserved
    /// characters), thousands separators in US or european style, and
    /// trailing lot annotations `{price}`, `[date]`, `(tag)`. The way the
    /// amount is written migrates onto the commodity: display style flags
    /// always, display precision unless `NO_MIGRATE`. The result is
    /// reduced along scaling links unless `NO_REDUCE`.
    pub fn parse(
        pool: &mut CommodityPool,
        input: &str,
        flags: ParseFlags,
    ) -> AmountResult<Amount> {
        let mut scanner = Scanner::new(input);
        scanner.skip_ws();
        if scanner.at_end() {
            return Err(AmountError::Syntax("empty amount".to_string()));
        }

        let mut negative = false;
        if scanner.eat('-') {
            negative = true;
            scanner.skip_ws();
        } else if scanner.eat('+') {
            scanner.skip_ws();
        }

        let mut symbol = String::new();
        let mut style = CommodityFlags::empty();
        let quantity;

        let leading = scanner
            .peek()
            .ok_or_else(|| AmountError::Syntax("incomplete amount".to_string()))?;
        if !leading.is_ascii_digit() && !matches!(leading, '.' | ',' | '-' | '+') {
            // Commodity precedes the digits.
            symbol = scan_symbol(&mut scanner)?;
            if scanner.skip_ws() {
                style |= CommodityFlags::STYLE_SEPARATED;
            }
            if scanner.eat('-') {
                negative = true;
            } else {
                scanner.eat('+');
            }
            let token = scan_number(&mut scanner)?;
            let (digits, number_style) = analyze_number(&token)?;
            style |= number_style;
            quantity = Quantity::parse(&digits)?;
        } else {
            let token = scan_number(&mut scanner)?;
            let (digits, number_style) = analyze_number(&token)?;
            quantity = Quantity::parse(&digits)?;

            let separated = scanner.skip_ws();
            if scanner
                .peek()
                .map_or(false, |c| c == '"' || is_symbol_char(c))
            {
                symbol = scan_symbol(&mut scanner)?;
                style |= number_style | CommodityFlags::STYLE_SUFFIXED;
                if separated {
                    style |= CommodityFlags::STYLE_SEPARATED;
                }
            }
        }

        let mut details = Annotation::default();
        while scan_annotation(&mut scanner, pool, &mut details)? {}

        scanner.skip_ws();
        if !scanner.at_end() {
            return Err(AmountError::Syntax(format!(
                "unexpected input {:?} after amount",
                scanner.rest()
            )));
        }

        let mut quantity = quantity;
        if negative {
            quantity.negate();
        }
        let parsed_precision = quantity.precision();

        let mut amount = Amount { quantity: Some(quantity), commodity: None };
        if !symbol.is_empty() {
            let commodity = pool.find_or_create(&symbol)?;
            commodity.add_flags(style);
            if !flags.contains(ParseFlags::NO_MIGRATE)
                && parsed_precision > commodity.precision()
            {
                commodity.set_precision(parsed_precision);
            }
            amount.commodity = Some(if details.is_present() {
                pool.find_or_create_annotated(&symbol, details)?
            } else {
                commodity
            });
        } else if details.is_present() {
            return Err(AmountError::Syntax(
                "lot annotations require a commodity".to_string(),
            ));
        }

        if !flags.contains(ParseFlags::NO_REDUCE) {
            amount.in_place_reduce();
        }
        Ok(amount)
    }

    /// Register a reciprocal scaling pair, e.g.
    /// `parse_conversion(pool, "1.0h", "60m")` makes hours reduce to
    /// minutes and minutes unreduce to hours.
    pub fn parse_conversion(
        pool: &mut CommodityPool,
        larger_str: &str,
        smaller_str: &str,
    ) -> AmountResult<()> {
        let mut larger = Amount::parse(pool, larger_str, ParseFlags::NO_REDUCE)?;
        let smaller = Amount::parse(pool, smaller_str, ParseFlags::NO_REDUCE)?;

        let (Some(larger_commodity), Some(smaller_commodity)) =
            (larger.commodity().cloned(), smaller.commodity().cloned())
        else {
            return Err(AmountError::NotReducible);
        };
        if larger_commodity.shares_base_with(&smaller_commodity) {
            return Err(AmountError::NotReducible);
        }

        // Scale the larger amount by the smaller magnitude: from
        // ("1.0h", "60m") the stored up-link is 60h, so unreduce is a
        // plain divide-by-60 into hours.
        if let (Some(lhs), Some(rhs)) = (&larger.quantity, &smaller.quantity) {
            larger.quantity = Some(lhs.mul(rhs));
        }

        larger_commodity.set_smaller(Some(smaller));
        smaller_commodity.set_larger(Some(larger));
        Ok(())
    }

    /// Serialize to the compact binary form: a tag byte, the commodity
    /// ident (varint) when present, then numerator, denominator
    /// (length-prefixed two's-complement big-endian bytes) and display
    /// precision (varint).
    pub fn write<W: io::Write>(&self, out: &mut W) -> AmountResult<()> {
        let mut tag = 0u8;
        if self.quantity.is_some() {
            tag |= TAG_HAS_QUANTITY;
        }
        let commodity = self.commodity();
        if let Some(commodity) = commodity {
            tag |= TAG_HAS_COMMODITY;
            if commodity.is_annotated() {
                tag |= TAG_ANNOTATED;
            }
        }
        out.write_all(&[tag])?;

        if let Some(commodity) = commodity {
            write_varint(out, u64::from(commodity.ident()))?;
        }
        if let Some(quantity) = &self.quantity {
            write_bytes(out, &quantity.value().numer().to_signed_bytes_be())?;
            write_bytes(out, &quantity.value().denom().to_signed_bytes_be())?;
            write_varint(out, u64::from(quantity.precision()))?;
        }
        Ok(())
    }

    /// Deserialize an amount written by [`Amount::write`]. The pool must
    /// contain every commodity the amount referenced when written.
    pub fn read<R: io::Read>(pool: &CommodityPool, input: &mut R) -> AmountResult<Amount> {
        let tag = read_u8(input)?;
        if tag & !TAG_KNOWN != 0 {
            return Err(AmountError::Corrupt(format!("unknown tag bits {:#04x}", tag)));
        }
        if tag & TAG_ANNOTATED != 0 && tag & TAG_HAS_COMMODITY == 0 {
            return Err(AmountError::Corrupt(
                "annotation bit without a commodity".to_string(),
            ));
        }
        if tag & TAG_HAS_COMMODITY != 0 && tag & TAG_HAS_QUANTITY == 0 {
            return Err(AmountError::Corrupt(
                "commodity bit without a quantity".to_string(),
            ));
        }

        let commodity = if tag & TAG_HAS_COMMODITY != 0 {
            let raw = read_varint(input)?;
            let ident = u32::try_from(raw)
                .map_err(|_| AmountError::Corrupt(format!("ident {} out of range", raw)))?;
            let commodity = pool
                .find_by_ident(ident)
                .ok_or(AmountError::UnknownCommodity(ident))?;
            if commodity.is_annotated() != (tag & TAG_ANNOTATED != 0) {
                return Err(AmountError::Corrupt(
                    "annotation bit disagrees with commodity".to_string(),
                ));
            }
            Some(commodity)
        } else {
            None
        };

        let quantity = if tag & TAG_HAS_QUANTITY != 0 {
            let numer = BigInt::from_signed_bytes_be(&read_bytes(input)?);
            let denom = BigInt::from_signed_bytes_be(&read_bytes(input)?);
            if denom <= BigInt::zero() {
                return Err(AmountError::Corrupt("non-positive denominator".to_string()));
            }
            let raw = read_varint(input)?;
            let precision = Precision::try_from(raw)
                .ok()
                .filter(|p| *p <= MAX_PRECISION)
                .ok_or_else(|| {
                    AmountError::Corrupt(format!("precision {} out of range", raw))
                })?;
            let mut quantity = Quantity::from_rational(BigRational::new(numer, denom));
            quantity.set_precision(precision);
            Some(quantity)
        } else {
            None
        };

        Ok(Amount { quantity, commodity })
    }
}

/// The unannotated commodity an annotated lot degrades to in arithmetic.
fn strip_for_arithmetic(commodity: &CommodityRef) -> CommodityRef {
    match commodity.as_annotated() {
        Some(annotated) => annotated.referent().clone(),
        None => commodity.clone(),
    }
}

fn cap_display_precision(quantity: &mut Quantity, commodity: Option<&crate::commodity::Commodity>) {
    if let Some(commodity) = commodity {
        let cap = commodity.precision().saturating_add(EXTEND_BY_DIGITS);
        if quantity.precision() > cap {
            quantity.set_precision(cap);
        }
    }
}

// ---- textual parsing helpers ----

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().map_or(false, char::is_whitespace) {
            self.bump();
        }
        self.pos > start
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().map_or(false, &pred) {
            self.bump();
        }
        &self.text[start..self.pos]
    }

    /// Consume up to and including `stop`, returning the content before
    /// it, or `None` if `stop` never occurs.
    fn take_until(&mut self, stop: char) -> Option<&'a str> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == stop {
                let content = &self.text[start..self.pos];
                self.bump();
                return Some(content);
            }
            self.bump();
        }
        self.pos = start;
        None
    }
}

fn is_symbol_char(c: char) -> bool {
    !(c.is_whitespace()
        || c.is_ascii_digit()
        || matches!(
            c,
            '.' | ','
                | ';'
                | '-'
                | '+'
                | '*'
                | '/'
                | '^'
                | '?'
                | ':'
                | '&'
                | '|'
                | '!'
                | '='
                | '<'
                | '>'
                | '{'
                | '}'
                | '['
                | ']'
                | '('
                | ')'
                | '@'
                | '"'
        ))
}

fn scan_symbol(scanner: &mut Scanner) -> AmountResult<String> {
    if scanner.eat('"') {
        let mut symbol = String::new();
        loop {
            match scanner.bump() {
                Some('\\') => match scanner.bump() {
                    Some(c) => symbol.push(c),
                    None => {
                        return Err(AmountError::Syntax(
                            "unterminated quoted symbol".to_string(),
                        ))
                    }
                },
                Some('"') => break,
                Some(c) => symbol.push(c),
                None => {
                    return Err(AmountError::Syntax(
                        "unterminated quoted symbol".to_string(),
                    ))
                }
            }
        }
        if symbol.is_empty() {
            return Err(AmountError::InvalidSymbol("empty quoted symbol".to_string()));
        }
        Ok(symbol)
    } else {
        Ok(scanner.take_while(is_symbol_char).to_string())
    }
}

fn scan_number(scanner: &mut Scanner) -> AmountResult<String> {
    let start = scanner.pos;
    while let Some(c) = scanner.peek() {
        if c.is_ascii_digit() {
            scanner.bump();
        } else if c == '.' || c == ',' {
            // A separator belongs to the number only when a digit follows.
            let mut ahead = Scanner { text: scanner.text, pos: scanner.pos };
            ahead.bump();
            if ahead.peek().map_or(false, |d| d.is_ascii_digit()) {
                scanner.bump();
            } else {
                break;
            }
        } else {
            break;
        }
    }
    let token = &scanner.text[start..scanner.pos];
    if !token.bytes().any(|b| b.is_ascii_digit()) {
        return Err(AmountError::Syntax(format!(
            "expected a quantity in {:?}",
            scanner.text
        )));
    }
    Ok(token.to_string())
}

/// Resolve `.`/`,` roles and return the normalized digit string along
/// with the style flags the layout implies. When both separators appear
/// the rightmost is the decimal point; a lone separator trailed by
/// exactly three digits (or repeated) groups thousands, anything else is
/// a decimal point.
fn analyze_number(token: &str) -> AmountResult<(String, CommodityFlags)> {
    let has_dot = token.contains('.');
    let has_comma = token.contains(',');

    let (decimal, thousands) = if has_dot && has_comma {
        match (token.rfind('.'), token.rfind(',')) {
            (Some(dot), Some(comma)) if dot > comma => (Some('.'), Some(',')),
            _ => (Some(','), Some('.')),
        }
    } else if has_dot || has_comma {
        let sep = if has_dot { '.' } else { ',' };
        let occurrences = token.matches(sep).count();
        let trailing = match token.rfind(sep) {
            Some(at) => token.len() - at - 1,
            None => 0,
        };
        if occurrences > 1 || trailing == 3 {
            (None, Some(sep))
        } else {
            (Some(sep), None)
        }
    } else {
        (None, None)
    };

    if let (Some(decimal), Some(thousands)) = (decimal, thousands) {
        if token.matches(decimal).count() > 1 {
            return Err(AmountError::Syntax(format!("invalid number {:?}", token)));
        }
        if let Some(at) = token.rfind(decimal) {
            if token[at..].contains(thousands) {
                return Err(AmountError::Syntax(format!("invalid number {:?}", token)));
            }
        }
    }

    // Thousands groups after the first must hold exactly three digits.
    if let Some(thousands) = thousands {
        let int_part = match decimal.and_then(|d| token.find(d)) {
            Some(at) => &token[..at],
            None => token,
        };
        let mut groups = int_part.split(thousands);
        if groups.next().map_or(true, str::is_empty) {
            return Err(AmountError::Syntax(format!("invalid number {:?}", token)));
        }
        if groups.any(|group| group.len() != 3) {
            return Err(AmountError::Syntax(format!("invalid number {:?}", token)));
        }
    }

    let mut normalized = String::with_capacity(token.len());
    for c in token.chars() {
        if Some(c) == thousands {
            continue;
        }
        normalized.push(if Some(c) == decimal { '.' } else { c });
    }

    let mut style = CommodityFlags::empty();
    if thousands.is_some() {
        style |= CommodityFlags::STYLE_THOUSANDS;
    }
    if decimal == Some(',') || thousands == Some('.') {
        style |= CommodityFlags::STYLE_EUROPEAN;
    }
    Ok((normalized, style))
}

fn scan_annotation(
    scanner: &mut Scanner,
    pool: &mut CommodityPool,
    details: &mut Annotation,
) -> AmountResult<bool> {
    let checkpoint = scanner.pos;
    scanner.skip_ws();
    match scanner.peek() {
        Some('{') => {
            scanner.bump();
            let inner = scanner.take_until('}').ok_or_else(|| {
                AmountError::Syntax("unterminated price annotation".to_string())
            })?;
            if details.price.is_some() {
                return Err(AmountError::Syntax(
                    "commodity specifies more than one price".to_string(),
                ));
            }
            details.price = Some(Amount::parse(pool, inner, ParseFlags::empty())?);
            Ok(true)
        }
        Some('[') => {
            scanner.bump();
            let inner = scanner.take_until(']').ok_or_else(|| {
                AmountError::Syntax("unterminated date annotation".to_string())
            })?;
            if details.date.is_some() {
                return Err(AmountError::Syntax(
                    "commodity specifies more than one date".to_string(),
                ));
            }
            details.date = Some(parse_date(inner)?);
            Ok(true)
        }
        Some('(') => {
            scanner.bump();
            let inner = scanner.take_until(')').ok_or_else(|| {
                AmountError::Syntax("unterminated tag annotation".to_string())
            })?;
            if details.tag.is_some() {
                return Err(AmountError::Syntax(
                    "commodity specifies more than one tag".to_string(),
                ));
            }
            details.tag = Some(inner.trim().to_string());
            Ok(true)
        }
        _ => {
            scanner.pos = checkpoint;
            Ok(false)
        }
    }
}

// ---- binary io helpers ----

fn read_u8<R: io::Read>(input: &mut R) -> AmountResult<u8> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn write_varint<W: io::Write>(out: &mut W, mut value: u64) -> AmountResult<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.write_all(&[byte])?;
        if value == 0 {
            return Ok(());
        }
    }
}

fn read_varint<R: io::Read>(input: &mut R) -> AmountResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(input)?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(AmountError::Corrupt("varint too long".to_string()));
        }
    }
}

fn write_bytes<W: io::Write>(out: &mut W, bytes: &[u8]) -> AmountResult<()> {
    write_varint(out, bytes.len() as u64)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_bytes<R: io::Read>(input: &mut R) -> AmountResult<Vec<u8>> {
    let len = read_varint(input)?;
    if len > MAX_MAGNITUDE_BYTES {
        return Err(AmountError::Corrupt(format!("length {} out of range", len)));
    }
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

// ---- trait implementations ----

impl Default for Amount {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        match (self.commodity(), other.commodity()) {
            (None, None) => {}
            (Some(a), Some(b)) if **a == **b => {}
            _ => return false,
        }
        match (&self.quantity, &other.quantity) {
            (None, None) => true,
            (Some(q), None) | (None, Some(q)) => q.is_zero(),
            (Some(a), Some(b)) => a == b,
        }
    }
}

impl Eq for Amount {}

impl Hash for Amount {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.quantity {
            Some(quantity) => {
                quantity.value().numer().hash(state);
                quantity.value().denom().hash(state);
            }
            // Null hashes like zero, matching equality.
            None => {
                BigInt::zero().hash(state);
                BigInt::from(1).hash(state);
            }
        }
        if let Some(commodity) = self.commodity() {
            (Rc::as_ptr(commodity) as usize).hash(state);
        }
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        // Stricter than `compare`: mixing a commoditized amount with a
        // unitless one yields no ordering here, keeping PartialOrd
        // consistent with PartialEq.
        match (self.commodity(), other.commodity()) {
            (None, None) => {}
            (Some(a), Some(b)) if **a == **b => {}
            _ => return None,
        }
        self.compare(other).ok()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f, false, false)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AMOUNT({})", self.to_string())
    }
}

impl From<i32> for Amount {
    fn from(value: i32) -> Self {
        Self::from_i64(i64::from(value))
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl From<u32> for Amount {
    fn from(value: u32) -> Self {
        Self::from_i64(i64::from(value))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<BigInt> for Amount {
    fn from(value: BigInt) -> Self {
        Self::from_quantity(Quantity::from_rational(BigRational::from_integer(value)))
    }
}

impl From<BigRational> for Amount {
    fn from(value: BigRational) -> Self {
        Self::from_quantity(Quantity::from_rational(value))
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self::from_decimal(value)
    }
}

impl TryFrom<f64> for Amount {
    type Error = AmountError;

    fn try_from(value: f64) -> AmountResult<Self> {
        Self::from_f64(value)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        self.negated()
    }
}

impl Neg for &Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        self.negated()
    }
}

macro_rules! arith_ops {
    ($trait:ident, $method:ident, $in_place:ident) => {
        impl $trait for Amount {
            type Output = AmountResult<Amount>;

            fn $method(mut self, other: Amount) -> Self::Output {
                self.$in_place(&other)?;
                Ok(self)
            }
        }

        impl $trait<&Amount> for Amount {
            type Output = AmountResult<Amount>;

            fn $method(mut self, other: &Amount) -> Self::Output {
                self.$in_place(other)?;
                Ok(self)
            }
        }

        impl $trait<Amount> for &Amount {
            type Output = AmountResult<Amount>;

            fn $method(self, other: Amount) -> Self::Output {
                let mut result = self.clone();
                result.$in_place(&other)?;
                Ok(result)
            }
        }

        impl $trait<&Amount> for &Amount {
            type Output = AmountResult<Amount>;

            fn $method(self, other: &Amount) -> Self::Output {
                let mut result = self.clone();
                result.$in_place(other)?;
                Ok(result)
            }
        }
    };
}

arith_ops!(Add, add, add_amount);
arith_ops!(Sub, sub, sub_amount);
arith_ops!(Mul, mul, mul_amount);
arith_ops!(Div, div, div_amount);

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Amount", 4)?;
        state.serialize_field(
            "quantity",
            &self.quantity.as_ref().map(|q| q.value().to_string()),
        )?;
        state.serialize_field(
            "precision",
            &self.quantity.as_ref().map_or(0, Quantity::precision),
        )?;
        state.serialize_field(
            "keep_precision",
            &self.quantity.as_ref().map_or(false, Quantity::keeps_precision),
        )?;
        // The commodity travels as its mapping key; resolving it back
        // needs a pool, so deserialization yields a unitless amount.
        state.serialize_field("commodity", &self.commodity().map(|c| c.mapping_key()))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawAmount {
            quantity: Option<String>,
            precision: Precision,
            keep_precision: bool,
            #[allow(dead_code)]
            commodity: Option<String>,
        }

        let raw = RawAmount::deserialize(deserializer)?;
        let quantity = match raw.quantity {
            None => None,
            Some(text) => {
                let value = text
                    .parse::<BigRational>()
                    .map_err(serde::de::Error::custom)?;
                let mut quantity = Quantity::from_rational(value);
                quantity.set_precision(raw.precision);
                quantity.set_keep_precision(raw.keep_precision);
                Some(quantity)
            }
        };
        Ok(Amount { quantity, commodity: None })
    }
}
