//! Commodities: interned symbols with display conventions, price history,
//! scaling links, and optional lot annotations.
//!
//! A commodity's mutable state (flags, display precision, price history,
//! scaling links) lives in a base record shared between the plain
//! commodity and every annotated variant of it, so observing a new display
//! precision through one handle is visible through all of them. The core
//! is single-threaded by contract, which is what licenses the
//! `Rc<RefCell<_>>` sharing here.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use log::debug;

use crate::amount::Amount;
use crate::datetime::{format_date, Date, Moment};
use crate::pool::CommodityPool;
use crate::quantity::Precision;

/// Dense identifier assigned by a pool. Never reused.
pub type Ident = u32;

/// Reference-counted handle to an interned commodity.
pub type CommodityRef = Rc<Commodity>;

bitflags! {
    /// Display-style and behavior flags observed from parsed amounts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommodityFlags: u8 {
        /// The symbol follows the quantity (`10 AAPL` rather than `$10`).
        const STYLE_SUFFIXED  = 0x01;
        /// A space separates symbol and quantity.
        const STYLE_SEPARATED = 0x02;
        /// Decimal comma, thousands dot.
        const STYLE_EUROPEAN  = 0x04;
        /// Integer part grouped in threes.
        const STYLE_THOUSANDS = 0x08;
        /// Never consult quote sources or price history for this commodity.
        const NOMARKET        = 0x10;
        /// Created by the library rather than seen in input.
        const BUILTIN         = 0x20;
    }
}

/// Which lot details survive [`Amount::strip_annotations`] and mixed
/// annotated/unannotated arithmetic. Defaults to keeping nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepDetails {
    pub keep_price: bool,
    pub keep_date: bool,
    pub keep_tag: bool,
}

impl KeepDetails {
    /// Keep no lot details.
    pub fn none() -> Self {
        Self::default()
    }

    /// Keep every lot detail.
    pub fn all() -> Self {
        Self { keep_price: true, keep_date: true, keep_tag: true }
    }

    pub fn keep_any(&self) -> bool {
        self.keep_price || self.keep_date || self.keep_tag
    }
}

/// Lot details attached to a commodity: the price paid, the acquisition
/// date, and a free-form tag. An annotation individuates a lot only when
/// at least one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    pub price: Option<Amount>,
    pub date: Option<Date>,
    pub tag: Option<String>,
}

impl Annotation {
    pub fn new(price: Option<Amount>, date: Option<Date>, tag: Option<String>) -> Self {
        Self { price, date, tag }
    }

    pub fn with_price(price: Amount) -> Self {
        Self { price: Some(price), ..Self::default() }
    }

    pub fn with_date(date: Date) -> Self {
        Self { date: Some(date), ..Self::default() }
    }

    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: Some(tag.into()), ..Self::default() }
    }

    /// True iff any field is set.
    pub fn is_present(&self) -> bool {
        self.price.is_some() || self.date.is_some() || self.tag.is_some()
    }

    /// Diagnostic form: `price {P|NONE} date {D|T0} tag {T|NONE}`.
    pub fn write<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        match &self.price {
            Some(price) => write!(out, "price {} ", price)?,
            None => out.write_str("price NONE ")?,
        }
        match self.date {
            Some(date) => write!(out, "date {} ", format_date(date))?,
            None => out.write_str("date T0 ")?,
        }
        match &self.tag {
            Some(tag) => write!(out, "tag {}", tag),
            None => out.write_str("tag NONE"),
        }
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f)
    }
}

/// A commodity specialised by an [`Annotation`], sharing its base with the
/// unannotated referent it was derived from.
#[derive(Clone)]
pub struct AnnotatedCommodity {
    referent: CommodityRef,
    details: Annotation,
}

impl AnnotatedCommodity {
    /// The unannotated commodity this lot refers back to.
    pub fn referent(&self) -> &CommodityRef {
        &self.referent
    }

    pub fn details(&self) -> &Annotation {
        &self.details
    }

    /// Append the display clauses `{price}`, `[date]`, `(tag)`, each
    /// preceded by a space and omitted when unset.
    pub fn write_annotations<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        write_annotation_clauses(out, &self.details)
    }
}

impl PartialEq for AnnotatedCommodity {
    fn eq(&self, other: &Self) -> bool {
        self.referent.shares_base_with(&other.referent) && self.details == other.details
    }
}

impl Eq for AnnotatedCommodity {}

impl fmt::Debug for AnnotatedCommodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnnotatedCommodity({})", self.referent.base_symbol())
    }
}

pub(crate) fn write_annotation_clauses<W: fmt::Write>(
    out: &mut W,
    details: &Annotation,
) -> fmt::Result {
    if let Some(price) = &details.price {
        write!(out, " {{{}}}", price)?;
    }
    if let Some(date) = details.date {
        write!(out, " [{}]", format_date(date))?;
    }
    if let Some(tag) = &details.tag {
        write!(out, " ({})", tag)?;
    }
    Ok(())
}

/// The state shared between a commodity and all its annotated variants.
#[derive(Debug)]
struct CommodityBase {
    symbol: String,
    flags: CommodityFlags,
    precision: Precision,
    name: Option<String>,
    note: Option<String>,
    prices: BTreeMap<Moment, Amount>,
    last_lookup: Option<Moment>,
    smaller: Option<Amount>,
    larger: Option<Amount>,
}

/// An interned commodity. Instances are owned by a [`CommodityPool`] and
/// handed out as [`CommodityRef`]s; symbolically equivalent commodities
/// within one pool are pointer-equal.
pub struct Commodity {
    base: Rc<RefCell<CommodityBase>>,
    ident: Ident,
    qualified_symbol: Option<String>,
    mapping_key: Option<String>,
    annotation: Option<AnnotatedCommodity>,
}

impl Commodity {
    pub(crate) fn new(ident: Ident, symbol: &str, qualified_symbol: Option<String>) -> Self {
        Self {
            base: Rc::new(RefCell::new(CommodityBase {
                symbol: symbol.to_string(),
                flags: CommodityFlags::empty(),
                precision: 0,
                name: None,
                note: None,
                prices: BTreeMap::new(),
                last_lookup: None,
                smaller: None,
                larger: None,
            })),
            ident,
            qualified_symbol,
            mapping_key: None,
            annotation: None,
        }
    }

    pub(crate) fn new_annotated(
        referent: &CommodityRef,
        ident: Ident,
        details: Annotation,
        mapping_key: String,
    ) -> Self {
        Self {
            base: referent.base.clone(),
            ident,
            qualified_symbol: referent.qualified_symbol.clone(),
            mapping_key: Some(mapping_key),
            annotation: Some(AnnotatedCommodity { referent: referent.clone(), details }),
        }
    }

    pub fn ident(&self) -> Ident {
        self.ident
    }

    /// The raw symbol as seen in input.
    pub fn base_symbol(&self) -> String {
        self.base.borrow().symbol.clone()
    }

    /// The display symbol: the quoted form when the raw symbol requires
    /// quoting, the raw symbol otherwise.
    pub fn symbol(&self) -> String {
        match &self.qualified_symbol {
            Some(qualified) => qualified.clone(),
            None => self.base_symbol(),
        }
    }

    /// The key this commodity is interned under. Annotated commodities
    /// encode their annotation into the key.
    pub fn mapping_key(&self) -> String {
        match &self.mapping_key {
            Some(key) => key.clone(),
            None => self.base_symbol(),
        }
    }

    /// The "no commodity" sentinel has an empty symbol.
    pub fn is_null(&self) -> bool {
        self.base.borrow().symbol.is_empty()
    }

    pub fn name(&self) -> Option<String> {
        self.base.borrow().name.clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        self.base.borrow_mut().name = name;
    }

    pub fn note(&self) -> Option<String> {
        self.base.borrow().note.clone()
    }

    pub fn set_note(&self, note: Option<String>) {
        self.base.borrow_mut().note = note;
    }

    /// Maximum fractional digits observed for this commodity.
    pub fn precision(&self) -> Precision {
        self.base.borrow().precision
    }

    pub fn set_precision(&self, precision: Precision) {
        self.base.borrow_mut().precision = precision;
    }

    pub fn flags(&self) -> CommodityFlags {
        self.base.borrow().flags
    }

    pub fn has_flags(&self, flags: CommodityFlags) -> bool {
        self.base.borrow().flags.contains(flags)
    }

    pub fn set_flags(&self, flags: CommodityFlags) {
        self.base.borrow_mut().flags = flags;
    }

    pub fn add_flags(&self, flags: CommodityFlags) {
        self.base.borrow_mut().flags |= flags;
    }

    pub fn drop_flags(&self, flags: CommodityFlags) {
        self.base.borrow_mut().flags &= !flags;
    }

    /// The amount one unit of this commodity scales down to, e.g. `60m`
    /// for a commodity `h`.
    pub fn smaller(&self) -> Option<Amount> {
        self.base.borrow().smaller.clone()
    }

    pub fn set_smaller(&self, smaller: Option<Amount>) {
        self.base.borrow_mut().smaller = smaller;
    }

    /// The divisor and target commodity for scaling up, e.g. `60h` for a
    /// commodity `m` (divide by 60, switch to hours).
    pub fn larger(&self) -> Option<Amount> {
        self.base.borrow().larger.clone()
    }

    pub fn set_larger(&self, larger: Option<Amount>) {
        self.base.borrow_mut().larger = larger;
    }

    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }

    pub fn as_annotated(&self) -> Option<&AnnotatedCommodity> {
        self.annotation.as_ref()
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.annotation.as_ref().map(AnnotatedCommodity::details)
    }

    /// Whether two handles denote the same underlying commodity,
    /// annotations aside.
    pub fn shares_base_with(&self, other: &Commodity) -> bool {
        Rc::ptr_eq(&self.base, &other.base)
    }

    /// Record `price` at `when`, replacing any price already recorded at
    /// exactly that moment.
    pub fn add_price(&self, when: Moment, price: Amount) {
        debug!("commodity {}: price {} at {}", self.base_symbol(), price, when);
        self.base.borrow_mut().prices.insert(when, price);
    }

    /// Returns true iff a price existed at `when` and was removed.
    pub fn remove_price(&self, when: Moment) -> bool {
        self.base.borrow_mut().prices.remove(&when).is_some()
    }

    pub fn price_count(&self) -> usize {
        self.base.borrow().prices.len()
    }

    /// Historical valuation. Consults the price history for the newest
    /// entry at or before `at` (the newest overall when `at` is `None`),
    /// then offers the pool's quote sources a chance to override; the
    /// first source returning a price wins. `NOMARKET` suppresses the
    /// whole lookup.
    pub fn value(&self, pool: &CommodityPool, at: Option<Moment>) -> Option<Amount> {
        if self.has_flags(CommodityFlags::NOMARKET) {
            return None;
        }

        let (found, found_at, previous_lookup) = {
            let mut base = self.base.borrow_mut();
            let entry = match at {
                Some(moment) => base.prices.range(..=moment).next_back(),
                None => base.prices.iter().next_back(),
            }
            .map(|(when, price)| (*when, price.clone()));
            let previous = base.last_lookup;
            if let Some((when, _)) = entry {
                base.last_lookup = Some(when);
            }
            match entry {
                Some((when, price)) => (Some(price), Some(when), previous),
                None => (None, None, previous),
            }
        };

        if let Some(quoted) = pool.get_quote(self, at, found_at, previous_lookup) {
            debug!("commodity {}: quote source supplied a price", self.base_symbol());
            return Some(quoted);
        }
        found
    }

    /// Coherence check over the optional internals.
    pub fn valid(&self) -> bool {
        if let Some(smaller) = self.smaller() {
            match smaller.commodity() {
                Some(commodity) if !commodity.shares_base_with(self) => {}
                _ => return false,
            }
        }
        if let Some(larger) = self.larger() {
            match larger.commodity() {
                Some(commodity) if !commodity.shares_base_with(self) => {}
                _ => return false,
            }
        }
        if let (Some(smaller), Some(larger)) = (self.smaller(), self.larger()) {
            if let (Some(s), Some(l)) = (smaller.commodity(), larger.commodity()) {
                if s.shares_base_with(l) {
                    return false;
                }
            }
        }
        match &self.annotation {
            Some(annotated) => !annotated.referent().is_annotated(),
            None => true,
        }
    }
}

impl PartialEq for Commodity {
    fn eq(&self, other: &Self) -> bool {
        match (&self.annotation, &other.annotation) {
            (None, None) => Rc::ptr_eq(&self.base, &other.base),
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Commodity {}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())?;
        if let Some(annotated) = &self.annotation {
            annotated.write_annotations(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commodity(#{} {})", self.ident, self.mapping_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_add_and_drop() {
        let commodity = Commodity::new(1, "$", None);
        assert!(!commodity.has_flags(CommodityFlags::STYLE_THOUSANDS));
        commodity.add_flags(CommodityFlags::STYLE_THOUSANDS);
        assert!(commodity.has_flags(CommodityFlags::STYLE_THOUSANDS));
        commodity.drop_flags(CommodityFlags::STYLE_THOUSANDS);
        assert!(!commodity.has_flags(CommodityFlags::STYLE_THOUSANDS));
    }

    #[test]
    fn annotation_presence() {
        assert!(!Annotation::default().is_present());
        assert!(Annotation::with_tag("lot1").is_present());

        let mut rendered = String::new();
        Annotation::with_tag("lot1").write(&mut rendered).unwrap();
        assert_eq!(rendered, "price NONE date T0 tag lot1");
    }

    #[test]
    fn keep_details_defaults() {
        assert!(!KeepDetails::none().keep_any());
        assert!(KeepDetails::all().keep_any());
        assert_eq!(KeepDetails::default(), KeepDetails::none());
    }

    #[test]
    fn price_history_replaces_same_moment() {
        let commodity = Commodity::new(1, "AAPL", None);
        let when = crate::datetime::parse_date("2000/04/10")
            .map(crate::datetime::moment_at)
            .unwrap();
        commodity.add_price(when, Amount::from_i64(10));
        commodity.add_price(when, Amount::from_i64(12));
        assert_eq!(commodity.price_count(), 1);
        assert!(commodity.remove_price(when));
        assert!(!commodity.remove_price(when));
    }

    #[test]
    fn base_symbol_empty_means_null() {
        let null = Commodity::new(0, "", None);
        assert!(null.is_null());
        let dollar = Commodity::new(1, "$", None);
        assert!(!dollar.is_null());
    }
}
