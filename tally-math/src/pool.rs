//! The commodity pool: an interning table owning every commodity created
//! in its scope.
//!
//! The pool is indexed two ways: by dense monotone ident, and by mapping
//! key (the raw symbol for plain commodities, the symbol plus encoded
//! annotation clauses for annotated ones). Both indices are kept in sync
//! by the create paths; idents are never reused.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::debug;

use crate::amount::{Amount, AmountError, AmountResult, ParseFlags};
use crate::commodity::{Annotation, Commodity, CommodityFlags, CommodityRef, Ident};
use crate::datetime::{format_date, Moment};

/// A quote source callback: `(commodity, requested, found, last_lookup)`.
/// `requested` is the moment the caller asked about, `found` the moment of
/// the history entry the lookup landed on, and `last_lookup` the moment of
/// the previous lookup on this commodity. Returning `None` passes.
pub type QuoteSource =
    Box<dyn Fn(&Commodity, Option<Moment>, Option<Moment>, Option<Moment>) -> Option<Amount>>;

/// Owner and interning table for commodities.
pub struct CommodityPool {
    by_ident: BTreeMap<Ident, CommodityRef>,
    by_key: HashMap<String, CommodityRef>,
    next_ident: Ident,
    null_commodity: CommodityRef,
    default_commodity: Option<CommodityRef>,
    quote_sources: Vec<QuoteSource>,
}

impl CommodityPool {
    /// Create an empty pool holding only the null commodity sentinel.
    pub fn new() -> Self {
        let null = CommodityRef::new(Commodity::new(0, "", None));
        null.add_flags(CommodityFlags::BUILTIN | CommodityFlags::NOMARKET);

        let mut by_ident = BTreeMap::new();
        by_ident.insert(0, null.clone());
        let mut by_key = HashMap::new();
        by_key.insert(String::new(), null.clone());

        Self {
            by_ident,
            by_key,
            next_ident: 1,
            null_commodity: null,
            default_commodity: None,
            quote_sources: Vec::new(),
        }
    }

    /// Whether a symbol must be written in double quotes.
    pub fn symbol_needs_quoting(symbol: &str) -> bool {
        symbol.chars().any(|c| {
            c.is_whitespace()
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
                )
        })
    }

    fn validate_symbol(symbol: &str) -> AmountResult<()> {
        if symbol.is_empty() {
            return Err(AmountError::InvalidSymbol("empty symbol".to_string()));
        }
        if symbol.chars().any(|c| c == '"' || c.is_control()) {
            return Err(AmountError::InvalidSymbol(symbol.to_string()));
        }
        Ok(())
    }

    /// Register a new commodity. Fails if the symbol is invalid or
    /// already interned.
    pub fn create(&mut self, symbol: &str) -> AmountResult<CommodityRef> {
        Self::validate_symbol(symbol)?;
        if self.by_key.contains_key(symbol) {
            return Err(AmountError::DuplicateCommodity(symbol.to_string()));
        }

        let qualified = Self::symbol_needs_quoting(symbol).then(|| format!("\"{}\"", symbol));
        let commodity = CommodityRef::new(Commodity::new(self.next_ident, symbol, qualified));
        debug!("interned commodity {:?} as ident {}", symbol, self.next_ident);
        self.next_ident += 1;
        self.index(commodity.clone());
        Ok(commodity)
    }

    fn index(&mut self, commodity: CommodityRef) {
        self.by_ident.insert(commodity.ident(), commodity.clone());
        self.by_key.insert(commodity.mapping_key(), commodity);
    }

    /// Look up a commodity by its raw symbol (or, for annotated
    /// commodities, by the full mapping key).
    pub fn find(&self, symbol: &str) -> Option<CommodityRef> {
        self.by_key.get(symbol).cloned()
    }

    pub fn find_by_ident(&self, ident: Ident) -> Option<CommodityRef> {
        self.by_ident.get(&ident).cloned()
    }

    /// Idempotent accessor: the interned commodity for `symbol`,
    /// creating it on first sight.
    pub fn find_or_create(&mut self, symbol: &str) -> AmountResult<CommodityRef> {
        match self.by_key.get(symbol) {
            Some(commodity) => Ok(commodity.clone()),
            None => self.create(symbol),
        }
    }

    // The clause encoding doubles as the secondary-index key, so two
    // annotations rendering identically intern to one commodity. Prices
    // render at full precision: the key must not move when the price
    // commodity's display precision later widens.
    fn annotated_key(base_symbol: &str, details: &Annotation) -> String {
        let mut key = base_symbol.to_string();
        if let Some(price) = &details.price {
            key.push_str(&format!(" {{{}}}", price.to_fullstring()));
        }
        if let Some(date) = details.date {
            key.push_str(&format!(" [{}]", format_date(date)));
        }
        if let Some(tag) = &details.tag {
            key.push_str(&format!(" ({})", tag));
        }
        key
    }

    /// Register the annotated variant of `symbol` for `details`, creating
    /// the base commodity if needed. Fails if that exact annotated
    /// commodity already exists.
    pub fn create_annotated(
        &mut self,
        symbol: &str,
        details: Annotation,
    ) -> AmountResult<CommodityRef> {
        if !details.is_present() {
            return self.find_or_create(symbol);
        }
        let base = self.find_or_create(symbol)?;
        let key = Self::annotated_key(&base.base_symbol(), &details);
        if self.by_key.contains_key(&key) {
            return Err(AmountError::DuplicateCommodity(key));
        }

        let commodity =
            CommodityRef::new(Commodity::new_annotated(&base, self.next_ident, details, key));
        debug!(
            "interned annotated commodity {:?} as ident {}",
            commodity.mapping_key(),
            self.next_ident
        );
        self.next_ident += 1;
        self.index(commodity.clone());
        Ok(commodity)
    }

    pub fn find_annotated(&self, symbol: &str, details: &Annotation) -> Option<CommodityRef> {
        self.by_key.get(&Self::annotated_key(symbol, details)).cloned()
    }

    pub fn find_or_create_annotated(
        &mut self,
        symbol: &str,
        details: Annotation,
    ) -> AmountResult<CommodityRef> {
        match self.find_annotated(symbol, &details) {
            Some(commodity) => Ok(commodity),
            None => self.create_annotated(symbol, details),
        }
    }

    /// The "no commodity" sentinel. Never annotated.
    pub fn null_commodity(&self) -> CommodityRef {
        self.null_commodity.clone()
    }

    pub fn default_commodity(&self) -> Option<CommodityRef> {
        self.default_commodity.clone()
    }

    pub fn set_default_commodity(&mut self, commodity: Option<CommodityRef>) {
        self.default_commodity = commodity;
    }

    /// All commodities in ident order, the null sentinel included.
    pub fn commodities(&self) -> impl Iterator<Item = &CommodityRef> {
        self.by_ident.values()
    }

    /// Number of interned commodities, excluding the null sentinel.
    pub fn len(&self) -> usize {
        self.by_ident.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a quote source. Sources are consulted in registration
    /// order on every historical valuation; the first to return a price
    /// wins.
    pub fn add_quote_source(&mut self, source: QuoteSource) {
        self.quote_sources.push(source);
    }

    pub fn clear_quote_sources(&mut self) {
        self.quote_sources.clear();
    }

    pub(crate) fn get_quote(
        &self,
        commodity: &Commodity,
        requested: Option<Moment>,
        found: Option<Moment>,
        last_lookup: Option<Moment>,
    ) -> Option<Amount> {
        self.quote_sources
            .iter()
            .find_map(|source| source(commodity, requested, found, last_lookup))
    }

    /// Parse an amount against this pool. Convenience for
    /// [`Amount::parse`].
    pub fn parse_amount(&mut self, text: &str, flags: ParseFlags) -> AmountResult<Amount> {
        Amount::parse(self, text, flags)
    }
}

impl Default for CommodityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommodityPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommodityPool")
            .field("commodities", &self.len())
            .field("next_ident", &self.next_ident)
            .field("quote_sources", &self.quote_sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn interning_is_idempotent() {
        let mut pool = CommodityPool::new();
        let a = pool.find_or_create("USD").unwrap();
        let b = pool.find_or_create("USD").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert_eq!(a.ident(), 1);
    }

    #[test]
    fn create_rejects_duplicates_and_bad_symbols() {
        let mut pool = CommodityPool::new();
        pool.create("USD").unwrap();
        assert!(matches!(pool.create("USD"), Err(AmountError::DuplicateCommodity(_))));
        assert!(matches!(pool.create(""), Err(AmountError::InvalidSymbol(_))));
        assert!(matches!(pool.create("a\"b"), Err(AmountError::InvalidSymbol(_))));
    }

    #[test]
    fn quoting_rule() {
        assert!(!CommodityPool::symbol_needs_quoting("$"));
        assert!(!CommodityPool::symbol_needs_quoting("AAPL"));
        assert!(CommodityPool::symbol_needs_quoting("MSFT US"));
        assert!(CommodityPool::symbol_needs_quoting("M&M"));
        assert!(CommodityPool::symbol_needs_quoting("X2"));

        let mut pool = CommodityPool::new();
        let quoted = pool.create("M&M").unwrap();
        assert_eq!(quoted.base_symbol(), "M&M");
        assert_eq!(quoted.symbol(), "\"M&M\"");
        assert_eq!(quoted.mapping_key(), "M&M");
    }

    #[test]
    fn idents_are_dense_and_ordered() {
        let mut pool = CommodityPool::new();
        pool.create("A").unwrap();
        pool.create("B").unwrap();
        pool.create("C").unwrap();
        let idents: Vec<_> = pool.commodities().map(|c| c.ident()).collect();
        assert_eq!(idents, vec![0, 1, 2, 3]);
        assert!(pool.find_by_ident(2).is_some());
        assert!(pool.find_by_ident(9).is_none());
    }

    #[test]
    fn annotated_interning_shares_base() {
        let mut pool = CommodityPool::new();
        let details = Annotation::with_tag("lot1");
        let a = pool.find_or_create_annotated("AAPL", details.clone()).unwrap();
        let b = pool.find_or_create_annotated("AAPL", details).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.mapping_key(), "AAPL (lot1)");

        let base = pool.find("AAPL").unwrap();
        assert!(a.shares_base_with(&base));
        assert!(!base.is_annotated());
        base.set_precision(4);
        assert_eq!(a.precision(), 4);
    }

    #[test]
    fn null_commodity_is_builtin() {
        let pool = CommodityPool::new();
        let null = pool.null_commodity();
        assert!(null.is_null());
        assert!(null.has_flags(CommodityFlags::BUILTIN | CommodityFlags::NOMARKET));
        assert_eq!(null.ident(), 0);
        assert_eq!(pool.len(), 0);
    }
}
