//! Arbitrary precision commoditized amounts for double-entry accounting.
//!
//! This crate is the numeric core of the tally accounting engine. It
//! provides exact rational arithmetic over [`Amount`]s that may carry a
//! [`Commodity`] — an interned symbol owned by a [`CommodityPool`] that
//! tracks display conventions, historical prices, scaling relationships
//! (`1h = 60m = 3600s`) and annotated lots (`10 AAPL {$20} [2024/01/15]`).
//!
//! ```
//! use tally_math::{Amount, CommodityPool, ParseFlags};
//!
//! let mut pool = CommodityPool::new();
//! let a = Amount::parse(&mut pool, "$1,234.56", ParseFlags::empty()).unwrap();
//! let b = Amount::parse(&mut pool, "$0.44", ParseFlags::empty()).unwrap();
//! let sum = (&a + &b).unwrap();
//! assert_eq!(sum.to_string(), "$1,235.00");
//! ```
//!
//! The core is single-threaded by contract: a pool and everything it owns
//! must stay on one thread, though separate threads may hold separate
//! pools.

#![warn(clippy::all)]

pub mod amount;
pub mod commodity;
pub mod datetime;
pub mod formatting;
pub mod pool;
pub mod quantity;

pub use amount::{Amount, AmountError, AmountResult, ParseFlags};
pub use commodity::{
    AnnotatedCommodity, Annotation, Commodity, CommodityFlags, CommodityRef, Ident, KeepDetails,
};
pub use datetime::{format_date, moment_at, parse_date, Date, Moment};
pub use pool::{CommodityPool, QuoteSource};
pub use quantity::{Precision, Quantity, EXTEND_BY_DIGITS};

// Re-export for convenience
pub use num_bigint::BigInt;
pub use num_rational::BigRational;
pub use rust_decimal::Decimal;
