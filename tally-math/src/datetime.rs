//! Dates and moments for lot annotations and price history.
//!
//! Price history is keyed by [`Moment`]; annotation dates are whole-day
//! [`Date`] values. Both `1990/01/01` and `1990-01-01` input forms are
//! accepted.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::amount::{AmountError, AmountResult};

/// Calendar date used in lot annotations.
pub type Date = NaiveDate;

/// Point in time used as a price-history key.
pub type Moment = NaiveDateTime;

const DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d"];

/// Parse a date in `YYYY/MM/DD` or `YYYY-MM-DD` form.
pub fn parse_date(text: &str) -> AmountResult<Date> {
    let trimmed = text.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date);
        }
    }
    Err(AmountError::Syntax(format!("invalid date {:?}", text)))
}

/// The moment at the start of the given date.
pub fn moment_at(date: Date) -> Moment {
    date.and_time(NaiveTime::MIN)
}

/// Render a date the way mapping keys and annotations expect it.
pub fn format_date(date: Date) -> String {
    date.format("%Y/%m/%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_separators() {
        let slash = parse_date("2000/04/10").unwrap();
        let dash = parse_date("2000-04-10").unwrap();
        assert_eq!(slash, dash);
        assert_eq!(format_date(slash), "2000/04/10");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_date("04/10/2000").is_err());
        assert!(parse_date("not a date").is_err());
        assert!(parse_date("2000/13/40").is_err());
    }
}
