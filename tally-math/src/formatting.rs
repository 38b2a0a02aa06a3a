//! Rendering of rational quantities as decimal text.
//!
//! This handles only the numeric portion of an amount: sign, integer part
//! with optional digit grouping, and a fractional part padded or rounded to
//! the requested display precision. Commodity placement is composed on top
//! by `Amount::print`.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed};

use crate::quantity::Precision;

/// Render `value` with exactly `precision` fractional digits, rounding
/// half-away-from-zero. With `thousands`, the integer part is grouped in
/// threes; `european` swaps the roles of `.` and `,`.
pub fn render_quantity(
    value: &BigRational,
    precision: Precision,
    thousands: bool,
    european: bool,
) -> String {
    let scale = BigInt::from(10u32).pow(precision as u32);
    let scaled = value * BigRational::from_integer(scale.clone());
    let half = BigRational::new(BigInt::one(), BigInt::from(2));
    let shifted = if scaled.is_negative() { scaled - half } else { scaled + half };
    let rounded = shifted.to_integer();

    let negative = rounded.is_negative();
    let mut digits = rounded.magnitude().to_string();
    while digits.len() <= precision as usize {
        digits.insert(0, '0');
    }

    let split = digits.len() - precision as usize;
    let (int_part, frac_part) = digits.split_at(split);

    let int_rendered = if thousands {
        group_digits(int_part, if european { '.' } else { ',' })
    } else {
        int_part.to_string()
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&int_rendered);
    if precision > 0 {
        out.push(if european { ',' } else { '.' });
        out.push_str(frac_part);
    }
    out
}

fn group_digits(digits: &str, separator: char) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let total = digits.len();
    for (index, ch) in digits.chars().enumerate() {
        out.push(ch);
        let remaining = total - index - 1;
        if remaining > 0 && remaining % 3 == 0 {
            out.push(separator);
        }
    }
    out
}
