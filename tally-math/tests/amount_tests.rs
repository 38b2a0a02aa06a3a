// End-to-end tests of amount parsing, printing and arithmetic against a
// shared commodity pool.

use std::cmp::Ordering;

use tally_math::{Amount, AmountError, CommodityFlags, CommodityPool, ParseFlags, Quantity};

fn parse(pool: &mut CommodityPool, text: &str) -> Amount {
    Amount::parse(pool, text, ParseFlags::empty()).unwrap()
}

mod parse_print {
    use super::*;

    #[test]
    fn dollar_amount_round_trips() {
        let mut pool = CommodityPool::new();
        let amount = parse(&mut pool, "$1,234.56");

        let quantity = amount.quantity().unwrap();
        assert_eq!(quantity.precision(), 2);
        assert_eq!(quantity, &Quantity::parse("1234.56").unwrap());

        let dollar = amount.commodity().unwrap();
        assert_eq!(dollar.base_symbol(), "$");
        assert!(dollar.has_flags(CommodityFlags::STYLE_THOUSANDS));

        assert_eq!(amount.to_string(), "$1,234.56");
    }

    #[test]
    fn full_precision_string_reparses_equal() {
        let mut pool = CommodityPool::new();
        for text in ["$123.456789", "10.000001 AAPL", "$-0.01", "42"] {
            let amount = Amount::parse(&mut pool, text, ParseFlags::empty()).unwrap();
            let reparsed = parse(&mut pool, &amount.to_fullstring());
            assert_eq!(reparsed, amount, "{:?}", text);
            match (reparsed.commodity(), amount.commodity()) {
                (None, None) => {}
                (Some(a), Some(b)) => assert!(std::rc::Rc::ptr_eq(a, b)),
                _ => panic!("commodity identity lost for {:?}", text),
            }
        }
    }

    #[test]
    fn display_precision_migrates_across_parses() {
        let mut pool = CommodityPool::new();
        parse(&mut pool, "$10.001");
        let second = parse(&mut pool, "$5.00");
        assert_eq!(second.to_string(), "$5.000");

        // Widening is monotone over any sequence of parses.
        let mut seen = 0;
        for text in ["$1", "$2.5", "$3.25", "$4", "$5.123456"] {
            parse(&mut pool, text);
            let precision = pool.find("$").unwrap().precision();
            assert!(precision >= seen);
            seen = precision;
        }
        assert_eq!(seen, 6);
    }

    #[test]
    fn no_migrate_leaves_commodity_untouched() {
        let mut pool = CommodityPool::new();
        parse(&mut pool, "$1.00");
        Amount::parse(&mut pool, "$2.123456", ParseFlags::NO_MIGRATE).unwrap();
        assert_eq!(pool.find("$").unwrap().precision(), 2);
    }

    #[test]
    fn quantity_string_omits_commodity_only() {
        let mut pool = CommodityPool::new();
        let amount = parse(&mut pool, "$1,234.56");
        assert_eq!(amount.quantity_string(), "1,234.56");
    }
}

mod arithmetic {
    use super::*;

    #[test]
    fn addition_commutes_and_associates() {
        let mut pool = CommodityPool::new();
        let a = parse(&mut pool, "$1.10");
        let b = parse(&mut pool, "$2.25");
        let c = parse(&mut pool, "$3.033");

        assert_eq!((&a + &b).unwrap(), (&b + &a).unwrap());

        let left = ((&a + &b).unwrap() + &c).unwrap();
        let right = (&a + (&b + &c).unwrap()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn multiplicative_identity() {
        let mut pool = CommodityPool::new();
        let a = parse(&mut pool, "$12.34");
        let product = (&a * Amount::from_i64(1)).unwrap();
        assert_eq!(product, a);
    }

    #[test]
    fn mismatched_commodities_fail() {
        let mut pool = CommodityPool::new();
        let dollars = parse(&mut pool, "$1");
        let shares = parse(&mut pool, "1 AAPL");

        assert!(matches!(&dollars + &shares, Err(AmountError::CommodityMismatch)));
        assert!(matches!(&dollars - &shares, Err(AmountError::CommodityMismatch)));
        assert!(matches!(dollars.compare(&shares), Err(AmountError::CommodityMismatch)));
    }

    #[test]
    fn multiplying_by_unitless_keeps_commodity() {
        let mut pool = CommodityPool::new();
        let price = parse(&mut pool, "$2.50");
        let count = parse(&mut pool, "4");

        let total = (&price * &count).unwrap();
        assert_eq!(total.to_string(), "$10.00");

        let reversed = (&count * &price).unwrap();
        assert_eq!(reversed.to_string(), "$10.00");
    }

    #[test]
    fn commoditized_multiplication_keeps_left_commodity() {
        let mut pool = CommodityPool::new();
        let dollars = parse(&mut pool, "$3");
        let shares = parse(&mut pool, "2 AAPL");
        let product = (&dollars * &shares).unwrap();
        assert_eq!(product.commodity().unwrap().base_symbol(), "$");
        assert_eq!(product.to_i64().unwrap(), 6);
    }

    #[test]
    fn division_by_zero_leaves_dividend() {
        let mut pool = CommodityPool::new();
        let five = parse(&mut pool, "$5");
        let zero = parse(&mut pool, "0");

        assert!(matches!(&five / &zero, Err(AmountError::DivisionByZero)));
        assert_eq!(five.to_string(), "$5");

        // A very small divisor is fine and yields a large precise result.
        let tiny = parse(&mut pool, "0.0001");
        assert_eq!((&five / &tiny).unwrap().to_i64().unwrap(), 50_000);
    }

    #[test]
    fn precision_widens_through_addition() {
        let mut pool = CommodityPool::new();
        let coarse = parse(&mut pool, "1.5");
        let fine = parse(&mut pool, "0.125");
        let sum = (&coarse + &fine).unwrap();
        assert_eq!(sum.quantity().unwrap().precision(), 3);
        assert_eq!(sum.to_string(), "1.625");
    }

    #[test]
    fn null_operands_act_as_zero() {
        let mut pool = CommodityPool::new();
        let amount = parse(&mut pool, "$7.50");

        let sum = (Amount::null() + &amount).unwrap();
        assert_eq!(sum, amount);
        assert!(std::rc::Rc::ptr_eq(
            sum.commodity().unwrap(),
            amount.commodity().unwrap()
        ));

        let diff = (Amount::null() - &amount).unwrap();
        assert_eq!(diff, amount.negated());

        assert!((&amount * Amount::null()).unwrap().is_null());
    }

    #[test]
    fn ordering_within_one_commodity() {
        let mut pool = CommodityPool::new();
        let small = parse(&mut pool, "$1.99");
        let large = parse(&mut pool, "$2");
        assert_eq!(small.compare(&large).unwrap(), Ordering::Less);
        assert!(small < large);
        assert_eq!(small.abs().compare(&small).unwrap(), Ordering::Equal);
        assert_eq!(large.negated().compare(&large).unwrap(), Ordering::Less);
    }
}

mod scaling {
    use super::*;

    fn time_pool() -> CommodityPool {
        let mut pool = CommodityPool::new();
        Amount::parse_conversion(&mut pool, "1.0m", "60s").unwrap();
        Amount::parse_conversion(&mut pool, "1.0h", "60m").unwrap();
        pool
    }

    #[test]
    fn minutes_reduce_to_seconds() {
        let mut pool = time_pool();
        let minutes = Amount::parse(&mut pool, "90m", ParseFlags::NO_REDUCE).unwrap();
        let reduced = minutes.reduced();
        assert_eq!(reduced.to_string(), "5400s");
        // Reduction is a fixed point.
        assert_eq!(reduced.reduced(), reduced);

        // Parsing without NO_REDUCE reduces on the spot.
        let parsed = parse(&mut pool, "90m");
        assert_eq!(parsed.to_string(), "5400s");
    }

    #[test]
    fn seconds_unreduce_to_compact_form() {
        let mut pool = time_pool();
        let seconds = parse(&mut pool, "3601s");
        let compact = seconds.unreduced();

        assert_eq!(compact.commodity().unwrap().base_symbol(), "h");
        // 3601s is 3601/3600 hours exactly.
        let back = (compact.number() * Amount::from_i64(3600)).unwrap();
        assert_eq!(back.to_i64().unwrap(), 3601);
        // Displayed at the hour commodity's precision.
        assert_eq!(compact.to_string(), "1.0h");

        // 3599s stays under one hour: 59.98m.
        let under = parse(&mut pool, "3599s").unreduced();
        assert_eq!(under.commodity().unwrap().base_symbol(), "m");
        assert_eq!(under.to_string(), "60.0m");
        assert!(under.number() < Amount::from_i64(60).number());
    }

    #[test]
    fn reduce_then_unreduce_restores_compact_amounts() {
        let mut pool = time_pool();
        let hours = Amount::parse(&mut pool, "1.5h", ParseFlags::NO_REDUCE).unwrap();
        let round_trip = hours.reduced().unreduced();
        assert_eq!(round_trip.commodity().unwrap().base_symbol(), "h");
        assert_eq!(round_trip.number(), hours.number());
    }

    #[test]
    fn conversion_between_same_commodity_fails() {
        let mut pool = CommodityPool::new();
        assert!(matches!(
            Amount::parse_conversion(&mut pool, "1.0m", "60m"),
            Err(AmountError::NotReducible)
        ));
        assert!(matches!(
            Amount::parse_conversion(&mut pool, "1.0m", "60"),
            Err(AmountError::NotReducible)
        ));
    }
}

mod serialization {
    use super::*;

    #[test]
    fn binary_round_trip_preserves_identity() {
        let mut pool = CommodityPool::new();
        let samples = [
            Amount::null(),
            parse(&mut pool, "42"),
            parse(&mut pool, "$1,234.56"),
            parse(&mut pool, "-0.000001"),
            parse(&mut pool, "10 AAPL {$20} [2024/01/15] (first lot)"),
        ];

        for amount in &samples {
            let mut buffer = Vec::new();
            amount.write(&mut buffer).unwrap();
            let read = Amount::read(&pool, &mut buffer.as_slice()).unwrap();
            assert_eq!(&read, amount);
            if let (Some(a), Some(b)) = (read.commodity(), amount.commodity()) {
                assert!(std::rc::Rc::ptr_eq(a, b));
            }
            assert_eq!(read.to_fullstring(), amount.to_fullstring());
        }
    }

    #[test]
    fn reader_rejects_unknown_tag_bits() {
        let pool = CommodityPool::new();
        for tag in [0x08u8, 0x10, 0x80, 0xff] {
            let mut input = &[tag][..];
            assert!(
                matches!(Amount::read(&pool, &mut input), Err(AmountError::Corrupt(_))),
                "tag {:#04x} accepted",
                tag
            );
        }
    }

    #[test]
    fn reader_rejects_unknown_commodity() {
        let mut writer_pool = CommodityPool::new();
        let amount = parse(&mut writer_pool, "$9.99");
        let mut buffer = Vec::new();
        amount.write(&mut buffer).unwrap();

        let reader_pool = CommodityPool::new();
        assert!(matches!(
            Amount::read(&reader_pool, &mut buffer.as_slice()),
            Err(AmountError::UnknownCommodity(1))
        ));
    }
}
