//! Property tests for the value model.

use proptest::prelude::*;
use std::cmp::Ordering;

use tabq::value::{format_real, infer_type, parse_integer, parse_real};
use tabq::{TypeTag, Value};

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        prop::num::f64::NORMAL.prop_map(Value::Real),
        any::<bool>().prop_map(Value::Bool),
        "[a-zA-Z0-9 ,.-]{0,24}".prop_map(Value::Str),
        Just(Value::Unknown),
    ]
}

proptest! {
    #[test]
    fn ordering_is_reflexive(v in arb_value()) {
        prop_assert_eq!(Value::compare(&v, &v), Ordering::Equal);
    }

    #[test]
    fn ordering_is_antisymmetric(a in arb_value(), b in arb_value()) {
        let ab = Value::compare(&a, &b);
        let ba = Value::compare(&b, &a);
        prop_assert_eq!(ab, ba.reverse());
    }

    #[test]
    fn ordering_is_transitive(a in arb_value(), b in arb_value(), c in arb_value()) {
        let mut vals = vec![a, b, c];
        vals.sort_by(Value::compare);
        // A total order sorts without contradiction: each adjacent pair is
        // non-decreasing.
        prop_assert_ne!(Value::compare(&vals[0], &vals[1]), Ordering::Greater);
        prop_assert_ne!(Value::compare(&vals[1], &vals[2]), Ordering::Greater);
        prop_assert_ne!(Value::compare(&vals[0], &vals[2]), Ordering::Greater);
    }

    #[test]
    fn conversion_is_deterministic(v in arb_value()) {
        for tag in [
            TypeTag::String,
            TypeTag::Real,
            TypeTag::Integer,
            TypeTag::Boolean,
        ] {
            let once = v.convert(tag);
            let twice = v.convert(tag);
            prop_assert_eq!(Value::compare(&once, &twice), Ordering::Equal);
        }
    }

    #[test]
    fn conversion_lands_on_target_type(v in arb_value()) {
        prop_assert_eq!(v.convert(TypeTag::Integer).tag(), TypeTag::Integer);
        prop_assert_eq!(v.convert(TypeTag::Real).tag(), TypeTag::Real);
        prop_assert_eq!(v.convert(TypeTag::Boolean).tag(), TypeTag::Boolean);
        prop_assert_eq!(v.convert(TypeTag::String).tag(), TypeTag::String);
    }

    #[test]
    fn integer_roundtrips_through_string(i in any::<i64>()) {
        let s = Value::Int(i).as_str();
        prop_assert_eq!(parse_integer(&s), (i, true));
    }

    #[test]
    fn format_real_never_panics(r in any::<f64>(), p in 0usize..18) {
        let _ = format_real(r, p);
    }

    #[test]
    fn inferred_integers_parse_exactly(i in any::<i64>()) {
        // 0 and 1 are exact boolean matches, which outrank Integer in the
        // inference ladder.
        prop_assume!(i != 0 && i != 1);
        let s = i.to_string();
        prop_assert_eq!(infer_type(&s), TypeTag::Integer);
        prop_assert!(parse_real(&s).1);
    }
}
