//! BSON value comparison rules shared by the evaluator, the sorter and the
//! update operators.

use std::cmp::Ordering;

use bson::Bson;

/// Relative order of BSON types when values of different types meet.
///
/// Numeric types share one rank so that i64/f64 comparisons stay numeric.
pub fn type_rank(v: &Bson) -> u8 {
    match v {
        Bson::Null | Bson::Undefined => 0,
        Bson::Boolean(_) => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Binary(_) => 4,
        Bson::ObjectId(_) => 5,
        Bson::DateTime(_) => 6,
        Bson::Timestamp(_) => 7,
        Bson::RegularExpression(_) => 8,
        Bson::Array(_) => 9,
        Bson::Document(_) => 10,
        _ => 11,
    }
}

/// Compare an i64 against an f64 without losing precision on the i64 side.
///
/// `a as f64` rounds for |a| >= 2^53, so the integer part is compared as
/// i64 and only the fraction breaks ties.
fn cmp_i64_f64(a: i64, b: f64) -> Ordering {
    if b.is_nan() {
        return Ordering::Greater;
    }
    if b >= 9.223_372_036_854_776e18 {
        return Ordering::Less;
    }
    if b < -9.223_372_036_854_776e18 {
        return Ordering::Greater;
    }
    let trunc = b.trunc();
    match a.cmp(&(trunc as i64)) {
        Ordering::Equal => {
            let frac = b - trunc;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn as_i64(v: &Bson) -> Option<i64> {
    match v {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

/// Total comparison of two BSON values.
///
/// Numbers compare numerically across i32/i64/f64 — f64 is involved only
/// when one side is f64. Booleans order `false < true`. Strings, object
/// ids and binaries compare bytewise; dates by epoch millis. Arrays
/// compare element-wise then by length; documents by ordered key/value
/// traversal. Values of different type ranks order by rank.
pub fn cmp_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::Null, _) | (Bson::Undefined, _) => Ordering::Equal,
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        _ if ra == 2 => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(x), None) => match b {
                Bson::Double(y) => cmp_i64_f64(x, *y),
                _ => Ordering::Equal,
            },
            (None, Some(y)) => match a {
                Bson::Double(x) => cmp_i64_f64(y, *x).reverse(),
                _ => Ordering::Equal,
            },
            (None, None) => match (a, b) {
                (Bson::Double(x), Bson::Double(y)) => cmp_f64(*x, *y),
                _ => Ordering::Equal,
            },
        },
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::String(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            (x.pattern.as_str(), x.options.as_str()).cmp(&(y.pattern.as_str(), y.options.as_str()))
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = cmp_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    cmp_values(a, b) == Ordering::Equal
}

/// Simple locale-independent case folding.
pub fn fold_case(s: &str) -> String {
    s.chars().flat_map(|c| c.to_lowercase()).collect()
}

/// Split a string on whitespace and punctuation into non-empty tokens.
pub fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, doc};

    #[test]
    fn integers_compare_exactly() {
        assert_eq!(
            cmp_values(&Bson::Int64(10), &Bson::Int32(10)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Bson::Int64(-5), &Bson::Int64(3)),
            Ordering::Less
        );
    }

    #[test]
    fn large_i64_vs_f64_keeps_precision() {
        // 2^53 + 1 is not representable as f64
        let big = (1i64 << 53) + 1;
        assert_eq!(
            cmp_values(&Bson::Int64(big), &Bson::Double((1i64 << 53) as f64)),
            Ordering::Greater
        );
        assert_eq!(
            cmp_values(&Bson::Int64(big), &Bson::Int64(big)),
            Ordering::Equal
        );
    }

    #[test]
    fn double_fraction_breaks_ties() {
        assert_eq!(
            cmp_values(&Bson::Int64(2), &Bson::Double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Bson::Double(2.5), &Bson::Int64(2)),
            Ordering::Greater
        );
    }

    #[test]
    fn booleans_order_false_before_true() {
        assert_eq!(
            cmp_values(&Bson::Boolean(false), &Bson::Boolean(true)),
            Ordering::Less
        );
    }

    #[test]
    fn mixed_types_order_by_rank() {
        assert_eq!(
            cmp_values(&Bson::Int32(5), &Bson::String("5".into())),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Bson::Null, &Bson::Boolean(false)),
            Ordering::Less
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_length() {
        let a = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let b = Bson::Array(vec![Bson::Int32(1), Bson::Int32(3)]);
        let c = Bson::Array(vec![Bson::Int32(1)]);
        assert_eq!(cmp_values(&a, &b), Ordering::Less);
        assert_eq!(cmp_values(&c, &a), Ordering::Less);
    }

    #[test]
    fn documents_compare_by_traversal() {
        let a = Bson::Document(doc! { "a": 1, "b": 2 });
        let b = Bson::Document(doc! { "a": 1, "b": 3 });
        assert_eq!(cmp_values(&a, &b), Ordering::Less);
        let c = Bson::Document(doc! { "a": 1, "b": 2 });
        assert_eq!(cmp_values(&a, &c), Ordering::Equal);
    }

    #[test]
    fn fold_case_is_simple_lowercase() {
        assert_eq!(fold_case("HeLLo"), "hello");
        assert_eq!(fold_case("ÄÖÜ"), "äöü");
    }

    #[test]
    fn tokenize_splits_punctuation_and_space() {
        let tokens: Vec<&str> = tokenize("one, two;three  four!").collect();
        assert_eq!(tokens, vec!["one", "two", "three", "four"]);
    }
}
