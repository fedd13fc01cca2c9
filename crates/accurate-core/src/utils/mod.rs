//! Shared helpers: markers, sets, time parsing and decimal math

pub mod consts;
pub mod string_map;
pub mod time;

pub use string_map::StringMap;

use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};

use consts::{DEFAULT_DIVISION_SCALE, ROUNDING_DOWN, ROUNDING_MIDDLE, ROUNDING_UP};

/// Rounds to `decimals` using one of `*up`, `*middle` or `*down`
///
/// Unknown methods leave the value untouched.
pub fn round(value: Decimal, decimals: u32, method: &str) -> Decimal {
    let strategy = match method {
        ROUNDING_UP => RoundingStrategy::AwayFromZero,
        ROUNDING_MIDDLE => RoundingStrategy::MidpointAwayFromZero,
        ROUNDING_DOWN => RoundingStrategy::ToZero,
        _ => return value,
    };
    value.round_dp_with_strategy(decimals, strategy).normalize()
}

/// Division with banker's rounding at `scale`; [`DEFAULT_DIVISION_SCALE`] when `None`
///
/// Returns zero on division by zero.
pub fn div(a: Decimal, b: Decimal, scale: Option<u32>) -> Decimal {
    if b.is_zero() {
        return Decimal::ZERO;
    }
    let scale = scale.unwrap_or(DEFAULT_DIVISION_SCALE);
    a.checked_div(b)
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)
}

/// Converts a float metric into a decimal, NaN and infinities map to zero
pub fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_f64_retain(v).unwrap_or(Decimal::ZERO).normalize()
}

pub fn gen_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Stable hex digest over the given parts, used for CDR unique ids
pub fn sha_id<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// Joins key parts with `:`
pub fn concatenated_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(consts::CONCATENATED_KEY_SEP)
}

/// Splits "tenant:name" account ids
pub fn split_account_id(id: &str) -> (&str, &str) {
    match id.split_once(consts::TENANT_ACCOUNT_SEP) {
        Some((tenant, name)) => (tenant, name),
        None => ("", id),
    }
}

/// Returns `val` or `default` when `val` is empty
pub fn first_non_empty<'a>(vals: &[&'a str]) -> &'a str {
    vals.iter().find(|v| !v.is_empty()).copied().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_methods() {
        assert_eq!(round(dec!(1.234), 2, ROUNDING_UP), dec!(1.24));
        assert_eq!(round(dec!(1.235), 2, ROUNDING_MIDDLE), dec!(1.24));
        assert_eq!(round(dec!(1.239), 2, ROUNDING_DOWN), dec!(1.23));
        assert_eq!(round(dec!(1.239), 2, ""), dec!(1.239));
    }

    #[test]
    fn test_div_bankers_rounding() {
        assert_eq!(div(dec!(1), dec!(8), Some(2)), dec!(0.12));
        assert_eq!(div(dec!(3), dec!(8), Some(2)), dec!(0.38));
        assert_eq!(div(dec!(1), dec!(0), None), Decimal::ZERO);
        assert_eq!(div(dec!(1), dec!(3), None).scale(), DEFAULT_DIVISION_SCALE);
    }

    #[test]
    fn test_sha_id_is_stable() {
        let a = sha_id(["abc", "2013-11-07T08:42:26Z"]);
        let b = sha_id(["abc", "2013-11-07T08:42:26Z"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_split_account_id() {
        assert_eq!(split_account_id("test:dan"), ("test", "dan"));
        assert_eq!(split_account_id("dan"), ("", "dan"));
    }
}
