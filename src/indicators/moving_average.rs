use rust_decimal::Decimal;

/// Percentage distance of `price` from `mean`
///
/// Returns None for a zero mean.
pub fn deviation_pct(price: Decimal, mean: Decimal) -> Option<Decimal> {
    if mean.is_zero() {
        return None;
    }

    Some((price - mean) / mean * Decimal::ONE_HUNDRED)
}
