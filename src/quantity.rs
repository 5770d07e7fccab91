/// Normalize raw ticket-quantity input into a positive count.
///
/// Leading zeros are stripped, anything containing a non-digit is
/// rejected, and `"0"` (in any number of zeros) normalizes to no
/// quantity at all.
pub fn normalize_quantity(input: &str) -> Option<u32> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let significant = trimmed.trim_start_matches('0');
    if significant.is_empty() {
        return None;
    }
    significant.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalize_quantity__strips_leading_zeros() {
        assert_eq!(normalize_quantity("007"), Some(7));
    }

    #[test]
    fn normalize_quantity__zero_is_invalid() {
        assert_eq!(normalize_quantity("0"), None);
        assert_eq!(normalize_quantity("000"), None);
    }

    #[test]
    fn normalize_quantity__rejects_non_digits() {
        assert_eq!(normalize_quantity(""), None);
        assert_eq!(normalize_quantity("-3"), None);
        assert_eq!(normalize_quantity("1.5"), None);
        assert_eq!(normalize_quantity("ten"), None);
        assert_eq!(normalize_quantity("1 0"), None);
    }

    #[test]
    fn normalize_quantity__accepts_surrounding_whitespace() {
        assert_eq!(normalize_quantity(" 12 "), Some(12));
    }

    #[test]
    fn normalize_quantity__rejects_overflow() {
        assert_eq!(normalize_quantity("99999999999999999999"), None);
    }

    proptest! {
        #[test]
        fn normalize_quantity__positive_integers_round_trip(q in 1u32..=u32::MAX) {
            prop_assert_eq!(normalize_quantity(&q.to_string()), Some(q));
        }

        #[test]
        fn normalize_quantity__zero_padding_is_ignored(q in 1u32..10_000, pad in 0usize..5) {
            let input = format!("{}{}", "0".repeat(pad), q);
            prop_assert_eq!(normalize_quantity(&input), Some(q));
        }

        #[test]
        fn normalize_quantity__never_returns_zero(input in ".*") {
            prop_assert_ne!(normalize_quantity(&input), Some(0));
        }
    }
}
