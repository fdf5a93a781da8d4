//! Deterministic decimal-string → integer-micros conversion for run cost.
//!
//! Costs travel as decimal strings on the wire and are stored as integer
//! micros (1 unit = 1_000_000 micros). No floating point at any stage.

use std::fmt;

/// Errors produced while converting a cost string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// The cost string was empty.
    Empty,
    /// The cost string could not be parsed as a decimal number.
    Invalid { raw: String },
    /// More than 6 decimal places (would require rounding).
    TooManyDecimalPlaces { raw: String },
    /// Costs are non-negative; a leading `-` is rejected outright.
    Negative { raw: String },
}

impl fmt::Display for MoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoneyError::Empty => write!(f, "cost is empty"),
            MoneyError::Invalid { raw } => {
                write!(f, "cost could not be parsed as a decimal: '{raw}'")
            }
            MoneyError::TooManyDecimalPlaces { raw } => {
                write!(
                    f,
                    "cost has more than 6 decimal places \
                     (ambiguous micro conversion): '{raw}'"
                )
            }
            MoneyError::Negative { raw } => write!(f, "cost must be >= 0: '{raw}'"),
        }
    }
}

impl std::error::Error for MoneyError {}

/// Convert a decimal cost string to integer micros deterministically.
///
/// Rules:
/// - Accepts an optional fractional part separated by `.`.
/// - Rejects negative values (cost is a non-negative quantity).
/// - Rejects strings with more than 6 decimal places (would require rounding).
/// - Rejects empty strings, non-numeric characters, or multiple `.` separators.
/// - Does **not** use floating-point at any stage.
pub fn cost_to_micros(s: &str) -> Result<i64, MoneyError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MoneyError::Empty);
    }

    if s.starts_with('-') {
        return Err(MoneyError::Negative { raw: s.to_string() });
    }
    let digits = s.strip_prefix('+').unwrap_or(s);
    if digits.is_empty() {
        return Err(MoneyError::Invalid { raw: s.to_string() });
    }

    // Split on '.'.
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    // Reject anything that is not pure ASCII digits in either part.
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(MoneyError::Invalid { raw: s.to_string() });
    }
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(MoneyError::Invalid { raw: s.to_string() });
    }

    if frac_part.len() > 6 {
        return Err(MoneyError::TooManyDecimalPlaces { raw: s.to_string() });
    }

    let int_val: i64 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse::<i64>()
            .map_err(|_| MoneyError::Invalid { raw: s.to_string() })?
    };

    // Pad fractional part to exactly 6 digits, then parse.
    let mut frac_padded = frac_part.to_string();
    while frac_padded.len() < 6 {
        frac_padded.push('0');
    }
    let frac_val: i64 = frac_padded
        .parse::<i64>()
        .map_err(|_| MoneyError::Invalid { raw: s.to_string() })?;

    int_val
        .checked_mul(1_000_000)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(|| MoneyError::Invalid { raw: s.to_string() })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_plain_decimals() {
        assert_eq!(cost_to_micros("0.05"), Ok(50_000));
        assert_eq!(cost_to_micros("1"), Ok(1_000_000));
        assert_eq!(cost_to_micros("0"), Ok(0));
        assert_eq!(cost_to_micros("12.345678"), Ok(12_345_678));
        assert_eq!(cost_to_micros(".5"), Ok(500_000));
        assert_eq!(cost_to_micros("3."), Ok(3_000_000));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(cost_to_micros(" 0.02 "), Ok(20_000));
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(
            cost_to_micros("-0.01"),
            Err(MoneyError::Negative {
                raw: "-0.01".to_string()
            })
        );
    }

    #[test]
    fn rejects_too_many_decimal_places() {
        assert!(matches!(
            cost_to_micros("0.1234567"),
            Err(MoneyError::TooManyDecimalPlaces { .. })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(cost_to_micros(""), Err(MoneyError::Empty));
        assert!(matches!(cost_to_micros("abc"), Err(MoneyError::Invalid { .. })));
        assert!(matches!(cost_to_micros("1.2.3"), Err(MoneyError::Invalid { .. })));
        assert!(matches!(cost_to_micros("1e3"), Err(MoneyError::Invalid { .. })));
        assert!(matches!(cost_to_micros("."), Err(MoneyError::Invalid { .. })));
        assert!(matches!(cost_to_micros("+"), Err(MoneyError::Invalid { .. })));
    }

    #[test]
    fn overflow_is_an_error_not_a_wrap() {
        assert!(matches!(
            cost_to_micros("99999999999999999999"),
            Err(MoneyError::Invalid { .. })
        ));
    }
}
