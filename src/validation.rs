//! Format checks for banking identifiers, usable as `validator` custom functions.

use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

static IBAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2}[0-9]{2}[a-zA-Z0-9]{1,30}$").expect("valid IBAN regex"));
static BIC_SWIFT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z]{6}[A-Z0-9]{2}([A-Z0-9]{3})?$").expect("valid BIC/SWIFT regex")
});
static CVV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}$").expect("valid CVV regex"));
static PAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{13,19}$").expect("valid PAN regex"));

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

pub fn validate_iban(value: &str) -> Result<(), ValidationError> {
    if IBAN_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("iban", "must be a valid IBAN"))
    }
}

pub fn validate_bic_swift(value: &str) -> Result<(), ValidationError> {
    if BIC_SWIFT_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("bic_swift", "must be a valid BIC/SWIFT code"))
    }
}

pub fn validate_cvv(value: &str) -> Result<(), ValidationError> {
    if CVV_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid("cvv", "must be exactly 3 digits"))
    }
}

/// Format check only; the checksum is applied separately so it can be toggled.
pub fn validate_pan(value: &str) -> Result<(), ValidationError> {
    if PAN_RE.is_match(&normalize_pan(value)) {
        Ok(())
    } else {
        Err(invalid("pan", "must be 13 to 19 digits"))
    }
}

pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(invalid("not_blank", "must not be blank"))
    } else {
        Ok(())
    }
}

/// Strips the `-` group separators callers commonly send.
pub fn normalize_pan(value: &str) -> String {
    value.chars().filter(|c| *c != '-').collect()
}

/// Luhn (mod 10) checksum over an all-digit string.
pub fn luhn_valid(digits: &str) -> bool {
    if digits.is_empty() {
        return false;
    }
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let Some(mut d) = c.to_digit(10) else {
            return false;
        };
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("DE89370400440532013000", true)]
    #[case("GB82WEST12345698765432", true)]
    #[case("de89370400440532013000", false)]
    #[case("DE8", false)]
    #[case("DEXX370400440532013000", false)]
    fn iban_format(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate_iban(value).is_ok(), ok);
    }

    #[rstest]
    #[case("DEUTDEFF", true)]
    #[case("DEUTDEFF500", true)]
    #[case("DEUTDEF", false)]
    #[case("deutdeff", false)]
    #[case("DEUTDEFF50", false)]
    fn bic_swift_format(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate_bic_swift(value).is_ok(), ok);
    }

    #[rstest]
    #[case("123", true)]
    #[case("12", false)]
    #[case("1234", false)]
    #[case("12a", false)]
    fn cvv_format(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate_cvv(value).is_ok(), ok);
    }

    #[rstest]
    #[case("4111111111111111", true)]
    #[case("4111-1111-1111-1111", true)]
    #[case("411111111111", false)]
    #[case("41111111111111111111", false)]
    #[case("4111 1111 1111 1111", false)]
    fn pan_format(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate_pan(value).is_ok(), ok);
    }

    #[test]
    fn luhn_known_values() {
        assert!(luhn_valid("4111111111111111"));
        assert!(luhn_valid("5500005555555559"));
        assert!(luhn_valid("378282246310005"));
        assert!(!luhn_valid("4111111111111112"));
        assert!(!luhn_valid(""));
        assert!(!luhn_valid("4111x11111111111"));
    }

    #[test]
    fn blank_strings_rejected() {
        assert!(validate_not_blank("  ").is_err());
        assert!(validate_not_blank(" a ").is_ok());
    }

    proptest! {
        #[test]
        fn changing_one_digit_breaks_luhn(body in "[0-9]{15}", pos in 0usize..15, delta in 1u32..10) {
            // Append the check digit that makes `body` valid.
            let check = (0..10u32)
                .find(|d| luhn_valid(&format!("{body}{d}")))
                .unwrap();
            let valid = format!("{body}{check}");
            prop_assert!(luhn_valid(&valid));

            let mut digits: Vec<u32> = valid.chars().map(|c| c.to_digit(10).unwrap()).collect();
            digits[pos] = (digits[pos] + delta) % 10;
            let mutated: String = digits.iter().map(|d| char::from_digit(*d, 10).unwrap()).collect();
            prop_assert!(!luhn_valid(&mutated));
        }
    }
}
