use thiserror::Error;
use url::Url;

use crate::points::Points;

pub const MAX_TEXT_LEN: usize = 250;
/// Total digits of the course price column (two of them decimal).
pub const PRICE_MAX_DIGITS: u32 = 6;
/// Total digits of the balance column (two of them decimal).
pub const BALANCE_MAX_DIGITS: u32 = 8;

/// Write-time validation failures, raised before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("course price cannot be negative")]
    NegativePrice,
    #[error("balance cannot be negative")]
    NegativeBalance,
    #[error("{field} must have at most {max_digits} digits")]
    TooManyDigits {
        field: &'static str,
        max_digits: u32,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{0} is not a valid email address")]
    InvalidEmail(String),
    #[error("{0} is not a valid http(s) link")]
    InvalidLink(String),
}

pub fn validate_price(price: Points) -> Result<(), ValidationError> {
    if price.is_negative() {
        return Err(ValidationError::NegativePrice);
    }
    if !price.fits_digits(PRICE_MAX_DIGITS) {
        return Err(ValidationError::TooManyDigits {
            field: "price",
            max_digits: PRICE_MAX_DIGITS,
        });
    }
    Ok(())
}

pub fn validate_balance(amount: Points) -> Result<(), ValidationError> {
    if amount.is_negative() {
        return Err(ValidationError::NegativeBalance);
    }
    if !amount.fits_digits(BALANCE_MAX_DIGITS) {
        return Err(ValidationError::TooManyDigits {
            field: "balance",
            max_digits: BALANCE_MAX_DIGITS,
        });
    }
    Ok(())
}

/// Validates a required short text field such as a title or a name.
pub fn validate_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.chars().count() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
        });
    }
    Ok(())
}

pub fn validate_email(value: &str) -> Result<(), ValidationError> {
    validate_text("email", value)?;
    let valid = match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmail(value.to_string()))
    }
}

pub fn validate_link(value: &str) -> Result<(), ValidationError> {
    validate_text("link", value)?;
    let url = Url::parse(value).map_err(|_| ValidationError::InvalidLink(value.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::InvalidLink(value.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_price_is_rejected() {
        assert_eq!(
            validate_price(Points::from_hundredths(-1)),
            Err(ValidationError::NegativePrice)
        );
        assert_eq!(validate_price(Points::ZERO), Ok(()));
        assert!(matches!(
            validate_price(Points::whole(10_000)),
            Err(ValidationError::TooManyDigits { field: "price", .. })
        ));
    }

    #[test]
    fn negative_balance_is_rejected() {
        assert_eq!(
            validate_balance(Points::from_hundredths(-100)),
            Err(ValidationError::NegativeBalance)
        );
        assert_eq!(validate_balance(Points::whole(999_999)), Ok(()));
    }

    #[test]
    fn text_fields_are_bounded() {
        assert_eq!(validate_text("title", "  "), Err(ValidationError::Empty("title")));
        let long = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(
            validate_text("title", &long),
            Err(ValidationError::TooLong { .. })
        ));
        assert_eq!(validate_text("title", &"x".repeat(MAX_TEXT_LEN)), Ok(()));
    }

    #[test]
    fn emails_need_local_part_and_domain() {
        assert_eq!(validate_email("ada@example.com"), Ok(()));
        assert!(validate_email("ada.example.com").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ada@localhost").is_err());
    }

    #[test]
    fn links_must_be_absolute_http() {
        assert_eq!(validate_link("https://videos.example.com/lesson-1"), Ok(()));
        assert!(validate_link("ftp://example.com/file").is_err());
        assert!(validate_link("/relative/path").is_err());
    }
}
