//! Input validation for billing operations.
//!
//! Everything here runs before any state is written, so a rejected request
//! never leaves a partial transaction behind.

use validator::Validate;

use super::error::{BillingError, Result};

/// Maximum length for user IDs.
const MAX_USER_ID_LENGTH: usize = 256;

/// Maximum length for plan IDs.
const MAX_PLAN_ID_LENGTH: usize = 64;

/// Maximum length for idempotency keys (the gateway's order id column is 128).
const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 128;

/// Validate a user ID handed over by the authentication layer.
pub fn validate_user_id(id: &str) -> Result<()> {
    validate_identifier("user_id", id, MAX_USER_ID_LENGTH, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })
}

/// Validate a plan ID.
pub fn validate_plan_id(id: &str) -> Result<()> {
    validate_identifier("plan_id", id, MAX_PLAN_ID_LENGTH, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })
}

/// Validate an idempotency key.
///
/// Keys double as the gateway order id, so they are limited to characters
/// that survive a query string unescaped.
pub fn validate_idempotency_key(key: &str) -> Result<()> {
    validate_identifier("idempotency_key", key, MAX_IDEMPOTENCY_KEY_LENGTH, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
    })
}

/// Validate a charge amount against the configured bounds (inclusive).
pub fn validate_amount(amount: i64, min: i64, max: i64) -> Result<()> {
    if amount <= 0 {
        return Err(BillingError::validation("amount must be positive"));
    }
    if amount < min {
        return Err(BillingError::validation(format!(
            "amount {} is below the minimum of {}",
            amount, min
        )));
    }
    if amount > max {
        return Err(BillingError::validation(format!(
            "amount {} exceeds the maximum of {}",
            amount, max
        )));
    }
    Ok(())
}

/// Validate an ISO 4217 currency code (upper case, three letters).
pub fn validate_currency(currency: &str) -> Result<()> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(BillingError::validation(format!(
            "invalid currency code '{}'",
            sanitize_for_error(currency)
        )))
    }
}

/// Run the derived field rules on `value`, folding every failure into one
/// validation error of the form `field: reason`.
pub fn validate_fields<T: Validate>(value: &T) -> Result<()> {
    value.validate().map_err(|errors| {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    let msg = error
                        .message
                        .as_ref()
                        .map(|m| m.as_ref())
                        .unwrap_or_else(|| error.code.as_ref());
                    format!("{}: {}", field, msg)
                })
            })
            .collect();
        messages.sort();
        BillingError::validation(messages.join(", "))
    })
}

fn validate_identifier(
    field: &str,
    value: &str,
    max_len: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<()> {
    if value.is_empty() {
        return Err(BillingError::validation(format!("{} cannot be empty", field)));
    }

    if value.len() > max_len {
        return Err(BillingError::validation(format!(
            "{} '{}' exceeds maximum length of {}",
            field,
            truncate_for_error(value),
            max_len
        )));
    }

    if !value.chars().all(allowed) {
        return Err(BillingError::validation(format!(
            "{} '{}' contains invalid characters",
            field,
            sanitize_for_error(value)
        )));
    }

    Ok(())
}

/// Truncate a string for error messages.
fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 50 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(47).collect::<String>())
    }
}

/// Sanitize a string for error messages to prevent log injection.
pub(crate) fn sanitize_for_error(s: &str) -> String {
    let sanitized: String = s
        .chars()
        .take(50)
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '?' })
        .collect();

    if s.chars().count() > 50 {
        format!("{}...", sanitized)
    } else {
        sanitized
    }
}
