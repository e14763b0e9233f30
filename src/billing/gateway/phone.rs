//! Tanzanian mobile-money phone numbers.
//!
//! The gateway accepts either the local form `07XXXXXXXX` or the
//! international form `2557XXXXXXXX`. Numbers are stored in local form.

use crate::billing::error::{BillingError, Result};
use crate::billing::validation::sanitize_for_error;

/// Mobile-money channels the gateway settles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MobileChannel {
    Mpesa,
    Tigo,
    Airtel,
}

impl MobileChannel {
    pub const ALL: [MobileChannel; 3] = [Self::Mpesa, Self::Tigo, Self::Airtel];

    /// Gateway code for the channel.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Mpesa => "MPESA-TZ",
            Self::Tigo => "TIGO-TZ",
            Self::Airtel => "AIRTEL-TZ",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mpesa => "M-Pesa",
            Self::Tigo => "Tigo Pesa",
            Self::Airtel => "Airtel Money",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(code.trim()))
    }
}

/// Normalize a phone number to local `07XXXXXXXX` form.
///
/// Spaces, dashes and a leading `+` are ignored.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '+'))
        .collect();

    if !is_valid_phone(&digits) {
        return Err(BillingError::validation(format!(
            "invalid phone number '{}': expected 07XXXXXXXX or 2557XXXXXXXX",
            sanitize_for_error(raw)
        )));
    }

    match digits.strip_prefix("255") {
        Some(rest) => Ok(format!("0{}", rest)),
        None => Ok(digits),
    }
}

fn is_valid_phone(digits: &str) -> bool {
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    match digits.len() {
        10 => digits.starts_with("07"),
        12 => digits.starts_with("2557"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_form_is_kept() {
        assert_eq!(normalize_phone("0712345678").unwrap(), "0712345678");
    }

    #[test]
    fn test_international_form_is_localized() {
        assert_eq!(normalize_phone("+255 712-345-678").unwrap(), "0712345678");
        assert_eq!(normalize_phone("255712345678").unwrap(), "0712345678");
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        for raw in ["", "0612345678", "071234567", "25571234567", "07123a5678", "+1 555 0100"] {
            assert!(
                matches!(normalize_phone(raw), Err(BillingError::Validation { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_channel_codes() {
        assert_eq!(MobileChannel::from_code("mpesa-tz"), Some(MobileChannel::Mpesa));
        assert_eq!(MobileChannel::from_code("AIRTEL-TZ"), Some(MobileChannel::Airtel));
        assert_eq!(MobileChannel::from_code("HALOPESA"), None);
        assert_eq!(MobileChannel::Tigo.display_name(), "Tigo Pesa");
    }
}
