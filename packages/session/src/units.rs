//! Fixed-point amount conversion and small display helpers.

use primitive_types::U256;

use crate::{
    error::{Result, SessionError},
    types::Address,
};

/// Decimals of both the native coin and the JODA token.
pub const DECIMALS: u32 = 18;

/// Render base units as a decimal string, trimming trailing zeros.
pub fn format_units(value: U256, decimals: u32) -> String {
    let (whole, frac) = value.div_mod(U256::exp10(decimals as usize));
    if frac.is_zero() {
        return whole.to_string();
    }
    let digits = frac.to_string();
    let padding = "0".repeat((decimals as usize).saturating_sub(digits.len()));
    format!("{}.{}{}", whole, padding, digits.trim_end_matches('0'))
}

/// Parse a decimal string into base units. Exact: no float rounding.
pub fn parse_units(text: &str, decimals: u32) -> Result<U256> {
    let invalid = |why: &str| SessionError::InvalidAmount(format!("{:?}: {}", text, why));

    let text = text.trim();
    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("empty"));
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid("not a number"));
    }
    if frac.len() > decimals as usize {
        return Err(invalid("too many decimal places"));
    }

    let digits = |s: &str| -> Result<U256> {
        if s.is_empty() {
            return Ok(U256::zero());
        }
        U256::from_dec_str(s).map_err(|_| invalid("too large"))
    };
    let whole = digits(whole)?;
    let frac_units = digits(&format!("{:0<width$}", frac, width = decimals as usize))?;

    whole
        .checked_mul(U256::exp10(decimals as usize))
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| invalid("too large"))
}

/// `0x1234…abcd`
pub fn short_address(address: &Address) -> String {
    let full = address.to_string();
    format!("{}…{}", &full[..6], &full[full.len() - 4..])
}

/// Countdown text such as `2d 3h 4m 5s`; zero reads as `Ready`.
pub fn format_countdown(seconds: u64) -> String {
    if seconds == 0 {
        return "Ready".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    format!("{}d {}h {}m {}s", days, hours, minutes, secs)
}

/// Affiliate link for `address` under the page `base` URL.
pub fn referral_link(base: &str, address: Option<&Address>) -> String {
    let base = base
        .strip_suffix("index.html")
        .or_else(|| base.strip_suffix("index.htm"))
        .unwrap_or(base);
    match address {
        Some(a) => format!("{}?ref={}", base, a),
        None => format!("{}?ref=", base),
    }
}

/// Serde adapter writing `U256` amounts as decimal strings, which JSON
/// consumers can hold without losing precision.
pub mod wei_string {
    use primitive_types::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(|e| serde::de::Error::custom(format!("{:?}", e)))
    }
}
