//! Parsing and range checks for spoken temperature / load-rate values.
//!
//! The intent layer hands us loosely formatted strings such as `"22.5度"`,
//! `"-5℃"`, `"60%"` or `"0.6"`. Only the first number matters; unit tokens
//! after it are ignored.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ParameterLimits;
use crate::error::{ParamError, ParamKind};

/// A parsed parameter: the raw number sent to the gateway plus the text used
/// when talking to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedValue {
    pub raw: f64,
    pub formatted: String,
}

fn signed_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").ok()).as_ref()
}

fn unsigned_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").ok()).as_ref()
}

/// Extract the first signed decimal from `text`.
pub fn parse_temperature(text: &str) -> Option<ParsedValue> {
    let raw: f64 = signed_number()?.find(text)?.as_str().parse().ok()?;
    Some(ParsedValue {
        raw,
        formatted: format_temperature(raw),
    })
}

/// Extract the first unsigned decimal from `text`.
///
/// Values in `(0, 1]` are read as fractions, so `"0.6"` becomes `60`.
pub fn parse_load_rate(text: &str) -> Option<ParsedValue> {
    let mut raw: f64 = unsigned_number()?.find(text)?.as_str().parse().ok()?;
    if raw > 0.0 && raw <= 1.0 {
        raw = round_to_precision(raw * 100.0);
    }
    Some(ParsedValue {
        raw,
        formatted: format_load_rate(raw),
    })
}

pub fn format_temperature(value: f64) -> String {
    format!("{}℃", value)
}

/// Shows the same number [`wire_number`] sends, so the user confirms exactly
/// what the gateway receives.
pub fn format_load_rate(value: f64) -> String {
    format!("{}%", wire_number(value))
}

/// Drop float noise from scaling (`0.57 * 100.0` is `56.99999999999999`).
fn round_to_precision(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Number rendering used on the wire: `22` rather than `22.0`.
pub fn wire_number(value: f64) -> String {
    format!("{}", value)
}

pub fn validate_temperature(value: Option<f64>, limits: &ParameterLimits) -> Result<(), ParamError> {
    check_range(
        ParamKind::Temperature,
        value,
        limits.temperature_min,
        limits.temperature_max,
    )
}

pub fn validate_load_rate(value: Option<f64>, limits: &ParameterLimits) -> Result<(), ParamError> {
    check_range(
        ParamKind::LoadRate,
        value,
        limits.load_rate_min,
        limits.load_rate_max,
    )
}

fn check_range(kind: ParamKind, value: Option<f64>, min: f64, max: f64) -> Result<(), ParamError> {
    match value {
        Some(v) if v < min || v > max => Err(ParamError::OutOfRange {
            kind,
            value: v,
            min,
            max,
        }),
        _ => Ok(()),
    }
}
