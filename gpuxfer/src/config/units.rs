//! Parsers for the value formats accepted in environment variables.
//!
//! Memory sizes and bandwidths use binary multiples: `1k` is 1024 bytes and
//! `1MB/s` is 1048576 bytes per second.

use std::time::Duration;

fn binary_multiplier(unit: &str) -> Option<f64> {
    let m = match unit {
        "" | "b" => 1.0,
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(m)
}

/// Split `"6911.0MB"` into `("6911.0", "mb")`.
fn split_number(s: &str) -> (&str, String) {
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(idx);
    (num, unit.trim().to_ascii_lowercase())
}

/// Parse a memory size such as `1024`, `1k`, `1m` or `4MB`. `inf` maps to
/// `usize::MAX`.
pub fn parse_mem_units(s: &str) -> Option<usize> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("inf") {
        return Some(usize::MAX);
    }
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(digits_end);
    let value: usize = num.parse().ok()?;
    let mult = binary_multiplier(&unit.trim().to_ascii_lowercase())? as usize;
    value.checked_mul(mult)
}

/// Parse a bandwidth such as `6911.0MB/s` into bytes per second. A bare
/// number is already bytes per second.
pub fn parse_bandwidth(s: &str) -> Option<f64> {
    let s = s.trim();
    let s = s
        .strip_suffix("/s")
        .or_else(|| s.strip_suffix("ps"))
        .unwrap_or(s);
    let (num, unit) = split_number(s);
    let value: f64 = num.parse().ok()?;
    let bw = value * binary_multiplier(&unit)?;
    if bw.is_finite() && bw >= 0.0 { Some(bw) } else { None }
}

/// Parse a time such as `10e-6` (seconds), `10us`, `5ms` or `1s`.
pub fn parse_time(s: &str) -> Option<Duration> {
    let (num, unit) = split_number(s.trim());
    let value: f64 = num.parse().ok()?;
    let scale = match unit.as_str() {
        "" | "s" => 1e9,
        "ms" => 1e6,
        "us" => 1e3,
        "ns" => 1.0,
        _ => return None,
    };
    let nanos = (value * scale).round();
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

/// Parse a switch. `try` and `auto` count as on: the feature is used when the
/// driver supports it.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "on" | "1" | "true" | "try" | "auto" => Some(true),
        "n" | "no" | "off" | "0" | "false" => Some(false),
        _ => None,
    }
}
