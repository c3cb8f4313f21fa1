//! Small parsing and formatting helpers shared across the crate:
//! durations (`9ms`, `1.2s`), human-readable byte sizes (`10kb`, `1MB`)
//! and HTTP header-name canonicalization.

use std::time::Duration;

use crate::error::{EsiError, Result};

/// Parse a duration attribute value such as `5ms`, `2s`, `1.2s` or `1m30s`.
///
/// Supported units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. Compound values
/// concatenate segments (`1m30s`). A bare number or an unknown unit is an
/// error.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EsiError::NotValid("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| EsiError::NotValid(format!("duration {:?} is missing a unit", input)))?;
        if num_end == 0 {
            return Err(EsiError::NotValid(format!(
                "duration {:?} does not start with a number",
                input
            )));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| EsiError::NotValid(format!("bad number in duration {:?}", input)))?;

        let unit_end = rest[num_end..]
            .find(|c: char| c.is_ascii_digit())
            .map(|i| num_end + i)
            .unwrap_or(rest.len());
        let unit = &rest[num_end..unit_end];

        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "\u{b5}s" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3600.0 * 1_000_000_000.0,
            _ => {
                return Err(EsiError::NotValid(format!(
                    "unknown unit {:?} in duration {:?}",
                    unit, input
                )))
            }
        };

        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
        rest = &rest[unit_end..];
    }

    Ok(total)
}

/// Format a duration the way tag attributes write them: integral
/// milliseconds below one second, seconds (with trimmed fraction) above.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        if d < Duration::from_millis(1) {
            return format!("{}\u{b5}s", d.as_micros());
        }
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs_f64();
    let mut out = format!("{:.3}", secs);
    while out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
    out.push('s');
    out
}

/// Parse a human-readable byte size such as `10kb`, `1MB`, `3.5GB` or
/// `10KiB`. Decimal suffixes are powers of 1000, `*iB` suffixes powers of
/// 1024, and a bare number is a plain byte count.
pub fn parse_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EsiError::NotValid("empty byte size".into()));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if num_end == 0 {
        return Err(EsiError::NotValid(format!(
            "byte size {:?} does not start with a number",
            input
        )));
    }
    let value: f64 = s[..num_end]
        .parse()
        .map_err(|_| EsiError::NotValid(format!("bad number in byte size {:?}", input)))?;

    let unit = s[num_end..].trim().to_ascii_lowercase();
    let factor: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => 1e3,
        "mb" | "m" => 1e6,
        "gb" | "g" => 1e9,
        "tb" | "t" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => {
            return Err(EsiError::NotValid(format!(
                "unknown unit {:?} in byte size {:?}",
                unit, input
            )))
        }
    };

    Ok((value * factor).round() as u64)
}

/// Format a byte count into decimal units with trimmed precision:
/// `3000` → `3.0 kB`, `10000` → `10 kB`, `123456789` → `123 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit_index = 0;
    while value >= 1000.0 && unit_index < UNITS.len() - 1 {
        value /= 1000.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        return format!("{} {}", bytes, UNITS[unit_index]);
    }
    if value < 10.0 {
        format!("{:.1} {}", value, UNITS[unit_index])
    } else {
        format!("{} {}", value.round() as u64, UNITS[unit_index])
    }
}

/// Canonicalize an HTTP header name: the first letter and every letter
/// following a `-` are uppercased, everything else lowercased
/// (`accept-language` → `Accept-Language`).
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if c == '-' {
            out.push('-');
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Split a comma-separated list into trimmed, non-empty items.
pub fn comma_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
