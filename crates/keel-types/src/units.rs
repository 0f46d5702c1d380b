//! Human-readable duration and memory quantities used by stack descriptors.

use std::time::Duration;

/// Parse a duration such as `30s`, `1m30s`, `250ms` or `1.5h`.
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }

    if let Ok(secs) = s.parse::<f64>() {
        return seconds_to_duration(secs, input);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let factor = match unit {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            "" => return Err(format!("missing unit in duration '{}'", input)),
            other => return Err(format!("unknown duration unit '{}' in '{}'", other, input)),
        };
        total += value * factor;
    }

    seconds_to_duration(total, input)
}

fn seconds_to_duration(secs: f64, input: &str) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration '{}'", input));
    }
    Ok(Duration::from_nanos((secs * 1e9).round() as u64))
}

/// Parse a memory quantity such as `2g`, `512M`, `1gb` or `1073741824`.
///
/// Suffixes are binary multiples.
pub fn parse_memory(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err("empty memory quantity".into());
    }

    let digits_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid memory quantity '{}'", input))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "k" | "kb" | "ki" | "kib" => 1 << 10,
        "m" | "mb" | "mi" | "mib" => 1 << 20,
        "g" | "gb" | "gi" | "gib" => 1 << 30,
        "t" | "tb" | "ti" | "tib" => 1 << 40,
        other => return Err(format!("unknown memory unit '{}' in '{}'", other, input)),
    };

    if value < 0.0 || !value.is_finite() {
        return Err(format!("invalid memory quantity '{}'", input));
    }
    Ok((value * multiplier as f64).round() as u64)
}
