use chrono::TimeDelta;
use thiserror::Error as ThisError;

/// Errors that could occur while building an exporter.
#[derive(Debug, ThisError)]
pub enum BuildError {
    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ConfigError),

    /// The configuration references a driver kind that no driver is registered for.
    #[error("no driver registered for kind {0}")]
    UnknownDriver(String),

    /// The telemetry path is not a valid absolute path.
    #[error("telemetry path must start with '/', got {0:?}")]
    InvalidTelemetryPath(String),

    /// Failed to bind the HTTP listener.
    #[error("failed to create HTTP listener: {0}")]
    FailedToCreateHTTPListener(String),
}

/// A duration string that could not be parsed.
#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("invalid duration {0:?}")]
pub struct InvalidDuration(pub String);

/// Parses a duration such as `300ms`, `-1.5h` or `2h45m`.
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is accepted without a
/// unit.
pub fn parse_duration(input: &str) -> Result<TimeDelta, InvalidDuration> {
    let invalid = || InvalidDuration(input.to_owned());

    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    while !rest.is_empty() {
        let whole_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let whole: u64 = if whole_len == 0 { 0 } else { rest[..whole_len].parse().map_err(|_| invalid())? };
        rest = &rest[whole_len..];

        // Fractional digits past what fits in a u64 are dropped.
        let (mut fraction, mut scale, mut fraction_len) = (0u64, 1f64, 0);
        if let Some(after_dot) = rest.strip_prefix('.') {
            fraction_len = after_dot.find(|c: char| !c.is_ascii_digit()).unwrap_or(after_dot.len());
            for digit in after_dot[..fraction_len].bytes() {
                match fraction.checked_mul(10).and_then(|f| f.checked_add(u64::from(digit - b'0'))) {
                    Some(f) => {
                        fraction = f;
                        scale *= 10.0;
                    }
                    None => break,
                }
            }
            rest = &after_dot[fraction_len..];
        }
        if whole_len == 0 && fraction_len == 0 {
            return Err(invalid());
        }

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let unit: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let mut nanos = whole.checked_mul(unit).ok_or_else(invalid)?;
        if fraction > 0 {
            nanos = nanos.checked_add((fraction as f64 * (unit as f64 / scale)) as u64).ok_or_else(invalid)?;
        }
        total = total.checked_add(nanos).ok_or_else(invalid)?;
    }

    let signed = if negative { -i128::from(total) } else { i128::from(total) };
    let nanos = i64::try_from(signed).map_err(|_| invalid())?;
    Ok(TimeDelta::nanoseconds(nanos))
}
