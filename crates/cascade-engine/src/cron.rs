//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds).
//! Field syntax: *, */N, N, and comma lists like "0,15,30,45".
//! Evaluation happens in the rule's configured time zone; the returned
//! due time is UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use cascade_core::{CascadeError, Result};

/// Compute the next time the expression matches after `after`.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(CascadeError::Schedule(format!(
            "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
        )));
    }

    let minutes = parse_field(parts[0], 0, 59)?;
    let hours = parse_field(parts[1], 0, 23)?;
    let dom = parse_field(parts[2], 1, 31)?;
    let months = parse_field(parts[3], 1, 12)?;
    let dow = parse_field(parts[4], 0, 6)?;

    // Scan minute by minute in the rule's time zone; a year is the bound
    // for expressions like "0 0 29 2 *".
    let mut candidate = (after + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after);

    for _ in 0..(366 * 24 * 60) {
        let local = candidate.with_timezone(&tz);
        if minutes.contains(&local.minute())
            && hours.contains(&local.hour())
            && dom.contains(&local.day())
            && months.contains(&local.month())
            && dow.contains(&local.weekday().num_days_from_sunday())
        {
            return Ok(candidate);
        }
        candidate += Duration::minutes(1);
    }

    Err(CascadeError::Schedule(format!(
        "cron expression '{expression}' never matches"
    )))
}

/// Parse one time zone name.
pub fn parse_tz(name: &str) -> Result<Tz> {
    name.parse()
        .map_err(|_| CascadeError::Schedule(format!("unknown time zone '{name}'")))
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let invalid =
        || CascadeError::Schedule(format!("invalid cron field '{field}' (range {min}-{max})"));

    if field == "*" {
        return Ok((min..=max).collect());
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(invalid());
        }
        return Ok((min..=max).step_by(n as usize).collect());
    }

    if field.contains(',') {
        let vals: std::result::Result<Vec<u32>, _> =
            field.split(',').map(|s| s.trim().parse()).collect();
        let vals = vals.map_err(|_| invalid())?;
        if vals.iter().any(|v| *v < min || *v > max) {
            return Err(invalid());
        }
        return Ok(vals);
    }

    let n: u32 = field.parse().map_err(|_| invalid())?;
    if n < min || n > max {
        return Err(invalid());
    }
    Ok(vec![n])
}
