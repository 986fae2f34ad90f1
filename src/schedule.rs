//! Cron schedule math: parsing, next-run computation, and interval
//! estimation for dead-man tolerances.
//!
//! Kubernetes CronJobs use 5-field cron expressions; the `cron` crate wants
//! a seconds field, so parsing normalizes to 6 fields first. An optional
//! IANA timezone (CronJob `spec.timeZone`) shifts the schedule.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Parse a CronJob schedule expression.
///
/// Accepts the 5-field Kubernetes form, the 6/7-field form with seconds,
/// and `@`-shorthands (`@hourly`, `@daily`, ...).
pub fn parse(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if expression.starts_with('@') || expression.split_whitespace().count() != 5 {
        expression.to_string()
    } else {
        format!("0 {expression}")
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Validation(format!("invalid cron schedule '{expression}': {e}")))
}

fn timezone(tz: Option<&str>) -> Result<Option<Tz>> {
    tz.map(|name| {
        name.parse::<Tz>()
            .map_err(|_| Error::Validation(format!("unknown timezone '{name}'")))
    })
    .transpose()
}

/// The next fire time strictly after `after`, in UTC.
pub fn next_run(
    expression: &str,
    tz: Option<&str>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse(expression)?;
    let next = match timezone(tz)? {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    };
    Ok(next)
}

/// Estimate the typical gap between runs by sampling upcoming fire times
/// and taking the median. The median rides out irregular schedules like
/// "weekdays only" better than the first gap would.
pub fn estimate_interval(
    expression: &str,
    tz: Option<&str>,
    after: DateTime<Utc>,
) -> Result<Option<Duration>> {
    const SAMPLES: usize = 6;

    let schedule = parse(expression)?;
    let fires: Vec<DateTime<Utc>> = match timezone(tz)? {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .take(SAMPLES)
            .map(|t| t.with_timezone(&Utc))
            .collect(),
        None => schedule.after(&after).take(SAMPLES).collect(),
    };

    if fires.len() < 2 {
        return Ok(None);
    }

    let mut gaps: Vec<Duration> = fires.windows(2).map(|w| w[1] - w[0]).collect();
    gaps.sort();
    Ok(Some(gaps[gaps.len() / 2]))
}

/// Dead-man tolerance: the estimated schedule interval plus configured
/// slack. None when the schedule never fires again.
pub fn dead_man_tolerance(
    expression: &str,
    tz: Option<&str>,
    slack: Duration,
    after: DateTime<Utc>,
) -> Result<Option<Duration>> {
    Ok(estimate_interval(expression, tz, after)?.map(|interval| interval + slack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_five_field_kubernetes_schedules() {
        assert!(parse("*/5 * * * *").is_ok());
        assert!(parse("0 2 * * *").is_ok());
        assert!(parse("@hourly").is_ok());
        assert!(parse("not a schedule").is_err());
    }

    #[test]
    fn next_run_advances_past_after() {
        let after = at(2026, 3, 1, 10, 2);
        let next = next_run("*/5 * * * *", None, after).unwrap().unwrap();
        assert_eq!(next, at(2026, 3, 1, 10, 5));
    }

    #[test]
    fn next_run_honors_timezone() {
        // 02:00 in Berlin is 01:00 UTC in winter.
        let after = at(2026, 1, 10, 0, 0);
        let next = next_run("0 2 * * *", Some("Europe/Berlin"), after)
            .unwrap()
            .unwrap();
        assert_eq!(next, at(2026, 1, 10, 1, 0));
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(next_run("0 2 * * *", Some("Mars/Olympus"), Utc::now()).is_err());
    }

    #[test]
    fn estimates_regular_intervals() {
        let after = at(2026, 3, 1, 0, 0);
        let interval = estimate_interval("*/15 * * * *", None, after)
            .unwrap()
            .unwrap();
        assert_eq!(interval, Duration::minutes(15));

        let interval = estimate_interval("0 2 * * *", None, after).unwrap().unwrap();
        assert_eq!(interval, Duration::hours(24));
    }

    #[test]
    fn median_rides_out_irregular_schedules() {
        // Weekdays at 06:00: most gaps are 24h, the weekend gap is 72h.
        let after = at(2026, 3, 2, 0, 0); // a Monday
        let interval = estimate_interval("0 6 * * 1-5", None, after)
            .unwrap()
            .unwrap();
        assert_eq!(interval, Duration::hours(24));
    }

    #[test]
    fn tolerance_adds_slack() {
        let after = at(2026, 3, 1, 0, 0);
        let tolerance = dead_man_tolerance("0 * * * *", None, Duration::minutes(10), after)
            .unwrap()
            .unwrap();
        assert_eq!(tolerance, Duration::minutes(70));
    }
}
