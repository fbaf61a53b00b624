//! A bespoke 5-field cron expression parser and next-fire-time search.
//!
//! The standard `cron` crate ANDs day-of-month and day-of-week when both
//! are restricted; this scheduler's predicate unions them instead (see
//! the table on `CronExpression::matches`), so matching is hand-rolled
//! here rather than delegated.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

const MAX_LOOKAHEAD_MINUTES: i64 = 60 * 24 * 366;

#[derive(Debug, Clone)]
struct Field {
    values: Vec<u32>,
    wildcard: bool,
}

#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    weekday: Field,
    source: String,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELD_SPECS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "weekday", min: 0, max: 6 },
];

impl CronExpression {
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::MalformedCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }
        let minute = parse_field(fields[0], &FIELD_SPECS[0])?;
        let hour = parse_field(fields[1], &FIELD_SPECS[1])?;
        let day_of_month = parse_field(fields[2], &FIELD_SPECS[2])?;
        let month = parse_field(fields[3], &FIELD_SPECS[3])?;
        let weekday = parse_field(fields[4], &FIELD_SPECS[4])?;
        Ok(Self {
            minute,
            hour,
            day_of_month,
            month,
            weekday,
            source: expr.to_owned(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the first instant strictly after `moment` (truncated to the
    /// minute) that satisfies this expression, or `UnreachableSchedule` if
    /// none is found within the lookahead window.
    pub fn next_after(&self, moment: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(moment) + Duration::minutes(1);
        for _ in 0..MAX_LOOKAHEAD_MINUTES {
            if self.matches(candidate) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }
        Err(SchedulerError::UnreachableSchedule)
    }

    fn matches(&self, instant: DateTime<Utc>) -> bool {
        if !self.minute.contains(instant.minute()) {
            return false;
        }
        if !self.hour.contains(instant.hour()) {
            return false;
        }
        if !self.month.contains(instant.month()) {
            return false;
        }
        let dom_matches = self.day_of_month.contains(instant.day());
        let dow_matches = self.weekday.contains(civil_weekday(instant));
        match (self.day_of_month.wildcard, self.weekday.wildcard) {
            (true, true) => true,
            (true, false) => dow_matches,
            (false, true) => dom_matches,
            (false, false) => dom_matches || dow_matches,
        }
    }
}

/// Monday = 0 .. Sunday = 6, matching `chrono::Weekday::num_days_from_monday`.
fn civil_weekday(instant: DateTime<Utc>) -> u32 {
    instant.weekday().num_days_from_monday()
}

fn truncate_to_minute(moment: DateTime<Utc>) -> DateTime<Utc> {
    moment - Duration::seconds(moment.second() as i64) - Duration::nanoseconds(moment.nanosecond() as i64)
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.values.binary_search(&value).is_ok()
    }
}

fn parse_field(raw: &str, spec: &FieldSpec) -> SchedulerResult<Field> {
    let mut values = std::collections::BTreeSet::new();
    for segment in raw.split(',') {
        parse_segment(segment, spec, &mut values)?;
    }
    if values.is_empty() {
        return Err(SchedulerError::MalformedCron(format!(
            "{} field has an empty value set",
            spec.name
        )));
    }
    let full_span = (spec.max - spec.min + 1) as usize;
    let is_wildcard = raw.contains('*') || values.len() == full_span;
    // Weekday 7 folds to 0 before evaluation.
    let values: Vec<u32> = if spec.name == "weekday" {
        values.into_iter().map(|v| if v == 7 { 0 } else { v }).collect::<std::collections::BTreeSet<_>>().into_iter().collect()
    } else {
        values.into_iter().collect()
    };
    Ok(Field { values, wildcard: is_wildcard })
}

fn parse_segment(
    segment: &str,
    spec: &FieldSpec,
    out: &mut std::collections::BTreeSet<u32>,
) -> SchedulerResult<()> {
    let (base, step) = match segment.split_once('/') {
        Some((base, step_str)) => {
            let step: u32 = step_str.parse().map_err(|_| {
                SchedulerError::MalformedCron(format!("invalid step '{step_str}' in {} field", spec.name))
            })?;
            if step == 0 {
                return Err(SchedulerError::MalformedCron(format!(
                    "step must be positive in {} field",
                    spec.name
                )));
            }
            (base, Some(step))
        }
        None => (segment, None),
    };

    // Effective max for a weekday field allows the 0-7 range (7 folds to 0).
    let effective_max = if spec.name == "weekday" { 7 } else { spec.max };

    let (start, end) = if base == "*" {
        (spec.min, effective_max)
    } else if let Some((a, b)) = base.split_once('-') {
        let a: u32 = a
            .parse()
            .map_err(|_| SchedulerError::MalformedCron(format!("invalid value '{a}' in {} field", spec.name)))?;
        let b: u32 = b
            .parse()
            .map_err(|_| SchedulerError::MalformedCron(format!("invalid value '{b}' in {} field", spec.name)))?;
        if a > b {
            return Err(SchedulerError::MalformedCron(format!(
                "inverted range '{base}' in {} field",
                spec.name
            )));
        }
        (a, b)
    } else {
        let v: u32 = base
            .parse()
            .map_err(|_| SchedulerError::MalformedCron(format!("unknown token '{base}' in {} field", spec.name)))?;
        (v, v)
    };

    if start < spec.min || end > effective_max {
        return Err(SchedulerError::MalformedCron(format!(
            "value out of range in {} field: '{segment}'",
            spec.name
        )));
    }

    let first = start;
    for value in start..=end {
        let keep = match step {
            Some(step) => (value - first) % step == 0,
            None => true,
        };
        if keep {
            out.insert(value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronExpression::parse("* * * *").is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(CronExpression::parse("10-5 * * * *").is_err());
    }

    #[test]
    fn rejects_non_positive_step() {
        assert!(CronExpression::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn s1_hourly_advance() {
        let expr = CronExpression::parse("0 * * * *").unwrap();
        let base = dt(2024, 6, 1, 10, 15);
        let next = expr.next_after(base).unwrap();
        assert_eq!(next, dt(2024, 6, 1, 11, 0));
        let after = expr.next_after(next).unwrap();
        assert_eq!(after, dt(2024, 6, 1, 12, 0));
    }

    #[test]
    fn s2_dom_dow_union_picks_earlier() {
        // 2024-05-01 is a Wednesday; DOM fires same day at 09:00, which is
        // earlier than the next Monday, so the union picks the DOM hit.
        let expr = CronExpression::parse("0 9 1,15 * 1").unwrap();
        let base = dt(2024, 5, 1, 0, 0);
        let next = expr.next_after(base).unwrap();
        assert_eq!(next, dt(2024, 5, 1, 9, 0));
    }

    #[test]
    fn s3_step_and_range() {
        let expr = CronExpression::parse("*/15 9-11 * * *").unwrap();
        let mut t = dt(2024, 6, 1, 9, 7);
        let expected = [
            dt(2024, 6, 1, 9, 15),
            dt(2024, 6, 1, 9, 30),
            dt(2024, 6, 1, 9, 45),
            dt(2024, 6, 1, 10, 0),
        ];
        for want in expected {
            t = expr.next_after(t).unwrap();
            assert_eq!(t, want);
        }
        // Walk to the end of the window: last hit is 11:45, then it should
        // roll over to the next day at 09:00.
        while t.hour() != 11 || t.minute() != 45 {
            t = expr.next_after(t).unwrap();
        }
        let rollover = expr.next_after(t).unwrap();
        assert_eq!(rollover, dt(2024, 6, 2, 9, 0));
    }

    #[test]
    fn next_after_is_monotone() {
        let expr = CronExpression::parse("*/7 * * * *").unwrap();
        let base = dt(2024, 1, 1, 0, 0);
        let first = expr.next_after(base).unwrap();
        let second = expr.next_after(first).unwrap();
        assert!(second > first);
    }

    #[test]
    fn weekday_seven_folds_to_zero() {
        let a = CronExpression::parse("0 0 * * 7").unwrap();
        let b = CronExpression::parse("0 0 * * 0").unwrap();
        let base = dt(2024, 1, 1, 0, 0);
        assert_eq!(a.next_after(base).unwrap(), b.next_after(base).unwrap());
    }

    #[test]
    fn wildcard_detected_via_full_span() {
        let expr = CronExpression::parse("0-59 * * * *").unwrap();
        assert!(expr.minute.wildcard);
    }
}
