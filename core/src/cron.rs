use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Local, Timelike};

/// One parsed field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    List(Vec<u32>),
    Range(u32, u32),
    Exact(u32),
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Field> {
        let parse_num = |s: &str| -> Result<u32> {
            let n: u32 = s.parse().with_context(|| format!("cron field {raw:?}"))?;
            if n < min || n > max {
                bail!("cron field {raw:?} out of range {min}-{max}");
            }
            Ok(n)
        };

        if raw == "*" {
            Ok(Field::Any)
        } else if let Some(step) = raw.strip_prefix("*/") {
            let n: u32 = step.parse().with_context(|| format!("cron step {raw:?}"))?;
            if n == 0 {
                bail!("cron step {raw:?} must be positive");
            }
            Ok(Field::Step(n))
        } else if raw.contains(',') {
            let vals = raw
                .split(',')
                .map(parse_num)
                .collect::<Result<Vec<u32>>>()?;
            Ok(Field::List(vals))
        } else if let Some((a, b)) = raw.split_once('-') {
            let (lo, hi) = (parse_num(a)?, parse_num(b)?);
            if lo > hi {
                bail!("cron range {raw:?} is inverted");
            }
            Ok(Field::Range(lo, hi))
        } else {
            Ok(Field::Exact(parse_num(raw)?))
        }
    }

    fn matches(&self, v: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => v % n == 0,
            Field::List(vals) => vals.contains(&v),
            Field::Range(lo, hi) => (*lo..=*hi).contains(&v),
            Field::Exact(n) => *n == v,
        }
    }
}

/// Wall-clock instant reduced to the five cron components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronTime {
    /// Minute, 0-59.
    pub minute: u32,
    /// Hour, 0-23.
    pub hour: u32,
    /// Day of month, 1-31.
    pub day_of_month: u32,
    /// Month, 1-12.
    pub month: u32,
    /// Day of week, 0-6 with Sunday = 0.
    pub day_of_week: u32,
}

impl CronTime {
    /// Reduce a local timestamp to cron components.
    pub fn from_local(dt: &DateTime<Local>) -> Self {
        CronTime {
            minute: dt.minute(),
            hour: dt.hour(),
            day_of_month: dt.day(),
            month: dt.month(),
            day_of_week: dt.weekday().num_days_from_sunday(),
        }
    }
}

/// Key identifying the minute a cron watch last fired in, to suppress
/// same-minute re-fires from the 60-second ticker.
pub fn minute_key(dt: &DateTime<Local>) -> String {
    dt.format("%Y-%m-%dT%H:%M").to_string()
}

/// Parsed five-field cron expression: `minute hour dayOfMonth month dayOfWeek`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    /// Parse an expression; each field is `*`, `*/N`, `A,B,C`, `A-B`, or `N`.
    pub fn parse(raw: &str) -> Result<CronExpr> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron {raw:?} must have 5 fields, got {}", fields.len());
        }
        Ok(CronExpr {
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day_of_month: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            day_of_week: Field::parse(fields[4], 0, 6)?,
        })
    }

    /// True if all five fields match the given instant.
    pub fn matches(&self, t: &CronTime) -> bool {
        self.minute.matches(t.minute)
            && self.hour.matches(t.hour)
            && self.day_of_month.matches(t.day_of_month)
            && self.month.matches(t.month)
            && self.day_of_week.matches(t.day_of_week)
    }

    /// Tick-aligned predicate: matches the instant and was not already fired
    /// within the same minute.
    pub fn should_fire(&self, dt: &DateTime<Local>, last_fired: Option<&str>) -> bool {
        if last_fired == Some(minute_key(dt).as_str()) {
            return false;
        }
        self.matches(&CronTime::from_local(dt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    fn t(minute: u32, hour: u32, dom: u32, month: u32, dow: u32) -> CronTime {
        CronTime { minute, hour, day_of_month: dom, month, day_of_week: dow }
    }

    #[test]
    fn wildcard_matches_everything() {
        let e = CronExpr::parse("* * * * *").unwrap();
        assert!(e.matches(&t(0, 0, 1, 1, 0)));
        assert!(e.matches(&t(59, 23, 31, 12, 6)));
    }

    #[test]
    fn step_list_range_and_literal() {
        let e = CronExpr::parse("*/15 9-17 1,15 6 1-5").unwrap();
        assert!(e.matches(&t(0, 9, 1, 6, 3)));
        assert!(e.matches(&t(45, 17, 15, 6, 5)));
        assert!(!e.matches(&t(10, 9, 1, 6, 3)), "minute off the step");
        assert!(!e.matches(&t(0, 8, 1, 6, 3)), "hour outside range");
        assert!(!e.matches(&t(0, 9, 2, 6, 3)), "day not in list");
        assert!(!e.matches(&t(0, 9, 1, 7, 3)), "wrong month");
        assert!(!e.matches(&t(0, 9, 1, 6, 0)), "sunday excluded");
    }

    #[test]
    fn sunday_is_zero() {
        let e = CronExpr::parse("0 12 * * 0").unwrap();
        assert!(e.matches(&t(0, 12, 10, 3, 0)));
        assert!(!e.matches(&t(0, 12, 10, 3, 1)));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* * * * 7").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("9-5 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn same_minute_is_suppressed() {
        // "*/5 * * * *": true at 10:05 after firing at 10:00, false 30s
        // later in the same minute, true again at 10:10.
        let e = CronExpr::parse("*/5 * * * *").unwrap();
        let first = at(10, 5, 0);
        assert!(e.should_fire(&first, Some(&minute_key(&at(10, 0, 0)))));
        let same_minute = at(10, 5, 30);
        assert!(!e.should_fire(&same_minute, Some(&minute_key(&first))));
        let next = at(10, 10, 0);
        assert!(e.should_fire(&next, Some(&minute_key(&first))));
    }

    #[test]
    fn non_matching_minute_never_fires() {
        let e = CronExpr::parse("*/5 * * * *").unwrap();
        assert!(!e.should_fire(&at(10, 7, 0), None));
    }
}
